//! Migration Planner: reconciles logical device tables with the physical
//! schema of a SQL target
//!
//! All user-facing tables live in a reserved namespace: a real schema
//! (`neuract.<logical>`) on engines that support schemas, a name prefix
//! (`neuract__<logical>`) on engines that do not. Planning is pure given a
//! [`SchemaInspector`] snapshot; applying runs each table's operations in a
//! single transaction, all-or-nothing per table.

use crate::catalog::CatalogStore;
use crate::errors::{AppError, AppResult};
use crate::models::*;
use crate::targets::{TargetEngine, TargetRegistry};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const NEURACT_SCHEMA: &str = "neuract";
pub const NEURACT_PREFIX: &str = "neuract__";

/// Meta tables hidden from discovery
const RESERVED_TABLES: [&str; 3] = ["device_mappings", "mappings", "mapping_history"];
const RESERVED_PREFIXES: [&str; 2] = ["meta_", "system_"];

/// Physical identity of a logical table on a given provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalIdent {
    pub schema: Option<String>,
    pub name: String,
    pub qualified: String,
}

pub fn physical_ident(provider: DbProvider, logical: &str) -> PhysicalIdent {
    if provider.supports_schemas() {
        PhysicalIdent {
            schema: Some(NEURACT_SCHEMA.to_string()),
            name: logical.to_string(),
            qualified: format!("{}.{}", NEURACT_SCHEMA, logical),
        }
    } else {
        let name = format!("{}{}", NEURACT_PREFIX, logical);
        PhysicalIdent {
            schema: None,
            qualified: name.clone(),
            name,
        }
    }
}

/// Strip the namespace from a physical name, if it carries one
pub fn logical_name(physical: &str) -> &str {
    physical.strip_prefix(NEURACT_PREFIX).unwrap_or(physical)
}

/// True when the physical name is an internal/meta table to hide
pub fn is_reserved(physical: &str) -> bool {
    let logical = logical_name(physical);
    RESERVED_TABLES.contains(&logical)
        || RESERVED_PREFIXES.iter().any(|p| logical.starts_with(p))
        || logical.starts_with(NEURACT_PREFIX)
}

/// SQL column type for a schema field
pub fn sql_type(dtype: FieldType) -> &'static str {
    match dtype {
        FieldType::Float => "REAL",
        FieldType::Int => "INTEGER",
        FieldType::Bool => "BOOLEAN",
        FieldType::String => "TEXT",
    }
}

/// Capability the planner needs from a target: table existence and column
/// introspection over the namespace
pub trait SchemaInspector {
    fn has_table(&self, ident: &PhysicalIdent) -> AppResult<bool>;
    fn columns_of(&self, ident: &PhysicalIdent) -> AppResult<Vec<String>>;
}

impl SchemaInspector for TargetEngine {
    fn has_table(&self, ident: &PhysicalIdent) -> AppResult<bool> {
        TargetEngine::has_table(self, &ident.name)
    }

    fn columns_of(&self, ident: &PhysicalIdent) -> AppResult<Vec<String>> {
        TargetEngine::columns_of(self, &ident.name)
    }
}

/// Compute the DDL operations that reconcile `fields` with the physical
/// table. An up-to-date table yields the empty list.
pub fn plan_ops(
    provider: DbProvider,
    logical: &str,
    fields: &[Field],
    inspector: &dyn SchemaInspector,
) -> AppResult<Vec<String>> {
    let ident = physical_ident(provider, logical);
    let mut ops: Vec<String> = Vec::new();

    if !inspector.has_table(&ident)? {
        let mut cols = vec!["timestamp_utc DATETIME NOT NULL".to_string()];
        cols.extend(
            fields
                .iter()
                .map(|f| format!("{} {}", f.key, sql_type(f.dtype))),
        );
        ops.push(format!(
            "CREATE TABLE {} ({})",
            ident.qualified,
            cols.join(", ")
        ));
    } else {
        let existing = inspector.columns_of(&ident)?;
        for field in fields {
            if !existing.iter().any(|c| c == &field.key) {
                ops.push(format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    ident.qualified,
                    field.key,
                    sql_type(field.dtype)
                ));
            }
        }
        if !existing.iter().any(|c| c == "timestamp_utc") {
            ops.push(format!(
                "ALTER TABLE {} ADD COLUMN timestamp_utc DATETIME NOT NULL",
                ident.qualified
            ));
        }
    }

    if !ops.is_empty() {
        if ident.schema.is_some() {
            ops.insert(
                0,
                format!("CREATE SCHEMA IF NOT EXISTS {}", NEURACT_SCHEMA),
            );
        }
        ops.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_ts ON {}(timestamp_utc)",
            ident.name, ident.qualified
        ));
    }
    Ok(ops)
}

/// Per-table planning/apply outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateOutcome {
    pub id: String,
    pub name: Option<String>,
    pub operations: Vec<String>,
    pub status: MigrateStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrateStatus {
    Planned,
    Created,
    Updated,
    Noop,
    Error,
}

/// Discovery reconciliation between the catalog and the physical target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discovery {
    pub planned: Vec<DeviceTable>,
    pub migrated: Vec<DeviceTable>,
}

pub struct MigrationPlanner {
    catalog: Arc<CatalogStore>,
    targets: Arc<TargetRegistry>,
}

impl MigrationPlanner {
    pub fn new(catalog: Arc<CatalogStore>, targets: Arc<TargetRegistry>) -> Self {
        Self { catalog, targets }
    }

    fn table_context(
        &self,
        table_id: &str,
    ) -> AppResult<(DeviceTable, Vec<Field>, Arc<TargetEngine>)> {
        let table = self
            .catalog
            .get_table(table_id)
            .ok_or_else(|| AppError::not_found("table", table_id, "TABLE_NOT_FOUND"))?;
        let fields = table
            .schema_id
            .as_deref()
            .and_then(|sid| self.catalog.get_schema(sid))
            .map(|s| s.fields)
            .unwrap_or_default();
        let engine = self
            .targets
            .engine_for_target(table.db_target_id.as_deref())?;
        Ok((table, fields, engine))
    }

    /// Plan without applying
    pub fn dry_run(&self, ids: &[String]) -> Vec<MigrateOutcome> {
        ids.iter().map(|id| self.plan_one(id)).collect()
    }

    fn plan_one(&self, table_id: &str) -> MigrateOutcome {
        match self.table_context(table_id) {
            Ok((table, fields, engine)) => {
                let ident = physical_ident(engine.provider(), &table.name);
                match plan_ops(engine.provider(), &table.name, &fields, engine.as_ref()) {
                    Ok(operations) => MigrateOutcome {
                        id: table.id,
                        name: Some(ident.qualified),
                        operations,
                        status: MigrateStatus::Planned,
                        error: None,
                    },
                    Err(e) => MigrateOutcome {
                        id: table.id,
                        name: Some(ident.qualified),
                        operations: vec![],
                        status: MigrateStatus::Error,
                        error: Some(e.to_string()),
                    },
                }
            }
            Err(e) => MigrateOutcome {
                id: table_id.to_string(),
                name: None,
                operations: vec![],
                status: MigrateStatus::Error,
                error: Some(e.code().to_string()),
            },
        }
    }

    /// Apply migrations; each table is atomic, siblings are independent
    pub fn migrate(&self, ids: &[String]) -> Vec<MigrateOutcome> {
        ids.iter().map(|id| self.migrate_one(id)).collect()
    }

    fn migrate_one(&self, table_id: &str) -> MigrateOutcome {
        let (table, fields, engine) = match self.table_context(table_id) {
            Ok(ctx) => ctx,
            Err(e) => {
                return MigrateOutcome {
                    id: table_id.to_string(),
                    name: None,
                    operations: vec![],
                    status: MigrateStatus::Error,
                    error: Some(e.code().to_string()),
                }
            }
        };
        let ident = physical_ident(engine.provider(), &table.name);
        let operations = match plan_ops(engine.provider(), &table.name, &fields, engine.as_ref()) {
            Ok(ops) => ops,
            Err(e) => {
                return MigrateOutcome {
                    id: table.id,
                    name: Some(ident.qualified),
                    operations: vec![],
                    status: MigrateStatus::Error,
                    error: Some(e.to_string()),
                }
            }
        };

        if operations.is_empty() {
            let _ = self.catalog.set_table_status(
                &table.id,
                TableStatus::Migrated,
                Some(now_ist_iso()),
            );
            return MigrateOutcome {
                id: table.id,
                name: Some(ident.qualified),
                operations,
                status: MigrateStatus::Noop,
                error: None,
            };
        }

        let creating = operations.iter().any(|op| op.starts_with("CREATE TABLE"));
        let applied = engine.with_transaction(|tx| {
            for op in &operations {
                tx.execute_batch(op)?;
            }
            Ok(())
        });
        match applied {
            Ok(()) => {
                let _ = self.catalog.set_table_status(
                    &table.id,
                    TableStatus::Migrated,
                    Some(now_ist_iso()),
                );
                info!(
                    "migrated {} -> {} ({} op(s))",
                    table.id,
                    ident.qualified,
                    operations.len()
                );
                MigrateOutcome {
                    id: table.id,
                    name: Some(ident.qualified),
                    operations,
                    status: if creating {
                        MigrateStatus::Created
                    } else {
                        MigrateStatus::Updated
                    },
                    error: None,
                }
            }
            Err(e) => {
                error!("migration of {} failed: {}", table.id, e);
                let _ = self
                    .catalog
                    .set_table_status(&table.id, TableStatus::NotMigrated, None);
                MigrateOutcome {
                    id: table.id,
                    name: Some(ident.qualified),
                    operations,
                    status: MigrateStatus::Error,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Merge catalog tables with what is physically present in the target's
    /// namespace. Catalog entries marked migrated but physically absent are
    /// hidden; physical-only tables surface with synthetic `phy_` ids.
    pub fn discover(&self, target_id: Option<&str>) -> AppResult<Discovery> {
        let selected = target_id
            .map(|s| s.to_string())
            .or_else(|| self.catalog.default_target_id());
        let physical: Vec<String> = match &selected {
            Some(id) => match self.targets.engine_for_target(Some(id)) {
                Ok(engine) => engine
                    .list_tables()?
                    .into_iter()
                    .filter(|n| n.starts_with(NEURACT_PREFIX) && !is_reserved(n))
                    .map(|n| logical_name(&n).to_string())
                    .collect(),
                Err(_) => vec![],
            },
            None => vec![],
        };

        let mut planned = Vec::new();
        let mut migrated = Vec::new();
        for table in self.catalog.list_tables() {
            let effective = self.catalog.effective_target_id(&table);
            if selected.is_some() && effective != selected {
                continue;
            }
            match table.status {
                TableStatus::NotMigrated => planned.push(table),
                TableStatus::Migrated => {
                    if physical.iter().any(|n| n == &table.name) {
                        migrated.push(table);
                    }
                }
            }
        }
        let known: Vec<String> = migrated.iter().map(|t| t.name.clone()).collect();
        for logical in physical {
            if known.iter().any(|n| n == &logical) {
                continue;
            }
            migrated.push(DeviceTable {
                id: format!("phy_{}", logical),
                name: logical,
                schema_id: None,
                db_target_id: selected.clone(),
                status: TableStatus::Migrated,
                last_migrated_at: None,
                schema_hash: None,
                mapping_health: MappingHealth::Unmapped,
                device_id: None,
            });
        }
        Ok(Discovery { planned, migrated })
    }
}
