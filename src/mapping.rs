//! Mapping Resolver: tag mappings stored in the user's target database
//!
//! Mappings live in a meta-table (`neuract__device_mappings` or the
//! schema-qualified equivalent) inside the target, keyed by
//! `(table_name, field_key)`. The catalog mirrors whatever was loaded so
//! the UI stays fast; writes go through to both. Historical installations
//! used a couple of other table names, so probing accepts those too.

use crate::catalog::CatalogStore;
use crate::errors::{AppError, AppResult};
use crate::migrate::{physical_ident, NEURACT_PREFIX, NEURACT_SCHEMA};
use crate::models::*;
use crate::protocols::{tag_for_row, SessionFactory};
use crate::targets::{TargetEngine, TargetRegistry};
use log::{debug, info, warn};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

/// A problem found while validating a table's mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingProblem {
    pub field: Option<String>,
    pub code: String,
}

/// Outcome of `validate`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub success: bool,
    pub health: MappingHealth,
    pub problems: Vec<MappingProblem>,
}

/// Candidate meta-table names, newest convention first
fn mapping_table_candidates(provider: DbProvider) -> Vec<String> {
    if provider.supports_schemas() {
        vec![
            format!("{}.device_mappings", NEURACT_SCHEMA),
            "device_mappings".to_string(),
        ]
    } else {
        vec![
            format!("{}device_mappings", NEURACT_PREFIX),
            "neuract_device_mappings".to_string(),
            "device_mappings".to_string(),
        ]
    }
}

pub struct MappingResolver {
    catalog: Arc<CatalogStore>,
    targets: Arc<TargetRegistry>,
    factory: Arc<dyn SessionFactory>,
}

impl MappingResolver {
    pub fn new(
        catalog: Arc<CatalogStore>,
        targets: Arc<TargetRegistry>,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            catalog,
            targets,
            factory,
        }
    }

    fn engine_for_table(&self, table: &DeviceTable) -> AppResult<Arc<TargetEngine>> {
        self.targets
            .engine_for_target(table.db_target_id.as_deref())
    }

    /// Pick the meta-table to use: prefer an existing candidate, create the
    /// canonical one when asked
    fn select_mapping_table(&self, engine: &TargetEngine, create: bool) -> AppResult<String> {
        for candidate in mapping_table_candidates(engine.provider()) {
            let exists = engine
                .with_conn(|c| {
                    let probe = format!("SELECT 1 FROM {} WHERE 1=0", candidate);
                    Ok(c.prepare(&probe).is_ok())
                })
                .unwrap_or(false);
            if exists {
                self.ensure_device_id_column(engine, &candidate)?;
                return Ok(candidate);
            }
        }
        let canonical = mapping_table_candidates(engine.provider())
            .into_iter()
            .next()
            .expect("candidate list is never empty");
        if create {
            engine.with_conn(|c| {
                c.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        table_name TEXT NOT NULL,
                        field_key TEXT NOT NULL,
                        protocol TEXT,
                        address TEXT,
                        data_type TEXT,
                        scale REAL,
                        deadband REAL,
                        device_id TEXT,
                        PRIMARY KEY (table_name, field_key)
                    )",
                    canonical
                ))?;
                Ok(())
            })?;
            debug!("mapping meta-table ready: {}", canonical);
        }
        Ok(canonical)
    }

    /// Older installations predate the device_id column
    fn ensure_device_id_column(&self, engine: &TargetEngine, table: &str) -> AppResult<()> {
        let cols = engine.columns_of(table)?;
        if !cols.is_empty() && !cols.iter().any(|c| c == "device_id") {
            engine.with_conn(|c| {
                c.execute(
                    &format!("ALTER TABLE {} ADD COLUMN device_id TEXT", table),
                    [],
                )?;
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Load mapping rows for a logical table from the target's meta-table.
    /// Tries the logical name first, then the prefixed physical name.
    pub fn load(&self, table: &DeviceTable) -> AppResult<Option<Mapping>> {
        let engine = self.engine_for_table(table)?;
        let meta = self.select_mapping_table(&engine, false)?;
        let prefixed = physical_ident(engine.provider(), &table.name).name;

        let mut rows = self.query_rows(&engine, &meta, &table.name)?;
        if rows.is_empty() && prefixed != table.name {
            rows = self.query_rows(&engine, &meta, &prefixed)?;
        }
        if rows.is_empty() {
            return Ok(None);
        }
        let device_id = rows
            .iter()
            .find_map(|(_, _, dev)| dev.clone())
            .or_else(|| self.catalog.get_mapping(&table.id).device_id);
        let mut mapping = Mapping {
            device_id,
            rows: BTreeMap::new(),
        };
        for (key, row, _) in rows {
            mapping.rows.insert(key, row);
        }
        Ok(Some(mapping))
    }

    #[allow(clippy::type_complexity)]
    fn query_rows(
        &self,
        engine: &TargetEngine,
        meta: &str,
        table_name: &str,
    ) -> AppResult<Vec<(String, MappingRow, Option<String>)>> {
        engine.with_conn(|c| {
            let sql = format!(
                "SELECT field_key,protocol,address,data_type,scale,deadband,device_id
                 FROM {} WHERE table_name=?1",
                meta
            );
            let mut stmt = match c.prepare(&sql) {
                Ok(stmt) => stmt,
                Err(_) => return Ok(vec![]),
            };
            let rows = stmt
                .query_map(params![table_name], |row| {
                    let protocol: Option<String> = row.get(1)?;
                    let data_type: Option<String> = row.get(3)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        MappingRow {
                            protocol: protocol
                                .and_then(|p| p.parse().ok())
                                .unwrap_or(Protocol::Opcua),
                            address: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                            data_type: data_type.and_then(|d| d.parse().ok()),
                            scale: row.get(4)?,
                            deadband: row.get(5)?,
                        },
                        row.get::<_, Option<String>>(6)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Refresh the catalog mirror from the target; used on read/list/start
    pub fn hydrate(&self, table_id: &str) -> AppResult<Mapping> {
        let table = self
            .catalog
            .get_table(table_id)
            .ok_or_else(|| AppError::not_found("table", table_id, "TABLE_NOT_FOUND"))?;
        match self.load(&table) {
            Ok(Some(loaded)) => {
                let merged = Mapping {
                    device_id: loaded
                        .device_id
                        .clone()
                        .or_else(|| self.catalog.get_mapping(table_id).device_id),
                    rows: loaded.rows,
                };
                self.catalog.replace_mapping(table_id, merged.clone())?;
                Ok(merged)
            }
            Ok(None) => Ok(self.catalog.get_mapping(table_id)),
            Err(e) => {
                // target down: serve the mirror rather than failing the read
                warn!("mapping hydrate failed for {}: {}", table_id, e);
                Ok(self.catalog.get_mapping(table_id))
            }
        }
    }

    /// Upsert rows (and optionally the device binding), write-through
    pub fn upsert(
        &self,
        table_id: &str,
        device_id: Option<String>,
        rows_patch: HashMap<String, MappingRow>,
    ) -> AppResult<Mapping> {
        let table = self
            .catalog
            .get_table(table_id)
            .ok_or_else(|| AppError::not_found("table", table_id, "TABLE_NOT_FOUND"))?;
        let engine = self.engine_for_table(&table)?;
        let meta = self.select_mapping_table(&engine, true)?;
        let bound = device_id
            .clone()
            .or_else(|| self.catalog.get_mapping(table_id).device_id);
        engine.with_transaction(|tx| {
            for (key, row) in &rows_patch {
                tx.execute(
                    &format!(
                        "INSERT OR REPLACE INTO {}
                         (table_name,field_key,protocol,address,data_type,scale,deadband,device_id)
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                        meta
                    ),
                    params![
                        table.name,
                        key,
                        row.protocol.to_string(),
                        row.address,
                        row.data_type.map(|d| d.to_string()),
                        row.scale,
                        row.deadband,
                        bound
                    ],
                )?;
            }
            Ok(())
        })?;
        self.catalog.upsert_mapping(table_id, device_id, rows_patch)
    }

    /// Replace the whole mapping: delete-then-insert in one transaction
    pub fn replace(&self, table_id: &str, mapping: Mapping) -> AppResult<Mapping> {
        let table = self
            .catalog
            .get_table(table_id)
            .ok_or_else(|| AppError::not_found("table", table_id, "TABLE_NOT_FOUND"))?;
        let engine = self.engine_for_table(&table)?;
        let meta = self.select_mapping_table(&engine, true)?;
        engine.with_transaction(|tx| {
            tx.execute(
                &format!("DELETE FROM {} WHERE table_name=?1", meta),
                params![table.name],
            )?;
            for (key, row) in &mapping.rows {
                tx.execute(
                    &format!(
                        "INSERT INTO {}
                         (table_name,field_key,protocol,address,data_type,scale,deadband,device_id)
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                        meta
                    ),
                    params![
                        table.name,
                        key,
                        row.protocol.to_string(),
                        row.address,
                        row.data_type.map(|d| d.to_string()),
                        row.scale,
                        row.deadband,
                        mapping.device_id
                    ],
                )?;
            }
            Ok(())
        })?;
        self.catalog.replace_mapping(table_id, mapping)
    }

    /// Delete one row from both the target meta-table and the mirror
    pub fn delete_row(&self, table_id: &str, field_key: &str) -> AppResult<Mapping> {
        let table = self
            .catalog
            .get_table(table_id)
            .ok_or_else(|| AppError::not_found("table", table_id, "TABLE_NOT_FOUND"))?;
        if let Ok(engine) = self.engine_for_table(&table) {
            let meta = self.select_mapping_table(&engine, false)?;
            let prefixed = physical_ident(engine.provider(), &table.name).name;
            engine.with_conn(|c| {
                let sql = format!(
                    "DELETE FROM {} WHERE table_name IN (?1, ?2) AND field_key=?3",
                    meta
                );
                if let Err(e) = c.execute(&sql, params![table.name, prefixed, field_key]) {
                    debug!("meta-table row delete skipped: {}", e);
                }
                Ok(())
            })?;
        }
        self.catalog.delete_mapping_row(table_id, field_key)
    }

    /// Copy rows (never the device binding); mirrored into the target when
    /// source and destination share one
    pub fn copy(&self, src_table_id: &str, dst_table_id: &str) -> AppResult<Mapping> {
        let src = self
            .catalog
            .get_table(src_table_id)
            .ok_or_else(|| AppError::not_found("table", src_table_id, "TABLE_NOT_FOUND"))?;
        let dst = self
            .catalog
            .get_table(dst_table_id)
            .ok_or_else(|| AppError::not_found("table", dst_table_id, "TABLE_NOT_FOUND"))?;
        let copied = self.catalog.copy_mapping(src_table_id, dst_table_id)?;
        let src_target = self.catalog.effective_target_id(&src);
        let dst_target = self.catalog.effective_target_id(&dst);
        if src_target == dst_target {
            self.replace(dst_table_id, copied.clone())?;
        }
        info!(
            "mapping copied: {} -> {} ({} rows)",
            src_table_id,
            dst_table_id,
            copied.rows.len()
        );
        Ok(self.catalog.get_mapping(dst_table_id))
    }

    /// Validate a mapping (stored, or a proposed payload) against the
    /// table's schema. Live probe-reads run per row when a device is bound.
    pub fn validate(
        &self,
        table_id: &str,
        rows: Option<&BTreeMap<String, MappingRow>>,
        device_id: Option<&str>,
    ) -> AppResult<ValidationReport> {
        let table = self
            .catalog
            .get_table(table_id)
            .ok_or_else(|| AppError::not_found("table", table_id, "TABLE_NOT_FOUND"))?;
        let stored = self.catalog.get_mapping(table_id);
        let rows = rows.unwrap_or(&stored.rows);
        let device_id = device_id
            .map(|s| s.to_string())
            .or_else(|| stored.device_id.clone());
        let required = self.catalog.required_keys_for(&table);

        let mut problems: Vec<MappingProblem> = Vec::new();
        let device = match &device_id {
            Some(id) => self.catalog.get_device_raw(id),
            None => None,
        };
        if device.is_none() {
            problems.push(MappingProblem {
                field: None,
                code: "DEVICE_NOT_BOUND".into(),
            });
        }
        let mut session = device
            .as_ref()
            .and_then(|d| self.factory.open(d).ok());

        for key in &required {
            let Some(row) = rows.get(key) else {
                problems.push(MappingProblem {
                    field: Some(key.clone()),
                    code: "MAPPING_INCOMPLETE".into(),
                });
                continue;
            };
            match tag_for_row(key, row) {
                Ok(tag) => {
                    // best-effort live read through the bound device
                    if let Some(session) = session.as_mut() {
                        if session.read(&tag).is_err() {
                            problems.push(MappingProblem {
                                field: Some(key.clone()),
                                code: "TAG_UNREADABLE".into(),
                            });
                        }
                    }
                }
                Err(e) => problems.push(MappingProblem {
                    field: Some(key.clone()),
                    code: e.code().to_string(),
                }),
            }
        }
        if let Some(mut session) = session {
            session.close();
        }

        let proposed = Mapping {
            device_id,
            rows: rows.clone(),
        };
        let health = mapping_health(&proposed, &required);
        // partial saves are allowed: incomplete rows do not block, anything
        // harder (unbound device, bad types, unreadable tags) does
        let success = problems.iter().all(|p| p.code == "MAPPING_INCOMPLETE");
        Ok(ValidationReport {
            success,
            health,
            problems,
        })
    }
}
