//! Device table command handlers: bulk creation, discovery-merged listing,
//! DDL planning and migration

use crate::api::{
    ApiResponse, BulkTablesRequest, ListResponse, TableDetailsResponse, TablesCreatedResponse,
};
use crate::commands::{guarded, AppState};
use crate::errors::AppError;
use crate::migrate::MigrateOutcome;
use crate::models::*;

pub fn bulk_create_tables_command(
    state: &AppState,
    token: Option<&str>,
    request: BulkTablesRequest,
) -> ApiResponse<TablesCreatedResponse> {
    guarded(state, token, "bulk_create_tables", || {
        if request.parent_schema_id.trim().is_empty() {
            return Err(AppError::not_found(
                "schema",
                "(blank)",
                "PARENT_SCHEMA_NOT_FOUND",
            ));
        }
        let names = request.all_names();
        let (items, warnings) = state.catalog.add_tables_bulk(
            &request.parent_schema_id,
            &names,
            request.db_target_id.clone(),
        )?;
        Ok(TablesCreatedResponse {
            count: items.len(),
            items,
            warnings,
        })
    })
}

/// Catalog tables merged with what is physically present in the selected
/// target: unmigrated entries pass through, migrated-but-absent entries are
/// hidden, physical-only tables surface with synthetic ids.
pub fn list_tables_command(
    state: &AppState,
    token: Option<&str>,
    db_target_id: Option<&str>,
) -> ApiResponse<ListResponse<DeviceTable>> {
    guarded(state, token, "list_tables", || {
        // refresh mapping mirrors so health reflects what is saved
        for table in state.catalog.list_tables() {
            let _ = state.resolver.hydrate(&table.id);
        }
        let discovery = state.planner.discover(db_target_id)?;
        let mut items = discovery.planned;
        items.extend(discovery.migrated);
        Ok(items.into())
    })
}

pub fn get_table_command(
    state: &AppState,
    token: Option<&str>,
    table_id: &str,
) -> ApiResponse<TableDetailsResponse> {
    guarded(state, token, "get_table", || {
        let table = match state.catalog.get_table(table_id) {
            Some(table) => table,
            // physically discovered tables have no catalog entry
            None if table_id.starts_with("phy_") => DeviceTable {
                id: table_id.to_string(),
                name: table_id.trim_start_matches("phy_").to_string(),
                schema_id: None,
                db_target_id: state.catalog.default_target_id(),
                status: TableStatus::Migrated,
                last_migrated_at: None,
                schema_hash: None,
                mapping_health: MappingHealth::Unmapped,
                device_id: None,
            },
            None => {
                return Err(AppError::not_found("table", table_id, "TABLE_NOT_FOUND"));
            }
        };
        let schema = table
            .schema_id
            .as_deref()
            .and_then(|sid| state.catalog.get_schema(sid));
        let mapping_health = state.catalog.mapping_health_of(&table.id);
        Ok(TableDetailsResponse {
            item: table,
            schema,
            mapping_health,
        })
    })
}

pub fn delete_table_command(
    state: &AppState,
    token: Option<&str>,
    table_id: &str,
) -> ApiResponse<()> {
    guarded(state, token, "delete_table", || {
        state.catalog.delete_table(table_id)
    })
}

pub fn dry_run_ddl_command(
    state: &AppState,
    token: Option<&str>,
    ids: &[String],
) -> ApiResponse<ListResponse<MigrateOutcome>> {
    guarded(state, token, "dry_run_ddl", || {
        if ids.is_empty() {
            return Err(AppError::validation(
                "ids",
                "NO_TABLES",
                "No table ids given",
            ));
        }
        Ok(state.planner.dry_run(ids).into())
    })
}

pub fn migrate_command(
    state: &AppState,
    token: Option<&str>,
    ids: &[String],
) -> ApiResponse<ListResponse<MigrateOutcome>> {
    guarded(state, token, "migrate", || {
        if ids.is_empty() {
            return Err(AppError::validation(
                "ids",
                "NO_TABLES",
                "No table ids given",
            ));
        }
        Ok(state.planner.migrate(ids).into())
    })
}
