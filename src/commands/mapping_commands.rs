//! Mapping command handlers

use crate::api::{ApiResponse, MappingResponse, MappingUpsertRequest};
use crate::commands::{guarded, AppState};
use crate::errors::AppError;
use crate::mapping::ValidationReport;
use crate::models::{Mapping, Protocol};

fn mapping_response(state: &AppState, table_id: &str, mapping: Mapping) -> MappingResponse {
    MappingResponse {
        table_id: table_id.to_string(),
        device_id: mapping.device_id.clone(),
        health: state.catalog.mapping_health_of(table_id),
        rows: mapping.rows,
    }
}

/// The protocol of the bound device, used when a row omits its own
fn fallback_protocol(state: &AppState, table_id: &str, device_id: Option<&str>) -> Option<Protocol> {
    device_id
        .map(|s| s.to_string())
        .or_else(|| state.catalog.get_mapping(table_id).device_id)
        .and_then(|id| state.catalog.get_device(&id))
        .map(|d| d.protocol)
}

pub fn get_mapping_command(
    state: &AppState,
    token: Option<&str>,
    table_id: &str,
) -> ApiResponse<MappingResponse> {
    guarded(state, token, "get_mapping", || {
        let mapping = state.resolver.hydrate(table_id)?;
        Ok(mapping_response(state, table_id, mapping))
    })
}

pub fn upsert_mapping_command(
    state: &AppState,
    token: Option<&str>,
    table_id: &str,
    request: MappingUpsertRequest,
) -> ApiResponse<MappingResponse> {
    guarded(state, token, "upsert_mapping", || {
        if state.catalog.get_table(table_id).is_none() {
            return Err(AppError::not_found("table", table_id, "TABLE_NOT_FOUND"));
        }
        let fallback = fallback_protocol(state, table_id, request.device_id.as_deref());
        let rows = request.rows(fallback)?;
        let mapping = state
            .resolver
            .upsert(table_id, request.device_id.clone(), rows)?;
        Ok(mapping_response(state, table_id, mapping))
    })
}

/// Replace semantics: the imported mapping fully supersedes the stored one
pub fn import_mapping_command(
    state: &AppState,
    token: Option<&str>,
    table_id: &str,
    request: MappingUpsertRequest,
) -> ApiResponse<MappingResponse> {
    guarded(state, token, "import_mapping", || {
        if state.catalog.get_table(table_id).is_none() {
            return Err(AppError::not_found("table", table_id, "TABLE_NOT_FOUND"));
        }
        let fallback = fallback_protocol(state, table_id, request.device_id.as_deref());
        let rows = request.rows(fallback)?;
        let mapping = state.resolver.replace(
            table_id,
            Mapping {
                device_id: request.device_id.clone(),
                rows: rows.into_iter().collect(),
            },
        )?;
        Ok(mapping_response(state, table_id, mapping))
    })
}

pub fn export_mapping_command(
    state: &AppState,
    token: Option<&str>,
    table_id: &str,
) -> ApiResponse<MappingResponse> {
    guarded(state, token, "export_mapping", || {
        if state.catalog.get_table(table_id).is_none() {
            return Err(AppError::not_found("table", table_id, "TABLE_NOT_FOUND"));
        }
        Ok(mapping_response(
            state,
            table_id,
            state.catalog.get_mapping(table_id),
        ))
    })
}

pub fn delete_mapping_row_command(
    state: &AppState,
    token: Option<&str>,
    table_id: &str,
    field_key: &str,
) -> ApiResponse<MappingResponse> {
    guarded(state, token, "delete_mapping_row", || {
        let mapping = state.resolver.delete_row(table_id, field_key)?;
        Ok(mapping_response(state, table_id, mapping))
    })
}

pub fn copy_mapping_command(
    state: &AppState,
    token: Option<&str>,
    src_table_id: &str,
    dst_table_id: &str,
) -> ApiResponse<MappingResponse> {
    guarded(state, token, "copy_mapping", || {
        let mapping = state.resolver.copy(src_table_id, dst_table_id)?;
        Ok(mapping_response(state, dst_table_id, mapping))
    })
}

pub fn validate_mapping_command(
    state: &AppState,
    token: Option<&str>,
    table_id: &str,
    request: Option<MappingUpsertRequest>,
) -> ApiResponse<ValidationReport> {
    guarded(state, token, "validate_mapping", || {
        match request {
            Some(request) => {
                let fallback =
                    fallback_protocol(state, table_id, request.device_id.as_deref());
                let rows = request.rows(fallback)?.into_iter().collect();
                state
                    .resolver
                    .validate(table_id, Some(&rows), request.device_id.as_deref())
            }
            None => state.resolver.validate(table_id, None, None),
        }
    })
}
