//! Parent schema command handlers

use crate::api::{ApiResponse, CreateSchemaRequest, ListResponse};
use crate::commands::{guarded, AppState};
use crate::models::ParentSchema;

pub fn list_schemas_command(
    state: &AppState,
    token: Option<&str>,
) -> ApiResponse<ListResponse<ParentSchema>> {
    guarded(state, token, "list_schemas", || {
        Ok(state.catalog.list_schemas().into())
    })
}

pub fn create_schema_command(
    state: &AppState,
    token: Option<&str>,
    request: CreateSchemaRequest,
) -> ApiResponse<ParentSchema> {
    guarded(state, token, "create_schema", || {
        let fields = request.fields()?;
        state
            .catalog
            .create_schema(request.id.clone(), &request.name, fields)
    })
}

pub fn delete_schema_command(
    state: &AppState,
    token: Option<&str>,
    schema_id: &str,
) -> ApiResponse<()> {
    guarded(state, token, "delete_schema", || {
        state.catalog.delete_schema(schema_id)
    })
}

pub fn import_schemas_command(
    state: &AppState,
    token: Option<&str>,
    items: Vec<CreateSchemaRequest>,
) -> ApiResponse<usize> {
    guarded(state, token, "import_schemas", || {
        let schemas = items
            .iter()
            .map(|req| {
                Ok(ParentSchema {
                    id: req.id.clone().unwrap_or_default(),
                    name: req.name.clone(),
                    fields: req.fields()?,
                })
            })
            .collect::<crate::errors::AppResult<Vec<_>>>()?;
        state.catalog.import_schemas(schemas)
    })
}

pub fn export_schemas_command(
    state: &AppState,
    token: Option<&str>,
) -> ApiResponse<ListResponse<ParentSchema>> {
    guarded(state, token, "export_schemas", || {
        Ok(state.catalog.list_schemas().into())
    })
}
