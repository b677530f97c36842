//! Command handlers: the agent's control surface
//!
//! Each handler authenticates the per-process token, executes against the
//! shared state and returns an [`ApiResponse`]. The external transport
//! (HTTP server, desktop IPC) is out of scope; it simply maps routes onto
//! these functions. Only `handshake` and `health` skip authentication.

pub mod device_commands;
pub mod gateway_commands;
pub mod job_commands;
pub mod mapping_commands;
pub mod schema_commands;
pub mod system_commands;
pub mod table_commands;

pub use device_commands::*;
pub use gateway_commands::*;
pub use job_commands::*;
pub use mapping_commands::*;
pub use schema_commands::*;
pub use system_commands::*;
pub use table_commands::*;

use crate::api::ApiResponse;
use crate::catalog::CatalogStore;
use crate::devices::DeviceSessionManager;
use crate::errors::AppResult;
use crate::jobs::JobEngine;
use crate::mapping::MappingResolver;
use crate::metrics::MetricsRegistry;
use crate::middleware::auth::AuthManager;
use crate::migrate::MigrationPlanner;
use crate::secrets::SecretBox;
use crate::targets::TargetRegistry;
use log::error;
use std::sync::Arc;

/// Shared state for command handlers
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<CatalogStore>,
    pub targets: Arc<TargetRegistry>,
    pub planner: Arc<MigrationPlanner>,
    pub resolver: Arc<MappingResolver>,
    pub devices: Arc<DeviceSessionManager>,
    pub jobs: Arc<JobEngine>,
    pub metrics: Arc<MetricsRegistry>,
    pub secret_box: Arc<dyn SecretBox>,
    pub auth: Arc<AuthManager>,
    pub port: u16,
}

/// Authenticate, run, wrap. All handlers except handshake/health go
/// through here.
pub fn guarded<T>(
    state: &AppState,
    token: Option<&str>,
    command: &str,
    f: impl FnOnce() -> AppResult<T>,
) -> ApiResponse<T> {
    match state.auth.validate(token).and_then(|_| f()) {
        Ok(data) => ApiResponse::success(data),
        Err(e) => {
            error!("command '{}' failed: {} [{}]", command, e, e.code());
            ApiResponse::error(e)
        }
    }
}

#[cfg(test)]
pub mod tests;
