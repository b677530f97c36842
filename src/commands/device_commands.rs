//! Device command handlers
//!
//! Device creation runs a connectivity preflight before anything is saved:
//! an unreachable endpoint comes back as `TEST_FAILED` and the catalog
//! stays untouched. Name collisions (case-insensitive) return the existing
//! device.

use crate::api::{ApiResponse, CreateDeviceRequest, DeviceUpdateRequest, ListResponse, QuickTestResponse};
use crate::commands::{guarded, AppState};
use crate::errors::AppError;
use crate::models::*;

pub fn list_devices_command(
    state: &AppState,
    token: Option<&str>,
) -> ApiResponse<ListResponse<Device>> {
    guarded(state, token, "list_devices", || {
        Ok(state.catalog.list_devices().into())
    })
}

pub fn create_device_command(
    state: &AppState,
    token: Option<&str>,
    request: CreateDeviceRequest,
) -> ApiResponse<Device> {
    guarded(state, token, "create_device", || {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(AppError::required("name", "NAME_REQUIRED"));
        }
        if let Some(existing) = state
            .catalog
            .list_devices()
            .into_iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
        {
            return Ok(existing);
        }
        let protocol: Protocol = request.protocol.parse()?;
        let candidate = Device {
            id: request.id.clone().unwrap_or_default(),
            name: name.to_string(),
            protocol,
            params: request.params.clone(),
            secrets_sealed: None,
            status: DeviceStatus::Disconnected,
            latency_ms: None,
            last_error: None,
            auto_reconnect: request.auto_reconnect,
        };
        // fast connectivity test prior to save
        let probe = state.devices.probe_device(&candidate)?;
        if !probe.ok {
            return Err(AppError::TestFailed {
                message: probe.error.unwrap_or_else(|| "connect failed".into()),
            });
        }
        let sealed = match &request.secrets {
            Some(secrets) => Some(state.secret_box.seal(&serde_json::to_vec(secrets)?)?),
            None => None,
        };
        state.catalog.add_device(
            request.id.clone().filter(|id| !id.is_empty()),
            name,
            protocol,
            request.params.clone(),
            sealed,
            request.auto_reconnect,
        )
    })
}

pub fn update_device_command(
    state: &AppState,
    token: Option<&str>,
    device_id: &str,
    request: DeviceUpdateRequest,
) -> ApiResponse<Device> {
    guarded(state, token, "update_device", || {
        state
            .catalog
            .update_device_metadata(device_id, request.name.clone(), request.auto_reconnect)
    })
}

pub fn delete_device_command(
    state: &AppState,
    token: Option<&str>,
    device_id: &str,
) -> ApiResponse<()> {
    guarded(state, token, "delete_device", || {
        state.catalog.delete_device(device_id)
    })
}

pub fn connect_device_command(
    state: &AppState,
    token: Option<&str>,
    device_id: &str,
) -> ApiResponse<QuickTestResponse> {
    guarded(state, token, "connect_device", || {
        let probe = state.devices.connect(device_id)?;
        Ok(QuickTestResponse {
            ok: probe.ok,
            latency_ms: probe.latency_ms,
            error: probe.error,
        })
    })
}

pub fn disconnect_device_command(
    state: &AppState,
    token: Option<&str>,
    device_id: &str,
) -> ApiResponse<()> {
    guarded(state, token, "disconnect_device", || {
        state.devices.disconnect(device_id)
    })
}

pub fn quick_test_device_command(
    state: &AppState,
    token: Option<&str>,
    device_id: &str,
) -> ApiResponse<QuickTestResponse> {
    guarded(state, token, "quick_test_device", || {
        let probe = state.devices.quick_test(device_id)?;
        Ok(QuickTestResponse {
            ok: probe.ok,
            latency_ms: probe.latency_ms,
            error: probe.error,
        })
    })
}
