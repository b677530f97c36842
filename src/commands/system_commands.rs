//! Target, system and handshake command handlers

use crate::api::{
    parse_range, ApiResponse, CreateTargetRequest, DbMetricsResponse, HandshakeResponse,
    ListResponse, SystemMetricsResponse, SystemSummaryResponse, TargetsResponse,
};
use crate::commands::{guarded, AppState};
use crate::errors::AppError;
use crate::models::*;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// The only verb that needs no token: bootstraps the UI with the
/// per-process token and port
pub fn handshake_command(state: &AppState) -> HandshakeResponse {
    HandshakeResponse {
        token: state.auth.token().to_string(),
        port: state.port,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub agent: String,
    pub version: String,
}

/// Liveness; never fails authentication
pub fn health_command() -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        agent: "plc-agent".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    }
}

// ---------------- Targets ----------------

pub fn list_targets_command(
    state: &AppState,
    token: Option<&str>,
) -> ApiResponse<TargetsResponse> {
    guarded(state, token, "list_targets", || {
        let (items, default_id) = state.catalog.list_targets();
        Ok(TargetsResponse { items, default_id })
    })
}

pub fn create_target_command(
    state: &AppState,
    token: Option<&str>,
    request: CreateTargetRequest,
) -> ApiResponse<DbTarget> {
    guarded(state, token, "create_target", || {
        let provider = request.provider()?;
        state.catalog.add_target(
            request.id.clone(),
            provider,
            request.conn.as_deref().unwrap_or(":memory:"),
            None,
            None,
        )
    })
}

pub fn delete_target_command(
    state: &AppState,
    token: Option<&str>,
    target_id: &str,
) -> ApiResponse<()> {
    guarded(state, token, "delete_target", || {
        state.catalog.delete_target(target_id)?;
        state.targets.evict(target_id);
        Ok(())
    })
}

pub fn test_target_command(
    state: &AppState,
    token: Option<&str>,
    target_id: Option<&str>,
    adhoc: Option<CreateTargetRequest>,
) -> ApiResponse<DbTarget> {
    guarded(state, token, "test_target", || {
        let adhoc = match adhoc {
            Some(req) => Some(DbTarget {
                id: req.id.clone().unwrap_or_default(),
                provider: req.provider()?,
                conn: req.conn.clone().unwrap_or_else(|| ":memory:".into()),
                status: TargetStatus::Untested,
                last_msg: None,
            }),
            None => None,
        };
        state.targets.test(target_id, adhoc)
    })
}

pub fn set_default_target_command(
    state: &AppState,
    token: Option<&str>,
    target_id: &str,
) -> ApiResponse<()> {
    guarded(state, token, "set_default_target", || {
        state.catalog.set_default_target(target_id)
    })
}

pub fn create_db_command(
    state: &AppState,
    token: Option<&str>,
    target_id: &str,
) -> ApiResponse<()> {
    guarded(state, token, "create_db", || {
        state.targets.create_db(target_id)
    })
}

// ---------------- System ----------------

pub fn system_summary_command(
    state: &AppState,
    token: Option<&str>,
) -> ApiResponse<SystemSummaryResponse> {
    guarded(state, token, "system_summary", || {
        let devices_connected = state
            .catalog
            .list_devices()
            .iter()
            .filter(|d| {
                matches!(d.status, DeviceStatus::Connected | DeviceStatus::Degraded)
            })
            .count();
        let default_db_ok = state
            .catalog
            .default_target_id()
            .and_then(|id| state.catalog.get_target(&id))
            .map(|t| t.status == TargetStatus::Ok)
            .unwrap_or(false);
        let jobs_running = state
            .catalog
            .list_jobs()
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .count();
        Ok(SystemSummaryResponse {
            ok: true,
            devices_connected,
            default_db_ok,
            jobs_running,
        })
    })
}

pub fn system_metrics_command(
    state: &AppState,
    token: Option<&str>,
    range: Option<&str>,
) -> ApiResponse<SystemMetricsResponse> {
    guarded(state, token, "system_metrics", || {
        let window = parse_range(range);
        let mut counts = serde_json::json!({"connected": 0, "disconnected": 0, "unknown": 0});
        for device in state.catalog.list_devices() {
            let key = match device.status {
                DeviceStatus::Connected | DeviceStatus::Degraded => "connected",
                DeviceStatus::Disconnected | DeviceStatus::Reconnecting => "disconnected",
            };
            counts[key] = serde_json::json!(counts[key].as_u64().unwrap_or(0) + 1);
        }
        Ok(SystemMetricsResponse {
            timeseries: state.metrics.system.snapshot(window),
            devices: counts,
            now: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        })
    })
}

/// Write-side health of one target, aggregated across the jobs that feed it
pub fn db_metrics_command(
    state: &AppState,
    token: Option<&str>,
    target_id: Option<&str>,
    range: Option<&str>,
) -> ApiResponse<DbMetricsResponse> {
    guarded(state, token, "db_metrics", || {
        let target_id = target_id
            .map(|s| s.to_string())
            .or_else(|| state.catalog.default_target_id())
            .ok_or_else(|| AppError::not_found("target", "(default)", "TARGET_NOT_FOUND"))?;
        let window = parse_range(range);

        let mut latencies: Vec<f64> = Vec::new();
        let mut writes = 0u64;
        let mut write_errors = 0u64;
        for job in state.catalog.list_jobs() {
            let relevant = job.tables.iter().any(|table_id| {
                state
                    .catalog
                    .get_table(table_id)
                    .map(|t| {
                        state.catalog.effective_target_id(&t).as_deref()
                            == Some(target_id.as_str())
                    })
                    .unwrap_or(false)
            });
            if !relevant {
                continue;
            }
            let job_metrics = state.metrics.job(&job.id);
            latencies.extend(job_metrics.write_latencies(600));
            for sample in job_metrics.timeseries(window) {
                writes += sample.writes;
                write_errors += sample.write_err;
            }
        }
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let pick = |p: f64| -> Option<f64> {
            if latencies.is_empty() {
                None
            } else {
                let k = ((p * (latencies.len() - 1) as f64) as usize).min(latencies.len() - 1);
                Some(latencies[k])
            }
        };
        Ok(DbMetricsResponse {
            target_id,
            write_p50: pick(0.50),
            write_p95: pick(0.95),
            error_pct: write_errors as f64 / (writes.max(1)) as f64 * 100.0,
            writes,
            write_errors,
        })
    })
}

pub fn jobs_summary_command(
    state: &AppState,
    token: Option<&str>,
    range: Option<&str>,
) -> ApiResponse<ListResponse<serde_json::Value>> {
    guarded(state, token, "jobs_summary", || {
        let window = parse_range(range);
        let items = state
            .metrics
            .jobs_summary(window)
            .into_iter()
            .map(|(job_id, summary)| {
                serde_json::json!({"jobId": job_id, "summary": summary})
            })
            .collect::<Vec<_>>();
        Ok(items.into())
    })
}
