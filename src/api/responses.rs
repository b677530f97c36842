//! Response shapes returned by the command surface

use crate::catalog::NameWarning;
use crate::metrics::{JobSummary, SecSample, SystemSample};
use crate::models::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(items: Vec<T>) -> Self {
        Self {
            total: items.len(),
            items,
        }
    }
}

/// Unauthenticated bootstrap payload for the desktop UI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub token: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TablesCreatedResponse {
    pub count: usize,
    pub items: Vec<DeviceTable>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub warnings: Vec<NameWarning>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDetailsResponse {
    pub item: DeviceTable,
    pub schema: Option<ParentSchema>,
    pub mapping_health: MappingHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetsResponse {
    pub items: Vec<DbTarget>,
    pub default_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingResponse {
    pub table_id: String,
    pub device_id: Option<String>,
    pub rows: std::collections::BTreeMap<String, MappingRow>,
    pub health: MappingHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickTestResponse {
    pub ok: bool,
    pub latency_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpTestResponse {
    pub ok: bool,
    pub status: String,
    pub time_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    pub ok: bool,
    pub loss_pct: u32,
    pub min: i64,
    pub avg: i64,
    pub max: i64,
    pub samples: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NicInfo {
    pub id: String,
    pub label: String,
    pub mac: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetricsResponse {
    pub job_id: String,
    pub summary: JobSummary,
    pub timeseries: Vec<SecSample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSummaryResponse {
    pub ok: bool,
    pub devices_connected: usize,
    pub default_db_ok: bool,
    pub jobs_running: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetricsResponse {
    pub timeseries: Vec<SystemSample>,
    pub devices: JsonValue,
    pub now: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbMetricsResponse {
    pub target_id: String,
    pub write_p50: Option<f64>,
    pub write_p95: Option<f64>,
    pub error_pct: f64,
    pub writes: u64,
    pub write_errors: u64,
}
