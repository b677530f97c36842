//! Request shapes accepted by the command surface

use crate::errors::{AppError, AppResult};
use crate::models::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRequest {
    pub key: String,
    #[serde(rename = "type", default)]
    pub dtype: Option<String>,
    pub unit: Option<String>,
    pub scale: Option<f64>,
    pub description: Option<String>,
}

impl FieldRequest {
    pub fn to_field(&self) -> AppResult<Field> {
        Ok(Field {
            key: self.key.trim().to_string(),
            dtype: self
                .dtype
                .as_deref()
                .unwrap_or("string")
                .parse()
                .unwrap_or(FieldType::String),
            unit: self.unit.clone(),
            scale: self.scale,
            description: self.description.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSchemaRequest {
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldRequest>,
}

impl CreateSchemaRequest {
    pub fn fields(&self) -> AppResult<Vec<Field>> {
        self.fields.iter().map(|f| f.to_field()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkTablesRequest {
    #[serde(alias = "schemaId")]
    pub parent_schema_id: String,
    #[serde(default)]
    pub names: Vec<String>,
    pub pattern: Option<String>,
    pub name: Option<String>,
    pub db_target_id: Option<String>,
}

impl BulkTablesRequest {
    /// Names from whichever field the caller used
    pub fn all_names(&self) -> Vec<String> {
        let mut names = self.names.clone();
        if let Some(pattern) = &self.pattern {
            names.push(pattern.clone());
        }
        if let Some(name) = &self.name {
            names.push(name.clone());
        }
        names
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTargetRequest {
    pub id: Option<String>,
    pub provider: Option<String>,
    pub conn: Option<String>,
}

impl CreateTargetRequest {
    pub fn provider(&self) -> AppResult<DbProvider> {
        self.provider
            .as_deref()
            .unwrap_or("sqlite")
            .parse()
            .map_err(|_: AppError| {
                AppError::validation(
                    "provider",
                    "TYPE_INVALID",
                    format!("Invalid provider: {:?}", self.provider),
                )
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDeviceRequest {
    pub id: Option<String>,
    pub name: String,
    pub protocol: String,
    #[serde(default)]
    pub params: JsonValue,
    /// Credential blob; sealed by the secret box before it is stored
    pub secrets: Option<JsonValue>,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceUpdateRequest {
    pub name: Option<String>,
    pub auto_reconnect: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGatewayRequest {
    pub id: Option<String>,
    pub name: String,
    pub host: String,
    pub adapter_id: Option<String>,
    pub nic_hint: Option<String>,
    #[serde(default)]
    pub ports: Vec<i64>,
    pub protocol_hint: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayUpdateRequest {
    pub name: Option<String>,
    pub host: Option<String>,
    pub nic_hint: Option<String>,
    pub ports: Option<Vec<i64>>,
    pub protocol_hint: Option<String>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingRowRequest {
    pub protocol: Option<String>,
    pub address: Option<String>,
    pub node_id: Option<String>,
    pub data_type: Option<String>,
    pub scale: Option<f64>,
    pub deadband: Option<f64>,
}

impl MappingRowRequest {
    pub fn to_row(&self, fallback_protocol: Option<Protocol>) -> AppResult<MappingRow> {
        let protocol = match self.protocol.as_deref() {
            Some(p) => p.parse()?,
            None => fallback_protocol.ok_or_else(|| {
                AppError::validation("protocol", "PROTOCOL_INVALID", "Protocol required")
            })?,
        };
        Ok(MappingRow {
            protocol,
            address: self
                .address
                .clone()
                .or_else(|| self.node_id.clone())
                .unwrap_or_default(),
            data_type: self.data_type.as_deref().and_then(|d| d.parse().ok()),
            scale: self.scale,
            deadband: self.deadband,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingUpsertRequest {
    pub device_id: Option<String>,
    #[serde(default)]
    pub rows: HashMap<String, MappingRowRequest>,
}

impl MappingUpsertRequest {
    pub fn rows(&self, fallback_protocol: Option<Protocol>) -> AppResult<HashMap<String, MappingRow>> {
        self.rows
            .iter()
            .map(|(k, v)| Ok((k.clone(), v.to_row(fallback_protocol)?)))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    pub table_id: String,
    pub field_key: String,
    pub op: String,
    pub value: Option<f64>,
    pub deadband: Option<f64>,
    pub cooldown_ms: Option<u64>,
}

impl TriggerRequest {
    pub fn to_trigger(&self) -> AppResult<Trigger> {
        Ok(Trigger {
            table_id: self.table_id.clone(),
            field_key: self.field_key.clone(),
            op: self.op.parse()?,
            value: self.value,
            deadband: self.deadband,
            cooldown_ms: self.cooldown_ms,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type", default)]
    pub job_type: Option<String>,
    #[serde(default)]
    pub tables: Vec<String>,
    pub columns: Option<ColumnsSelection>,
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub enabled: bool,
    pub batching: Option<Batching>,
    pub cpu_budget: Option<CpuBudget>,
    #[serde(default)]
    pub triggers: Vec<TriggerRequest>,
}

impl CreateJobRequest {
    pub fn to_job(&self) -> AppResult<Job> {
        let job_type: JobType = self.job_type.as_deref().unwrap_or("continuous").parse()?;
        let triggers = self
            .triggers
            .iter()
            .map(|t| t.to_trigger())
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Job {
            id: self.id.clone().unwrap_or_default(),
            name: self.name.trim().to_string(),
            job_type,
            tables: self.tables.clone(),
            columns: self.columns.clone().unwrap_or_default(),
            interval_ms: self.interval_ms.unwrap_or(1000),
            enabled: self.enabled,
            status: JobStatus::Stopped,
            batching: self.batching.clone().unwrap_or_default(),
            cpu_budget: self.cpu_budget.unwrap_or_default(),
            triggers,
        })
    }
}
