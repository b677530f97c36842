//! Data models for the PLC Logger Agent
//!
//! This module contains the entities of the logical data model: parent
//! schemas and their fields, database targets, device tables, tag mappings,
//! devices, gateways, jobs with triggers, and run records. Identifiers are
//! short opaque strings; equality is by id.

use crate::errors::{AppError, AppResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// Validation trait for models
pub trait Validate {
    /// Validate the model and return any validation errors
    fn validate(&self) -> AppResult<()>;
}

/// True when `name` is usable verbatim as a SQL identifier
pub fn is_sql_safe(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Normalize an arbitrary table name into a SQL-safe identifier.
/// Returns the normalized name and whether it differed from the input.
pub fn normalize_sql_name(name: &str) -> (String, bool) {
    if is_sql_safe(name) {
        return (name.to_string(), false);
    }
    let mut safe: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if !safe
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false)
    {
        safe = format!("t_{}", safe);
    }
    (safe, true)
}

/// Short opaque id with an entity prefix (`sch_`, `tbl_`, `dev_`, ...)
pub fn new_id(prefix: &str) -> String {
    let tail = Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &tail[..12])
}

/// Row timestamps are IST (UTC+05:30) ISO-8601 with second precision,
/// matching what the desktop UI renders.
pub fn now_ist_iso() -> String {
    let ist = chrono::FixedOffset::east_opt(5 * 3600 + 30 * 60).expect("fixed offset");
    Utc::now()
        .with_timezone(&ist)
        .format("%Y-%m-%dT%H:%M:%S%:z")
        .to_string()
}

/// UTC ISO-8601 with a trailing Z, used for catalog bookkeeping columns
pub fn now_utc_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// =============================================================================
// Parent Schemas
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Float,
    Int,
    Bool,
    String,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::Float => write!(f, "float"),
            FieldType::Int => write!(f, "int"),
            FieldType::Bool => write!(f, "bool"),
            FieldType::String => write!(f, "string"),
        }
    }
}

impl std::str::FromStr for FieldType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "float" | "double" | "number" => Ok(FieldType::Float),
            "int" | "integer" => Ok(FieldType::Int),
            "bool" | "boolean" => Ok(FieldType::Bool),
            "string" | "text" => Ok(FieldType::String),
            other => Err(AppError::validation(
                "type",
                "TYPE_INVALID",
                format!("Invalid field type: {}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub key: String,
    #[serde(rename = "type")]
    pub dtype: FieldType,
    pub unit: Option<String>,
    pub scale: Option<f64>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentSchema {
    pub id: String,
    pub name: String,
    pub fields: Vec<Field>,
}

impl ParentSchema {
    pub fn field_keys(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.key.clone()).collect()
    }
}

impl Validate for ParentSchema {
    fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::required("name", "NAME_REQUIRED"));
        }
        let mut seen: HashSet<String> = HashSet::new();
        for field in &self.fields {
            if field.key.trim().is_empty() {
                return Err(AppError::required("key", "FIELD_KEY_REQUIRED"));
            }
            if !is_sql_safe(&field.key) {
                return Err(AppError::validation(
                    "key",
                    "FIELD_KEY_INVALID",
                    format!("Field key is not an identifier: {}", field.key),
                ));
            }
            if !seen.insert(field.key.to_ascii_lowercase()) {
                return Err(AppError::validation(
                    "key",
                    "FIELD_KEY_DUPLICATE",
                    format!("Duplicate field key: {}", field.key),
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// DB Targets
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbProvider {
    Sqlite,
    Postgres,
    Mysql,
    Sqlserver,
}

impl std::fmt::Display for DbProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbProvider::Sqlite => write!(f, "sqlite"),
            DbProvider::Postgres => write!(f, "postgres"),
            DbProvider::Mysql => write!(f, "mysql"),
            DbProvider::Sqlserver => write!(f, "sqlserver"),
        }
    }
}

impl std::str::FromStr for DbProvider {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(DbProvider::Sqlite),
            "postgres" | "postgresql" => Ok(DbProvider::Postgres),
            "mysql" => Ok(DbProvider::Mysql),
            "sqlserver" | "mssql" => Ok(DbProvider::Sqlserver),
            other => Err(AppError::validation(
                "provider",
                "TYPE_INVALID",
                format!("Invalid provider: {}", other),
            )),
        }
    }
}

impl DbProvider {
    /// Engines with real schema support get a `neuract` schema; the rest use
    /// a `neuract__` table-name prefix.
    pub fn supports_schemas(&self) -> bool {
        matches!(self, DbProvider::Postgres | DbProvider::Sqlserver)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Untested,
    Ok,
    Fail,
}

impl std::fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetStatus::Untested => write!(f, "untested"),
            TargetStatus::Ok => write!(f, "ok"),
            TargetStatus::Fail => write!(f, "fail"),
        }
    }
}

impl std::str::FromStr for TargetStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "untested" | "" => Ok(TargetStatus::Untested),
            "ok" => Ok(TargetStatus::Ok),
            "fail" => Ok(TargetStatus::Fail),
            other => Err(AppError::validation(
                "status",
                "TYPE_INVALID",
                format!("Invalid target status: {}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbTarget {
    pub id: String,
    pub provider: DbProvider,
    pub conn: String,
    pub status: TargetStatus,
    pub last_msg: Option<String>,
}

// =============================================================================
// Device Tables
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    NotMigrated,
    Migrated,
}

impl std::fmt::Display for TableStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableStatus::NotMigrated => write!(f, "not_migrated"),
            TableStatus::Migrated => write!(f, "migrated"),
        }
    }
}

impl std::str::FromStr for TableStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "not_migrated" | "" => Ok(TableStatus::NotMigrated),
            "migrated" => Ok(TableStatus::Migrated),
            other => Err(AppError::validation(
                "status",
                "TYPE_INVALID",
                format!("Invalid table status: {}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingHealth {
    Unmapped,
    Partial,
    Mapped,
}

impl std::fmt::Display for MappingHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MappingHealth::Unmapped => write!(f, "unmapped"),
            MappingHealth::Partial => write!(f, "partial"),
            MappingHealth::Mapped => write!(f, "mapped"),
        }
    }
}

impl std::str::FromStr for MappingHealth {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unmapped" | "" => Ok(MappingHealth::Unmapped),
            "partial" | "partially mapped" => Ok(MappingHealth::Partial),
            "mapped" => Ok(MappingHealth::Mapped),
            other => Err(AppError::validation(
                "mapping_health",
                "TYPE_INVALID",
                format!("Invalid mapping health: {}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTable {
    pub id: String,
    /// Logical (SQL-safe) table name; the physical name adds the namespace
    pub name: String,
    pub schema_id: Option<String>,
    pub db_target_id: Option<String>,
    pub status: TableStatus,
    pub last_migrated_at: Option<String>,
    pub schema_hash: Option<String>,
    pub mapping_health: MappingHealth,
    pub device_id: Option<String>,
}

// =============================================================================
// Mappings
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Modbus,
    Opcua,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Modbus => write!(f, "modbus"),
            Protocol::Opcua => write!(f, "opcua"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "modbus" => Ok(Protocol::Modbus),
            "opcua" => Ok(Protocol::Opcua),
            other => Err(AppError::validation(
                "protocol",
                "PROTOCOL_INVALID",
                format!("Invalid protocol: {}", other),
            )),
        }
    }
}

/// One mapped field: the tag address on the device and how to interpret it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingRow {
    pub protocol: Protocol,
    pub address: String,
    pub data_type: Option<FieldType>,
    pub scale: Option<f64>,
    pub deadband: Option<f64>,
}

impl MappingRow {
    /// A row counts toward mapping health when it is actually readable:
    /// opcua needs an address, modbus needs an address and a data type.
    pub fn is_complete(&self) -> bool {
        if self.address.trim().is_empty() {
            return false;
        }
        match self.protocol {
            Protocol::Opcua => true,
            Protocol::Modbus => self.data_type.is_some(),
        }
    }
}

/// Mapping for one table: optional device binding plus rows keyed by field
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mapping {
    pub device_id: Option<String>,
    pub rows: BTreeMap<String, MappingRow>,
}

/// Pure mapping-health function over the stored rows and the schema's keys
pub fn mapping_health(mapping: &Mapping, required_keys: &[String]) -> MappingHealth {
    if mapping.rows.is_empty() {
        return MappingHealth::Unmapped;
    }
    if required_keys.is_empty() {
        return MappingHealth::Mapped;
    }
    let ok = required_keys
        .iter()
        .filter(|k| mapping.rows.get(*k).map(|r| r.is_complete()).unwrap_or(false))
        .count();
    if ok == 0 {
        MappingHealth::Unmapped
    } else if ok == required_keys.len() {
        MappingHealth::Mapped
    } else {
        MappingHealth::Partial
    }
}

// =============================================================================
// Devices
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Disconnected,
    Reconnecting,
    Connected,
    Degraded,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Disconnected => write!(f, "disconnected"),
            DeviceStatus::Reconnecting => write!(f, "reconnecting"),
            DeviceStatus::Connected => write!(f, "connected"),
            DeviceStatus::Degraded => write!(f, "degraded"),
        }
    }
}

impl std::str::FromStr for DeviceStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disconnected" | "" => Ok(DeviceStatus::Disconnected),
            "reconnecting" => Ok(DeviceStatus::Reconnecting),
            "connected" => Ok(DeviceStatus::Connected),
            "degraded" => Ok(DeviceStatus::Degraded),
            other => Err(AppError::validation(
                "status",
                "TYPE_INVALID",
                format!("Invalid device status: {}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    /// Unique case-insensitively
    pub name: String,
    pub protocol: Protocol,
    /// Protocol parameters: `endpoint` for opcua, `host`/`port`/`unitId`
    /// for modbus. Secret keys are redacted on read.
    pub params: JsonValue,
    /// Credential blob sealed by the secret box; never serialized outward
    #[serde(skip_serializing, default)]
    pub secrets_sealed: Option<Vec<u8>>,
    pub status: DeviceStatus,
    pub latency_ms: Option<i64>,
    pub last_error: Option<String>,
    pub auto_reconnect: bool,
}

impl Device {
    /// Copy with secret-looking params masked, for anything leaving the store
    pub fn redacted(&self) -> Device {
        let mut out = self.clone();
        if let Some(obj) = out.params.as_object_mut() {
            for key in ["pass", "password"] {
                if obj.contains_key(key) {
                    obj.insert(key.to_string(), JsonValue::String("***".into()));
                }
            }
        }
        out.secrets_sealed = None;
        out
    }
}

// =============================================================================
// Gateways
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Unknown,
    Reachable,
    Limited,
    Unreachable,
}

impl std::fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayStatus::Unknown => write!(f, "unknown"),
            GatewayStatus::Reachable => write!(f, "reachable"),
            GatewayStatus::Limited => write!(f, "limited"),
            GatewayStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

impl std::str::FromStr for GatewayStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" | "" => Ok(GatewayStatus::Unknown),
            "reachable" => Ok(GatewayStatus::Reachable),
            "limited" => Ok(GatewayStatus::Limited),
            "unreachable" => Ok(GatewayStatus::Unreachable),
            other => Err(AppError::validation(
                "status",
                "TYPE_INVALID",
                format!("Invalid gateway status: {}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gateway {
    pub id: String,
    /// Unique
    pub name: String,
    /// Unique
    pub host: String,
    pub adapter_id: Option<String>,
    pub nic_hint: Option<String>,
    pub ports: Vec<u16>,
    pub protocol_hint: Option<String>,
    pub tags: Vec<String>,
    pub status: GatewayStatus,
    pub last_ping: Option<JsonValue>,
    pub last_tcp: Option<JsonValue>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub last_test_at: Option<String>,
}

/// Validate, dedupe and sort a raw port list. Ports must be in [1, 65535].
pub fn sanitize_ports(raw: &[i64]) -> AppResult<Vec<u16>> {
    let mut set: HashSet<u16> = HashSet::new();
    for &p in raw {
        if !(1..=65535).contains(&p) {
            return Err(AppError::InvalidPorts {
                message: format!("port out of range: {}", p),
            });
        }
        set.insert(p as u16);
    }
    let mut out: Vec<u16> = set.into_iter().collect();
    out.sort_unstable();
    Ok(out)
}

impl Validate for Gateway {
    fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::required("name", "NAME_REQUIRED"));
        }
        if self.host.trim().is_empty() {
            return Err(AppError::required("host", "HOST_REQUIRED"));
        }
        Ok(())
    }
}

// =============================================================================
// Jobs
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Continuous,
    Trigger,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobType::Continuous => write!(f, "continuous"),
            JobType::Trigger => write!(f, "trigger"),
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "continuous" | "" => Ok(JobType::Continuous),
            // historical alias
            "trigger" | "triggered" => Ok(JobType::Trigger),
            other => Err(AppError::validation(
                "type",
                "TYPE_INVALID",
                format!("Invalid job type: {}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Stopped,
    Running,
    Paused,
    Degraded,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Stopped => write!(f, "stopped"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Paused => write!(f, "paused"),
            JobStatus::Degraded => write!(f, "degraded"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stopped" | "" => Ok(JobStatus::Stopped),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "degraded" => Ok(JobStatus::Degraded),
            other => Err(AppError::validation(
                "status",
                "TYPE_INVALID",
                format!("Invalid job status: {}", other),
            )),
        }
    }
}

/// Which schema fields a job writes. Trigger evaluation always sees all
/// mapped fields; `Subset` only projects the written row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", untagged)]
pub enum ColumnsSelection {
    All(String),
    Subset(Vec<String>),
}

impl Default for ColumnsSelection {
    fn default() -> Self {
        ColumnsSelection::All("all".into())
    }
}

impl ColumnsSelection {
    pub fn all() -> Self {
        ColumnsSelection::All("all".into())
    }

    pub fn includes(&self, key: &str) -> bool {
        match self {
            ColumnsSelection::All(_) => true,
            ColumnsSelection::Subset(keys) => keys.iter().any(|k| k == key),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerOp {
    Change,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    Rising,
    Falling,
}

impl std::str::FromStr for TriggerOp {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "change" => Ok(TriggerOp::Change),
            ">" => Ok(TriggerOp::Gt),
            ">=" => Ok(TriggerOp::Ge),
            "<" => Ok(TriggerOp::Lt),
            "<=" => Ok(TriggerOp::Le),
            "==" => Ok(TriggerOp::Eq),
            "!=" => Ok(TriggerOp::Ne),
            "rising" => Ok(TriggerOp::Rising),
            "falling" => Ok(TriggerOp::Falling),
            other => Err(AppError::validation(
                "op",
                "TYPE_INVALID",
                format!("Invalid trigger op: {}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub table_id: String,
    pub field_key: String,
    pub op: TriggerOp,
    pub value: Option<f64>,
    pub deadband: Option<f64>,
    pub cooldown_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Batching {
    /// 0 disables batching: every tick writes its row immediately
    #[serde(default)]
    pub max_rows: usize,
    #[serde(default)]
    pub max_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuBudget {
    Low,
    Balanced,
    High,
}

impl Default for CpuBudget {
    fn default() -> Self {
        CpuBudget::Balanced
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub tables: Vec<String>,
    #[serde(default)]
    pub columns: ColumnsSelection,
    pub interval_ms: u64,
    pub enabled: bool,
    pub status: JobStatus,
    #[serde(default)]
    pub batching: Batching,
    #[serde(default)]
    pub cpu_budget: CpuBudget,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
}

impl Validate for Job {
    fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::required("name", "NAME_REQUIRED"));
        }
        if self.tables.is_empty() {
            return Err(AppError::validation(
                "tables",
                "NO_TABLES",
                "A job needs at least one table",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Runs
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub job_id: String,
    pub started_at: String,
    pub stopped_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub rows: i64,
    pub read_lat_avg: f64,
    pub write_lat_avg: f64,
    pub error_pct: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn field(key: &str, dtype: FieldType) -> Field {
        Field {
            key: key.to_string(),
            dtype,
            unit: None,
            scale: None,
            description: None,
        }
    }

    fn row(protocol: Protocol, address: &str, data_type: Option<FieldType>) -> MappingRow {
        MappingRow {
            protocol,
            address: address.to_string(),
            data_type,
            scale: None,
            deadband: None,
        }
    }

    #[test]
    fn schema_validation_rejects_bad_keys() {
        let mut schema = ParentSchema {
            id: "sch_1".into(),
            name: "LTPanel".into(),
            fields: vec![field("r_current", FieldType::Float)],
        };
        assert!(schema.validate().is_ok());

        schema.fields.push(field("9bad", FieldType::Float));
        assert_eq!(schema.validate().unwrap_err().code(), "FIELD_KEY_INVALID");

        schema.fields[1].key = "r_current".into();
        assert_eq!(schema.validate().unwrap_err().code(), "FIELD_KEY_DUPLICATE");

        schema.name = "  ".into();
        schema.fields.truncate(1);
        assert_eq!(schema.validate().unwrap_err().code(), "NAME_REQUIRED");
    }

    #[test]
    fn name_normalization_prefixes_and_replaces() {
        assert_eq!(normalize_sql_name("Transformer_1"), ("Transformer_1".into(), false));
        assert_eq!(normalize_sql_name("Pump 2"), ("Pump_2".into(), true));
        assert_eq!(normalize_sql_name("2ndFeeder"), ("t_2ndFeeder".into(), true));
        assert_eq!(normalize_sql_name("a-b/c"), ("a_b_c".into(), true));
    }

    #[test]
    fn mapping_health_matches_table() {
        let keys = vec!["a".to_string(), "b".to_string()];
        let mut mapping = Mapping::default();
        assert_eq!(mapping_health(&mapping, &keys), MappingHealth::Unmapped);

        mapping
            .rows
            .insert("a".into(), row(Protocol::Opcua, "ns=2;s=X", None));
        assert_eq!(mapping_health(&mapping, &keys), MappingHealth::Partial);

        mapping.rows.insert(
            "b".into(),
            row(Protocol::Modbus, "40001", Some(FieldType::Int)),
        );
        assert_eq!(mapping_health(&mapping, &keys), MappingHealth::Mapped);

        // modbus without a data type does not count
        mapping.rows.insert("b".into(), row(Protocol::Modbus, "40001", None));
        assert_eq!(mapping_health(&mapping, &keys), MappingHealth::Partial);

        // rows present but no required keys -> mapped
        assert_eq!(mapping_health(&mapping, &[]), MappingHealth::Mapped);
    }

    #[test]
    fn port_sanitizing_bounds() {
        assert_eq!(sanitize_ports(&[502, 4840, 502]).unwrap(), vec![502, 4840]);
        assert_eq!(sanitize_ports(&[0]).unwrap_err().code(), "INVALID_PORTS");
        assert_eq!(sanitize_ports(&[65536]).unwrap_err().code(), "INVALID_PORTS");
    }

    #[test]
    fn job_type_accepts_historical_alias() {
        assert_eq!("triggered".parse::<JobType>().unwrap(), JobType::Trigger);
        assert!("cron".parse::<JobType>().is_err());
    }

    #[test]
    fn device_redaction_masks_secrets() {
        let device = Device {
            id: "dev_1".into(),
            name: "PLC-1".into(),
            protocol: Protocol::Modbus,
            params: serde_json::json!({"host": "10.0.0.5", "port": 502, "password": "hunter2"}),
            secrets_sealed: Some(vec![1, 2, 3]),
            status: DeviceStatus::Disconnected,
            latency_ms: None,
            last_error: None,
            auto_reconnect: true,
        };
        let red = device.redacted();
        assert_eq!(red.params["password"], "***");
        assert_eq!(red.params["host"], "10.0.0.5");
        assert!(red.secrets_sealed.is_none());
    }

    proptest! {
        #[test]
        fn normalized_names_are_always_sql_safe(name in "\\PC{0,24}") {
            prop_assume!(!name.is_empty());
            let (safe, _) = normalize_sql_name(&name);
            prop_assert!(is_sql_safe(&safe), "not safe: {:?} -> {:?}", name, safe);
        }

        #[test]
        fn mapping_health_is_pure(n_rows in 0usize..5, n_keys in 0usize..5) {
            let keys: Vec<String> = (0..n_keys).map(|i| format!("k{}", i)).collect();
            let mut mapping = Mapping::default();
            for i in 0..n_rows {
                mapping.rows.insert(
                    format!("k{}", i),
                    MappingRow {
                        protocol: Protocol::Opcua,
                        address: format!("ns=2;s=T{}", i),
                        data_type: None,
                        scale: None,
                        deadband: None,
                    },
                );
            }
            let a = mapping_health(&mapping, &keys);
            let b = mapping_health(&mapping, &keys);
            prop_assert_eq!(a, b);
        }
    }
}
