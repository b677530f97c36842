//! In-memory catalog mirror with write-through persistence
//!
//! All mutations validate first, then commit to the App Local DB, then
//! update the mirror under one reentrant-style mutex. Reads hand out copies
//! so callers never observe partial updates.

use crate::catalog::appdb::AppDb;
use crate::errors::{AppError, AppResult};
use crate::models::*;
use log::{debug, info, warn};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Gateway connectivity tests are limited to one per gateway per this window
const GATEWAY_TEST_MIN_INTERVAL_MS: u64 = 3000;

/// Reported when a bulk table name had to be normalized
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NameWarning {
    pub original: String,
    pub normalized: String,
}

#[derive(Default)]
struct CatalogState {
    schemas: Vec<ParentSchema>,
    targets: HashMap<String, DbTarget>,
    default_target_id: Option<String>,
    tables: Vec<DeviceTable>,
    mappings: HashMap<String, Mapping>,
    devices: HashMap<String, Device>,
    gateways: Vec<Gateway>,
    jobs: Vec<Job>,
    gw_last_test: HashMap<String, Instant>,
}

/// Typed CRUD over the entities of the data model with uniqueness
/// enforcement and write-through durability
pub struct CatalogStore {
    db: Arc<AppDb>,
    state: Mutex<CatalogState>,
}

impl CatalogStore {
    /// Build a store over `db`, loading the mirror from disk
    pub fn new(db: Arc<AppDb>) -> AppResult<Self> {
        let store = Self {
            db,
            state: Mutex::new(CatalogState::default()),
        };
        store.reload()?;
        Ok(store)
    }

    pub fn app_db(&self) -> &Arc<AppDb> {
        &self.db
    }

    /// Refresh the in-memory mirror from the App Local DB
    pub fn reload(&self) -> AppResult<()> {
        let schemas = self.db.load_schemas()?;
        let (targets, default_id) = self.db.load_targets()?;
        let tables = self.db.load_device_tables()?;
        let devices = self.db.load_devices()?;
        let gateways = self.db.load_gateways()?;
        let jobs = self.db.load_jobs()?;

        let mut state = self.lock();
        state.schemas = schemas;
        state.targets = targets.into_iter().map(|t| (t.id.clone(), t)).collect();
        state.default_target_id = default_id;
        // Tables with a persisted device binding get a mapping stub so the
        // binding survives restarts even before rows are hydrated.
        state.mappings.clear();
        for table in &tables {
            if let Some(device_id) = &table.device_id {
                state.mappings.insert(
                    table.id.clone(),
                    Mapping {
                        device_id: Some(device_id.clone()),
                        rows: Default::default(),
                    },
                );
            }
        }
        let bound = tables.iter().filter(|t| t.device_id.is_some()).count();
        state.tables = tables;
        state.devices = devices.into_iter().map(|d| (d.id.clone(), d)).collect();
        state.gateways = gateways;
        state.jobs = jobs;
        info!(
            "catalog loaded: schemas={} tables={} device_bound={} devices={} jobs={}",
            state.schemas.len(),
            state.tables.len(),
            bound,
            state.devices.len(),
            state.jobs.len()
        );
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CatalogState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---------------- Schemas ----------------

    pub fn list_schemas(&self) -> Vec<ParentSchema> {
        self.lock().schemas.clone()
    }

    pub fn get_schema(&self, schema_id: &str) -> Option<ParentSchema> {
        self.lock()
            .schemas
            .iter()
            .find(|s| s.id == schema_id)
            .cloned()
    }

    pub fn create_schema(
        &self,
        id: Option<String>,
        name: &str,
        fields: Vec<Field>,
    ) -> AppResult<ParentSchema> {
        let schema = ParentSchema {
            id: id.unwrap_or_else(|| new_id("sch")),
            name: name.trim().to_string(),
            fields,
        };
        schema.validate()?;
        self.db.save_schema(&schema)?;
        let mut state = self.lock();
        state.schemas.retain(|s| s.id != schema.id);
        state.schemas.push(schema.clone());
        info!("schema created: {} ({})", schema.name, schema.id);
        Ok(schema)
    }

    pub fn import_schemas(&self, items: Vec<ParentSchema>) -> AppResult<usize> {
        let mut imported = 0;
        for mut item in items {
            if item.name.trim().is_empty() {
                continue;
            }
            if item.id.is_empty() {
                item.id = new_id("sch");
            }
            item.validate()?;
            self.db.save_schema(&item)?;
            let mut state = self.lock();
            state.schemas.retain(|s| s.id != item.id);
            state.schemas.push(item);
            imported += 1;
        }
        Ok(imported)
    }

    pub fn delete_schema(&self, schema_id: &str) -> AppResult<()> {
        if self.get_schema(schema_id).is_none() {
            return Err(AppError::not_found(
                "schema",
                schema_id,
                "PARENT_SCHEMA_NOT_FOUND",
            ));
        }
        self.db.delete_schema(schema_id)?;
        self.lock().schemas.retain(|s| s.id != schema_id);
        Ok(())
    }

    /// Field keys a table's mapping is measured against
    pub fn required_keys_for(&self, table: &DeviceTable) -> Vec<String> {
        table
            .schema_id
            .as_deref()
            .and_then(|sid| self.get_schema(sid))
            .map(|s| s.field_keys())
            .unwrap_or_default()
    }

    // ---------------- DB targets ----------------

    pub fn list_targets(&self) -> (Vec<DbTarget>, Option<String>) {
        let state = self.lock();
        let mut items: Vec<DbTarget> = state.targets.values().cloned().collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        (items, state.default_target_id.clone())
    }

    pub fn get_target(&self, target_id: &str) -> Option<DbTarget> {
        self.lock().targets.get(target_id).cloned()
    }

    /// Add-or-reuse by `(provider, conn)`, case-insensitively. A payload with
    /// a fresh status/message updates the reused entry.
    pub fn add_target(
        &self,
        id: Option<String>,
        provider: DbProvider,
        conn: &str,
        status: Option<TargetStatus>,
        last_msg: Option<String>,
    ) -> AppResult<DbTarget> {
        let conn = if conn.trim().is_empty() {
            ":memory:".to_string()
        } else {
            conn.trim().to_string()
        };
        let mut state = self.lock();
        if let Some(existing) = state.targets.values_mut().find(|t| {
            t.provider == provider && t.conn.to_ascii_lowercase() == conn.to_ascii_lowercase()
        }) {
            if let Some(status) = status {
                existing.status = status;
            }
            if last_msg.is_some() {
                existing.last_msg = last_msg;
            }
            let copy = existing.clone();
            drop(state);
            self.db.save_target(&copy)?;
            return Ok(copy);
        }
        let target = DbTarget {
            id: id.unwrap_or_else(|| new_id("db")),
            provider,
            conn,
            status: status.unwrap_or(TargetStatus::Untested),
            last_msg,
        };
        state.targets.insert(target.id.clone(), target.clone());
        drop(state);
        self.db.save_target(&target)?;
        info!("target saved: {} {} {}", target.id, target.provider, target.conn);
        Ok(target)
    }

    pub fn delete_target(&self, target_id: &str) -> AppResult<()> {
        {
            let state = self.lock();
            if !state.targets.contains_key(target_id) {
                return Err(AppError::not_found("target", target_id, "TARGET_NOT_FOUND"));
            }
            if state.default_target_id.as_deref() == Some(target_id) {
                return Err(AppError::TargetIsDefault {
                    id: target_id.to_string(),
                });
            }
        }
        let used = self.db.count_tables_referencing_target(target_id)?;
        if used > 0 {
            return Err(AppError::TargetInUse {
                id: target_id.to_string(),
                count: used,
            });
        }
        self.db.delete_target(target_id)?;
        self.lock().targets.remove(target_id);
        Ok(())
    }

    pub fn set_default_target(&self, target_id: &str) -> AppResult<()> {
        if self.get_target(target_id).is_none() {
            return Err(AppError::not_found("target", target_id, "TARGET_NOT_FOUND"));
        }
        self.db.set_default_target(target_id)?;
        self.lock().default_target_id = Some(target_id.to_string());
        Ok(())
    }

    pub fn default_target_id(&self) -> Option<String> {
        self.lock().default_target_id.clone()
    }

    /// The target a table writes to (its own, else the default)
    pub fn effective_target_id(&self, table: &DeviceTable) -> Option<String> {
        table
            .db_target_id
            .clone()
            .or_else(|| self.default_target_id())
    }

    // ---------------- Device tables ----------------

    /// Create device tables in bulk. Names may contain brace patterns
    /// (`Pump_{1..4}`); non-identifier names are normalized with a warning.
    pub fn add_tables_bulk(
        &self,
        parent_schema_id: &str,
        names: &[String],
        db_target_id: Option<String>,
    ) -> AppResult<(Vec<DeviceTable>, Vec<NameWarning>)> {
        let schema = self
            .get_schema(parent_schema_id)
            .ok_or_else(|| {
                AppError::not_found("schema", parent_schema_id, "PARENT_SCHEMA_NOT_FOUND")
            })?;

        let mut expanded: Vec<String> = Vec::new();
        for name in names {
            expanded.extend(expand_pattern(name));
        }
        expanded.retain(|n| !n.trim().is_empty());
        if expanded.is_empty() {
            return Err(AppError::validation(
                "names",
                "TABLE_NAME_INVALID",
                "No usable table names given",
            ));
        }

        let mut warnings = Vec::new();
        let mut created = Vec::new();
        let hash = schema_hash(&schema);
        for raw in expanded {
            let (normalized, changed) = normalize_sql_name(raw.trim());
            if changed {
                warnings.push(NameWarning {
                    original: raw.trim().to_string(),
                    normalized: normalized.clone(),
                });
            }
            let table = DeviceTable {
                id: new_id("tbl"),
                name: normalized,
                schema_id: Some(parent_schema_id.to_string()),
                db_target_id: db_target_id.clone(),
                status: TableStatus::NotMigrated,
                last_migrated_at: None,
                schema_hash: Some(hash.clone()),
                mapping_health: MappingHealth::Unmapped,
                device_id: None,
            };
            self.db.save_table(&table)?;
            created.push(table);
        }
        let mut state = self.lock();
        state.tables.extend(created.iter().cloned());
        info!(
            "tables created: {} (schema={}, warnings={})",
            created.len(),
            parent_schema_id,
            warnings.len()
        );
        Ok((created, warnings))
    }

    pub fn list_tables(&self) -> Vec<DeviceTable> {
        self.lock().tables.clone()
    }

    pub fn get_table(&self, table_id: &str) -> Option<DeviceTable> {
        self.lock().tables.iter().find(|t| t.id == table_id).cloned()
    }

    pub fn set_table_status(
        &self,
        table_id: &str,
        status: TableStatus,
        migrated_at: Option<String>,
    ) -> AppResult<()> {
        self.db
            .set_table_status(table_id, status, migrated_at.as_deref())?;
        let mut state = self.lock();
        if let Some(table) = state.tables.iter_mut().find(|t| t.id == table_id) {
            table.status = status;
            if migrated_at.is_some() {
                table.last_migrated_at = migrated_at;
            }
        }
        Ok(())
    }

    pub fn delete_table(&self, table_id: &str) -> AppResult<()> {
        if self.get_table(table_id).is_none() {
            return Err(AppError::not_found("table", table_id, "TABLE_NOT_FOUND"));
        }
        self.db.delete_table(table_id)?;
        let mut state = self.lock();
        state.tables.retain(|t| t.id != table_id);
        state.mappings.remove(table_id);
        Ok(())
    }

    pub fn set_table_device_binding(
        &self,
        table_id: &str,
        device_id: Option<String>,
    ) -> AppResult<()> {
        self.db
            .set_table_device_binding(table_id, device_id.as_deref())?;
        let mut state = self.lock();
        if let Some(table) = state.tables.iter_mut().find(|t| t.id == table_id) {
            table.device_id = device_id.clone();
        }
        let mapping = state.mappings.entry(table_id.to_string()).or_default();
        mapping.device_id = device_id.clone();
        info!("table bound: table={} device={:?}", table_id, device_id);
        Ok(())
    }

    // ---------------- Mappings ----------------

    /// Mapping for a table. Falls back to the table's persisted device
    /// binding when the in-memory mapping lacks one.
    pub fn get_mapping(&self, table_id: &str) -> Mapping {
        let state = self.lock();
        let mut mapping = state.mappings.get(table_id).cloned().unwrap_or_default();
        if mapping.device_id.is_none() {
            if let Some(table) = state.tables.iter().find(|t| t.id == table_id) {
                mapping.device_id = table.device_id.clone();
            }
        }
        mapping
    }

    pub fn upsert_mapping(
        &self,
        table_id: &str,
        device_id: Option<String>,
        rows_patch: HashMap<String, MappingRow>,
    ) -> AppResult<Mapping> {
        let patched = rows_patch.len();
        {
            let mut state = self.lock();
            let mapping = state.mappings.entry(table_id.to_string()).or_default();
            if device_id.is_some() {
                mapping.device_id = device_id.clone();
            }
            for (key, row) in rows_patch {
                mapping.rows.insert(key, row);
            }
            let bound = mapping.device_id.clone();
            if let Some(table) = state.tables.iter_mut().find(|t| t.id == table_id) {
                table.device_id = bound.clone();
            }
        }
        let mapping = self.get_mapping(table_id);
        self.db
            .set_table_device_binding(table_id, mapping.device_id.as_deref())?;
        self.refresh_mapping_health(table_id)?;
        info!(
            "mapping upsert: table={} device={:?} rows_patched={}",
            table_id, mapping.device_id, patched
        );
        Ok(self.get_mapping(table_id))
    }

    pub fn replace_mapping(&self, table_id: &str, mapping: Mapping) -> AppResult<Mapping> {
        {
            let mut state = self.lock();
            if let Some(table) = state.tables.iter_mut().find(|t| t.id == table_id) {
                table.device_id = mapping.device_id.clone();
            }
            state.mappings.insert(table_id.to_string(), mapping.clone());
        }
        self.db
            .set_table_device_binding(table_id, mapping.device_id.as_deref())?;
        self.refresh_mapping_health(table_id)?;
        info!(
            "mapping replace: table={} device={:?} rows={}",
            table_id,
            mapping.device_id,
            mapping.rows.len()
        );
        Ok(self.get_mapping(table_id))
    }

    /// Delete one row and recompute health; a previously mapped table can
    /// drop back to partial or unmapped.
    pub fn delete_mapping_row(&self, table_id: &str, field_key: &str) -> AppResult<Mapping> {
        {
            let mut state = self.lock();
            if let Some(mapping) = state.mappings.get_mut(table_id) {
                mapping.rows.remove(field_key);
            }
        }
        self.refresh_mapping_health(table_id)?;
        Ok(self.get_mapping(table_id))
    }

    /// Copy rows only; the destination keeps its own device binding
    pub fn copy_mapping(&self, src_table_id: &str, dst_table_id: &str) -> AppResult<Mapping> {
        let rows = {
            let state = self.lock();
            state
                .mappings
                .get(src_table_id)
                .map(|m| m.rows.clone())
                .unwrap_or_default()
        };
        {
            let mut state = self.lock();
            let dst = state.mappings.entry(dst_table_id.to_string()).or_default();
            dst.rows = rows;
        }
        self.refresh_mapping_health(dst_table_id)?;
        Ok(self.get_mapping(dst_table_id))
    }

    /// Health of a table's mapping against its schema's declared keys
    pub fn mapping_health_of(&self, table_id: &str) -> MappingHealth {
        let mapping = self.get_mapping(table_id);
        let required = self
            .get_table(table_id)
            .map(|t| self.required_keys_for(&t))
            .unwrap_or_default();
        mapping_health(&mapping, &required)
    }

    fn refresh_mapping_health(&self, table_id: &str) -> AppResult<()> {
        let health = self.mapping_health_of(table_id);
        self.db.update_mapping_health(table_id, health)?;
        let mut state = self.lock();
        if let Some(table) = state.tables.iter_mut().find(|t| t.id == table_id) {
            table.mapping_health = health;
        }
        Ok(())
    }

    // ---------------- Devices ----------------

    pub fn list_devices(&self) -> Vec<Device> {
        self.lock().devices.values().map(|d| d.redacted()).collect()
    }

    pub fn get_device(&self, device_id: &str) -> Option<Device> {
        self.lock().devices.get(device_id).map(|d| d.redacted())
    }

    /// Unredacted device, for session opening and the rekey pass
    pub fn get_device_raw(&self, device_id: &str) -> Option<Device> {
        self.lock().devices.get(device_id).cloned()
    }

    pub fn list_devices_raw(&self) -> Vec<Device> {
        self.lock().devices.values().cloned().collect()
    }

    /// Add-or-reuse by case-insensitive name: a collision returns the
    /// existing device without creating a new id.
    pub fn add_device(
        &self,
        id: Option<String>,
        name: &str,
        protocol: Protocol,
        params: JsonValue,
        secrets_sealed: Option<Vec<u8>>,
        auto_reconnect: bool,
    ) -> AppResult<Device> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::required("name", "NAME_REQUIRED"));
        }
        {
            let state = self.lock();
            if let Some(existing) = state
                .devices
                .values()
                .find(|d| d.name.eq_ignore_ascii_case(name))
            {
                debug!("device name collision, reusing {}", existing.id);
                return Ok(existing.redacted());
            }
        }
        let device = Device {
            id: id.unwrap_or_else(|| new_id("dev")),
            name: name.to_string(),
            protocol,
            params,
            secrets_sealed,
            status: DeviceStatus::Disconnected,
            latency_ms: None,
            last_error: None,
            auto_reconnect,
        };
        self.db.save_device(&device)?;
        self.lock().devices.insert(device.id.clone(), device.clone());
        info!("device saved: {} ({} {})", device.name, device.id, device.protocol);
        Ok(device.redacted())
    }

    pub fn update_device_metadata(
        &self,
        device_id: &str,
        name: Option<String>,
        auto_reconnect: Option<bool>,
    ) -> AppResult<Device> {
        let updated = {
            let mut state = self.lock();
            let device = state.devices.get_mut(device_id).ok_or_else(|| {
                AppError::not_found("device", device_id, "DEVICE_NOT_FOUND")
            })?;
            if let Some(name) = name {
                device.name = name;
            }
            if let Some(auto) = auto_reconnect {
                device.auto_reconnect = auto;
            }
            device.clone()
        };
        self.db.save_device(&updated)?;
        Ok(updated.redacted())
    }

    pub fn set_device_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
        latency_ms: Option<i64>,
        last_error: Option<String>,
    ) -> AppResult<Device> {
        let updated = {
            let mut state = self.lock();
            let device = state.devices.get_mut(device_id).ok_or_else(|| {
                AppError::not_found("device", device_id, "DEVICE_NOT_FOUND")
            })?;
            device.status = status;
            device.latency_ms = latency_ms;
            device.last_error = last_error.clone();
            device.clone()
        };
        self.db
            .update_device_status(device_id, status, latency_ms, last_error.as_deref())?;
        Ok(updated.redacted())
    }

    pub fn set_device_secrets(&self, device_id: &str, sealed: Vec<u8>) -> AppResult<()> {
        self.db.update_device_secrets(device_id, &sealed)?;
        let mut state = self.lock();
        if let Some(device) = state.devices.get_mut(device_id) {
            device.secrets_sealed = Some(sealed);
        }
        Ok(())
    }

    pub fn delete_device(&self, device_id: &str) -> AppResult<()> {
        if self.get_device(device_id).is_none() {
            return Err(AppError::not_found("device", device_id, "DEVICE_NOT_FOUND"));
        }
        self.db.delete_device(device_id)?;
        self.lock().devices.remove(device_id);
        Ok(())
    }

    // ---------------- Gateways ----------------

    pub fn list_gateways(&self) -> Vec<Gateway> {
        self.lock().gateways.clone()
    }

    pub fn get_gateway(&self, gateway_id: &str) -> Option<Gateway> {
        self.lock()
            .gateways
            .iter()
            .find(|g| g.id == gateway_id)
            .cloned()
    }

    /// Add-or-reuse by name or host (both unique)
    pub fn add_gateway(
        &self,
        id: Option<String>,
        name: &str,
        host: &str,
        adapter_id: Option<String>,
        nic_hint: Option<String>,
        ports: &[i64],
        protocol_hint: Option<String>,
        tags: Vec<String>,
    ) -> AppResult<Gateway> {
        let ports = sanitize_ports(ports)?;
        let gateway = Gateway {
            id: id.unwrap_or_else(|| new_id("gw")),
            name: name.trim().to_string(),
            host: host.trim().to_string(),
            nic_hint: nic_hint.or_else(|| adapter_id.clone()),
            adapter_id,
            ports,
            protocol_hint,
            tags,
            status: GatewayStatus::Unknown,
            last_ping: None,
            last_tcp: None,
            created_at: Some(now_utc_iso()),
            updated_at: Some(now_utc_iso()),
            last_test_at: None,
        };
        gateway.validate()?;
        {
            let state = self.lock();
            if let Some(existing) = state.gateways.iter().find(|g| {
                g.name.eq_ignore_ascii_case(&gateway.name)
                    || g.host.eq_ignore_ascii_case(&gateway.host)
            }) {
                return Ok(existing.clone());
            }
        }
        self.db.save_gateway(&gateway)?;
        self.lock().gateways.push(gateway.clone());
        info!("gateway saved: {} ({})", gateway.name, gateway.id);
        Ok(gateway)
    }

    pub fn update_gateway(
        &self,
        gateway_id: &str,
        name: Option<String>,
        host: Option<String>,
        nic_hint: Option<String>,
        ports: Option<Vec<i64>>,
        protocol_hint: Option<String>,
        tags: Option<Vec<String>>,
    ) -> AppResult<Gateway> {
        let sanitized = match ports {
            Some(raw) => Some(sanitize_ports(&raw)?),
            None => None,
        };
        let updated = {
            let mut state = self.lock();
            let gateway = state
                .gateways
                .iter_mut()
                .find(|g| g.id == gateway_id)
                .ok_or_else(|| AppError::not_found("gateway", gateway_id, "GATEWAY_NOT_FOUND"))?;
            if let Some(name) = name {
                gateway.name = name;
            }
            if let Some(host) = host {
                gateway.host = host;
            }
            if nic_hint.is_some() {
                gateway.nic_hint = nic_hint;
            }
            if let Some(ports) = sanitized {
                gateway.ports = ports;
            }
            if protocol_hint.is_some() {
                gateway.protocol_hint = protocol_hint;
            }
            if let Some(tags) = tags {
                gateway.tags = tags;
            }
            gateway.updated_at = Some(now_utc_iso());
            gateway.clone()
        };
        updated.validate()?;
        self.db.save_gateway(&updated)?;
        Ok(updated)
    }

    /// Deletion is blocked while a saved device references the gateway
    pub fn delete_gateway(&self, gateway_id: &str) -> AppResult<()> {
        {
            let state = self.lock();
            if !state.gateways.iter().any(|g| g.id == gateway_id) {
                return Err(AppError::not_found(
                    "gateway",
                    gateway_id,
                    "GATEWAY_NOT_FOUND",
                ));
            }
            let referenced = state.devices.values().any(|d| {
                d.params
                    .get("gatewayId")
                    .and_then(|v| v.as_str())
                    .map(|gid| gid == gateway_id)
                    .unwrap_or(false)
            });
            if referenced {
                return Err(AppError::GatewayInUse {
                    id: gateway_id.to_string(),
                });
            }
        }
        self.db.delete_gateway(gateway_id)?;
        self.lock().gateways.retain(|g| g.id != gateway_id);
        Ok(())
    }

    /// One connectivity test per gateway per 3s
    pub fn rate_limit_gateway_test(&self, gateway_id: &str) -> AppResult<()> {
        let mut state = self.lock();
        let now = Instant::now();
        if let Some(last) = state.gw_last_test.get(gateway_id) {
            let elapsed = now.duration_since(*last).as_millis() as u64;
            if elapsed < GATEWAY_TEST_MIN_INTERVAL_MS {
                return Err(AppError::RateLimited {
                    resource: format!("gateway {}", gateway_id),
                    retry_after_ms: GATEWAY_TEST_MIN_INTERVAL_MS - elapsed,
                });
            }
        }
        state.gw_last_test.insert(gateway_id.to_string(), now);
        Ok(())
    }

    /// Record a test result and derive reachability status
    pub fn set_gateway_health(
        &self,
        gateway_id: &str,
        last_ping: Option<JsonValue>,
        last_tcp: Option<JsonValue>,
    ) -> AppResult<Gateway> {
        let updated = {
            let mut state = self.lock();
            let gateway = state
                .gateways
                .iter_mut()
                .find(|g| g.id == gateway_id)
                .ok_or_else(|| AppError::not_found("gateway", gateway_id, "GATEWAY_NOT_FOUND"))?;
            let ping_ok = last_ping
                .as_ref()
                .and_then(|p| p.get("ok"))
                .and_then(|v| v.as_bool());
            let any_open = last_tcp
                .as_ref()
                .and_then(|t| t.as_array())
                .map(|rs| {
                    rs.iter().any(|r| {
                        r.get("status").and_then(|s| s.as_str()) == Some("open")
                            || r.get("open").and_then(|o| o.as_bool()).unwrap_or(false)
                    })
                })
                .unwrap_or(false);
            if last_ping.is_some() || last_tcp.is_some() {
                gateway.status = if ping_ok == Some(true) || any_open {
                    if ping_ok == Some(false) && any_open {
                        GatewayStatus::Limited
                    } else {
                        GatewayStatus::Reachable
                    }
                } else {
                    GatewayStatus::Unreachable
                };
            }
            if last_ping.is_some() {
                gateway.last_ping = last_ping;
            }
            if last_tcp.is_some() {
                gateway.last_tcp = last_tcp;
            }
            gateway.last_test_at = Some(now_utc_iso());
            gateway.clone()
        };
        self.db.save_gateway(&updated)?;
        Ok(updated)
    }

    // ---------------- Jobs ----------------

    pub fn list_jobs(&self) -> Vec<Job> {
        self.lock().jobs.clone()
    }

    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        self.lock().jobs.iter().find(|j| j.id == job_id).cloned()
    }

    /// Create a job after preflight: at least one table, every table known
    /// and at least partially mapped.
    pub fn create_job(&self, mut job: Job) -> AppResult<Job> {
        job.validate()?;
        for table_id in &job.tables {
            let table = self
                .get_table(table_id)
                .ok_or_else(|| AppError::not_found("table", table_id, "TABLE_NOT_FOUND"))?;
            if self.mapping_health_of(&table.id) == MappingHealth::Unmapped {
                return Err(AppError::validation(
                    "tables",
                    "NO_MAPPED_COLUMNS",
                    format!("Table {} has no mapped columns", table.name),
                ));
            }
        }
        if job.id.is_empty() {
            job.id = new_id("job");
        }
        self.db.save_job(&job)?;
        let mut state = self.lock();
        state.jobs.retain(|j| j.id != job.id);
        state.jobs.push(job.clone());
        info!("job created: {} ({:?}, {} tables)", job.name, job.job_type, job.tables.len());
        Ok(job)
    }

    pub fn set_job_status(&self, job_id: &str, status: JobStatus) -> AppResult<Job> {
        let updated = {
            let mut state = self.lock();
            let job = state
                .jobs
                .iter_mut()
                .find(|j| j.id == job_id)
                .ok_or_else(|| AppError::not_found("job", job_id, "JOB_NOT_FOUND"))?;
            job.status = status;
            job.clone()
        };
        self.db.update_job_status(job_id, status)?;
        Ok(updated)
    }

    pub fn set_job_enabled(&self, job_id: &str, enabled: bool) -> AppResult<Job> {
        let updated = {
            let mut state = self.lock();
            let job = state
                .jobs
                .iter_mut()
                .find(|j| j.id == job_id)
                .ok_or_else(|| AppError::not_found("job", job_id, "JOB_NOT_FOUND"))?;
            job.enabled = enabled;
            job.clone()
        };
        self.db.save_job(&updated)?;
        Ok(updated)
    }

    pub fn delete_job(&self, job_id: &str) -> AppResult<bool> {
        let existed = {
            let mut state = self.lock();
            let before = state.jobs.len();
            state.jobs.retain(|j| j.id != job_id);
            state.jobs.len() < before
        };
        let db_removed = self.db.delete_job(job_id)?;
        if !(existed || db_removed) {
            warn!("delete of unknown job {}", job_id);
        }
        Ok(existed || db_removed)
    }
}

/// Expand `prefix{a..b}suffix` patterns into concrete names
pub fn expand_pattern(name: &str) -> Vec<String> {
    let (Some(open), Some(close)) = (name.find('{'), name.find('}')) else {
        return vec![name.to_string()];
    };
    if close < open {
        return vec![name.to_string()];
    }
    let inner = &name[open + 1..close];
    let Some((a, b)) = inner.split_once("..") else {
        return vec![name.to_string()];
    };
    let (Ok(start), Ok(end)) = (a.parse::<u64>(), b.parse::<u64>()) else {
        return vec![name.to_string()];
    };
    if end < start || end - start > 10_000 {
        return vec![name.to_string()];
    }
    let prefix = &name[..open];
    let suffix = &name[close + 1..];
    (start..=end)
        .map(|i| format!("{}{}{}", prefix, i, suffix))
        .collect()
}

/// Checksum of a schema's field list; stored on tables to detect drift
pub fn schema_hash(schema: &ParentSchema) -> String {
    let mut hasher = Sha256::new();
    for field in &schema.fields {
        hasher.update(field.key.as_bytes());
        hasher.update(b":");
        hasher.update(field.dtype.to_string().as_bytes());
        hasher.update(b",");
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests;
