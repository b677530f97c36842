//! Shared test harness
//!
//! Builds a fully wired agent over an in-memory catalog, an in-memory
//! sqlite target and a scripted protocol session factory, so tests can
//! exercise the command surface end to end without touching the network.

use crate::catalog::appdb::AppDb;
use crate::catalog::CatalogStore;
use crate::commands::AppState;
use crate::devices::DeviceSessionManager;
use crate::errors::{AppError, AppResult};
use crate::jobs::JobEngine;
use crate::mapping::MappingResolver;
use crate::metrics::MetricsRegistry;
use crate::middleware::auth::AuthManager;
use crate::migrate::MigrationPlanner;
use crate::models::*;
use crate::protocols::{ProbeOutcome, ProtocolSession, SessionFactory, Tag, Value};
use crate::secrets::{KeyfileSecretBox, SecretBox, SecretScope};
use crate::targets::TargetRegistry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const TEST_TOKEN: &str = "test-token";

/// Scripted tag values, shared with the factory's sessions
#[derive(Default)]
pub struct ScriptedTags {
    values: Mutex<HashMap<String, Value>>,
    refuse_connect: AtomicBool,
}

impl ScriptedTags {
    pub fn set(&self, node_id: &str, value: Value) {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node_id.to_string(), value);
    }

    pub fn clear(&self, node_id: &str) {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(node_id);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }
}

pub struct ScriptedFactory {
    pub tags: Arc<ScriptedTags>,
}

struct ScriptedSession {
    values: HashMap<String, Value>,
    ok: bool,
}

impl ProtocolSession for ScriptedSession {
    fn probe(&mut self) -> ProbeOutcome {
        ProbeOutcome {
            ok: self.ok,
            latency_ms: 4,
            error: if self.ok {
                None
            } else {
                Some("TCP_CONNECT_FAILED".into())
            },
        }
    }

    fn read(&mut self, tag: &Tag) -> AppResult<Value> {
        let key = match tag {
            Tag::Opcua { node_id } => node_id.clone(),
            Tag::Modbus { address, .. } => address.to_string(),
        };
        self.values
            .get(&key)
            .cloned()
            .ok_or_else(|| AppError::ReadError {
                message: format!("tag {} not scripted", key),
            })
    }

    fn close(&mut self) {}
}

impl SessionFactory for ScriptedFactory {
    fn open(&self, _device: &Device) -> AppResult<Box<dyn ProtocolSession>> {
        let ok = !self.tags.refuse_connect.load(Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            values: self
                .tags
                .values
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            ok,
        }))
    }
}

/// A fully wired agent over in-memory storage
pub struct TestAgent {
    pub state: AppState,
    pub tags: Arc<ScriptedTags>,
    _key_dir: tempfile::TempDir,
}

impl TestAgent {
    pub fn new() -> Self {
        let catalog =
            Arc::new(CatalogStore::new(Arc::new(AppDb::open_in_memory().unwrap())).unwrap());
        let targets = Arc::new(TargetRegistry::new(catalog.clone()));
        let tags = Arc::new(ScriptedTags::default());
        let factory: Arc<dyn SessionFactory> = Arc::new(ScriptedFactory { tags: tags.clone() });
        let resolver = Arc::new(MappingResolver::new(
            catalog.clone(),
            targets.clone(),
            factory.clone(),
        ));
        let planner = Arc::new(MigrationPlanner::new(catalog.clone(), targets.clone()));
        let metrics = Arc::new(MetricsRegistry::new());
        let devices = Arc::new(DeviceSessionManager::new(catalog.clone(), factory.clone()));
        let jobs = Arc::new(JobEngine::new(
            catalog.clone(),
            targets.clone(),
            resolver.clone(),
            factory.clone(),
            metrics.clone(),
        ));
        let key_dir = tempfile::tempdir().expect("temp key dir");
        let secret_box: Arc<dyn SecretBox> = Arc::new(
            KeyfileSecretBox::load_or_create(SecretScope::User, key_dir.path())
                .expect("secret box"),
        );
        let state = AppState {
            catalog,
            targets,
            planner,
            resolver,
            devices,
            jobs,
            metrics,
            secret_box,
            auth: Arc::new(AuthManager::new(TEST_TOKEN)),
            port: 5175,
        };
        Self {
            state,
            tags,
            _key_dir: key_dir,
        }
    }

    pub fn token(&self) -> Option<&str> {
        Some(TEST_TOKEN)
    }

    /// Schema `LTPanel` + default in-memory sqlite target + one table
    pub fn seed_panel_table(&self, table_name: &str) -> DeviceTable {
        let schema = match self
            .state
            .catalog
            .list_schemas()
            .into_iter()
            .find(|s| s.name == "LTPanel")
        {
            Some(schema) => schema,
            None => self
                .state
                .catalog
                .create_schema(
                    None,
                    "LTPanel",
                    vec![
                        Field {
                            key: "r_current".into(),
                            dtype: FieldType::Float,
                            unit: Some("A".into()),
                            scale: Some(1.0),
                            description: None,
                        },
                        Field {
                            key: "voltage".into(),
                            dtype: FieldType::Float,
                            unit: Some("V".into()),
                            scale: Some(1.0),
                            description: None,
                        },
                    ],
                )
                .unwrap(),
        };
        if self.state.catalog.default_target_id().is_none() {
            let target = self
                .state
                .catalog
                .add_target(None, DbProvider::Sqlite, ":memory:", None, None)
                .unwrap();
            self.state.catalog.set_default_target(&target.id).unwrap();
        }
        let (tables, _) = self
            .state
            .catalog
            .add_tables_bulk(&schema.id, &[table_name.to_string()], None)
            .unwrap();
        tables.into_iter().next().unwrap()
    }

    /// Connected opcua device with Current/Voltage tags scripted
    pub fn seed_connected_device(&self) -> Device {
        self.tags
            .set("ns=2;s=Device1.Current", Value::I64(10));
        self.tags
            .set("ns=2;s=Device1.Voltage", Value::I64(230));
        let device = self
            .state
            .catalog
            .add_device(
                None,
                "D1",
                Protocol::Opcua,
                serde_json::json!({"endpoint": "opc.tcp://127.0.0.1:4840"}),
                None,
                true,
            )
            .unwrap();
        self.state
            .catalog
            .set_device_status(&device.id, DeviceStatus::Connected, Some(3), None)
            .unwrap();
        device
    }

    /// Standard mapping for a panel table bound to `device_id`
    pub fn seed_mapping(&self, table_id: &str, device_id: &str) {
        let mut rows = HashMap::new();
        rows.insert(
            "r_current".to_string(),
            MappingRow {
                protocol: Protocol::Opcua,
                address: "ns=2;s=Device1.Current".into(),
                data_type: None,
                scale: Some(0.1),
                deadband: None,
            },
        );
        rows.insert(
            "voltage".to_string(),
            MappingRow {
                protocol: Protocol::Opcua,
                address: "ns=2;s=Device1.Voltage".into(),
                data_type: None,
                scale: None,
                deadband: None,
            },
        );
        self.state
            .resolver
            .upsert(table_id, Some(device_id.to_string()), rows)
            .unwrap();
    }
}

impl Default for TestAgent {
    fn default() -> Self {
        Self::new()
    }
}
