//! App Local DB persistence layer
//!
//! Owns the embedded SQLite file (`app.db`) that backs the catalog. Table
//! names are stable and load/save functions are plain row mappers; all
//! higher-level semantics (uniqueness, health, defaults) live in
//! [`super::store::CatalogStore`].

use crate::errors::{AppError, AppResult};
use crate::models::*;
use log::{debug, info};
use rusqlite::{params, Connection, OpenFlags};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Resolve the application folder: `$PLCLOGGER_DATA_DIR` wins, then the
/// service path (`$ProgramData`), then the per-user path, then CWD.
pub fn app_folder() -> PathBuf {
    let base = std::env::var("PLCLOGGER_DATA_DIR")
        .ok()
        .map(PathBuf::from)
        .or_else(|| std::env::var("ProgramData").ok().map(|p| PathBuf::from(p)))
        .or_else(|| std::env::var("LOCALAPPDATA").ok().map(|p| PathBuf::from(p)))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let folder = base.join("PLCLogger").join("agent");
    let _ = std::fs::create_dir_all(&folder);
    folder
}

/// Path of the embedded catalog database
pub fn app_db_path() -> PathBuf {
    app_folder().join("app.db")
}

/// Handle over the embedded catalog database
pub struct AppDb {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl AppDb {
    /// Open (creating if needed) the catalog database at `path`
    pub fn open(path: &Path) -> AppResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        let db = Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        };
        db.init()?;
        info!("App DB ready at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory catalog database (tests)
    pub fn open_in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        };
        db.init()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Execute `f` inside a single transaction
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> AppResult<T>,
    ) -> AppResult<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| AppError::database("app db lock poisoned"))?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> AppResult<T>) -> AppResult<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| AppError::database("app db lock poisoned"))?;
        f(&conn)
    }

    fn init(&self) -> AppResult<()> {
        self.with_conn(|c| {
            c.execute_batch(
                "CREATE TABLE IF NOT EXISTS app_meta (
                    key TEXT PRIMARY KEY,
                    value TEXT
                );
                CREATE TABLE IF NOT EXISTS app_schemas (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS app_schema_fields (
                    schema_id TEXT,
                    key TEXT,
                    type TEXT,
                    unit TEXT,
                    scale REAL,
                    desc TEXT,
                    PRIMARY KEY (schema_id, key)
                );
                CREATE TABLE IF NOT EXISTS app_db_targets (
                    id TEXT PRIMARY KEY,
                    provider TEXT,
                    conn TEXT,
                    status TEXT,
                    last_msg TEXT
                );
                CREATE TABLE IF NOT EXISTS app_device_tables (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    schema_id TEXT,
                    db_target_id TEXT,
                    status TEXT,
                    last_migrated_at TEXT,
                    schema_hash TEXT,
                    mapping_health TEXT,
                    device_id TEXT
                );
                CREATE TABLE IF NOT EXISTS app_gateways (
                    id TEXT PRIMARY KEY,
                    name TEXT UNIQUE,
                    host TEXT UNIQUE,
                    adapter_id TEXT,
                    nic_hint TEXT,
                    ports_json TEXT,
                    protocol_hint TEXT,
                    tags_json TEXT,
                    status TEXT,
                    last_ping_json TEXT,
                    last_tcp_json TEXT,
                    created_at TEXT,
                    updated_at TEXT,
                    last_test_at TEXT
                );
                CREATE TABLE IF NOT EXISTS app_devices (
                    id TEXT PRIMARY KEY,
                    name TEXT UNIQUE,
                    protocol TEXT,
                    params_json TEXT,
                    status TEXT,
                    latency_ms INTEGER,
                    last_error TEXT,
                    auto_reconnect INTEGER DEFAULT 1
                );
                CREATE TABLE IF NOT EXISTS app_jobs (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    type TEXT,
                    tables_json TEXT,
                    columns_json TEXT,
                    interval_ms INTEGER,
                    enabled INTEGER,
                    status TEXT,
                    batching_json TEXT,
                    cpu_budget TEXT,
                    triggers_json TEXT,
                    metrics_json TEXT
                );
                CREATE TABLE IF NOT EXISTS app_job_runs (
                    id TEXT PRIMARY KEY,
                    job_id TEXT NOT NULL,
                    started_at TEXT,
                    stopped_at TEXT,
                    duration_ms INTEGER,
                    rows INTEGER,
                    read_lat_avg REAL,
                    write_lat_avg REAL,
                    error_pct REAL
                );
                CREATE TABLE IF NOT EXISTS app_metrics_jobs_minute (
                    job_id TEXT NOT NULL,
                    minute_utc TEXT NOT NULL,
                    reads INTEGER,
                    read_err INTEGER,
                    writes INTEGER,
                    write_err INTEGER,
                    read_p50 REAL,
                    read_p95 REAL,
                    write_p50 REAL,
                    write_p95 REAL,
                    triggers INTEGER,
                    fires INTEGER,
                    suppressed INTEGER,
                    PRIMARY KEY (job_id, minute_utc)
                );
                CREATE TABLE IF NOT EXISTS app_metrics_system_minute (
                    minute_utc TEXT PRIMARY KEY,
                    cpu_avg REAL,
                    mem_avg REAL,
                    disk_r INTEGER,
                    disk_w INTEGER,
                    net_rx INTEGER,
                    net_tx INTEGER,
                    proc_cpu_avg REAL,
                    proc_rss_mb REAL
                );
                CREATE TABLE IF NOT EXISTS app_job_errors_minute (
                    job_id TEXT NOT NULL,
                    code TEXT NOT NULL,
                    minute_utc TEXT NOT NULL,
                    count INTEGER,
                    last_message TEXT,
                    PRIMARY KEY (job_id, code, minute_utc)
                );",
            )?;
            // Additive evolution for databases created before credential sealing
            let cols = table_columns(c, "app_devices")?;
            if !cols.iter().any(|name| name == "secrets_sealed") {
                c.execute("ALTER TABLE app_devices ADD COLUMN secrets_sealed BLOB", [])?;
            }
            Ok(())
        })
    }

    // ---------- Meta ----------

    pub fn get_meta(&self, key: &str) -> AppResult<Option<String>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare("SELECT value FROM app_meta WHERE key=?1")?;
            let mut rows = stmt.query(params![key])?;
            match rows.next()? {
                Some(row) => Ok(row.get(0)?),
                None => Ok(None),
            }
        })
    }

    pub fn set_meta(&self, key: &str, value: &str) -> AppResult<()> {
        self.with_conn(|c| {
            c.execute(
                "INSERT OR REPLACE INTO app_meta (key,value) VALUES (?1,?2)",
                params![key, value],
            )?;
            Ok(())
        })
    }

    // ---------- Schemas ----------

    pub fn load_schemas(&self) -> AppResult<Vec<ParentSchema>> {
        self.with_conn(|c| {
            let mut out = Vec::new();
            let mut stmt = c.prepare("SELECT id, name FROM app_schemas ORDER BY name")?;
            let heads: Vec<(String, String)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<_, _>>()?;
            let mut fstmt = c.prepare(
                "SELECT key, type, unit, scale, desc FROM app_schema_fields
                 WHERE schema_id=?1 ORDER BY key",
            )?;
            for (id, name) in heads {
                let fields: Vec<Field> = fstmt
                    .query_map(params![id], |row| {
                        let dtype: String = row.get(1)?;
                        Ok(Field {
                            key: row.get(0)?,
                            dtype: dtype.parse().unwrap_or(FieldType::String),
                            unit: row.get(2)?,
                            scale: row.get(3)?,
                            description: row.get(4)?,
                        })
                    })?
                    .collect::<Result<_, _>>()?;
                out.push(ParentSchema { id, name, fields });
            }
            Ok(out)
        })
    }

    pub fn save_schema(&self, schema: &ParentSchema) -> AppResult<()> {
        self.with_transaction(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO app_schemas (id,name) VALUES (?1,?2)",
                params![schema.id, schema.name],
            )?;
            tx.execute(
                "DELETE FROM app_schema_fields WHERE schema_id=?1",
                params![schema.id],
            )?;
            for field in &schema.fields {
                tx.execute(
                    "INSERT OR REPLACE INTO app_schema_fields
                     (schema_id,key,type,unit,scale,desc) VALUES (?1,?2,?3,?4,?5,?6)",
                    params![
                        schema.id,
                        field.key,
                        field.dtype.to_string(),
                        field.unit,
                        field.scale,
                        field.description
                    ],
                )?;
            }
            Ok(())
        })
    }

    pub fn delete_schema(&self, schema_id: &str) -> AppResult<bool> {
        self.with_transaction(|tx| {
            tx.execute(
                "DELETE FROM app_schema_fields WHERE schema_id=?1",
                params![schema_id],
            )?;
            let n = tx.execute("DELETE FROM app_schemas WHERE id=?1", params![schema_id])?;
            Ok(n > 0)
        })
    }

    // ---------- Targets ----------

    pub fn load_targets(&self) -> AppResult<(Vec<DbTarget>, Option<String>)> {
        let default_id = self.get_meta("default_db_target")?;
        let items = self.with_conn(|c| {
            let mut stmt =
                c.prepare("SELECT id,provider,conn,status,last_msg FROM app_db_targets ORDER BY id")?;
            let items: Vec<DbTarget> = stmt
                .query_map([], |row| {
                    let provider: String = row.get(1)?;
                    let status: String = row.get::<_, Option<String>>(3)?.unwrap_or_default();
                    Ok(DbTarget {
                        id: row.get(0)?,
                        provider: provider.parse().unwrap_or(DbProvider::Sqlite),
                        conn: row.get(2)?,
                        status: status.parse().unwrap_or(TargetStatus::Untested),
                        last_msg: row.get(4)?,
                    })
                })?
                .collect::<Result<_, _>>()?;
            Ok(items)
        })?;
        Ok((items, default_id))
    }

    pub fn save_target(&self, target: &DbTarget) -> AppResult<()> {
        self.with_conn(|c| {
            c.execute(
                "INSERT OR REPLACE INTO app_db_targets (id,provider,conn,status,last_msg)
                 VALUES (?1,?2,?3,?4,?5)",
                params![
                    target.id,
                    target.provider.to_string(),
                    target.conn,
                    target.status.to_string(),
                    target.last_msg
                ],
            )?;
            Ok(())
        })
    }

    pub fn delete_target(&self, target_id: &str) -> AppResult<bool> {
        self.with_conn(|c| {
            let n = c.execute("DELETE FROM app_db_targets WHERE id=?1", params![target_id])?;
            Ok(n > 0)
        })
    }

    pub fn set_default_target(&self, target_id: &str) -> AppResult<()> {
        self.set_meta("default_db_target", target_id)
    }

    pub fn count_tables_referencing_target(&self, target_id: &str) -> AppResult<i64> {
        self.with_conn(|c| {
            let n: i64 = c.query_row(
                "SELECT COUNT(1) FROM app_device_tables WHERE db_target_id=?1",
                params![target_id],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }

    // ---------- Device tables ----------

    pub fn load_device_tables(&self) -> AppResult<Vec<DeviceTable>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT id,name,schema_id,db_target_id,status,last_migrated_at,
                        schema_hash,mapping_health,device_id
                 FROM app_device_tables ORDER BY name",
            )?;
            let items = stmt
                .query_map([], |row| {
                    let status: String = row.get::<_, Option<String>>(4)?.unwrap_or_default();
                    let health: String = row.get::<_, Option<String>>(7)?.unwrap_or_default();
                    Ok(DeviceTable {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        schema_id: row.get(2)?,
                        db_target_id: row.get(3)?,
                        status: status.parse().unwrap_or(TableStatus::NotMigrated),
                        last_migrated_at: row.get(5)?,
                        schema_hash: row.get(6)?,
                        mapping_health: health.parse().unwrap_or(MappingHealth::Unmapped),
                        device_id: row.get(8)?,
                    })
                })?
                .collect::<Result<_, _>>()?;
            Ok(items)
        })
    }

    pub fn save_table(&self, table: &DeviceTable) -> AppResult<()> {
        self.with_conn(|c| {
            c.execute(
                "INSERT OR REPLACE INTO app_device_tables
                 (id,name,schema_id,db_target_id,status,last_migrated_at,
                  schema_hash,mapping_health,device_id)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                params![
                    table.id,
                    table.name,
                    table.schema_id,
                    table.db_target_id,
                    table.status.to_string(),
                    table.last_migrated_at,
                    table.schema_hash,
                    table.mapping_health.to_string(),
                    table.device_id
                ],
            )?;
            Ok(())
        })
    }

    pub fn set_table_status(
        &self,
        table_id: &str,
        status: TableStatus,
        last_migrated_at: Option<&str>,
    ) -> AppResult<()> {
        self.with_conn(|c| {
            c.execute(
                "UPDATE app_device_tables SET status=?1, last_migrated_at=?2 WHERE id=?3",
                params![status.to_string(), last_migrated_at, table_id],
            )?;
            Ok(())
        })
    }

    pub fn update_mapping_health(&self, table_id: &str, health: MappingHealth) -> AppResult<()> {
        self.with_conn(|c| {
            c.execute(
                "UPDATE app_device_tables SET mapping_health=?1 WHERE id=?2",
                params![health.to_string(), table_id],
            )?;
            Ok(())
        })
    }

    pub fn set_table_device_binding(
        &self,
        table_id: &str,
        device_id: Option<&str>,
    ) -> AppResult<()> {
        self.with_conn(|c| {
            c.execute(
                "UPDATE app_device_tables SET device_id=?1 WHERE id=?2",
                params![device_id, table_id],
            )?;
            Ok(())
        })
    }

    pub fn delete_table(&self, table_id: &str) -> AppResult<bool> {
        self.with_conn(|c| {
            let n = c.execute("DELETE FROM app_device_tables WHERE id=?1", params![table_id])?;
            Ok(n > 0)
        })
    }

    // ---------- Gateways ----------

    pub fn load_gateways(&self) -> AppResult<Vec<Gateway>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT id,name,host,adapter_id,nic_hint,ports_json,protocol_hint,tags_json,
                        status,last_ping_json,last_tcp_json,created_at,updated_at,last_test_at
                 FROM app_gateways ORDER BY name",
            )?;
            let items = stmt
                .query_map([], |row| {
                    let ports_json: Option<String> = row.get(5)?;
                    let tags_json: Option<String> = row.get(7)?;
                    let status: String = row.get::<_, Option<String>>(8)?.unwrap_or_default();
                    let last_ping: Option<String> = row.get(9)?;
                    let last_tcp: Option<String> = row.get(10)?;
                    Ok(Gateway {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        host: row.get(2)?,
                        adapter_id: row.get(3)?,
                        nic_hint: row.get(4)?,
                        ports: ports_json
                            .and_then(|s| serde_json::from_str(&s).ok())
                            .unwrap_or_default(),
                        protocol_hint: row.get(6)?,
                        tags: tags_json
                            .and_then(|s| serde_json::from_str(&s).ok())
                            .unwrap_or_default(),
                        status: status.parse().unwrap_or(GatewayStatus::Unknown),
                        last_ping: last_ping.and_then(|s| serde_json::from_str(&s).ok()),
                        last_tcp: last_tcp.and_then(|s| serde_json::from_str(&s).ok()),
                        created_at: row.get(11)?,
                        updated_at: row.get(12)?,
                        last_test_at: row.get(13)?,
                    })
                })?
                .collect::<Result<_, _>>()?;
            Ok(items)
        })
    }

    pub fn save_gateway(&self, gw: &Gateway) -> AppResult<()> {
        self.with_conn(|c| {
            c.execute(
                "INSERT OR REPLACE INTO app_gateways
                 (id,name,host,adapter_id,nic_hint,ports_json,protocol_hint,tags_json,
                  status,last_ping_json,last_tcp_json,created_at,updated_at,last_test_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
                params![
                    gw.id,
                    gw.name,
                    gw.host,
                    gw.adapter_id,
                    gw.nic_hint,
                    serde_json::to_string(&gw.ports).unwrap_or_else(|_| "[]".into()),
                    gw.protocol_hint,
                    serde_json::to_string(&gw.tags).unwrap_or_else(|_| "[]".into()),
                    gw.status.to_string(),
                    gw.last_ping.as_ref().map(|v| v.to_string()),
                    gw.last_tcp.as_ref().map(|v| v.to_string()),
                    gw.created_at,
                    gw.updated_at,
                    gw.last_test_at
                ],
            )?;
            Ok(())
        })
    }

    pub fn delete_gateway(&self, gateway_id: &str) -> AppResult<bool> {
        self.with_conn(|c| {
            let n = c.execute("DELETE FROM app_gateways WHERE id=?1", params![gateway_id])?;
            Ok(n > 0)
        })
    }

    // ---------- Devices ----------

    pub fn load_devices(&self) -> AppResult<Vec<Device>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT id,name,protocol,params_json,status,latency_ms,last_error,
                        auto_reconnect,secrets_sealed
                 FROM app_devices ORDER BY name",
            )?;
            let items = stmt
                .query_map([], |row| {
                    let protocol: String = row.get(2)?;
                    let params_json: Option<String> = row.get(3)?;
                    let status: String = row.get::<_, Option<String>>(4)?.unwrap_or_default();
                    Ok(Device {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        protocol: protocol.parse().unwrap_or(Protocol::Modbus),
                        params: params_json
                            .and_then(|s| serde_json::from_str(&s).ok())
                            .unwrap_or_else(|| JsonValue::Object(Default::default())),
                        status: status.parse().unwrap_or(DeviceStatus::Disconnected),
                        latency_ms: row.get(5)?,
                        last_error: row.get(6)?,
                        auto_reconnect: row.get::<_, Option<i64>>(7)?.unwrap_or(1) != 0,
                        secrets_sealed: row.get(8)?,
                    })
                })?
                .collect::<Result<_, _>>()?;
            Ok(items)
        })
    }

    pub fn save_device(&self, dev: &Device) -> AppResult<()> {
        self.with_conn(|c| {
            c.execute(
                "INSERT OR REPLACE INTO app_devices
                 (id,name,protocol,params_json,status,latency_ms,last_error,
                  auto_reconnect,secrets_sealed)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                params![
                    dev.id,
                    dev.name,
                    dev.protocol.to_string(),
                    dev.params.to_string(),
                    dev.status.to_string(),
                    dev.latency_ms,
                    dev.last_error,
                    dev.auto_reconnect as i64,
                    dev.secrets_sealed
                ],
            )?;
            Ok(())
        })
    }

    pub fn update_device_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
        latency_ms: Option<i64>,
        last_error: Option<&str>,
    ) -> AppResult<()> {
        self.with_conn(|c| {
            c.execute(
                "UPDATE app_devices SET status=?1, latency_ms=?2, last_error=?3 WHERE id=?4",
                params![status.to_string(), latency_ms, last_error, device_id],
            )?;
            Ok(())
        })
    }

    pub fn update_device_secrets(&self, device_id: &str, sealed: &[u8]) -> AppResult<()> {
        self.with_conn(|c| {
            c.execute(
                "UPDATE app_devices SET secrets_sealed=?1 WHERE id=?2",
                params![sealed, device_id],
            )?;
            Ok(())
        })
    }

    pub fn delete_device(&self, device_id: &str) -> AppResult<bool> {
        self.with_conn(|c| {
            let n = c.execute("DELETE FROM app_devices WHERE id=?1", params![device_id])?;
            Ok(n > 0)
        })
    }

    // ---------- Jobs ----------

    pub fn load_jobs(&self) -> AppResult<Vec<Job>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT id,name,type,tables_json,columns_json,interval_ms,enabled,status,
                        batching_json,cpu_budget,triggers_json
                 FROM app_jobs ORDER BY name",
            )?;
            let items = stmt
                .query_map([], |row| {
                    let jtype: String = row.get::<_, Option<String>>(2)?.unwrap_or_default();
                    let tables: Option<String> = row.get(3)?;
                    let columns: Option<String> = row.get(4)?;
                    let status: String = row.get::<_, Option<String>>(7)?.unwrap_or_default();
                    let batching: Option<String> = row.get(8)?;
                    let budget: Option<String> = row.get(9)?;
                    let triggers: Option<String> = row.get(10)?;
                    Ok(Job {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        job_type: jtype.parse().unwrap_or(JobType::Continuous),
                        tables: tables
                            .and_then(|s| serde_json::from_str(&s).ok())
                            .unwrap_or_default(),
                        columns: columns
                            .and_then(|s| serde_json::from_str(&s).ok())
                            .unwrap_or_default(),
                        interval_ms: row.get::<_, Option<i64>>(5)?.unwrap_or(1000).max(0) as u64,
                        enabled: row.get::<_, Option<i64>>(6)?.unwrap_or(0) != 0,
                        status: status.parse().unwrap_or(JobStatus::Stopped),
                        batching: batching
                            .and_then(|s| serde_json::from_str(&s).ok())
                            .unwrap_or_default(),
                        cpu_budget: budget
                            .and_then(|s| serde_json::from_str(&format!("\"{}\"", s)).ok())
                            .unwrap_or_default(),
                        triggers: triggers
                            .and_then(|s| serde_json::from_str(&s).ok())
                            .unwrap_or_default(),
                    })
                })?
                .collect::<Result<_, _>>()?;
            Ok(items)
        })
    }

    pub fn save_job(&self, job: &Job) -> AppResult<()> {
        self.with_conn(|c| {
            c.execute(
                "INSERT OR REPLACE INTO app_jobs
                 (id,name,type,tables_json,columns_json,interval_ms,enabled,status,
                  batching_json,cpu_budget,triggers_json,metrics_json)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                params![
                    job.id,
                    job.name,
                    job.job_type.to_string(),
                    serde_json::to_string(&job.tables).unwrap_or_else(|_| "[]".into()),
                    serde_json::to_string(&job.columns).unwrap_or_else(|_| "\"all\"".into()),
                    job.interval_ms as i64,
                    job.enabled as i64,
                    job.status.to_string(),
                    serde_json::to_string(&job.batching).unwrap_or_else(|_| "{}".into()),
                    match job.cpu_budget {
                        CpuBudget::Low => "low",
                        CpuBudget::Balanced => "balanced",
                        CpuBudget::High => "high",
                    },
                    serde_json::to_string(&job.triggers).unwrap_or_else(|_| "[]".into()),
                    "{}",
                ],
            )?;
            Ok(())
        })
    }

    pub fn update_job_status(&self, job_id: &str, status: JobStatus) -> AppResult<()> {
        self.with_conn(|c| {
            c.execute(
                "UPDATE app_jobs SET status=?1 WHERE id=?2",
                params![status.to_string(), job_id],
            )?;
            Ok(())
        })
    }

    pub fn delete_job(&self, job_id: &str) -> AppResult<bool> {
        self.with_conn(|c| {
            let n = c.execute("DELETE FROM app_jobs WHERE id=?1", params![job_id])?;
            Ok(n > 0)
        })
    }

    // ---------- Run history ----------

    pub fn insert_run(&self, run: &Run) -> AppResult<()> {
        debug!("run persisted: job={} rows={}", run.job_id, run.rows);
        self.with_conn(|c| {
            c.execute(
                "INSERT OR REPLACE INTO app_job_runs
                 (id,job_id,started_at,stopped_at,duration_ms,rows,
                  read_lat_avg,write_lat_avg,error_pct)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                params![
                    run.id,
                    run.job_id,
                    run.started_at,
                    run.stopped_at,
                    run.duration_ms,
                    run.rows,
                    run.read_lat_avg,
                    run.write_lat_avg,
                    run.error_pct
                ],
            )?;
            Ok(())
        })
    }

    pub fn load_runs(
        &self,
        job_id: &str,
        from: Option<&str>,
        to: Option<&str>,
    ) -> AppResult<Vec<Run>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT id,job_id,started_at,stopped_at,duration_ms,rows,
                        read_lat_avg,write_lat_avg,error_pct
                 FROM app_job_runs
                 WHERE job_id=?1
                   AND (?2 IS NULL OR started_at >= ?2)
                   AND (?3 IS NULL OR started_at <= ?3)
                 ORDER BY started_at DESC",
            )?;
            let items = stmt
                .query_map(params![job_id, from, to], |row| {
                    Ok(Run {
                        id: row.get(0)?,
                        job_id: row.get(1)?,
                        started_at: row.get(2)?,
                        stopped_at: row.get(3)?,
                        duration_ms: row.get(4)?,
                        rows: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
                        read_lat_avg: row.get::<_, Option<f64>>(6)?.unwrap_or(0.0),
                        write_lat_avg: row.get::<_, Option<f64>>(7)?.unwrap_or(0.0),
                        error_pct: row.get::<_, Option<f64>>(8)?.unwrap_or(0.0),
                    })
                })?
                .collect::<Result<_, _>>()?;
            Ok(items)
        })
    }

    /// Cascade used by idempotent job deletion
    pub fn delete_job_history(&self, job_id: &str) -> AppResult<()> {
        self.with_transaction(|tx| {
            tx.execute("DELETE FROM app_job_runs WHERE job_id=?1", params![job_id])?;
            tx.execute(
                "DELETE FROM app_metrics_jobs_minute WHERE job_id=?1",
                params![job_id],
            )?;
            tx.execute(
                "DELETE FROM app_job_errors_minute WHERE job_id=?1",
                params![job_id],
            )?;
            Ok(())
        })
    }

    // ---------- Minute rollups ----------

    pub fn upsert_job_minute(
        &self,
        job_id: &str,
        minute_utc: &str,
        counters: &[i64; 7],
        quantiles: &[Option<f64>; 4],
    ) -> AppResult<()> {
        self.with_conn(|c| {
            c.execute(
                "INSERT OR REPLACE INTO app_metrics_jobs_minute
                 (job_id,minute_utc,reads,read_err,writes,write_err,
                  read_p50,read_p95,write_p50,write_p95,triggers,fires,suppressed)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
                params![
                    job_id,
                    minute_utc,
                    counters[0],
                    counters[1],
                    counters[2],
                    counters[3],
                    quantiles[0],
                    quantiles[1],
                    quantiles[2],
                    quantiles[3],
                    counters[4],
                    counters[5],
                    counters[6]
                ],
            )?;
            Ok(())
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn upsert_system_minute(
        &self,
        minute_utc: &str,
        cpu_avg: Option<f64>,
        mem_avg: Option<f64>,
        disk_r: i64,
        disk_w: i64,
        net_rx: i64,
        net_tx: i64,
        proc_cpu_avg: Option<f64>,
        proc_rss_mb: Option<f64>,
    ) -> AppResult<()> {
        self.with_conn(|c| {
            c.execute(
                "INSERT OR REPLACE INTO app_metrics_system_minute
                 (minute_utc,cpu_avg,mem_avg,disk_r,disk_w,net_rx,net_tx,proc_cpu_avg,proc_rss_mb)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                params![
                    minute_utc, cpu_avg, mem_avg, disk_r, disk_w, net_rx, net_tx, proc_cpu_avg,
                    proc_rss_mb
                ],
            )?;
            Ok(())
        })
    }

    pub fn upsert_job_error_minute(
        &self,
        job_id: &str,
        code: &str,
        minute_utc: &str,
        count: i64,
        last_message: &str,
    ) -> AppResult<()> {
        self.with_conn(|c| {
            c.execute(
                "INSERT OR REPLACE INTO app_job_errors_minute
                 (job_id,code,minute_utc,count,last_message)
                 VALUES (?1,?2,?3,?4,?5)",
                params![job_id, code, minute_utc, count, last_message],
            )?;
            Ok(())
        })
    }
}

fn table_columns(conn: &Connection, table: &str) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let cols = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(cols)
}
