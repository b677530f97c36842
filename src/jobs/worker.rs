//! Per-job worker: the polling loop behind a running job
//!
//! One worker thread per job. Each tick reads every mapped field of the
//! job's tables through one session per table, applies scaling, evaluates
//! triggers (trigger jobs), and writes coherent rows into the physical
//! tables. Tick scheduling is deadline-compensated: the next tick is due at
//! `start_of_loop + interval`, so in-tick work does not drift the cadence,
//! and overruns coalesce instead of queuing.

use crate::catalog::CatalogStore;
use crate::jobs::triggers::TriggerEngine;
use crate::metrics::JobMetrics;
use crate::migrate::physical_ident;
use crate::models::*;
use crate::protocols::{tag_for_row, SessionFactory, Value};
use crate::targets::TargetRegistry;
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Buffered rows awaiting a batched flush
struct RowBatch {
    rows: Vec<(String, Vec<(String, Value)>)>,
    opened: Instant,
}

pub(crate) struct JobWorker {
    job: Job,
    catalog: Arc<CatalogStore>,
    targets: Arc<TargetRegistry>,
    factory: Arc<dyn SessionFactory>,
    metrics: Arc<JobMetrics>,
    triggers: TriggerEngine,
    batches: HashMap<String, RowBatch>,
    consecutive_write_failures: u32,
    degraded: bool,
    write_failure_threshold: u32,
}

impl JobWorker {
    pub(crate) fn new(
        job: Job,
        catalog: Arc<CatalogStore>,
        targets: Arc<TargetRegistry>,
        factory: Arc<dyn SessionFactory>,
        metrics: Arc<JobMetrics>,
        write_failure_threshold: u32,
    ) -> Self {
        Self {
            job,
            catalog,
            targets,
            factory,
            metrics,
            triggers: TriggerEngine::new(),
            batches: HashMap::new(),
            consecutive_write_failures: 0,
            degraded: false,
            write_failure_threshold,
        }
    }

    /// Worker loop: wait-on-cancel until the tick deadline, run the tick,
    /// schedule the next one from the loop start
    pub(crate) fn run(mut self, stop_rx: Receiver<()>, done_tx: Sender<()>) {
        let interval = Duration::from_millis(self.job.interval_ms.max(1));
        let mut next_tick = Instant::now();
        loop {
            let now = Instant::now();
            if next_tick > now {
                match stop_rx.recv_timeout(next_tick - now) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            } else {
                match stop_rx.try_recv() {
                    Ok(()) | Err(TryRecvError::Disconnected) => break,
                    Err(TryRecvError::Empty) => {}
                }
            }
            let tick_start = Instant::now();
            next_tick = tick_start + interval;
            self.tick();
        }
        self.flush_batches(true);
        let _ = done_tx.send(());
        debug!("worker for {} exited", self.job.id);
    }

    pub(crate) fn tick(&mut self) {
        match self.job.job_type {
            JobType::Continuous => self.tick_continuous(),
            JobType::Trigger => self.tick_trigger(),
        }
        self.flush_batches(false);
    }

    fn tick_continuous(&mut self) {
        for table_id in self.job.tables.clone() {
            let Some((table, snapshot)) = self.read_table(&table_id) else {
                continue;
            };
            let timestamp = now_ist_iso();
            self.enqueue_row(&table, timestamp, &snapshot);
        }
    }

    fn tick_trigger(&mut self) {
        let now_ms = unix_now_ms();
        let triggers = self.job.triggers.clone();
        for table_id in self.job.tables.clone() {
            let table_triggers: Vec<&Trigger> = triggers
                .iter()
                .filter(|t| t.table_id == table_id)
                .collect();
            if table_triggers.is_empty() {
                continue;
            }
            let Some((table, snapshot)) = self.read_table(&table_id) else {
                continue;
            };
            let eval =
                self.triggers
                    .evaluate_table(&table_id, &table_triggers, &snapshot, now_ms);
            for fired in &eval.per_trigger {
                self.metrics
                    .record_trigger_eval(*fired, *fired && eval.suppressed);
            }
            if eval.write {
                let timestamp = now_ist_iso();
                self.enqueue_row(&table, timestamp, &snapshot);
            }
        }
    }

    /// Read every mapped field of a table under one session. Failed or
    /// missing reads surface as nulls and count as read errors; a
    /// disconnected device fails fast without touching the network.
    fn read_table(&mut self, table_id: &str) -> Option<(DeviceTable, BTreeMap<String, Value>)> {
        let Some(table) = self.catalog.get_table(table_id) else {
            self.metrics
                .record_error("READ_ERROR", &format!("table {} missing", table_id));
            return None;
        };
        let mapping = self.catalog.get_mapping(table_id);
        if mapping.rows.is_empty() {
            self.metrics
                .record_error("READ_ERROR", &format!("no mapping rows for {}", table.name));
            return None;
        }

        let device = mapping
            .device_id
            .as_deref()
            .and_then(|id| self.catalog.get_device_raw(id));
        let connected = device
            .as_ref()
            .map(|d| d.status == DeviceStatus::Connected)
            .unwrap_or(false);

        let mut snapshot = BTreeMap::new();
        if !connected {
            for key in mapping.rows.keys() {
                self.metrics.record_read(0.0, false);
                snapshot.insert(key.clone(), Value::Null);
            }
            self.metrics.record_error(
                "READ_ERROR",
                &format!("device not connected for {}", table.name),
            );
            return Some((table, snapshot));
        }

        let Some(device) = device else {
            return Some((table, snapshot));
        };
        let mut session = match self.factory.open(&device) {
            Ok(session) => session,
            Err(e) => {
                for key in mapping.rows.keys() {
                    self.metrics.record_read(0.0, false);
                    snapshot.insert(key.clone(), Value::Null);
                }
                self.metrics.record_error("READ_ERROR", &e.to_string());
                return Some((table, snapshot));
            }
        };
        for (key, row) in &mapping.rows {
            let started = Instant::now();
            let value = tag_for_row(key, row).and_then(|tag| session.read(&tag));
            let latency = started.elapsed().as_secs_f64() * 1000.0;
            match value {
                Ok(value) => {
                    self.metrics.record_read(latency, true);
                    snapshot.insert(key.clone(), value.scaled(row.scale));
                }
                Err(e) => {
                    self.metrics.record_read(latency, false);
                    self.metrics
                        .record_error("READ_ERROR", &format!("{}: {}", key, e));
                    snapshot.insert(key.clone(), Value::Null);
                }
            }
        }
        session.close();
        Some((table, snapshot))
    }

    /// Project the snapshot onto the job's column selection and either
    /// buffer it (batching on) or write immediately
    fn enqueue_row(
        &mut self,
        table: &DeviceTable,
        timestamp: String,
        snapshot: &BTreeMap<String, Value>,
    ) {
        let columns: Vec<(String, Value)> = snapshot
            .iter()
            .filter(|(key, _)| self.job.columns.includes(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if self.job.batching.max_rows > 0 {
            let batch = self
                .batches
                .entry(table.id.clone())
                .or_insert_with(|| RowBatch {
                    rows: Vec::new(),
                    opened: Instant::now(),
                });
            batch.rows.push((timestamp, columns));
        } else {
            self.write_rows(table, vec![(timestamp, columns)]);
        }
    }

    /// Flush batches that hit `max_rows` or `max_interval_ms` (or all of
    /// them on shutdown)
    fn flush_batches(&mut self, force: bool) {
        if self.job.batching.max_rows == 0 {
            return;
        }
        let max_rows = self.job.batching.max_rows;
        let max_age = Duration::from_millis(self.job.batching.max_interval_ms.max(1));
        let due: Vec<String> = self
            .batches
            .iter()
            .filter(|(_, batch)| {
                !batch.rows.is_empty()
                    && (force || batch.rows.len() >= max_rows || batch.opened.elapsed() >= max_age)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for table_id in due {
            let Some(batch) = self.batches.remove(&table_id) else {
                continue;
            };
            if let Some(table) = self.catalog.get_table(&table_id) {
                self.write_rows(&table, batch.rows);
            }
        }
    }

    /// Insert rows into the physical table inside one transaction
    fn write_rows(&mut self, table: &DeviceTable, rows: Vec<(String, Vec<(String, Value)>)>) {
        if rows.is_empty() {
            return;
        }
        let row_count = rows.len() as i64;
        let started = Instant::now();
        let written = self
            .targets
            .engine_for_target(table.db_target_id.as_deref())
            .and_then(|engine| {
                let qualified = physical_ident(engine.provider(), &table.name).qualified;
                engine.with_transaction(|tx| {
                    for (timestamp, columns) in &rows {
                        let mut names = vec!["timestamp_utc".to_string()];
                        names.extend(columns.iter().map(|(k, _)| k.clone()));
                        let placeholders: Vec<String> =
                            (1..=names.len()).map(|i| format!("?{}", i)).collect();
                        let sql = format!(
                            "INSERT INTO {} ({}) VALUES ({})",
                            qualified,
                            names.join(","),
                            placeholders.join(",")
                        );
                        let mut params: Vec<rusqlite::types::Value> =
                            vec![rusqlite::types::Value::Text(timestamp.clone())];
                        params.extend(columns.iter().map(|(_, v)| v.to_sql()));
                        tx.execute(&sql, rusqlite::params_from_iter(params))?;
                    }
                    Ok(())
                })
            });
        let latency = started.elapsed().as_secs_f64() * 1000.0;
        match written {
            Ok(()) => {
                self.metrics.record_write(latency, true, row_count);
                self.consecutive_write_failures = 0;
                if self.degraded {
                    self.degraded = false;
                    let _ = self.catalog.set_job_status(&self.job.id, JobStatus::Running);
                }
            }
            Err(e) => {
                self.metrics.record_write(latency, false, 0);
                self.metrics.record_error("WRITE_ERROR", &e.to_string());
                self.consecutive_write_failures += 1;
                if self.consecutive_write_failures >= self.write_failure_threshold && !self.degraded
                {
                    warn!(
                        "job {} degraded after {} consecutive write failures",
                        self.job.id, self.consecutive_write_failures
                    );
                    self.degraded = true;
                    let _ = self.catalog.set_job_status(&self.job.id, JobStatus::Degraded);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::appdb::AppDb;
    use crate::errors::{AppError, AppResult};
    use crate::metrics::MetricsRegistry;
    use crate::migrate::MigrationPlanner;
    use crate::protocols::{ProbeOutcome, ProtocolSession, Tag};
    use std::sync::Mutex;

    /// Factory whose sessions return fixed values per node id suffix
    struct FixedFactory {
        values: Mutex<HashMap<String, Value>>,
    }

    struct FixedSession {
        values: HashMap<String, Value>,
    }

    impl ProtocolSession for FixedSession {
        fn probe(&mut self) -> ProbeOutcome {
            ProbeOutcome {
                ok: true,
                latency_ms: 1,
                error: None,
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
                    message: format!("no such tag {}", key),
                })
        }

        fn close(&mut self) {}
    }

    impl SessionFactory for FixedFactory {
        fn open(&self, _device: &Device) -> AppResult<Box<dyn ProtocolSession>> {
            Ok(Box::new(FixedSession {
                values: self.values.lock().unwrap().clone(),
            }))
        }
    }

    struct Rig {
        catalog: Arc<CatalogStore>,
        targets: Arc<TargetRegistry>,
        factory: Arc<FixedFactory>,
        metrics: Arc<MetricsRegistry>,
        table_id: String,
    }

    fn rig() -> Rig {
        let catalog =
            Arc::new(CatalogStore::new(Arc::new(AppDb::open_in_memory().unwrap())).unwrap());
        let targets = Arc::new(TargetRegistry::new(catalog.clone()));
        let schema = catalog
            .create_schema(
                None,
                "LTPanel",
                vec![
                    Field {
                        key: "r_current".into(),
                        dtype: FieldType::Float,
                        unit: Some("A".into()),
                        scale: None,
                        description: None,
                    },
                    Field {
                        key: "voltage".into(),
                        dtype: FieldType::Float,
                        unit: Some("V".into()),
                        scale: None,
                        description: None,
                    },
                ],
            )
            .unwrap();
        let target = catalog
            .add_target(None, DbProvider::Sqlite, ":memory:", None, None)
            .unwrap();
        catalog.set_default_target(&target.id).unwrap();
        let (tables, _) = catalog
            .add_tables_bulk(&schema.id, &["Transformer_1".into()], None)
            .unwrap();
        let planner = MigrationPlanner::new(catalog.clone(), targets.clone());
        planner.migrate(&[tables[0].id.clone()]);

        let device = catalog
            .add_device(
                None,
                "D1",
                Protocol::Opcua,
                serde_json::json!({"endpoint": "opc.tcp://127.0.0.1:4840"}),
                None,
                true,
            )
            .unwrap();
        catalog
            .set_device_status(&device.id, DeviceStatus::Connected, Some(2), None)
            .unwrap();

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
        catalog
            .upsert_mapping(&tables[0].id, Some(device.id.clone()), rows)
            .unwrap();

        let mut values = HashMap::new();
        values.insert("ns=2;s=Device1.Current".to_string(), Value::I64(10));
        values.insert("ns=2;s=Device1.Voltage".to_string(), Value::I64(230));
        Rig {
            catalog,
            targets,
            factory: Arc::new(FixedFactory {
                values: Mutex::new(values),
            }),
            metrics: Arc::new(MetricsRegistry::new()),
            table_id: tables[0].id.clone(),
        }
    }

    fn job(rig: &Rig, job_type: JobType, triggers: Vec<Trigger>) -> Job {
        rig.catalog
            .create_job(Job {
                id: String::new(),
                name: "J1".into(),
                job_type,
                tables: vec![rig.table_id.clone()],
                columns: ColumnsSelection::all(),
                interval_ms: 1000,
                enabled: false,
                status: JobStatus::Stopped,
                batching: Batching::default(),
                cpu_budget: CpuBudget::Balanced,
                triggers,
            })
            .unwrap()
    }

    fn worker(rig: &Rig, job: &Job) -> JobWorker {
        JobWorker::new(
            job.clone(),
            rig.catalog.clone(),
            rig.targets.clone(),
            rig.factory.clone(),
            rig.metrics.job(&job.id),
            10,
        )
    }

    fn row_dump(rig: &Rig) -> Vec<(String, Option<f64>, Option<f64>)> {
        let engine = rig.targets.engine_for_target(None).unwrap();
        engine
            .with_conn(|c| {
                let mut stmt = c.prepare(
                    "SELECT timestamp_utc, r_current, voltage FROM neuract__Transformer_1
                     ORDER BY rowid",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .unwrap()
    }

    #[test]
    fn continuous_ticks_write_scaled_rows_in_order() {
        let rig = rig();
        let j = job(&rig, JobType::Continuous, vec![]);
        let mut worker = worker(&rig, &j);
        for _ in 0..3 {
            worker.tick();
        }
        let rows = row_dump(&rig);
        assert!(rows.len() >= 2);
        for (_, r_current, voltage) in &rows {
            assert_eq!(*r_current, Some(1.0));
            assert_eq!(*voltage, Some(230.0));
        }
        // monotonically non-decreasing timestamps within one table
        for pair in rows.windows(2) {
            assert!(pair[1].0 >= pair[0].0);
        }
        let summary = rig.metrics.job(&j.id).summary(60);
        assert_eq!(summary.reads, 6);
        assert_eq!(summary.writes, 3);
        assert_eq!(summary.read_errors, 0);
    }

    #[test]
    fn disconnected_device_writes_null_row_and_counts_read_errors() {
        let rig = rig();
        let device_id = rig.catalog.list_devices()[0].id.clone();
        rig.catalog
            .set_device_status(&device_id, DeviceStatus::Disconnected, None, None)
            .unwrap();
        let j = job(&rig, JobType::Continuous, vec![]);
        let mut worker = worker(&rig, &j);
        worker.tick();

        let rows = row_dump(&rig);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, None);
        let summary = rig.metrics.job(&j.id).summary(60);
        assert_eq!(summary.read_errors, 2);
        let errors = rig.metrics.job(&j.id).errors();
        assert!(errors.iter().any(|e| e.code == "READ_ERROR"));
    }

    #[test]
    fn failed_tag_reads_become_nulls_but_job_continues() {
        let rig = rig();
        rig.factory
            .values
            .lock()
            .unwrap()
            .remove("ns=2;s=Device1.Voltage");
        let j = job(&rig, JobType::Continuous, vec![]);
        let mut worker = worker(&rig, &j);
        worker.tick();

        let rows = row_dump(&rig);
        assert_eq!(rows[0].1, Some(1.0));
        assert_eq!(rows[0].2, None);
        let summary = rig.metrics.job(&j.id).summary(60);
        assert_eq!(summary.reads, 1);
        assert_eq!(summary.read_errors, 1);
    }

    #[test]
    fn trigger_job_writes_on_fire_and_counts_suppressions() {
        let rig = rig();
        let j = job(
            &rig,
            JobType::Trigger,
            vec![Trigger {
                table_id: rig.table_id.clone(),
                field_key: "r_current".into(),
                op: TriggerOp::Gt,
                value: Some(0.5),
                deadband: None,
                cooldown_ms: Some(3_600_000),
            }],
        );
        let mut worker = worker(&rig, &j);
        // r_current reads 10 * 0.1 = 1.0 > 0.5: first tick fires and
        // writes, the rest hit the cooldown
        for _ in 0..3 {
            worker.tick();
        }
        assert_eq!(row_dump(&rig).len(), 1);
        let summary = rig.metrics.job(&j.id).summary(60);
        assert_eq!(summary.triggers, 3);
        assert_eq!(summary.fires, 3);
        assert_eq!(summary.suppressed, 2);
    }

    #[test]
    fn trigger_below_threshold_never_writes() {
        let rig = rig();
        rig.factory.values.lock().unwrap().insert(
            "ns=2;s=Device1.Current".to_string(),
            Value::F64(1.0), // scaled to 0.1
        );
        let j = job(
            &rig,
            JobType::Trigger,
            vec![Trigger {
                table_id: rig.table_id.clone(),
                field_key: "r_current".into(),
                op: TriggerOp::Gt,
                value: Some(0.5),
                deadband: None,
                cooldown_ms: None,
            }],
        );
        let mut worker = worker(&rig, &j);
        worker.tick();
        assert!(row_dump(&rig).is_empty());
    }

    #[test]
    fn subset_columns_project_written_row() {
        let rig = rig();
        let mut j = job(&rig, JobType::Continuous, vec![]);
        j.columns = ColumnsSelection::Subset(vec!["voltage".into()]);
        let mut worker = worker(&rig, &j);
        worker.tick();
        let rows = row_dump(&rig);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, None, "r_current is outside the subset");
        assert_eq!(rows[0].2, Some(230.0));
    }

    #[test]
    fn batching_buffers_until_max_rows() {
        let rig = rig();
        let mut j = job(&rig, JobType::Continuous, vec![]);
        j.batching = Batching {
            max_rows: 3,
            max_interval_ms: 3_600_000,
        };
        let mut worker = worker(&rig, &j);
        worker.tick();
        worker.tick();
        assert!(row_dump(&rig).is_empty(), "buffered, not yet flushed");
        worker.tick();
        assert_eq!(row_dump(&rig).len(), 3);
    }

    #[test]
    fn sustained_write_failures_degrade_the_job() {
        let rig = rig();
        let j = job(&rig, JobType::Continuous, vec![]);
        // drop the physical table so every insert fails
        let engine = rig.targets.engine_for_target(None).unwrap();
        engine
            .with_conn(|c| {
                c.execute("DROP TABLE neuract__Transformer_1", [])?;
                Ok(())
            })
            .unwrap();
        let mut worker = JobWorker::new(
            j.clone(),
            rig.catalog.clone(),
            rig.targets.clone(),
            rig.factory.clone(),
            rig.metrics.job(&j.id),
            3,
        );
        worker.tick();
        worker.tick();
        assert_ne!(
            rig.catalog.get_job(&j.id).unwrap().status,
            JobStatus::Degraded
        );
        worker.tick();
        assert_eq!(
            rig.catalog.get_job(&j.id).unwrap().status,
            JobStatus::Degraded
        );
        let errors = rig.metrics.job(&j.id).errors();
        assert!(errors.iter().any(|e| e.code == "WRITE_ERROR"));
    }
}
