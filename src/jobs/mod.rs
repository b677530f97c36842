//! Job Engine: lifecycle and supervision of polling workers
//!
//! One worker thread per running job. `start` hydrates mappings, opens a
//! run and spawns the worker; `pause`/`stop` signal its cancellation
//! channel and join with a 2s deadline (a worker stuck in I/O past the
//! deadline is abandoned with daemon semantics); `delete` is an idempotent
//! cascade over config, run history and rollups.

pub mod triggers;
pub(crate) mod worker;

use crate::catalog::CatalogStore;
use crate::errors::{AppError, AppResult};
use crate::mapping::MappingResolver;
use crate::metrics::MetricsRegistry;
use crate::models::*;
use crate::protocols::SessionFactory;
use crate::targets::TargetRegistry;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

const JOIN_DEADLINE: Duration = Duration::from_secs(2);
pub const DEFAULT_WRITE_FAILURE_THRESHOLD: u32 = 10;

struct WorkerHandle {
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    handle: JoinHandle<()>,
}

/// What one tick of a job would touch, without doing it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunTable {
    pub table_id: String,
    pub name: String,
    pub mapped_fields: usize,
    pub device_bound: bool,
    pub device_connected: bool,
    pub target_reachable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunReport {
    pub job_id: String,
    pub job_type: JobType,
    pub interval_ms: u64,
    pub tables: Vec<DryRunTable>,
}

pub struct JobEngine {
    catalog: Arc<CatalogStore>,
    targets: Arc<TargetRegistry>,
    resolver: Arc<MappingResolver>,
    factory: Arc<dyn SessionFactory>,
    metrics: Arc<MetricsRegistry>,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    write_failure_threshold: u32,
}

impl JobEngine {
    pub fn new(
        catalog: Arc<CatalogStore>,
        targets: Arc<TargetRegistry>,
        resolver: Arc<MappingResolver>,
        factory: Arc<dyn SessionFactory>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            catalog,
            targets,
            resolver,
            factory,
            metrics,
            workers: Mutex::new(HashMap::new()),
            write_failure_threshold: DEFAULT_WRITE_FAILURE_THRESHOLD,
        }
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, HashMap<String, WorkerHandle>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a job's worker; begins a run. Starting a running job is a
    /// no-op.
    pub fn start(&self, job_id: &str) -> AppResult<Job> {
        let job = self
            .catalog
            .get_job(job_id)
            .ok_or_else(|| AppError::not_found("job", job_id, "JOB_NOT_FOUND"))?;
        {
            let workers = self.lock_workers();
            if workers.contains_key(job_id) {
                return Ok(job);
            }
        }
        // refresh mapping mirrors so the worker sees current rows
        for table_id in &job.tables {
            if let Err(e) = self.resolver.hydrate(table_id) {
                warn!("mapping hydrate on start failed for {}: {}", table_id, e);
            }
        }
        let job_metrics = self.metrics.job(job_id);
        job_metrics.start_run();

        let (stop_tx, stop_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let worker = worker::JobWorker::new(
            job.clone(),
            self.catalog.clone(),
            self.targets.clone(),
            self.factory.clone(),
            job_metrics,
            self.write_failure_threshold,
        );
        let thread_name = format!("job-{}", job_id);
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker.run(stop_rx, done_tx))
            .map_err(|e| AppError::internal(format!("worker spawn failed: {}", e)))?;
        self.lock_workers().insert(
            job_id.to_string(),
            WorkerHandle {
                stop_tx,
                done_rx,
                handle,
            },
        );
        let updated = self.catalog.set_job_status(job_id, JobStatus::Running)?;
        info!("job started: {} ({})", updated.name, job_id);
        Ok(updated)
    }

    /// Signal the worker and join with the deadline; true when a worker
    /// existed
    fn stop_worker(&self, job_id: &str) -> bool {
        let Some(handle) = self.lock_workers().remove(job_id) else {
            return false;
        };
        let _ = handle.stop_tx.send(());
        match handle.done_rx.recv_timeout(JOIN_DEADLINE) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.handle.join();
            }
            Err(RecvTimeoutError::Timeout) => {
                // blocked in I/O past the deadline: abandon it
                warn!("worker for {} did not stop within 2s, abandoning", job_id);
            }
        }
        true
    }

    /// Finalize the active run and persist it to run history
    fn finalize_run(&self, job_id: &str) {
        if let Some(run) = self.metrics.job(job_id).end_run() {
            if let Err(e) = self.catalog.app_db().insert_run(&run) {
                warn!("run persist failed for {}: {}", job_id, e);
            }
        }
    }

    pub fn pause(&self, job_id: &str) -> AppResult<Job> {
        if self.catalog.get_job(job_id).is_none() {
            return Err(AppError::not_found("job", job_id, "JOB_NOT_FOUND"));
        }
        self.stop_worker(job_id);
        self.finalize_run(job_id);
        let updated = self.catalog.set_job_status(job_id, JobStatus::Paused)?;
        info!("job paused: {}", job_id);
        Ok(updated)
    }

    pub fn stop(&self, job_id: &str) -> AppResult<Job> {
        if self.catalog.get_job(job_id).is_none() {
            return Err(AppError::not_found("job", job_id, "JOB_NOT_FOUND"));
        }
        self.stop_worker(job_id);
        self.finalize_run(job_id);
        let updated = self.catalog.set_job_status(job_id, JobStatus::Stopped)?;
        info!("job stopped: {}", job_id);
        Ok(updated)
    }

    /// Stop the worker, finalize the run, cascade-delete config, run
    /// history and rollups. A second call finds nothing and reports
    /// `JOB_NOT_FOUND` without changing state.
    pub fn delete(&self, job_id: &str) -> AppResult<()> {
        let existed = self.catalog.get_job(job_id).is_some();
        if !existed {
            return Err(AppError::not_found("job", job_id, "JOB_NOT_FOUND"));
        }
        self.stop_worker(job_id);
        self.finalize_run(job_id);
        self.catalog.delete_job(job_id)?;
        self.catalog.app_db().delete_job_history(job_id)?;
        self.metrics.remove_job(job_id);
        info!("job deleted: {}", job_id);
        Ok(())
    }

    /// Resolve what a tick would touch without reading or writing anything
    pub fn dry_run(&self, job_id: &str) -> AppResult<DryRunReport> {
        let job = self
            .catalog
            .get_job(job_id)
            .ok_or_else(|| AppError::not_found("job", job_id, "JOB_NOT_FOUND"))?;
        let mut tables = Vec::new();
        for table_id in &job.tables {
            let Some(table) = self.catalog.get_table(table_id) else {
                continue;
            };
            let mapping = self.resolver.hydrate(table_id)?;
            let device = mapping
                .device_id
                .as_deref()
                .and_then(|id| self.catalog.get_device(id));
            let target_reachable = self
                .targets
                .engine_for_target(table.db_target_id.as_deref())
                .is_ok();
            tables.push(DryRunTable {
                table_id: table.id.clone(),
                name: table.name.clone(),
                mapped_fields: mapping.rows.len(),
                device_bound: mapping.device_id.is_some(),
                device_connected: device
                    .map(|d| d.status == DeviceStatus::Connected)
                    .unwrap_or(false),
                target_reachable,
            });
        }
        Ok(DryRunReport {
            job_id: job.id,
            job_type: job.job_type,
            interval_ms: job.interval_ms,
            tables,
        })
    }

    pub fn runs(
        &self,
        job_id: &str,
        from: Option<&str>,
        to: Option<&str>,
    ) -> AppResult<Vec<Run>> {
        if self.catalog.get_job(job_id).is_none() {
            return Err(AppError::not_found("job", job_id, "JOB_NOT_FOUND"));
        }
        self.catalog.app_db().load_runs(job_id, from, to)
    }

    /// Restart jobs that were enabled when the agent last ran
    pub fn start_enabled_jobs(&self) {
        for job in self.catalog.list_jobs() {
            if job.enabled {
                if let Err(e) = self.start(&job.id) {
                    warn!("boot start of {} failed: {}", job.id, e);
                }
            }
        }
    }

    pub fn running_count(&self) -> usize {
        self.lock_workers().len()
    }

    /// Stop every worker (agent shutdown)
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.lock_workers().keys().cloned().collect();
        for job_id in ids {
            self.stop_worker(&job_id);
            self.finalize_run(&job_id);
        }
    }
}
