//! Metrics Registry: per-second rings, rolling latency quantiles, run
//! lifecycle, the system sampler and minute rollups
//!
//! Per-job metrics live in bounded rings (5 minutes of per-second samples,
//! 1800 latency points). Summaries compute p50/p95 over the last 600
//! latency samples. A 1Hz sampler thread collects host and process gauges;
//! a rollup thread aggregates both into minute rows in the App Local DB.

use crate::catalog::appdb::AppDb;
use crate::errors::AppResult;
use crate::models::{new_id, now_ist_iso, Run};
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use sysinfo::{Networks, Pid, System};

const PER_SEC_CAP: usize = 300;
const LATENCY_CAP: usize = 1800;
const QUANTILE_WINDOW: usize = 600;
const SYSTEM_CAP: usize = 600;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One second of job activity
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SecSample {
    pub ts: u64,
    pub reads: u64,
    pub read_err: u64,
    pub writes: u64,
    pub write_err: u64,
    pub triggers: u64,
    pub fires: u64,
    pub suppressed: u64,
}

/// Windowed counters with latency quantiles
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSummary {
    pub reads: u64,
    pub read_errors: u64,
    pub writes: u64,
    pub write_errors: u64,
    pub triggers: u64,
    pub fires: u64,
    pub suppressed: u64,
    pub read_p50: Option<f64>,
    pub read_p95: Option<f64>,
    pub write_p50: Option<f64>,
    pub write_p95: Option<f64>,
    pub error_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobErrorEntry {
    pub code: String,
    pub count: u64,
    pub last_message: String,
    pub last_ts: u64,
}

struct ActiveRun {
    id: String,
    started_at: String,
    started: Instant,
    rows: i64,
    read_lat_sum: f64,
    read_lat_n: u64,
    write_lat_sum: f64,
    write_lat_n: u64,
    errors: i64,
}

#[derive(Default)]
struct JobMetricsInner {
    per_sec: VecDeque<SecSample>,
    read_lat_ms: VecDeque<f64>,
    write_lat_ms: VecDeque<f64>,
    errors: HashMap<String, JobErrorEntry>,
    active_run: Option<ActiveRun>,
}

impl Default for ActiveRun {
    fn default() -> Self {
        Self {
            id: new_id("run"),
            started_at: now_ist_iso(),
            started: Instant::now(),
            rows: 0,
            read_lat_sum: 0.0,
            read_lat_n: 0,
            write_lat_sum: 0.0,
            write_lat_n: 0,
            errors: 0,
        }
    }
}

/// Metrics for one job; every method is safe to call from the job's worker
/// and from readers concurrently
pub struct JobMetrics {
    job_id: String,
    inner: Mutex<JobMetricsInner>,
}

fn quantile(values: &VecDeque<f64>, p: f64) -> Option<f64> {
    let skip = values.len().saturating_sub(QUANTILE_WINDOW);
    let mut window: Vec<f64> = values.iter().skip(skip).copied().collect();
    if window.is_empty() {
        return None;
    }
    window.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let k = ((p * (window.len() - 1) as f64) as usize).min(window.len() - 1);
    Some(window[k])
}

impl JobMetrics {
    fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            inner: Mutex::new(JobMetricsInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JobMetricsInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_second<'a>(
        inner: &'a mut JobMetricsInner,
        now: u64,
    ) -> &'a mut SecSample {
        let fresh = inner
            .per_sec
            .back()
            .map(|s| s.ts != now)
            .unwrap_or(true);
        if fresh {
            if inner.per_sec.len() == PER_SEC_CAP {
                inner.per_sec.pop_front();
            }
            inner.per_sec.push_back(SecSample {
                ts: now,
                ..Default::default()
            });
        }
        inner.per_sec.back_mut().expect("per_sec non-empty")
    }

    fn push_latency(ring: &mut VecDeque<f64>, value: f64) {
        if ring.len() == LATENCY_CAP {
            ring.pop_front();
        }
        ring.push_back(value);
    }

    /// Allocate the active run; a no-op while one is active
    pub fn start_run(&self) {
        let mut inner = self.lock();
        if inner.active_run.is_none() {
            inner.active_run = Some(ActiveRun::default());
        }
    }

    /// Finalize and return the active run record
    pub fn end_run(&self) -> Option<Run> {
        let mut inner = self.lock();
        let run = inner.active_run.take()?;
        let rows = run.rows.max(0);
        Some(Run {
            id: run.id,
            job_id: self.job_id.clone(),
            started_at: run.started_at,
            stopped_at: Some(now_ist_iso()),
            duration_ms: Some(run.started.elapsed().as_millis() as i64),
            rows,
            read_lat_avg: run.read_lat_sum / run.read_lat_n.max(1) as f64,
            write_lat_avg: run.write_lat_sum / run.write_lat_n.max(1) as f64,
            error_pct: (run.errors as f64 / rows.max(1) as f64) * 100.0,
        })
    }

    pub fn record_read(&self, latency_ms: f64, ok: bool) {
        let now = unix_now();
        let mut inner = self.lock();
        let sample = Self::current_second(&mut inner, now);
        if ok {
            sample.reads += 1;
        } else {
            sample.read_err += 1;
        }
        Self::push_latency(&mut inner.read_lat_ms, latency_ms);
        if let Some(run) = inner.active_run.as_mut() {
            run.read_lat_sum += latency_ms;
            run.read_lat_n += 1;
            if !ok {
                run.errors += 1;
            }
        }
    }

    pub fn record_write(&self, latency_ms: f64, ok: bool, rows: i64) {
        let now = unix_now();
        let mut inner = self.lock();
        let sample = Self::current_second(&mut inner, now);
        if ok {
            sample.writes += rows.max(0) as u64;
        } else {
            sample.write_err += 1;
        }
        Self::push_latency(&mut inner.write_lat_ms, latency_ms);
        if let Some(run) = inner.active_run.as_mut() {
            if ok {
                run.rows += rows.max(0);
            }
            run.write_lat_sum += latency_ms;
            run.write_lat_n += 1;
            if !ok {
                run.errors += 1;
            }
        }
    }

    pub fn record_trigger_eval(&self, fired: bool, suppressed: bool) {
        let now = unix_now();
        let mut inner = self.lock();
        let sample = Self::current_second(&mut inner, now);
        sample.triggers += 1;
        if fired {
            sample.fires += 1;
        }
        if suppressed {
            sample.suppressed += 1;
        }
    }

    pub fn record_error(&self, code: &str, message: &str) {
        let mut inner = self.lock();
        let entry = inner
            .errors
            .entry(code.to_string())
            .or_insert_with(|| JobErrorEntry {
                code: code.to_string(),
                count: 0,
                last_message: String::new(),
                last_ts: 0,
            });
        entry.count += 1;
        entry.last_message = message.chars().take(512).collect();
        entry.last_ts = unix_now();
    }

    pub fn errors(&self) -> Vec<JobErrorEntry> {
        let inner = self.lock();
        let mut out: Vec<JobErrorEntry> = inner.errors.values().cloned().collect();
        out.sort_by(|a, b| a.code.cmp(&b.code));
        out
    }

    /// Counters for the trailing window plus latency quantiles
    pub fn summary(&self, window_s: u64) -> JobSummary {
        let now = unix_now();
        let inner = self.lock();
        let mut out = JobSummary::default();
        for sample in &inner.per_sec {
            if now.saturating_sub(sample.ts) <= window_s {
                out.reads += sample.reads;
                out.read_errors += sample.read_err;
                out.writes += sample.writes;
                out.write_errors += sample.write_err;
                out.triggers += sample.triggers;
                out.fires += sample.fires;
                out.suppressed += sample.suppressed;
            }
        }
        out.read_p50 = quantile(&inner.read_lat_ms, 0.50);
        out.read_p95 = quantile(&inner.read_lat_ms, 0.95);
        out.write_p50 = quantile(&inner.write_lat_ms, 0.50);
        out.write_p95 = quantile(&inner.write_lat_ms, 0.95);
        let total = out.reads + out.writes;
        out.error_pct =
            (out.read_errors + out.write_errors) as f64 / total.max(1) as f64 * 100.0;
        out
    }

    /// Tail of the write-latency ring, newest last (per-target aggregation)
    pub fn write_latencies(&self, limit: usize) -> Vec<f64> {
        let inner = self.lock();
        let skip = inner.write_lat_ms.len().saturating_sub(limit);
        inner.write_lat_ms.iter().skip(skip).copied().collect()
    }

    /// Replay of the per-second ring filtered by the window
    pub fn timeseries(&self, window_s: u64) -> Vec<SecSample> {
        let now = unix_now();
        let inner = self.lock();
        inner
            .per_sec
            .iter()
            .filter(|s| now.saturating_sub(s.ts) <= window_s)
            .copied()
            .collect()
    }
}

// =============================================================================
// System sampler
// =============================================================================

/// One second of host/process gauges
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemSample {
    pub ts: u64,
    pub cpu: Option<f64>,
    pub mem: Option<f64>,
    pub disk_rps: Option<u64>,
    pub disk_wps: Option<u64>,
    pub net_rxps: Option<u64>,
    pub net_txps: Option<u64>,
    pub proc_cpu: Option<f64>,
    pub proc_rss_mb: Option<f64>,
}

#[derive(Default)]
struct SystemMetricsInner {
    per_sec: VecDeque<SystemSample>,
}

/// 1Hz sampler over cpu, memory, network and the agent process
pub struct SystemMetrics {
    inner: Mutex<SystemMetricsInner>,
    stop_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SystemMetrics {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SystemMetricsInner::default()),
            stop_tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let mut stop_guard = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner());
        if stop_guard.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel::<()>();
        *stop_guard = Some(tx);
        let metrics = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("metrics-system".into())
            .spawn(move || {
                let mut system = System::new();
                let mut networks = Networks::new_with_refreshed_list();
                let pid = Pid::from_u32(std::process::id());
                info!("system metrics sampler started");
                loop {
                    match rx.recv_timeout(Duration::from_secs(1)) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            metrics.sample_once(&mut system, &mut networks, pid);
                        }
                    }
                }
                info!("system metrics sampler stopped");
            })
            .expect("spawn metrics-system thread");
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
    }

    fn sample_once(&self, system: &mut System, networks: &mut Networks, pid: Pid) {
        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_process(pid);
        networks.refresh();

        let cpu = Some(system.global_cpu_info().cpu_usage() as f64);
        let mem = if system.total_memory() > 0 {
            Some(system.used_memory() as f64 / system.total_memory() as f64 * 100.0)
        } else {
            None
        };
        let (mut rx, mut tx) = (0u64, 0u64);
        for (_name, data) in networks.iter() {
            rx += data.received();
            tx += data.transmitted();
        }
        let (proc_cpu, proc_rss_mb, disk_r, disk_w) = match system.process(pid) {
            Some(proc) => {
                let usage = proc.disk_usage();
                (
                    Some(proc.cpu_usage() as f64),
                    Some(proc.memory() as f64 / (1024.0 * 1024.0)),
                    Some(usage.read_bytes),
                    Some(usage.written_bytes),
                )
            }
            None => (None, None, None, None),
        };

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.per_sec.len() == SYSTEM_CAP {
            inner.per_sec.pop_front();
        }
        inner.per_sec.push_back(SystemSample {
            ts: unix_now(),
            cpu,
            mem,
            disk_rps: disk_r,
            disk_wps: disk_w,
            net_rxps: Some(rx),
            net_txps: Some(tx),
            proc_cpu,
            proc_rss_mb,
        });
    }

    /// Samples within the trailing window
    pub fn snapshot(&self, window_s: u64) -> Vec<SystemSample> {
        let now = unix_now();
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .per_sec
            .iter()
            .filter(|s| now.saturating_sub(s.ts) <= window_s)
            .cloned()
            .collect()
    }
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Registry + rollups
// =============================================================================

/// Owns per-job metrics and the system sampler
pub struct MetricsRegistry {
    jobs: Mutex<HashMap<String, Arc<JobMetrics>>>,
    pub system: Arc<SystemMetrics>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            system: Arc::new(SystemMetrics::new()),
        }
    }

    pub fn job(&self, job_id: &str) -> Arc<JobMetrics> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.entry(job_id.to_string())
            .or_insert_with(|| Arc::new(JobMetrics::new(job_id)))
            .clone()
    }

    /// Drop a job's rings (cascade of job deletion)
    pub fn remove_job(&self, job_id: &str) {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
    }

    pub fn jobs_summary(&self, window_s: u64) -> HashMap<String, JobSummary> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.iter()
            .map(|(id, jm)| (id.clone(), jm.summary(window_s)))
            .collect()
    }

    /// Aggregate the trailing minute into rollup rows. Called by the rollup
    /// thread; exposed for tests.
    pub fn flush_minute(&self, db: &AppDb) -> AppResult<()> {
        let minute_utc = Utc::now().format("%Y-%m-%dT%H:%MZ").to_string();
        let job_ids: Vec<String> = {
            let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            jobs.keys().cloned().collect()
        };
        for job_id in job_ids {
            let jm = self.job(&job_id);
            let summary = jm.summary(60);
            if summary.reads + summary.writes + summary.read_errors + summary.write_errors == 0
                && summary.triggers == 0
            {
                continue;
            }
            db.upsert_job_minute(
                &job_id,
                &minute_utc,
                &[
                    summary.reads as i64,
                    summary.read_errors as i64,
                    summary.writes as i64,
                    summary.write_errors as i64,
                    summary.triggers as i64,
                    summary.fires as i64,
                    summary.suppressed as i64,
                ],
                &[
                    summary.read_p50,
                    summary.read_p95,
                    summary.write_p50,
                    summary.write_p95,
                ],
            )?;
            for entry in jm.errors() {
                db.upsert_job_error_minute(
                    &job_id,
                    &entry.code,
                    &minute_utc,
                    entry.count as i64,
                    &entry.last_message,
                )?;
            }
        }

        let samples = self.system.snapshot(60);
        if !samples.is_empty() {
            let avg = |f: fn(&SystemSample) -> Option<f64>| {
                let vals: Vec<f64> = samples.iter().filter_map(f).collect();
                if vals.is_empty() {
                    None
                } else {
                    Some(vals.iter().sum::<f64>() / vals.len() as f64)
                }
            };
            let sum = |f: fn(&SystemSample) -> Option<u64>| {
                samples.iter().filter_map(f).sum::<u64>() as i64
            };
            db.upsert_system_minute(
                &minute_utc,
                avg(|s| s.cpu),
                avg(|s| s.mem),
                sum(|s| s.disk_rps),
                sum(|s| s.disk_wps),
                sum(|s| s.net_rxps),
                sum(|s| s.net_txps),
                avg(|s| s.proc_cpu),
                avg(|s| s.proc_rss_mb),
            )?;
        }
        debug!("minute rollup flushed for {}", minute_utc);
        Ok(())
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Background writer that persists minute rollups
pub struct RollupWriter {
    stop_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RollupWriter {
    pub fn start(registry: Arc<MetricsRegistry>, db: Arc<AppDb>) -> Self {
        let (tx, rx) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("metrics-rollup".into())
            .spawn(move || loop {
                match rx.recv_timeout(Duration::from_secs(60)) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = registry.flush_minute(&db) {
                            warn!("minute rollup failed: {}", e);
                        }
                    }
                }
            })
            .expect("spawn metrics-rollup thread");
        Self {
            stop_tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_and_quantiles() {
        let jm = JobMetrics::new("job_1");
        for i in 0..10 {
            jm.record_read(i as f64, true);
        }
        jm.record_read(50.0, false);
        jm.record_write(2.0, true, 1);
        jm.record_write(4.0, false, 0);

        let summary = jm.summary(60);
        assert_eq!(summary.reads, 10);
        assert_eq!(summary.read_errors, 1);
        assert_eq!(summary.writes, 1);
        assert_eq!(summary.write_errors, 1);
        assert!(summary.read_p50.is_some());
        assert!(summary.read_p95.unwrap() >= summary.read_p50.unwrap());
        assert!((summary.error_pct - (2.0 / 11.0 * 100.0)).abs() < 1e-9);
    }

    #[test]
    fn run_lifecycle_accumulates_and_finalizes() {
        let jm = JobMetrics::new("job_1");
        // records before a run never panic and are not attributed
        jm.record_write(1.0, true, 1);

        jm.start_run();
        jm.record_read(10.0, true);
        jm.record_read(20.0, true);
        jm.record_write(5.0, true, 2);
        jm.record_write(5.0, false, 0);

        let run = jm.end_run().unwrap();
        assert_eq!(run.rows, 2);
        assert!((run.read_lat_avg - 15.0).abs() < 1e-9);
        assert!((run.write_lat_avg - 5.0).abs() < 1e-9);
        assert!((run.error_pct - 50.0).abs() < 1e-9);
        assert!(run.stopped_at.is_some());
        assert!(run.id.starts_with("run_"));

        // second end without a start yields nothing
        assert!(jm.end_run().is_none());
    }

    #[test]
    fn error_map_keeps_counts_and_last_message() {
        let jm = JobMetrics::new("job_1");
        jm.record_error("READ_ERROR", "first");
        jm.record_error("READ_ERROR", "second");
        jm.record_error("WRITE_ERROR", "boom");
        let errors = jm.errors();
        assert_eq!(errors.len(), 2);
        let read = errors.iter().find(|e| e.code == "READ_ERROR").unwrap();
        assert_eq!(read.count, 2);
        assert_eq!(read.last_message, "second");
    }

    #[test]
    fn latency_ring_is_bounded() {
        let jm = JobMetrics::new("job_1");
        for i in 0..(LATENCY_CAP + 100) {
            jm.record_read(i as f64, true);
        }
        let inner = jm.lock();
        assert_eq!(inner.read_lat_ms.len(), LATENCY_CAP);
        // oldest entries were evicted
        assert!((inner.read_lat_ms[0] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn quantile_uses_trailing_window() {
        let mut ring: VecDeque<f64> = VecDeque::new();
        for _ in 0..1000 {
            ring.push_back(1.0);
        }
        for _ in 0..QUANTILE_WINDOW {
            ring.push_back(100.0);
        }
        // only the last 600 samples count
        assert_eq!(quantile(&ring, 0.5), Some(100.0));
        assert_eq!(quantile(&VecDeque::new(), 0.5), None);
    }

    #[test]
    fn rollup_flush_writes_minute_rows() {
        let registry = MetricsRegistry::new();
        let db = AppDb::open_in_memory().unwrap();
        let jm = registry.job("job_1");
        jm.record_read(3.0, true);
        jm.record_write(1.0, true, 1);
        jm.record_error("WRITE_ERROR", "target closed");

        registry.flush_minute(&db).unwrap();

        let rows: i64 = db
            .with_transaction(|tx| {
                Ok(tx.query_row(
                    "SELECT COUNT(1) FROM app_metrics_jobs_minute WHERE job_id='job_1'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(rows, 1);
        let errs: i64 = db
            .with_transaction(|tx| {
                Ok(tx.query_row(
                    "SELECT count FROM app_job_errors_minute WHERE job_id='job_1' AND code='WRITE_ERROR'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(errs, 1);
    }
}
