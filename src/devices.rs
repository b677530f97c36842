//! Device Session Manager: status machine and autonomous reconnection
//!
//! A single supervisor thread scans saved devices once per second. Every
//! non-connected device with auto-reconnect enabled and a due backoff slot
//! gets one probe; failures grow the delay by 1.7x up to a 30s cap with
//! uniform jitter in [0, 0.3*delay], successes reset the delay and push the
//! next health check at least 5s out.

use crate::catalog::CatalogStore;
use crate::errors::{AppError, AppResult};
use crate::models::{Device, DeviceStatus};
use crate::protocols::{ProbeOutcome, SessionFactory};
use log::{debug, info, warn};
use rand::Rng;
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const SCAN_INTERVAL: Duration = Duration::from_secs(1);
const BACKOFF_MIN_S: f64 = 1.0;
const BACKOFF_MAX_S: f64 = 30.0;
const BACKOFF_FACTOR: f64 = 1.7;
const JITTER_FRACTION: f64 = 0.3;
const HEALTH_CHECK_FLOOR: Duration = Duration::from_secs(5);

/// Grow a reconnect delay: `min(30, max(1, delay * 1.7))`
pub fn next_backoff_delay(delay_s: f64) -> f64 {
    (delay_s * BACKOFF_FACTOR).clamp(BACKOFF_MIN_S, BACKOFF_MAX_S)
}

/// Uniform jitter in `[0, 0.3 * delay]`
fn jitter_for(delay_s: f64) -> f64 {
    rand::thread_rng().gen_range(0.0..=JITTER_FRACTION * delay_s)
}

#[derive(Debug, Clone, Copy)]
struct BackoffSlot {
    delay_s: f64,
    next_at: Instant,
}

/// Per-device status machine plus the reconnect supervisor
pub struct DeviceSessionManager {
    catalog: Arc<CatalogStore>,
    factory: Arc<dyn SessionFactory>,
    backoff: Mutex<HashMap<String, BackoffSlot>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceSessionManager {
    pub fn new(catalog: Arc<CatalogStore>, factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            catalog,
            factory,
            backoff: Mutex::new(HashMap::new()),
            stop_tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Start the supervisor thread; repeated calls are a no-op
    pub fn start(self: &Arc<Self>) {
        let mut stop_guard = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner());
        if stop_guard.is_some() {
            return;
        }
        let (tx, rx): (Sender<()>, Receiver<()>) = mpsc::channel();
        *stop_guard = Some(tx);
        let manager = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("dev-reconnect".into())
            .spawn(move || {
                info!("device reconnect supervisor started");
                loop {
                    match rx.recv_timeout(SCAN_INTERVAL) {
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                        Err(mpsc::RecvTimeoutError::Timeout) => manager.scan(),
                    }
                }
                info!("device reconnect supervisor stopped");
            })
            .expect("spawn dev-reconnect thread");
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Signal the supervisor and join it
    pub fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
    }

    /// One supervisor tick over all saved devices
    pub(crate) fn scan(&self) {
        let now = Instant::now();
        for device in self.catalog.list_devices_raw() {
            if !device.auto_reconnect || device.status == DeviceStatus::Connected {
                continue;
            }
            let due = {
                let backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
                backoff
                    .get(&device.id)
                    .map(|slot| slot.next_at <= now)
                    .unwrap_or(true)
            };
            if !due {
                continue;
            }
            let _ = self.catalog.set_device_status(
                &device.id,
                DeviceStatus::Reconnecting,
                None,
                None,
            );
            let outcome = self.attempt_probe(&device);
            let mut backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
            match outcome {
                Ok(probe) if probe.ok => {
                    backoff.insert(
                        device.id.clone(),
                        BackoffSlot {
                            delay_s: BACKOFF_MIN_S,
                            next_at: now + HEALTH_CHECK_FLOOR,
                        },
                    );
                    let _ = self.catalog.set_device_status(
                        &device.id,
                        DeviceStatus::Connected,
                        Some(probe.latency_ms),
                        None,
                    );
                    info!(
                        "device connected: {} ({}ms)",
                        device.name, probe.latency_ms
                    );
                }
                outcome => {
                    let cause = match outcome {
                        Ok(probe) => probe.error.unwrap_or_else(|| "CONNECT_FAILED".into()),
                        Err(e) => e.code().to_string(),
                    };
                    // wait the current delay (with jitter), then grow it for
                    // the following failure: 1, 1.7, 2.89, ... capped at 30
                    let wait = backoff
                        .get(&device.id)
                        .map(|slot| slot.delay_s)
                        .unwrap_or(BACKOFF_MIN_S);
                    let jitter = jitter_for(wait);
                    backoff.insert(
                        device.id.clone(),
                        BackoffSlot {
                            delay_s: next_backoff_delay(wait),
                            next_at: now + Duration::from_secs_f64(wait + jitter),
                        },
                    );
                    debug!(
                        "device {} reconnect failed ({}), next attempt in {:.2}s",
                        device.name,
                        cause,
                        wait + jitter
                    );
                    let _ = self.catalog.set_device_status(
                        &device.id,
                        DeviceStatus::Reconnecting,
                        None,
                        Some(cause),
                    );
                }
            }
        }
    }

    fn attempt_probe(&self, device: &Device) -> AppResult<ProbeOutcome> {
        let mut session = self.factory.open(device)?;
        let outcome = session.probe();
        session.close();
        Ok(outcome)
    }

    /// Probe an arbitrary (possibly unsaved) device definition. Used as the
    /// connectivity preflight before a device is persisted.
    pub fn probe_device(&self, device: &Device) -> AppResult<ProbeOutcome> {
        self.attempt_probe(device)
    }

    /// One-shot probe that updates status and returns the outcome
    pub fn quick_test(&self, device_id: &str) -> AppResult<ProbeOutcome> {
        let device = self
            .catalog
            .get_device_raw(device_id)
            .ok_or_else(|| AppError::not_found("device", device_id, "DEVICE_NOT_FOUND"))?;
        match self.attempt_probe(&device) {
            Ok(probe) if probe.ok => {
                self.catalog.set_device_status(
                    device_id,
                    DeviceStatus::Connected,
                    Some(probe.latency_ms),
                    None,
                )?;
                Ok(probe)
            }
            Ok(probe) => {
                self.catalog.set_device_status(
                    device_id,
                    DeviceStatus::Disconnected,
                    None,
                    probe.error.clone(),
                )?;
                Ok(probe)
            }
            Err(e) => {
                warn!("quick_test failed for {}: {}", device_id, e);
                self.catalog.set_device_status(
                    device_id,
                    DeviceStatus::Disconnected,
                    None,
                    Some(e.code().to_string()),
                )?;
                Err(e)
            }
        }
    }

    /// Explicit connect: probe now and adopt the result
    pub fn connect(&self, device_id: &str) -> AppResult<ProbeOutcome> {
        self.quick_test(device_id)
    }

    /// Explicit disconnect: drops to disconnected and disables
    /// auto-reconnect so the supervisor leaves the device alone
    pub fn disconnect(&self, device_id: &str) -> AppResult<()> {
        self.catalog
            .update_device_metadata(device_id, None, Some(false))?;
        self.catalog
            .set_device_status(device_id, DeviceStatus::Disconnected, None, None)?;
        self.backoff
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(device_id);
        Ok(())
    }

    #[cfg(test)]
    fn force_due(&self, device_id: &str) {
        let mut backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = backoff.get_mut(device_id) {
            slot.next_at = Instant::now() - Duration::from_millis(1);
        }
    }

    #[cfg(test)]
    fn current_delay(&self, device_id: &str) -> Option<f64> {
        self.backoff
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
            .map(|slot| slot.delay_s)
    }
}

impl Drop for DeviceSessionManager {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(());
        }
    }
}
