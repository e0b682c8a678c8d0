use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use sysinfo::{MemoryRefreshKind, Pid, RefreshKind, System};
use tracing::{debug, trace, warn};

use crate::types::{GraphError, Result};

use super::refs::ReferenceManager;

/// Reports how full memory currently is.
pub trait PressureSource: Send + Sync + 'static {
    /// Used fraction of available memory, `0.0..=1.0`.
    fn used_fraction(&self) -> Result<f64>;
}

/// System-wide used/total memory.
pub struct SystemMemorySource {
    system: Mutex<System>,
}

impl SystemMemorySource {
    /// Probes memory only; other subsystems are never refreshed.
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl PressureSource for SystemMemorySource {
    fn used_fraction(&self) -> Result<f64> {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return Err(GraphError::InvalidArgument(
                "system reports zero total memory".into(),
            ));
        }
        Ok(system.used_memory() as f64 / total as f64)
    }
}

/// Resident memory of this process against a fixed byte budget.
pub struct ProcessMemorySource {
    system: Mutex<System>,
    pid: Pid,
    limit_bytes: u64,
}

impl ProcessMemorySource {
    /// Measures the current process against `limit_bytes`.
    pub fn new(limit_bytes: u64) -> Result<Self> {
        if limit_bytes == 0 {
            return Err(GraphError::InvalidArgument(
                "memory limit must be positive".into(),
            ));
        }
        let pid = sysinfo::get_current_pid().map_err(|err| {
            GraphError::InvalidArgument(format!("cannot resolve current process: {err}"))
        })?;
        Ok(Self {
            system: Mutex::new(System::new()),
            pid,
            limit_bytes,
        })
    }
}

impl PressureSource for ProcessMemorySource {
    fn used_fraction(&self) -> Result<f64> {
        let mut system = self.system.lock();
        system.refresh_process(self.pid);
        let resident = system
            .process(self.pid)
            .map(|process| process.memory())
            .ok_or_else(|| {
                GraphError::InvalidArgument(format!("process {} not visible", self.pid))
            })?;
        Ok(resident as f64 / self.limit_bytes as f64)
    }
}

/// Samples a [`PressureSource`] and signals the reference manager when usage
/// exceeds the threshold.
///
/// Sampling happens on a dedicated thread started by
/// [`PressureMonitor::start`]; [`PressureMonitor::check_now`] runs one sample
/// on the caller's thread. The signal itself only schedules work.
pub struct PressureMonitor {
    threshold: u8,
    source: Arc<dyn PressureSource>,
    refs: Arc<ReferenceManager>,
    stop: Arc<(Mutex<bool>, Condvar)>,
    sampler: Mutex<Option<JoinHandle<()>>>,
    signals: Arc<AtomicU64>,
}

impl PressureMonitor {
    /// Validates `threshold_percent` (0..=100) and wires the monitor.
    pub fn new(
        threshold_percent: u8,
        source: Arc<dyn PressureSource>,
        refs: Arc<ReferenceManager>,
    ) -> Result<Self> {
        if threshold_percent > 100 {
            return Err(GraphError::InvalidArgument(format!(
                "heap percentage threshold must be within 0..=100, got {threshold_percent}"
            )));
        }
        Ok(Self {
            threshold: threshold_percent,
            source,
            refs,
            stop: Arc::new((Mutex::new(false), Condvar::new())),
            sampler: Mutex::new(None),
            signals: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Configured threshold in percent.
    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// Pressure signals sent so far.
    pub fn signals(&self) -> u64 {
        self.signals.load(Ordering::Relaxed)
    }

    /// Takes one sample; signals and returns true when above threshold.
    pub fn check_now(&self) -> Result<bool> {
        sample(
            self.source.as_ref(),
            self.threshold,
            &self.refs,
            &self.signals,
        )
    }

    /// Starts the background sampler. Calling it twice is a no-op.
    pub fn start(&self, interval: Duration) -> Result<()> {
        let mut sampler = self.sampler.lock();
        if sampler.is_some() {
            return Ok(());
        }
        if interval.is_zero() {
            return Err(GraphError::InvalidArgument(
                "pressure sample interval must be positive".into(),
            ));
        }
        *self.stop.0.lock() = false;
        let source = Arc::clone(&self.source);
        let refs = Arc::clone(&self.refs);
        let stop = Arc::clone(&self.stop);
        let signals = Arc::clone(&self.signals);
        let threshold = self.threshold;
        let handle = thread::Builder::new()
            .name("overgraph-pressure".into())
            .spawn(move || {
                debug!(threshold, interval_ms = interval.as_millis() as u64, "pressure.sampler.start");
                let (stopped, wakeup) = &*stop;
                loop {
                    {
                        let mut guard = stopped.lock();
                        if !*guard {
                            wakeup.wait_for(&mut guard, interval);
                        }
                        if *guard {
                            break;
                        }
                    }
                    if let Err(err) = sample(source.as_ref(), threshold, &refs, &signals) {
                        warn!(error = %err, "pressure.sample.failed");
                    }
                }
                debug!("pressure.sampler.exit");
            })?;
        *sampler = Some(handle);
        Ok(())
    }

    /// Stops and joins the sampler thread.
    pub fn stop(&self) {
        {
            let (stopped, wakeup) = &*self.stop;
            *stopped.lock() = true;
            wakeup.notify_all();
        }
        if let Some(handle) = self.sampler.lock().take() {
            if handle.join().is_err() {
                warn!("pressure.sampler.panicked");
            }
        }
    }
}

impl Drop for PressureMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for PressureMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PressureMonitor")
            .field("threshold", &self.threshold)
            .field("signals", &self.signals())
            .finish_non_exhaustive()
    }
}

fn sample(
    source: &dyn PressureSource,
    threshold: u8,
    refs: &ReferenceManager,
    signals: &AtomicU64,
) -> Result<bool> {
    let fraction = source.used_fraction()?;
    let percent = fraction * 100.0;
    trace!(percent, threshold, "pressure.sample");
    if percent <= f64::from(threshold) {
        return Ok(false);
    }
    signals.fetch_add(1, Ordering::Relaxed);
    let scheduled = refs.on_pressure_signal();
    debug!(percent, threshold, scheduled, "pressure.signal");
    Ok(true)
}
