//! Supervisor cycle and background worker.
//!
//! One cycle walks every shard, erasing tombstoned registrations and looking
//! for a thread whose liveness timestamp and freshest checkpoint are both
//! older than the configured thread timeout. The first such candidate ends
//! the scan; its history is dumped and the fault action runs, rate-limited
//! to one action per timeout window.
//!
//! The background worker paces itself from the garbage it collects: heavy
//! churn (thread pools spawning and exiting) shortens the sleep so GC cost
//! stays bounded, while a quiet process pays one scan per idle interval.

use std::io::{self, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::clock;
use crate::history::History;
use crate::registry::{Registry, STALE_THREAD_THRESHOLD, TOMBSTONE_NANOS};
use crate::report;

/// Sleep between cycles when there is nothing to collect. Essentially the
/// idle-machine overhead of the monitor.
pub const IDLE_CYCLE_INTERVAL: Duration = Duration::from_millis(500);

/// Background supervisor failures.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The OS refused to spawn the supervisor thread.
    #[error("failed to spawn the supervisor thread: {0}")]
    Spawn(#[from] io::Error),
    /// The supervisor thread panicked before it could be joined.
    #[error("supervisor thread panicked")]
    Join,
}

/// Handle to the background worker owned by the singleton registry.
pub(crate) struct Supervisor {
    terminating: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub(crate) fn spawn(registry: &'static Registry) -> Result<Self, SupervisorError> {
        let terminating = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&terminating);
        let thread = thread::Builder::new()
            .name("vigil-supervisor".into())
            .spawn(move || {
                debug!("liveness supervisor started");
                // Let the constructing thread finish singleton setup first.
                thread::sleep(Duration::from_millis(1));
                while !flag.load(Ordering::Relaxed) {
                    let collected = registry.run_monitor_cycle();
                    thread::sleep(pacing_delay(collected));
                }
                debug!("liveness supervisor terminated");
            })?;
        Ok(Self {
            terminating,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// A supervisor that never ran; used when spawning failed.
    pub(crate) fn disabled() -> Self {
        Self {
            terminating: Arc::new(AtomicBool::new(true)),
            thread: Mutex::new(None),
        }
    }

    pub(crate) fn shutdown(&self) -> Result<(), SupervisorError> {
        self.terminating.store(true, Ordering::Relaxed);
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            handle.join().map_err(|_| SupervisorError::Join)?;
        }
        Ok(())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            warn!(%error, "liveness supervisor did not shut down cleanly");
        }
    }
}

/// Next worker sleep, adapted to the amount of garbage the last cycle
/// collected. Thresholds are empirical tunables, not contracts.
pub(crate) fn pacing_delay(gc_count: usize) -> Duration {
    match gc_count {
        n if n > 500 => Duration::from_micros(200),
        n if n > 100 => Duration::from_millis(5),
        n if n > 10 => Duration::from_millis(100),
        _ => IDLE_CYCLE_INTERVAL,
    }
}

impl Registry {
    /// Runs one supervisor cycle: erases tombstoned registrations, detects
    /// at most one frozen thread, and (rate-limited) dumps its history and
    /// invokes the fault action. Returns the number of registrations
    /// garbage-collected.
    ///
    /// Invoked by the background worker in production; tests call it
    /// directly to drive the supervisor deterministically.
    pub fn run_monitor_cycle(&self) -> usize {
        let start = SystemTime::now();
        let start_nanos = clock::nanos_since_epoch(start);
        let timeout = self.thread_timeout();
        let timeout_nanos = clock::duration_nanos(timeout);
        let threshold_nanos = start_nanos.saturating_sub(timeout_nanos);

        let mut collected = 0usize;
        let mut frozen: Option<(ThreadId, History)> = None;

        'scan: for shard in &self.shards {
            let mut entries = shard.entries.lock();
            let mut index = 0;
            while index < entries.len() {
                let last_seen = entries[index].last_seen_nanos();

                if last_seen == TOMBSTONE_NANOS {
                    {
                        // Serialize with a recorder drop that may still be
                        // inside its critical section.
                        let probe = entries[index].probe();
                        debug_assert!(probe.is_none());
                    }
                    entries.swap_remove(index);
                    collected += 1;
                    // The swapped-in entry now sits at `index`; re-examine it.
                    continue;
                }

                if last_seen < threshold_nanos {
                    // The liveness timestamp lags by the reporting interval,
                    // so confirm against the recorder itself.
                    let registration = &entries[index];
                    let probe = registration.probe();
                    if let Some(ptr) = *probe {
                        // SAFETY: a non-null probe held under the probe lock
                        // points at a live recorder core; the recorder
                        // clears it under this same lock before dropping.
                        let recorder = unsafe { ptr.as_ref() };
                        let stale_for = SystemTime::now()
                            .duration_since(recorder.last_checkpoint_time())
                            .unwrap_or(Duration::ZERO);
                        if stale_for > timeout {
                            frozen = Some((registration.thread_id(), recorder.history()));
                            break 'scan;
                        }
                    }
                }
                index += 1;
            }
        }

        if collected > 0 {
            debug!(collected, "monitor cycle garbage-collected registrations");
        }

        if let Some((thread_id, history)) = frozen {
            let last_fault = self.last_fault_nanos.load(Ordering::Relaxed);
            if start_nanos.saturating_sub(last_fault) > timeout_nanos {
                self.last_fault_nanos.store(start_nanos, Ordering::Relaxed);
                self.detections.fetch_add(1, Ordering::Relaxed);
                error!(?thread_id, "frozen thread detected");
                {
                    let mut err = io::stderr().lock();
                    let _ = writeln!(err, "Frozen thread: {thread_id:?}");
                    let _ = report::write_history(&mut err, &history);
                }
                self.frozen_thread_action();
            }
        }
        collected
    }

    /// Fault action: a roll call of every stale thread, then the
    /// user-supplied callback.
    fn frozen_thread_action(&self) {
        let mut err = io::stderr().lock();
        let _ = writeln!(err, "All stale threads:");
        for shard in &self.shards {
            let shard_start = SystemTime::now();
            let entries = shard.entries.lock();
            for registration in entries.iter() {
                let last_seen = registration.last_seen_nanos();
                if last_seen == TOMBSTONE_NANOS {
                    continue;
                }
                let age = shard_start
                    .duration_since(clock::time_from_epoch_nanos(last_seen))
                    .unwrap_or(Duration::ZERO);
                if age < STALE_THREAD_THRESHOLD {
                    continue;
                }
                // Re-read a fresh history under the probe lock; the thread
                // may have unregistered since the liveness load.
                let (thread_id, history) = {
                    let probe = registration.probe();
                    match *probe {
                        // SAFETY: as in `run_monitor_cycle`.
                        Some(ptr) => (registration.thread_id(), unsafe { ptr.as_ref() }.history()),
                        None => continue,
                    }
                };
                let Some(newest) = history.last() else {
                    continue;
                };
                let freshly_seen = shard_start
                    .duration_since(newest.timestamp)
                    .unwrap_or(Duration::ZERO)
                    < STALE_THREAD_THRESHOLD;
                if freshly_seen {
                    continue;
                }
                let _ = writeln!(err, "Thread: {thread_id:?}");
                let _ = report::write_history(&mut err, &history);
            }
        }
        drop(err);

        if let Some(callback) = self.fault_callback() {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::Recorder;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_pacing_delay_ladder() {
        assert_eq!(pacing_delay(0), IDLE_CYCLE_INTERVAL);
        assert_eq!(pacing_delay(10), IDLE_CYCLE_INTERVAL);
        assert_eq!(pacing_delay(11), Duration::from_millis(100));
        assert_eq!(pacing_delay(100), Duration::from_millis(100));
        assert_eq!(pacing_delay(101), Duration::from_millis(5));
        assert_eq!(pacing_delay(500), Duration::from_millis(5));
        assert_eq!(pacing_delay(501), Duration::from_micros(200));
    }

    #[test]
    fn test_cycle_collects_tombstones() {
        let registry = Registry::new_without_monitor_thread();
        assert_eq!(registry.run_monitor_cycle(), 0);
        {
            let _recorder: Recorder = Recorder::with_registry(&registry, "gone", 1);
        }
        assert_eq!(registry.run_monitor_cycle(), 1);
        assert_eq!(registry.thread_count(), 0);
    }

    #[test]
    fn test_cycle_keeps_live_recorder() {
        let registry = Registry::new_without_monitor_thread();
        let _recorder: Recorder = Recorder::with_registry(&registry, "alive", 1);
        assert_eq!(registry.run_monitor_cycle(), 0);
        assert_eq!(registry.thread_count(), 1);
    }

    #[test]
    fn test_frozen_thread_detected_and_rate_limited() {
        let registry = Registry::new_without_monitor_thread();
        registry.set_thread_timeout(Duration::from_millis(50));
        let fired = Arc::new(AtomicU32::new(0));
        let observer = Arc::clone(&fired);
        registry.set_liveness_error_callback(move || {
            observer.fetch_add(1, Ordering::SeqCst);
        });

        let _recorder: Recorder = Recorder::with_registry(&registry, "stuck", 1);
        thread::sleep(Duration::from_millis(60));

        registry.run_monitor_cycle();
        // The second cycle lands well inside the rate-limit window.
        registry.run_monitor_cycle();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(registry.liveness_error_condition_detected_count(), 1);
    }

    #[test]
    fn test_healthy_thread_not_detected() {
        let registry = Registry::new_without_monitor_thread();
        registry.set_thread_timeout(Duration::from_secs(60));
        let _recorder: Recorder = Recorder::with_registry(&registry, "healthy", 1);
        registry.run_monitor_cycle();
        assert_eq!(registry.liveness_error_condition_detected_count(), 0);
    }

    #[test]
    fn test_worker_spawn_and_shutdown() {
        let registry: &'static Registry = Box::leak(Box::new(Registry::new(true)));
        registry.ensure_supervisor();
        registry.shutdown_supervisor().expect("clean shutdown");
        // Idempotent.
        registry.shutdown_supervisor().expect("second shutdown is a no-op");
    }
}
