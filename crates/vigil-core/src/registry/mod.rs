//! Process-wide directory of instrumented threads.
//!
//! The registry is an `N`-way sharded collection of registrations, one per
//! live recorder. Sharding keeps registration and supervisor scans off a
//! single mutex: throughput scales roughly linearly until about as many
//! threads as shards contend.
//!
//! ## Registration lifecycle
//!
//! ```text
//!   Live ──(recorder drop, under probe lock)──► Tombstoned ──(supervisor)──► Erased
//! ```
//!
//! There is no deregistration call. A dropping recorder clears its probe
//! pointer and stamps `last_seen_alive` with the tombstone sentinel; any
//! later monitor cycle erases the entry. Each registration is its own `Arc`
//! allocation, so shard growth and erasure move only the handles, never the
//! registrations that recorders and the supervisor point at.

mod supervisor;

use std::hash::{Hash, Hasher};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;
use std::time::{Duration, SystemTime};

use fxhash::FxHasher;
use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

use crate::clock;
use crate::recorder::LivenessProbe;

pub use supervisor::{SupervisorError, IDLE_CYCLE_INTERVAL};
pub(crate) use supervisor::Supervisor;

/// Number of independently locked registry partitions.
///
/// Chosen empirically: contention drops steeply up to the mid-thirties and
/// saturates past about forty concurrently registering threads.
pub const SHARD_COUNT: usize = 36;

/// Default staleness after which a thread is considered frozen.
pub const DEFAULT_THREAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default interval between a recorder's liveness publications.
///
/// Debug builds report far more often so tests and stress runs can observe
/// lagging threads precisely; the cost is acceptable there.
#[cfg(debug_assertions)]
pub const DEFAULT_REPORTING_INTERVAL: Duration = Duration::from_millis(1);
/// Default interval between a recorder's liveness publications.
#[cfg(not(debug_assertions))]
pub const DEFAULT_REPORTING_INTERVAL: Duration = Duration::from_secs(1);

/// Threads whose liveness is older than this are included in the fault-time
/// roll call.
pub const STALE_THREAD_THRESHOLD: Duration = Duration::from_millis(1);

/// `last_seen_alive` value marking a registration awaiting garbage
/// collection.
pub(crate) const TOMBSTONE_NANOS: u64 = u64::MAX;

/// Bookkeeping entry for one live recorder. Owned by a shard; the recorder
/// keeps a counted handle for its own lifetime.
pub(crate) struct Registration {
    thread_id: ThreadId,
    /// Epoch nanos of the owning thread's last liveness publication;
    /// [`TOMBSTONE_NANOS`] once the recorder dropped.
    last_seen_alive: AtomicU64,
    /// Back-pointer to the recorder core, used by the supervisor to re-check
    /// a suspect thread. Never dereferenced outside this lock; checkpoints
    /// never take it, so contention is negligible.
    probe: Mutex<Option<NonNull<dyn LivenessProbe>>>,
}

// SAFETY: the only non-Send/Sync field is the raw probe pointer. It is read
// and cleared exclusively under the `probe` mutex, and the owning recorder
// clears it (under that mutex) before the pointee is invalidated, so sharing
// a Registration across threads cannot produce a dangling dereference.
unsafe impl Send for Registration {}
// SAFETY: see the Send impl above.
unsafe impl Sync for Registration {}

impl Registration {
    pub(crate) fn new(thread_id: ThreadId, now_nanos: u64) -> Self {
        Self {
            thread_id,
            last_seen_alive: AtomicU64::new(now_nanos),
            probe: Mutex::new(None),
        }
    }

    pub(crate) fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub(crate) fn publish_liveness(&self, now_nanos: u64) {
        self.last_seen_alive.store(now_nanos, Ordering::Release);
    }

    pub(crate) fn last_seen_nanos(&self) -> u64 {
        self.last_seen_alive.load(Ordering::Acquire)
    }

    pub(crate) fn probe(&self) -> MutexGuard<'_, Option<NonNull<dyn LivenessProbe>>> {
        self.probe.lock()
    }

    /// Marks this registration for garbage collection. Called by the owning
    /// recorder's drop, and only there.
    pub(crate) fn tombstone(&self) {
        let mut probe = self.probe.lock();
        *probe = None;
        // Stored under the probe lock so the supervisor can serialize
        // against a drop still inside its critical section.
        self.last_seen_alive.store(TOMBSTONE_NANOS, Ordering::Release);
    }
}

/// Liveness snapshot for one instrumented thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadLivenessState {
    /// Identifier of the instrumented thread.
    pub thread_id: ThreadId,
    /// Last liveness timestamp the thread published. Stale up to the
    /// configured reporting interval.
    pub last_seen_alive: SystemTime,
}

#[derive(Default)]
struct Shard {
    entries: Mutex<Vec<Arc<Registration>>>,
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// Central directory of instrumented threads plus the supervisor that scans
/// them.
///
/// Most applications only touch the process-wide singleton:
///
/// ```rust,ignore
/// use std::time::Duration;
/// use vigil_core::Registry;
///
/// let registry = Registry::instance();
/// registry.set_thread_timeout(Duration::from_secs(30));
/// registry.set_liveness_error_callback(|| std::process::abort());
/// ```
pub struct Registry {
    /// Read by the supervisor on every cycle without locking.
    thread_timeout_nanos: AtomicU64,
    reporting_interval_nanos: AtomicU64,
    fault_callback: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    last_fault_nanos: AtomicU64,
    detections: AtomicU32,
    shards: [Shard; SHARD_COUNT],
    supervisor: OnceLock<Supervisor>,
    spawn_supervisor: bool,
}

impl Registry {
    fn new(spawn_supervisor: bool) -> Self {
        Self {
            thread_timeout_nanos: AtomicU64::new(clock::duration_nanos(DEFAULT_THREAD_TIMEOUT)),
            reporting_interval_nanos: AtomicU64::new(clock::duration_nanos(
                DEFAULT_REPORTING_INTERVAL,
            )),
            fault_callback: Mutex::new(None),
            last_fault_nanos: AtomicU64::new(clock::nanos_since_epoch(SystemTime::now())),
            detections: AtomicU32::new(0),
            shards: std::array::from_fn(|_| Shard::default()),
            supervisor: OnceLock::new(),
            spawn_supervisor,
        }
    }

    /// The process-wide registry, spawning the background supervisor on
    /// first use (unless the singleton was already created in test mode).
    pub fn instance() -> &'static Self {
        let registry = GLOBAL.get_or_init(|| Self::new(true));
        registry.ensure_supervisor();
        registry
    }

    /// Creates the singleton with the background supervisor disabled so
    /// tests can drive [`Self::run_monitor_cycle`] deterministically.
    ///
    /// Only effective when called before any other touch of the singleton.
    /// Returns a dummy boolean so tests can trigger it from a static
    /// initializer.
    pub fn instantiate_without_monitor_thread_for_tests() -> bool {
        GLOBAL.get_or_init(|| Self::new(false));
        true
    }

    /// A standalone registry with no background supervisor. Recorders attach
    /// to it via [`Recorder::with_registry`](crate::Recorder::with_registry);
    /// cycles run only through [`Self::run_monitor_cycle`].
    ///
    /// Keeps tests independent of each other and of the process singleton.
    #[must_use]
    pub fn new_without_monitor_thread() -> Self {
        Self::new(false)
    }

    fn ensure_supervisor(&'static self) {
        if !self.spawn_supervisor {
            return;
        }
        self.supervisor.get_or_init(|| {
            Supervisor::spawn(self).unwrap_or_else(|error| {
                warn!(%error, "liveness supervisor not started");
                Supervisor::disabled()
            })
        });
    }

    /// Signals the background supervisor to exit and joins it. A no-op when
    /// no supervisor was ever started.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Join`] if the supervisor thread panicked.
    pub fn shutdown_supervisor(&self) -> Result<(), SupervisorError> {
        match self.supervisor.get() {
            Some(supervisor) => supervisor.shutdown(),
            None => Ok(()),
        }
    }

    /// How long a thread may go without publishing liveness before the
    /// supervisor treats it as frozen.
    #[must_use]
    pub fn thread_timeout(&self) -> Duration {
        Duration::from_nanos(self.thread_timeout_nanos.load(Ordering::Relaxed))
    }

    /// Sets the freeze threshold. Production keeps the five-minute default;
    /// integration and stress tests shrink it to spot lagging threads fast.
    pub fn set_thread_timeout(&self, timeout: Duration) {
        self.thread_timeout_nanos
            .store(clock::duration_nanos(timeout), Ordering::Relaxed);
    }

    /// Interval newly constructed recorders use between liveness
    /// publications.
    #[must_use]
    pub fn reporting_interval(&self) -> Duration {
        Duration::from_nanos(self.reporting_interval_nanos.load(Ordering::Relaxed))
    }

    /// Changes how often new recorders publish liveness. Existing recorders
    /// keep the interval they cached at construction.
    pub fn set_reporting_interval(&self, interval: Duration) {
        self.reporting_interval_nanos
            .store(clock::duration_nanos(interval), Ordering::Relaxed);
    }

    /// Installs the callback invoked when a frozen thread is detected. In
    /// production this may terminate the process; the library itself only
    /// reports and keeps running.
    pub fn set_liveness_error_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.fault_callback.lock() = Some(Arc::new(callback));
    }

    /// How many times the frozen-thread condition was detected.
    #[must_use]
    pub fn liveness_error_condition_detected_count(&self) -> u32 {
        self.detections.load(Ordering::Relaxed)
    }

    /// Approximate count of registered threads, stale the instant it
    /// returns. Tombstoned registrations count until a cycle erases them.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.entries.lock().len())
            .sum()
    }

    /// Snapshot of every registered thread's last published liveness
    /// timestamp. Timestamps lag by up to the reporting interval.
    #[must_use]
    pub fn all_thread_liveness_states(&self) -> Vec<ThreadLivenessState> {
        let mut states = Vec::with_capacity(self.thread_count());
        for shard in &self.shards {
            let entries = shard.entries.lock();
            states.extend(entries.iter().map(|registration| ThreadLivenessState {
                thread_id: registration.thread_id(),
                last_seen_alive: clock::time_from_epoch_nanos(registration.last_seen_nanos()),
            }));
        }
        states
    }

    /// Inserts a registration whose probe pointer is already final. Called
    /// from recorder construction only.
    pub(crate) fn register(
        &self,
        registration: Arc<Registration>,
        probe: NonNull<dyn LivenessProbe>,
    ) {
        *registration.probe.lock() = Some(probe);
        let shard = self.shard_for(registration.thread_id());
        shard.entries.lock().push(registration);
    }

    fn shard_for(&self, thread_id: ThreadId) -> &Shard {
        let mut hasher = FxHasher::default();
        thread_id.hash(&mut hasher);
        let index = usize::try_from(hasher.finish() % SHARD_COUNT as u64).unwrap_or(0);
        &self.shards[index]
    }

    fn fault_callback(&self) -> Option<Arc<dyn Fn() + Send + Sync>> {
        self.fault_callback.lock().clone()
    }
}
