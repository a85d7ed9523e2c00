//! Per-thread checkpoint recorder.
//!
//! A [`Recorder`] is a scope guard living on a worker thread's stack. On
//! construction it installs itself as the thread's active recorder, writes a
//! first checkpoint, and registers with the [`Registry`]; on drop it clears
//! the slot and tombstones its registration for the supervisor to collect.
//!
//! ```text
//!  application thread                      supervisor thread
//!  ──────────────────                      ─────────────────
//!  checkpoint(id)
//!    └─► active-recorder slot ─► ring      run_monitor_cycle()
//!                                 │          └─► registration ──(probe)──► ring
//!                                 └── every reporting interval:
//!                                     registration.last_seen_alive = now
//! ```
//!
//! Nesting is suppressed rather than tracked: a recorder constructed while
//! another is live on the same thread's stack stays disabled and records
//! nothing, so a single thread-local pointer is all the bookkeeping the hot
//! path needs.
//!
//! ## Threading contract
//!
//! `Recorder` is deliberately `!Send`: the drop must run on the thread that
//! ran the constructor, because it clears that thread's active-recorder slot.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::SystemTime;

use crate::clock;
use crate::history::{History, HistoryRing, DEFAULT_HISTORY_DEPTH};
use crate::registry::{Registration, Registry};
use crate::report;

thread_local! {
    /// Innermost enabled recorder on this thread's stack, if any. Only the
    /// owning thread touches the slot, so a plain `Cell` suffices.
    static ACTIVE_RECORDER: Cell<Option<NonNull<dyn CheckpointSink>>> = const { Cell::new(None) };
}

/// Checkpoint entry point used by the thread-local active-recorder slot.
pub(crate) trait CheckpointSink {
    fn record_checkpoint(&self, id: u32);
}

/// Supervisor-facing view of a live recorder, reached through its
/// registration's guarded probe pointer.
pub(crate) trait LivenessProbe: Sync {
    fn last_checkpoint_time(&self) -> SystemTime;
    fn history(&self) -> History;
}

/// Records a checkpoint on the current thread's active recorder.
///
/// A silent no-op when no recorder is in scope, so instrumented code paths
/// cost nothing in processes that never construct a [`Recorder`]. Never
/// blocks and never allocates.
///
/// # Example
///
/// ```
/// use vigil_core::{checkpoint, Recorder};
///
/// checkpoint(100); // no recorder yet: ignored
/// let recorder: Recorder = Recorder::new("worker", 1);
/// checkpoint(2);
/// assert!(recorder.is_enabled());
/// ```
pub fn checkpoint(id: u32) {
    ACTIVE_RECORDER.with(|slot| {
        if let Some(sink) = slot.get() {
            // SAFETY: the slot points at the innermost enabled recorder's
            // core. The recorder clears the slot in its drop before the core
            // is freed, and only this thread reads or writes the slot.
            unsafe { sink.as_ref() }.record_checkpoint(id);
        }
    });
}

/// Heap-pinned recorder state. The public [`Recorder`] wrapper may move
/// freely; the core must not, because the thread-local slot and the
/// registration hold raw pointers to it.
struct RecorderCore<const DEPTH: usize> {
    name: String,
    thread_id: ThreadId,
    ring: HistoryRing<DEPTH>,
    registration: Option<Arc<Registration>>,
    /// Cached from the registry at construction.
    reporting_interval_nanos: u64,
    /// Epoch nanos of the last liveness publication.
    last_reported_nanos: AtomicU64,
}

impl<const DEPTH: usize> RecorderCore<DEPTH> {
    /// Publishes `last_seen_alive` at most once per reporting interval, so a
    /// hot checkpoint loop does not thrash the registration's cache line.
    fn maybe_publish_liveness(&self, now: SystemTime) {
        let Some(registration) = &self.registration else {
            return;
        };
        let now_nanos = clock::nanos_since_epoch(now);
        let last = self.last_reported_nanos.load(Ordering::Relaxed);
        if now_nanos.saturating_sub(last) < self.reporting_interval_nanos {
            return;
        }
        self.last_reported_nanos.store(now_nanos, Ordering::Relaxed);
        registration.publish_liveness(now_nanos);
    }
}

impl<const DEPTH: usize> CheckpointSink for RecorderCore<DEPTH> {
    fn record_checkpoint(&self, id: u32) {
        let now = self.ring.record(id);
        self.maybe_publish_liveness(now);
    }
}

impl<const DEPTH: usize> LivenessProbe for RecorderCore<DEPTH> {
    fn last_checkpoint_time(&self) -> SystemTime {
        self.ring.last_checkpoint_time()
    }

    fn history(&self) -> History {
        self.ring.snapshot()
    }
}

/// Scope-bound checkpoint recorder for the current thread.
///
/// Construct one at the top of an instrumented region; every
/// [`checkpoint`] call on this thread then lands in its history ring, and
/// the registry's supervisor watches the thread for loss of liveness until
/// the recorder is dropped.
///
/// `DEPTH` selects the ring capacity and defaults to
/// [`DEFAULT_HISTORY_DEPTH`].
///
/// # Example
///
/// ```
/// use vigil_core::{checkpoint, Recorder};
///
/// fn handle_request() {
///     let _recorder: Recorder = Recorder::new("request-loop", 1);
///     checkpoint(2);
///     // ... work ...
///     checkpoint(3);
/// } // recorder deregisters here
/// # handle_request();
/// ```
pub struct Recorder<const DEPTH: usize = DEFAULT_HISTORY_DEPTH> {
    /// Owned allocation, freed in drop. Held as a raw pointer rather than a
    /// `Box` so the aliasing registry/slot pointers stay valid while the
    /// recorder itself moves around.
    core: NonNull<RecorderCore<DEPTH>>,
    enabled: bool,
    /// Ties the recorder to its creating thread; see the module docs.
    _single_thread: PhantomData<*mut ()>,
}

impl<const DEPTH: usize> Recorder<DEPTH> {
    /// Creates a recorder registered with the process-wide [`Registry`].
    ///
    /// If another recorder is already live on this thread's stack, the new
    /// one is disabled: it records nothing and the outer recorder remains
    /// the one of record.
    pub fn new(name: impl Into<String>, first_checkpoint_id: u32) -> Self {
        Self::with_registry(Registry::instance(), name, first_checkpoint_id)
    }

    /// Creates a recorder registered with an explicit registry instead of
    /// the process-wide singleton. Intended for tests driving
    /// [`Registry::run_monitor_cycle`] by hand.
    pub fn with_registry(
        registry: &Registry,
        name: impl Into<String>,
        first_checkpoint_id: u32,
    ) -> Self {
        let mut core = Box::new(RecorderCore {
            name: name.into(),
            thread_id: thread::current().id(),
            ring: HistoryRing::new(),
            registration: None,
            reporting_interval_nanos: 0,
            last_reported_nanos: AtomicU64::new(0),
        });

        let slot_free = ACTIVE_RECORDER.with(|slot| slot.get().is_none());
        if !slot_free {
            return Self {
                core: NonNull::from(Box::leak(core)),
                enabled: false,
                _single_thread: PhantomData,
            };
        }

        core.ring.record(first_checkpoint_id);
        core.reporting_interval_nanos = clock::duration_nanos(registry.reporting_interval());
        // Seed the registration with the first checkpoint's timestamp, which
        // is the ring's creation instant.
        let registration = Arc::new(Registration::new(
            core.thread_id,
            clock::nanos_since_epoch(core.ring.creation()),
        ));
        core.registration = Some(Arc::clone(&registration));

        // The core is fully initialized; release it from the `Box` before
        // the registry and the slot take aliasing pointers into it.
        let core = NonNull::from(Box::leak(core));
        registry.register(registration, core);
        let sink: NonNull<dyn CheckpointSink> = core;
        ACTIVE_RECORDER.with(|slot| slot.set(Some(sink)));

        Self {
            core,
            enabled: true,
            _single_thread: PhantomData,
        }
    }

    fn core(&self) -> &RecorderCore<DEPTH> {
        // SAFETY: `core` is the live allocation leaked in the constructor; it
        // is freed only in this recorder's drop.
        unsafe { self.core.as_ref() }
    }

    /// Whether this recorder is the thread's recorder of record. `false`
    /// exactly when it was constructed inside another recorder's scope.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Name passed at construction.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core().name
    }

    /// Ring capacity.
    #[must_use]
    pub const fn depth(&self) -> usize {
        DEPTH
    }

    /// Snapshot of the recent checkpoints, oldest first. Empty for a
    /// disabled recorder.
    #[must_use]
    pub fn history_snapshot(&self) -> History {
        self.core().ring.snapshot()
    }

    /// Wall-clock time of the newest checkpoint, or the recorder's creation
    /// time when nothing was recorded yet.
    #[must_use]
    pub fn last_checkpoint_time(&self) -> SystemTime {
        self.core().ring.last_checkpoint_time()
    }

    /// Writes this recorder's history to the diagnostics stream, one line
    /// per record.
    pub fn print_history(&self) {
        report::print_history(&self.history_snapshot());
    }
}

impl<const DEPTH: usize> Drop for Recorder<DEPTH> {
    fn drop(&mut self) {
        if self.enabled {
            ACTIVE_RECORDER.with(|slot| slot.set(None));
            if let Some(registration) = &self.core().registration {
                // The supervisor frees the registration later; after this
                // call it will never dereference the probe pointer again.
                registration.tombstone();
            }
        }
        // SAFETY: `core` was leaked from a `Box` in the constructor and is
        // freed exactly once, here. The slot is cleared and the probe
        // tombstoned above, so no pointer to it survives this drop.
        drop(unsafe { Box::from_raw(self.core.as_ptr()) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::COALESCE_RESOLUTION;

    fn settle() {
        thread::sleep(COALESCE_RESOLUTION * 2);
    }

    fn registry() -> Registry {
        Registry::new_without_monitor_thread()
    }

    #[test]
    fn test_nested_recorder_is_disabled() {
        let registry = registry();
        let outer: Recorder = Recorder::with_registry(&registry, "outer", 1);
        assert!(outer.is_enabled());
        let inner: Recorder = Recorder::with_registry(&registry, "inner", 2);
        assert!(!inner.is_enabled());
        assert_eq!(outer.name(), "outer");
        assert_eq!(inner.name(), "inner");

        // The outer recorder's history is untouched by the nested one.
        let history = outer.history_snapshot();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, 1);
        assert!(inner.history_snapshot().is_empty());
    }

    #[test]
    fn test_sequential_recorders_both_enabled() {
        let registry = registry();
        {
            let first: Recorder = Recorder::with_registry(&registry, "first", 1);
            assert!(first.is_enabled());
        }
        let second: Recorder = Recorder::with_registry(&registry, "second", 2);
        assert!(second.is_enabled());
    }

    #[test]
    fn test_first_checkpoint_written_in_constructor() {
        let registry = registry();
        let recorder: Recorder = Recorder::with_registry(&registry, "r", 42);
        let history = recorder.history_snapshot();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, 42);
    }

    #[test]
    fn test_checkpoint_without_recorder_is_noop() {
        checkpoint(5);
    }

    #[test]
    fn test_checkpoint_dispatches_to_active_recorder() {
        let registry = registry();
        let recorder: Recorder = Recorder::with_registry(&registry, "r", 1);
        settle();
        checkpoint(7);
        let ids: Vec<u32> = recorder.history_snapshot().iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![1, 7]);
    }

    #[test]
    fn test_checkpoints_skip_disabled_inner_recorder() {
        let registry = registry();
        let outer: Recorder = Recorder::with_registry(&registry, "outer", 1);
        let inner: Recorder = Recorder::with_registry(&registry, "inner", 2);
        settle();
        checkpoint(9);
        let ids: Vec<u32> = outer.history_snapshot().iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![1, 9]);
        assert!(inner.history_snapshot().is_empty());
    }

    #[test]
    fn test_depth_matches_parameter() {
        let registry = registry();
        let recorder = Recorder::<3>::with_registry(&registry, "r", 1);
        assert_eq!(recorder.depth(), 3);
    }

    #[test]
    fn test_ring_overflow_through_checkpoints() {
        let registry = registry();
        let recorder = Recorder::<3>::with_registry(&registry, "r", 0);
        for id in 1..=4 {
            settle();
            checkpoint(id);
        }
        let ids: Vec<u32> = recorder.history_snapshot().iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn test_slot_cleared_after_drop() {
        let registry = registry();
        {
            let _r: Recorder = Recorder::with_registry(&registry, "a", 1);
        }
        // If the slot leaked, this one would be disabled.
        let again: Recorder = Recorder::with_registry(&registry, "b", 2);
        assert!(again.is_enabled());
    }

    #[test]
    fn test_last_checkpoint_time_advances() {
        let registry = registry();
        let recorder: Recorder = Recorder::with_registry(&registry, "r", 1);
        let first = recorder.last_checkpoint_time();
        settle();
        checkpoint(2);
        assert!(recorder.last_checkpoint_time() > first);
    }
}
