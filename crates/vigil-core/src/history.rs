//! Lock-free checkpoint history ring.
//!
//! Every recorder owns one fixed-depth ring of the most recent checkpoints.
//! The ring is written by exactly one thread (the recorder's owner) and read
//! concurrently by at most one supervisor thread, so per-slot atomics are
//! enough; there is no mutex anywhere on the write path.
//!
//! ## Publication protocol
//!
//! `head` and `tail` live in `[0, DEPTH)`, with `DEPTH` itself acting as the
//! "empty" sentinel. `tail` is inclusive. Appending a record:
//!
//! 1. advance `head` first when the ring is full, so the interval
//!    `[head, tail]` never transiently covers the slot being overwritten;
//! 2. write the slot fields;
//! 3. publish with a release store of `tail`.
//!
//! A reader that observes the new `tail` therefore observes the slot fields
//! written before it. The one remaining race is a writer lapping the reader's
//! first element; the reader re-checks `head` and drops that element when it
//! moved. Snapshots assume at most one concurrent append per call — callers
//! needing more must serialize externally.
//!
//! Checkpoints closer together than [`COALESCE_RESOLUTION`] overwrite the
//! tail slot in place, so a tight loop does not flush the whole history.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::{Duration, SystemTime};

#[cfg(debug_assertions)]
use std::sync::atomic::AtomicU64;

use smallvec::SmallVec;

use crate::clock;

/// Default number of checkpoints a recorder keeps.
pub const DEFAULT_HISTORY_DEPTH: usize = 10;

/// Checkpoints closer together than this overwrite the previous record
/// instead of consuming a fresh slot.
pub const COALESCE_RESOLUTION: Duration = Duration::from_micros(10);

const COALESCE_RESOLUTION_NANOS: i64 = COALESCE_RESOLUTION.as_nanos() as i64;

/// One materialized checkpoint, as returned to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRecord {
    /// Application-chosen checkpoint identifier.
    pub id: u32,
    /// Absolute wall-clock time the checkpoint was recorded.
    pub timestamp: SystemTime,
    /// Global write-order stamp, only maintained in debug builds.
    #[cfg(debug_assertions)]
    pub sequence: u64,
}

/// A snapshot of a recorder's recent checkpoints, oldest first.
///
/// Inline up to the default depth so snapshotting a default-sized ring does
/// not allocate.
pub type History = SmallVec<[HistoryRecord; DEFAULT_HISTORY_DEPTH]>;

/// Process-global write-order stamp. Expensive, debug builds only.
#[cfg(debug_assertions)]
static GLOBAL_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[cfg(debug_assertions)]
fn next_sequence() -> u64 {
    GLOBAL_SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1
}

/// One ring slot. Durations are stored relative to the ring's creation
/// timestamp so a slot is two machine words and each field publishes with a
/// single atomic store.
struct HistorySlot {
    id: AtomicU32,
    nanos_from_creation: AtomicI64,
    #[cfg(debug_assertions)]
    sequence: AtomicU64,
}

impl HistorySlot {
    fn new() -> Self {
        Self {
            id: AtomicU32::new(0),
            nanos_from_creation: AtomicI64::new(0),
            #[cfg(debug_assertions)]
            sequence: AtomicU64::new(0),
        }
    }
}

/// Fixed-depth circular checkpoint history. Single writer, at most one
/// concurrent reader.
pub(crate) struct HistoryRing<const DEPTH: usize> {
    slots: [HistorySlot; DEPTH],
    /// Oldest valid slot, or [`Self::SENTINEL`] while empty.
    head: AtomicU32,
    /// Newest valid slot, inclusive, or [`Self::SENTINEL`] while empty.
    tail: AtomicU32,
    creation: SystemTime,
}

impl<const DEPTH: usize> HistoryRing<DEPTH> {
    const SENTINEL: u32 = DEPTH as u32;

    pub(crate) fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| HistorySlot::new()),
            head: AtomicU32::new(Self::SENTINEL),
            tail: AtomicU32::new(Self::SENTINEL),
            creation: SystemTime::now(),
        }
    }

    /// Timestamp captured at construction; all slot durations are relative
    /// to it.
    pub(crate) fn creation(&self) -> SystemTime {
        self.creation
    }

    /// Appends a checkpoint. Returns the timestamp the record carries so the
    /// caller can reuse it for liveness publication without a second clock
    /// read.
    ///
    /// Must only be called from the owning thread.
    pub(crate) fn record(&self, id: u32) -> SystemTime {
        if self.head.load(Ordering::Relaxed) == Self::SENTINEL {
            // Very first checkpoint, invoked from the recorder constructor.
            self.write_slot(0, id, 0);
            self.head.store(0, Ordering::Release);
            self.tail.store(0, Ordering::Release);
            return self.creation;
        }

        let now = SystemTime::now();
        let nanos = clock::signed_nanos_between(self.creation, now);
        let tail = self.tail.load(Ordering::Relaxed);
        let tail_nanos = self.slots[tail as usize]
            .nanos_from_creation
            .load(Ordering::Relaxed);
        if nanos.saturating_sub(tail_nanos) < COALESCE_RESOLUTION_NANOS {
            // Too close to the previous record; overwrite it in place rather
            // than polluting the history with near-duplicate entries.
            self.write_slot(tail, id, nanos);
            return now;
        }

        let head = self.head.load(Ordering::Relaxed);
        let next = if head == Self::wrap(tail + 1) {
            // Full: reuse the head slot, advancing head before the write so
            // readers never walk into the slot mid-update.
            self.head.store(Self::wrap(head + 1), Ordering::Release);
            head
        } else {
            Self::wrap(tail + 1)
        };
        self.write_slot(next, id, nanos);
        // Publish: once the new tail is visible the record is, too.
        self.tail.store(next, Ordering::Release);
        now
    }

    fn write_slot(&self, index: u32, id: u32, nanos: i64) {
        debug_assert!((index as usize) < DEPTH);
        let slot = &self.slots[index as usize];
        slot.id.store(id, Ordering::Relaxed);
        slot.nanos_from_creation.store(nanos, Ordering::Relaxed);
        #[cfg(debug_assertions)]
        slot.sequence.store(next_sequence(), Ordering::Relaxed);
    }

    fn wrap(index: u32) -> u32 {
        if index >= Self::SENTINEL {
            0
        } else {
            index
        }
    }

    /// Wall-clock time of the newest record, or the creation timestamp while
    /// the ring is empty. Safe to call from the supervisor thread.
    pub(crate) fn last_checkpoint_time(&self) -> SystemTime {
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            if tail == Self::SENTINEL {
                return self.creation;
            }
            let nanos = self.slots[tail as usize]
                .nanos_from_creation
                .load(Ordering::Relaxed);
            // Retry if the tail moved under us; the slot may have been
            // half-written.
            if self.tail.load(Ordering::Acquire) == tail {
                return clock::offset_by_nanos(self.creation, nanos);
            }
        }
    }

    /// Materializes the current history, oldest first.
    ///
    /// Never fails: under a concurrent append the result may be one element
    /// short (the overwritten first element is detected via a `head` re-read
    /// and dropped), but never garbage.
    pub(crate) fn snapshot(&self) -> History {
        let mut history = History::new();
        let initial_head = self.head.load(Ordering::Acquire);
        if initial_head == Self::SENTINEL || self.tail.load(Ordering::Acquire) == Self::SENTINEL {
            return history;
        }

        let mut index = initial_head;
        let mut at_first_element = true;
        loop {
            let slot = &self.slots[index as usize];
            let record = HistoryRecord {
                id: slot.id.load(Ordering::Relaxed),
                timestamp: clock::offset_by_nanos(
                    self.creation,
                    slot.nanos_from_creation.load(Ordering::Relaxed),
                ),
                #[cfg(debug_assertions)]
                sequence: slot.sequence.load(Ordering::Relaxed),
            };
            // If head moved while we materialized the first element, the
            // writer lapped us and the element is stale; drop it.
            if !at_first_element || initial_head == self.head.load(Ordering::Acquire) {
                history.push(record);
            }
            at_first_element = false;
            // Tail is inclusive; re-read it each step so an append during
            // the walk extends the snapshot instead of truncating it.
            if index == self.tail.load(Ordering::Acquire) {
                break;
            }
            index = Self::wrap(index + 1);
        }
        history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Sleeps past the coalescing resolution so consecutive records land in
    /// distinct slots.
    fn settle() {
        thread::sleep(COALESCE_RESOLUTION * 2);
    }

    #[test]
    fn test_empty_ring() {
        let ring: HistoryRing<4> = HistoryRing::new();
        assert!(ring.snapshot().is_empty());
        assert_eq!(ring.last_checkpoint_time(), ring.creation());
    }

    #[test]
    fn test_first_record_carries_first_id() {
        let ring: HistoryRing<4> = HistoryRing::new();
        ring.record(7);
        let history = ring.snapshot();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, 7);
        assert_eq!(history[0].timestamp, ring.creation());
    }

    #[test]
    fn test_records_appear_in_order() {
        let ring: HistoryRing<10> = HistoryRing::new();
        for id in 0..5 {
            ring.record(id);
            settle();
        }
        let history = ring.snapshot();
        let ids: Vec<u32> = history.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        for pair in history.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[test]
    fn test_len_is_min_of_depth_and_count() {
        let ring: HistoryRing<5> = HistoryRing::new();
        for n in 1..=8u32 {
            ring.record(n);
            settle();
            assert_eq!(ring.snapshot().len(), 5.min(n as usize));
        }
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let ring: HistoryRing<3> = HistoryRing::new();
        for id in 0..=4 {
            ring.record(id);
            settle();
        }
        let ids: Vec<u32> = ring.snapshot().iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn test_wraps_repeatedly() {
        let ring: HistoryRing<3> = HistoryRing::new();
        for id in 0..20 {
            ring.record(id);
            settle();
        }
        let ids: Vec<u32> = ring.snapshot().iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![17, 18, 19]);
    }

    #[test]
    fn test_tight_loop_coalesces() {
        let ring: HistoryRing<10> = HistoryRing::new();
        ring.record(0);
        ring.record(1);
        let history = ring.snapshot();
        // The second record usually lands within the resolution and replaces
        // the first; on a slow machine it may get its own slot.
        assert!(history.len() <= 2);
        if history.len() == 1 {
            assert_eq!(history[0].id, 1);
        }
    }

    #[test]
    fn test_last_checkpoint_time_tracks_tail() {
        let ring: HistoryRing<4> = HistoryRing::new();
        ring.record(1);
        settle();
        ring.record(2);
        let history = ring.snapshot();
        assert_eq!(
            ring.last_checkpoint_time(),
            history.last().unwrap().timestamp
        );
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_sequences_strictly_increase() {
        let ring: HistoryRing<8> = HistoryRing::new();
        for id in 0..6 {
            ring.record(id);
            settle();
        }
        let history = ring.snapshot();
        for pair in history.windows(2) {
            assert!(pair[0].sequence < pair[1].sequence);
        }
    }
}
