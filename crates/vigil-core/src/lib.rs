//! # Vigil Core
//!
//! In-process thread liveness monitoring with nanosecond-class overhead.
//!
//! Application code annotates hot paths with [`checkpoint`] calls; a
//! background supervisor detects threads that stopped making progress
//! (deadlocked, livelocked, stuck in a syscall), dumps their recent
//! checkpoint history, and invokes a fault callback.
//!
//! This crate provides:
//! - **Recorder**: a scope-bound, per-thread checkpoint recorder backed by a
//!   lock-free history ring
//! - **`checkpoint(id)`**: the free entry point, an inert no-op wherever no
//!   recorder is in scope
//! - **Registry**: a sharded, process-wide directory of instrumented threads
//! - **Supervisor**: an adaptive background cycle that garbage-collects dead
//!   registrations and reports frozen threads
//!
//! ## Design principles
//!
//! 1. **No locks or allocations on the hot path** — a checkpoint is a few
//!    atomic stores into a preallocated ring
//! 2. **Readers never block writers** — the supervisor snapshots histories
//!    through a single-writer publication protocol
//! 3. **Sharded registration** — registration scales to thousands of
//!    short-lived threads
//! 4. **Adaptive supervision** — the monitor spins faster under churn and is
//!    effectively idle in steady state
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use vigil_core::{checkpoint, Recorder, Registry};
//!
//! Registry::instance().set_thread_timeout(Duration::from_secs(30));
//!
//! fn worker_loop() {
//!     let _recorder: Recorder = Recorder::new("worker-loop", 1);
//!     for _ in 0..3 {
//!         checkpoint(2);
//!         // ... one unit of work ...
//!         checkpoint(3);
//!     }
//! } // the recorder deregisters itself here
//! # worker_loop();
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Raw recorder pointers underpin the slot/registration handshake.
#![allow(unsafe_code)]

mod clock;
pub mod history;
pub mod recorder;
pub mod registry;
mod report;

pub use history::{History, HistoryRecord, COALESCE_RESOLUTION, DEFAULT_HISTORY_DEPTH};
pub use recorder::{checkpoint, Recorder};
pub use registry::{Registry, SupervisorError, ThreadLivenessState};
