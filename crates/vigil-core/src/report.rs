//! Fault-time diagnostics formatting.
//!
//! One line per history record, written to the diagnostics stream (stderr):
//!
//! ```text
//! Checkpoint: 12    at: 2026-08-02 14:03:07.412398    delta: 154 us
//! ```
//!
//! Deltas are microseconds since the previous record; the first record's
//! delta is zero.

use std::io::{self, Write};
use std::time::SystemTime;

use chrono::{DateTime, Local};

use crate::clock;
use crate::history::History;

pub(crate) fn print_history(history: &History) {
    let mut err = io::stderr().lock();
    let _ = write_history(&mut err, history);
}

pub(crate) fn write_history(writer: &mut impl Write, history: &History) -> io::Result<()> {
    let mut previous = history.first().map(|record| record.timestamp);
    for record in history {
        let at: DateTime<Local> = record.timestamp.into();
        let delta_us = previous.map_or(0, |p| signed_micros_between(p, record.timestamp));
        writeln!(
            writer,
            "Checkpoint: {}\tat: {}\tdelta: {} us",
            record.id,
            at.format("%Y-%m-%d %H:%M:%S%.6f"),
            delta_us
        )?;
        previous = Some(record.timestamp);
    }
    Ok(())
}

fn signed_micros_between(earlier: SystemTime, later: SystemTime) -> i64 {
    clock::signed_nanos_between(earlier, later) / 1_000
}
