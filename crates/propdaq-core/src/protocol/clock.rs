//! Device clock synchronization
//!
//! The device stamps samples with its free-running 32-bit tick
//! counter and announces that counter once a second in a `sync`
//! control packet. This engine accumulates elapsed ticks across
//! counter rollovers and converts arbitrary device timestamps into
//! seconds since the first sync, cross-checked against the host wall
//! clock.
//!
//! The rollover arithmetic assumes at most one wraparound between
//! observations and disambiguates old-vs-new timestamps with
//! half-range comparisons; pathological reordering can defeat it, and
//! that ambiguity is inherited from the device firmware rather than
//! redesigned here.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{error, trace, warn};

use super::{ProtocolError, CLOCK_ERROR_TICKS, CLOCK_HZ, MAX_TICK, SYNC_PERIOD_TICKS};

/// Per-stream record used only to detect computed-time regressions.
#[derive(Debug, Clone, Copy, Default)]
struct StreamTime {
    last_real_time: f64,
    last_timestamp: u32,
}

/// State present once the first sync packet has arrived.
#[derive(Debug)]
struct Synced {
    /// Host instant of the first sync
    first_sync_wall: Instant,
    /// Elapsed device ticks accumulated since the first sync. Signed
    /// because drift correction can adjust it downward.
    ticks: i64,
    /// Device tick counter at the last sync
    last_sync_timestamp: u32,
}

/// Clock synchronization engine for one link session.
///
/// Mutated only by sync packets and timestamp conversions; never
/// reset except by reopening the link.
#[derive(Debug, Default)]
pub struct ClockSync {
    synced: Option<Synced>,
    streams: HashMap<Option<u8>, StreamTime>,
}

impl ClockSync {
    /// Fresh, unsynced engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a first sync has been seen.
    pub fn is_synced(&self) -> bool {
        self.synced.is_some()
    }

    /// Feed one sync packet carrying the device tick counter `t`.
    ///
    /// The first sync seeds the engine. Each later sync accumulates
    /// the elapsed ticks (assuming at most one rollover), warns when
    /// the elapsed count falls outside the expected sync period
    /// window, and corrects the accumulator when device-derived time
    /// has drifted more than a second from wall-clock time.
    pub fn on_sync(&mut self, t: u32) {
        let Some(s) = self.synced.as_mut() else {
            trace!(first = t, "first sync");
            self.synced = Some(Synced {
                first_sync_wall: Instant::now(),
                ticks: 0,
                last_sync_timestamp: t,
            });
            return;
        };

        let elapsed = if t >= s.last_sync_timestamp {
            trace!(from = s.last_sync_timestamp, to = t, "sync");
            (t - s.last_sync_timestamp) as u64
        } else {
            trace!(from = s.last_sync_timestamp, to = t, "sync (rollover)");
            t as u64 + (MAX_TICK - s.last_sync_timestamp as u64)
        };

        if elapsed + CLOCK_ERROR_TICKS < SYNC_PERIOD_TICKS {
            warn!(
                "{}",
                ProtocolError::ClockAnomaly(format!("sync too soon: {} ticks", elapsed))
            );
        } else if elapsed > SYNC_PERIOD_TICKS + CLOCK_ERROR_TICKS {
            warn!(
                "{}",
                ProtocolError::ClockAnomaly(format!("sync too late: {} ticks", elapsed))
            );
        }

        s.ticks += elapsed as i64;
        s.last_sync_timestamp = t;

        let device = s.ticks as f64 / CLOCK_HZ as f64;
        let wall = s.first_sync_wall.elapsed().as_secs_f64();
        let drift = device - wall;
        if drift.abs() > 1.0 {
            // a missed or garbled sync; pull the accumulator back in
            // line with the wall clock
            error!(
                "{}",
                ProtocolError::ClockAnomaly(format!(
                    "device time strayed {:.3}s from wall clock",
                    drift
                ))
            );
            s.ticks -= (drift * CLOCK_HZ as f64) as i64;
        }
    }

    /// Seconds since the first sync, from accumulated device ticks.
    pub fn current_time(&self) -> f64 {
        match &self.synced {
            Some(s) => s.ticks as f64 / CLOCK_HZ as f64,
            None => 0.0,
        }
    }

    /// Seconds since the first sync, from the host wall clock.
    /// Imprecise; used only as a drift reference.
    pub fn estimated_time(&self) -> f64 {
        match &self.synced {
            Some(s) => s.first_sync_wall.elapsed().as_secs_f64(),
            None => 0.0,
        }
    }

    /// Convert a device timestamp to seconds since the first sync.
    ///
    /// `stream_id` selects the per-stream regression record; pass
    /// `None` for timestamps not tied to a sample stream. A timestamp
    /// slightly older than the last sync yields a small negative
    /// elapsed time (minor reordering, permitted); a per-stream result
    /// regressing by more than half a second is reported as an anomaly
    /// but still returned.
    pub fn real_time(&mut self, timestamp: u32, stream_id: Option<u8>) -> f64 {
        let Some(s) = self.synced.as_ref() else {
            warn!(timestamp, "timestamp conversion before first sync");
            return 0.0;
        };

        let last = s.last_sync_timestamp as i64;
        let t = timestamp as i64;
        let half = (MAX_TICK / 2) as i64;

        let elapsed: i64 = if t >= last && t - last < half {
            // at or after the last sync, no rollover
            t - last
        } else if last - t > half {
            // new data, counter rolled over since the last sync
            t + (MAX_TICK as i64 - last)
        } else if t < last {
            // slightly old, signals minor reordering
            t - last
        } else if t - last > half {
            // appears ahead of the last sync by more than half the
            // range: actually pre-rollover old data
            warn!(last, t, "timestamp from before rollover");
            t - MAX_TICK as i64 - last
        } else {
            error!("no rollover case matched for timestamp {}", timestamp);
            0
        };

        let real = (s.ticks + elapsed) as f64 / CLOCK_HZ as f64;

        let entry = self.streams.entry(stream_id).or_default();
        if entry.last_real_time > real + 0.5 {
            warn!(
                "{}",
                ProtocolError::ClockAnomaly(format!(
                    "stream {:?} went back in time: {} -> {} ticks, {:.3}s",
                    stream_id,
                    entry.last_timestamp,
                    timestamp,
                    entry.last_real_time - real
                ))
            );
        }
        entry.last_real_time = real;
        entry.last_timestamp = timestamp;

        real
    }
}
