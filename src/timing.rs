//! Per-second throughput and PTS timeline tracking.
//!
//! The meter is driven by packet timestamps rather than a wall clock, so a
//! replayed capture reports the same intervals as the live stream did.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::suspicion::WRAP_GUARD;

const ONE_SECOND: Duration = Duration::from_secs(1);

/// Numbers for one completed one-second interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntervalReport {
    /// Start of the interval on the capture clock
    pub start: Duration,
    /// Frames closed in the interval
    pub frames: u64,
    /// Payload bytes received in the interval
    pub bytes: u64,
    /// Running average fps over all intervals so far
    pub avg_fps: f64,
    /// Frames short of the configured rate
    pub dropped: u64,
}

impl IntervalReport {
    /// Frames per second for this interval.
    pub fn fps(&self) -> u64 {
        self.frames
    }

    /// Bytes per second for this interval.
    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes
    }
}

/// One-second fps and throughput window.
#[derive(Debug, Clone, Default)]
pub struct ThroughputMeter {
    interval_start: Option<Duration>,
    interval_frames: u64,
    interval_bytes: u64,
    intervals: u64,
    avg_fps: f64,
    last_report: Option<IntervalReport>,
}

impl ThroughputMeter {
    /// Meter with no packets seen.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the window to `at`.
    ///
    /// The first call only anchors the clock. Afterwards every full second
    /// since the interval start produces a report: the accumulated interval
    /// first, then one zero-frame report per missed second.
    pub fn tick(&mut self, at: Duration, expected_fps: u32) -> Vec<IntervalReport> {
        let Some(mut start) = self.interval_start else {
            self.interval_start = Some(at);
            return Vec::new();
        };

        let passed = at.saturating_sub(start).as_secs();
        let mut reports = Vec::new();
        for i in 0..passed {
            let (frames, bytes) = if i == 0 {
                (self.interval_frames, self.interval_bytes)
            } else {
                (0, 0)
            };
            reports.push(self.report(start, frames, bytes, expected_fps));
            start += ONE_SECOND;
        }

        if passed > 0 {
            self.interval_start = Some(start);
            self.interval_frames = 0;
            self.interval_bytes = 0;
            if passed > 1 {
                log::debug!("Backfilled {} idle seconds", passed - 1);
            }
        }
        reports
    }

    fn report(&mut self, start: Duration, frames: u64, bytes: u64, expected_fps: u32) -> IntervalReport {
        let n = self.intervals as f64;
        self.avg_fps = (self.avg_fps * n + frames as f64) / (n + 1.0);
        self.intervals += 1;

        let report = IntervalReport {
            start,
            frames,
            bytes,
            avg_fps: self.avg_fps,
            dropped: u64::from(expected_fps).saturating_sub(frames),
        };
        log::trace!(
            "Interval at {:?}: {} fps, {} B/s, avg {:.2}",
            start,
            frames,
            bytes,
            self.avg_fps
        );
        self.last_report = Some(report);
        report
    }

    /// Count payload bytes in the current interval.
    pub fn record_bytes(&mut self, bytes: usize) {
        self.interval_bytes += bytes as u64;
    }

    /// Count a closed frame in the current interval.
    pub fn record_frame(&mut self) {
        self.interval_frames += 1;
    }

    /// Running average fps.
    pub fn avg_fps(&self) -> f64 {
        self.avg_fps
    }

    /// Completed intervals, backfilled ones included.
    pub fn intervals(&self) -> u64 {
        self.intervals
    }

    /// Most recent completed interval.
    pub fn last_report(&self) -> Option<IntervalReport> {
        self.last_report
    }
}

/// Converts device PTS values to a continuous millisecond timeline.
///
/// Each 32-bit wraparound adds one full counter period to later values.
#[derive(Debug, Clone, Default)]
pub struct PtsTimeline {
    prev_pts: u32,
    offset_ms: f64,
    wraps: u32,
    last_ms: Option<f64>,
}

impl PtsTimeline {
    /// Empty timeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a PTS sample, returning its position in milliseconds.
    ///
    /// Returns `None` for a zero PTS or a clock slower than 1 kHz.
    pub fn observe(&mut self, pts: u32, clock_frequency: u32) -> Option<f64> {
        if pts == 0 {
            return None;
        }
        let ticks_per_ms = clock_frequency / 1000;
        if ticks_per_ms == 0 {
            return None;
        }
        let ticks_per_ms = f64::from(ticks_per_ms);

        if self.prev_pts != 0 && pts < self.prev_pts && self.prev_pts - pts >= WRAP_GUARD {
            self.offset_ms += f64::from(u32::MAX) / ticks_per_ms;
            self.wraps += 1;
            log::debug!("PTS wrapped: 0x{:08x} -> 0x{:08x}", self.prev_pts, pts);
        }
        self.prev_pts = pts;

        let ms = f64::from(pts) / ticks_per_ms + self.offset_ms;
        self.last_ms = Some(ms);
        Some(ms)
    }

    /// Wraparounds seen.
    pub fn wraps(&self) -> u32 {
        self.wraps
    }

    /// Latest position in milliseconds.
    pub fn last_ms(&self) -> Option<f64> {
        self.last_ms
    }
}
