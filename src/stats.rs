//! Tallies of payload verdicts, frame errors and frame suspicion.
//!
//! Each table has one counter per enum variant, so every classification the
//! checker can produce has a slot and nothing is ever dropped on the floor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{FrameError, FrameSuspicious, UvcError};
use crate::timing::{IntervalReport, ThroughputMeter};

fn percentage(count: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 * 100.0 / total as f64
    }
}

/// Count per payload verdict.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadErrorStats {
    counts: [u64; UvcError::ALL.len()],
}

impl PayloadErrorStats {
    /// Count one payload.
    pub fn record(&mut self, verdict: UvcError) {
        self.counts[verdict as usize] += 1;
    }

    /// Payloads with this verdict.
    pub fn count(&self, verdict: UvcError) -> u64 {
        self.counts[verdict as usize]
    }

    /// All payloads seen.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Share of payloads with this verdict, 0 to 100.
    pub fn percentage(&self, verdict: UvcError) -> f64 {
        percentage(self.count(verdict), self.total())
    }

    /// Payloads not accepted into a frame.
    pub fn rejected(&self) -> u64 {
        UvcError::ALL
            .iter()
            .filter(|v| !v.is_accepted())
            .map(|v| self.count(*v))
            .sum()
    }
}

/// Count per frame outcome, plus frames inferred as dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameErrorStats {
    counts: [u64; FrameError::ALL.len()],
}

impl FrameErrorStats {
    /// Count one closed frame.
    pub fn record(&mut self, error: FrameError) {
        self.counts[error as usize] += 1;
    }

    /// Add frames missing from an interval.
    pub fn record_drops(&mut self, dropped: u64) {
        self.counts[FrameError::Drop as usize] += dropped;
    }

    /// Frames with this outcome.
    pub fn count(&self, error: FrameError) -> u64 {
        self.counts[error as usize]
    }

    /// Closed plus dropped frames.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Frames actually closed by the assembler.
    pub fn closed_frames(&self) -> u64 {
        self.total() - self.count(FrameError::Drop)
    }

    /// Share of frames with this outcome, 0 to 100.
    pub fn percentage(&self, error: FrameError) -> f64 {
        percentage(self.count(error), self.total())
    }
}

/// Count per frame suspicion status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuspiciousStats {
    counts: [u64; FrameSuspicious::ALL.len()],
}

impl SuspiciousStats {
    /// Count one closed frame.
    pub fn record(&mut self, suspicious: FrameSuspicious) {
        self.counts[suspicious as usize] += 1;
    }

    /// Frames with this status.
    pub fn count(&self, suspicious: FrameSuspicious) -> u64 {
        self.counts[suspicious as usize]
    }

    /// All closed frames.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Share of frames with this status, 0 to 100.
    pub fn percentage(&self, suspicious: FrameSuspicious) -> f64 {
        percentage(self.count(suspicious), self.total())
    }
}

/// All statistics owned by the checker.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    /// Payload verdicts
    pub payload: PayloadErrorStats,
    /// Frame outcomes
    pub frame: FrameErrorStats,
    /// Frame suspicion
    pub suspicious: SuspiciousStats,
    /// Per-second window
    pub meter: ThroughputMeter,
}

impl Statistics {
    /// Empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an interval report into the frame tally.
    pub fn apply_interval(&mut self, report: &IntervalReport) {
        self.frame.record_drops(report.dropped);
    }

    /// Serializable copy of the current state.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            payload_errors: UvcError::ALL
                .iter()
                .map(|v| (v.as_str().to_string(), self.payload.count(*v)))
                .collect(),
            frame_errors: FrameError::ALL
                .iter()
                .map(|v| (v.as_str().to_string(), self.frame.count(*v)))
                .collect(),
            frame_suspicious: FrameSuspicious::ALL
                .iter()
                .map(|v| (v.as_str().to_string(), self.suspicious.count(*v)))
                .collect(),
            total_payloads: self.payload.total(),
            total_frames: self.frame.closed_frames(),
            dropped_frames: self.frame.count(FrameError::Drop),
            interval: self.meter.last_report(),
            avg_fps: self.meter.avg_fps(),
        }
    }
}

/// Point-in-time view of the statistics, emitted on each tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Payload verdict counts keyed by snake_case name
    pub payload_errors: BTreeMap<String, u64>,
    /// Frame outcome counts keyed by snake_case name
    pub frame_errors: BTreeMap<String, u64>,
    /// Frame suspicion counts keyed by snake_case name
    pub frame_suspicious: BTreeMap<String, u64>,
    /// Payloads seen
    pub total_payloads: u64,
    /// Frames closed
    pub total_frames: u64,
    /// Frames inferred as dropped
    pub dropped_frames: u64,
    /// Last completed interval
    pub interval: Option<IntervalReport>,
    /// Running average fps
    pub avg_fps: f64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (fps, bps) = self
            .interval
            .map(|r| (r.fps(), r.bytes_per_sec()))
            .unwrap_or_default();
        write!(
            f,
            "payloads={} frames={} dropped={} fps={} avg_fps={:.2} throughput={} B/s",
            self.total_payloads, self.total_frames, self.dropped_frames, fps, self.avg_fps, bps
        )?;
        for (name, count) in self.payload_errors.iter().filter(|(_, c)| **c > 0) {
            write!(f, " {}={}", name, count)?;
        }
        Ok(())
    }
}
