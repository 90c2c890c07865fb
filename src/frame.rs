//! Frame state and the records emitted when a frame closes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{FrameFormat, StreamConfig};
use crate::error::{FrameError, FrameSuspicious, UvcError};
use crate::header::PayloadHeader;

/// Whether a received-time entry belongs to an accepted or a rejected payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeTag {
    /// Payload accepted into the frame
    Valid,
    /// Payload rejected or accepted with a frame error
    Error,
}

/// Arrival time of one payload, as an offset on the capture clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedTime {
    /// Offset from the start of the capture
    pub at: Duration,
    /// Valid or error
    pub tag: TimeTag,
}

/// A payload that was rejected while the frame was open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LostPayload {
    /// Why it was rejected
    pub error: UvcError,
    /// Full buffer size in bytes, header included
    pub size: usize,
    /// Arrival time
    pub at: Duration,
}

/// How a frame was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Closure {
    /// EOF bit observed on the last payload
    EofObserved,
    /// Next frame started before EOF arrived
    ForcedMissingEof,
}

/// A frame being assembled from payloads.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic frame number, starting at 1
    pub frame_number: u64,
    /// FID of the payload that opened the frame
    pub toggle_bit: bool,
    /// Latest PTS that differed from the previous frame PTS
    pub frame_pts: u32,
    /// PTS tracked before `frame_pts`
    pub prev_frame_pts: u32,
    /// Headers of accepted payloads, in arrival order
    pub headers: Vec<PayloadHeader>,
    /// Bytes after the header for each accepted payload
    pub payload_sizes: Vec<usize>,
    /// Arrival times of accepted and rejected payloads
    pub received_times: Vec<ReceivedTime>,
    /// Rejected payloads
    pub lost: Vec<LostPayload>,
    /// Concatenated payload bytes without headers
    pub image_data: Vec<u8>,
    /// Frame status
    pub frame_error: FrameError,
    /// Heuristic status
    pub suspicious: FrameSuspicious,
    /// EOF observed
    pub eof_reached: bool,
    /// Format the frame was opened with
    pub format: FrameFormat,
    /// Width the frame was opened with
    pub width: u32,
    /// Height the frame was opened with
    pub height: u32,
    /// Running sum of `payload_sizes`
    accepted_bytes: usize,
}

impl Frame {
    /// Open a frame with the current stream geometry.
    pub fn new(frame_number: u64, toggle_bit: bool, config: &StreamConfig) -> Self {
        Self {
            frame_number,
            toggle_bit,
            frame_pts: 0,
            prev_frame_pts: 0,
            headers: Vec::new(),
            payload_sizes: Vec::new(),
            received_times: Vec::new(),
            lost: Vec::new(),
            image_data: Vec::new(),
            frame_error: FrameError::NoError,
            suspicious: FrameSuspicious::None,
            eof_reached: false,
            format: config.frame_format,
            width: config.width,
            height: config.height,
            accepted_bytes: 0,
        }
    }

    /// Append an accepted payload. `payload` is the full buffer including the header.
    pub fn add_payload(&mut self, header: PayloadHeader, payload: &[u8], at: Duration, tag: TimeTag) {
        let start = usize::from(header.hle).min(payload.len());
        self.headers.push(header);
        self.payload_sizes.push(payload.len() - start);
        self.accepted_bytes += payload.len() - start;
        self.image_data.extend_from_slice(&payload[start..]);
        self.received_times.push(ReceivedTime { at, tag });
    }

    /// Record a rejected payload against this frame.
    pub fn add_lost(&mut self, error: UvcError, size: usize, at: Duration) {
        self.lost.push(LostPayload { error, size, at });
        self.received_times.push(ReceivedTime {
            at,
            tag: TimeTag::Error,
        });
    }

    /// Accepted payload bytes, headers excluded.
    pub fn total_bytes(&self) -> usize {
        self.accepted_bytes
    }

    /// Bytes of rejected payloads.
    pub fn lost_bytes(&self) -> usize {
        self.lost.iter().map(|l| l.size).sum()
    }

    /// Accepted plus rejected payloads.
    pub fn payload_count(&self) -> usize {
        self.headers.len() + self.lost.len()
    }

    /// Source clock values of payloads that carried an SCR.
    pub fn stc_values(&self) -> Vec<u32> {
        self.headers
            .iter()
            .filter(|h| h.has_scr() && h.scr != 0)
            .map(PayloadHeader::stc)
            .collect()
    }

    /// Summary for presentation and persistence.
    pub fn to_record(&self, closure: Closure) -> FrameRecord {
        let first = self.received_times.first().map(|t| t.at);
        let last = self.received_times.last().map(|t| t.at);
        FrameRecord {
            frame_number: self.frame_number,
            toggle_bit: self.toggle_bit,
            closure,
            frame_error: self.frame_error,
            suspicious: self.suspicious,
            eof_reached: self.eof_reached,
            format: self.format,
            payload_count: self.payload_count(),
            accepted_payloads: self.headers.len(),
            total_bytes: self.total_bytes(),
            lost_bytes: self.lost_bytes(),
            lost_payloads: self.lost.clone(),
            frame_pts: self.frame_pts,
            prev_frame_pts: self.prev_frame_pts,
            first_received: first,
            last_received: last,
            received_times: self.received_times.clone(),
            payload_sizes: self.payload_sizes.clone(),
            stc_values: self.stc_values(),
        }
    }
}

/// Per-frame summary emitted on closure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    /// Frame number
    pub frame_number: u64,
    /// FID of the frame
    pub toggle_bit: bool,
    /// How the frame was closed
    pub closure: Closure,
    /// Final frame status
    pub frame_error: FrameError,
    /// Final heuristic status
    pub suspicious: FrameSuspicious,
    /// EOF observed
    pub eof_reached: bool,
    /// Stream format at open
    pub format: FrameFormat,
    /// Accepted plus rejected payloads
    pub payload_count: usize,
    /// Accepted payloads only
    pub accepted_payloads: usize,
    /// Accepted bytes, headers excluded
    pub total_bytes: usize,
    /// Bytes of rejected payloads
    pub lost_bytes: usize,
    /// Rejected payload ledger
    pub lost_payloads: Vec<LostPayload>,
    /// Frame PTS
    pub frame_pts: u32,
    /// Previous frame PTS
    pub prev_frame_pts: u32,
    /// First payload arrival
    pub first_received: Option<Duration>,
    /// Last payload arrival
    pub last_received: Option<Duration>,
    /// Every payload arrival
    pub received_times: Vec<ReceivedTime>,
    /// Accepted payload sizes
    pub payload_sizes: Vec<usize>,
    /// SCR source clock values
    pub stc_values: Vec<u32>,
}

impl FrameRecord {
    /// Time between first and last payload.
    pub fn duration(&self) -> Duration {
        match (self.first_received, self.last_received) {
            (Some(first), Some(last)) => last.saturating_sub(first),
            _ => Duration::ZERO,
        }
    }
}

/// Raw frame bytes handed to the presentation side for decode/display.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameImage {
    /// Frame number
    pub frame_number: u64,
    /// Payload format
    pub format: FrameFormat,
    /// Width at open
    pub width: u32,
    /// Height at open
    pub height: u32,
    /// Frame status
    pub frame_error: FrameError,
    /// Heuristic status
    pub suspicious: FrameSuspicious,
    /// Concatenated payload bytes
    pub data: Vec<u8>,
}
