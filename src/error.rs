//! Classification taxonomy for payloads and frames
//!
//! These are plain data, not `std::error::Error` types: every packet and
//! every frame ends up with exactly one value from each relevant enum, and
//! the statistics tables are keyed by them. Operational failures (I/O,
//! locking, shutdown) live in the per-module error types instead.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Verdict for a single UVC payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UvcError {
    /// Header is well formed and consistent with the previous one
    #[default]
    NoError,
    /// Buffer too small to carry a header
    Empty,
    /// Buffer larger than the negotiated max payload transfer size
    PayloadOverflow,
    /// Device flagged the payload with the ERR bit
    ErrBitSet,
    /// HLE outside 2..=12
    LengthOutOfRange,
    /// HLE does not match the PTS/SCR flags
    LengthInvalid,
    /// Reserved bit set on a non-final payload
    ReservedBitSet,
    /// FID did not toggle after an EOF
    FidMismatch,
    /// Same FID and PTS as a payload that already ended its frame
    Swap,
    /// FID toggled without an EOF on the previous payload
    MissingEof,
    /// Catch-all, never produced
    Unknown,
}

impl UvcError {
    /// Every variant, in table order.
    pub const ALL: [UvcError; 11] = [
        UvcError::NoError,
        UvcError::Empty,
        UvcError::PayloadOverflow,
        UvcError::ErrBitSet,
        UvcError::LengthOutOfRange,
        UvcError::LengthInvalid,
        UvcError::ReservedBitSet,
        UvcError::FidMismatch,
        UvcError::Swap,
        UvcError::MissingEof,
        UvcError::Unknown,
    ];

    /// Soft errors still let the payload into a frame.
    pub fn is_soft(self) -> bool {
        matches!(self, UvcError::MissingEof | UvcError::FidMismatch)
    }

    /// Payload is accepted into a frame (clean or soft error).
    pub fn is_accepted(self) -> bool {
        self == UvcError::NoError || self.is_soft()
    }

    /// Payload is rejected and counted against the open frame.
    pub fn is_hard(self) -> bool {
        !self.is_accepted()
    }

    /// Stable snake_case name.
    pub fn as_str(self) -> &'static str {
        match self {
            UvcError::NoError => "no_error",
            UvcError::Empty => "empty",
            UvcError::PayloadOverflow => "payload_overflow",
            UvcError::ErrBitSet => "err_bit_set",
            UvcError::LengthOutOfRange => "length_out_of_range",
            UvcError::LengthInvalid => "length_invalid",
            UvcError::ReservedBitSet => "reserved_bit_set",
            UvcError::FidMismatch => "fid_mismatch",
            UvcError::Swap => "swap",
            UvcError::MissingEof => "missing_eof",
            UvcError::Unknown => "unknown",
        }
    }

    /// One-line explanation for reports.
    pub fn description(self) -> &'static str {
        match self {
            UvcError::NoError => "payload header is valid",
            UvcError::Empty => "payload is empty or too short for a header",
            UvcError::PayloadOverflow => "payload exceeds the max payload transfer size",
            UvcError::ErrBitSet => "device set the error bit",
            UvcError::LengthOutOfRange => "header length outside 2..=12",
            UvcError::LengthInvalid => "header length does not match PTS/SCR flags",
            UvcError::ReservedBitSet => "reserved bit set before end of frame",
            UvcError::FidMismatch => "frame identifier did not toggle after end of frame",
            UvcError::Swap => "payload repeats the previous frame's FID and PTS",
            UvcError::MissingEof => "frame identifier toggled without end of frame",
            UvcError::Unknown => "unclassified payload error",
        }
    }
}

impl fmt::Display for UvcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of an assembled frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameError {
    /// Frame closed cleanly
    #[default]
    NoError,
    /// Frames missing from the expected rate (counted per second, not per frame)
    Drop,
    /// At least one payload of the frame was rejected
    Error,
    /// Accumulated payload bytes exceed the max video frame size
    MaxFrameOverflow,
    /// Uncompressed YUYV frame does not total width*height*2 bytes
    InvalidYuyvRawSize,
    /// Frame was force-closed because the next frame started without EOF
    MissingEof,
    /// Frame was opened by a payload whose FID failed to toggle
    FidMismatch,
    /// Catch-all, never produced
    Unknown,
}

impl FrameError {
    /// Every variant, in table order.
    pub const ALL: [FrameError; 8] = [
        FrameError::NoError,
        FrameError::Drop,
        FrameError::Error,
        FrameError::MaxFrameOverflow,
        FrameError::InvalidYuyvRawSize,
        FrameError::MissingEof,
        FrameError::FidMismatch,
        FrameError::Unknown,
    ];

    /// Anything other than [`FrameError::NoError`].
    pub fn is_error(self) -> bool {
        self != FrameError::NoError
    }

    /// Stable snake_case name.
    pub fn as_str(self) -> &'static str {
        match self {
            FrameError::NoError => "no_error",
            FrameError::Drop => "drop",
            FrameError::Error => "error",
            FrameError::MaxFrameOverflow => "max_frame_overflow",
            FrameError::InvalidYuyvRawSize => "invalid_yuyv_raw_size",
            FrameError::MissingEof => "missing_eof",
            FrameError::FidMismatch => "fid_mismatch",
            FrameError::Unknown => "unknown",
        }
    }

    /// One-line explanation for reports.
    pub fn description(self) -> &'static str {
        match self {
            FrameError::NoError => "frame is valid",
            FrameError::Drop => "frame missing from the expected frame rate",
            FrameError::Error => "frame contains rejected payloads",
            FrameError::MaxFrameOverflow => "frame exceeds the max video frame size",
            FrameError::InvalidYuyvRawSize => "YUYV frame size differs from width*height*2",
            FrameError::MissingEof => "frame ended without an end of frame bit",
            FrameError::FidMismatch => "frame started with a non-toggled frame identifier",
            FrameError::Unknown => "unclassified frame error",
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heuristic verdict for a frame that has no hard error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameSuspicious {
    /// Checked and clean
    #[default]
    None,
    /// Payload arrival times do not fit the frame interval
    PayloadTimeInconsistent,
    /// Frame is much smaller than recent frames
    FrameSizeInconsistent,
    /// Frame has fewer payloads than recent frames
    PayloadCountInconsistent,
    /// PTS went backwards
    PtsDecrease,
    /// SCR source time clock went backwards
    StcDecrease,
    /// Compressed frame is implausibly small for the resolution
    Overcompressed,
    /// Frame carries a hard error, suspicion is not reported separately
    ErrorChecked,
    /// Catch-all, never produced
    Unknown,
    /// Heuristics are disabled
    Unchecked,
}

impl FrameSuspicious {
    /// Every variant, in table order.
    pub const ALL: [FrameSuspicious; 10] = [
        FrameSuspicious::None,
        FrameSuspicious::PayloadTimeInconsistent,
        FrameSuspicious::FrameSizeInconsistent,
        FrameSuspicious::PayloadCountInconsistent,
        FrameSuspicious::PtsDecrease,
        FrameSuspicious::StcDecrease,
        FrameSuspicious::Overcompressed,
        FrameSuspicious::ErrorChecked,
        FrameSuspicious::Unknown,
        FrameSuspicious::Unchecked,
    ];

    /// A heuristic actually fired.
    pub fn is_suspicious(self) -> bool {
        !matches!(
            self,
            FrameSuspicious::None | FrameSuspicious::Unchecked | FrameSuspicious::ErrorChecked
        )
    }

    /// Stable snake_case name.
    pub fn as_str(self) -> &'static str {
        match self {
            FrameSuspicious::None => "none",
            FrameSuspicious::PayloadTimeInconsistent => "payload_time_inconsistent",
            FrameSuspicious::FrameSizeInconsistent => "frame_size_inconsistent",
            FrameSuspicious::PayloadCountInconsistent => "payload_count_inconsistent",
            FrameSuspicious::PtsDecrease => "pts_decrease",
            FrameSuspicious::StcDecrease => "stc_decrease",
            FrameSuspicious::Overcompressed => "overcompressed",
            FrameSuspicious::ErrorChecked => "error_checked",
            FrameSuspicious::Unknown => "unknown",
            FrameSuspicious::Unchecked => "unchecked",
        }
    }

    /// One-line explanation for reports.
    pub fn description(self) -> &'static str {
        match self {
            FrameSuspicious::None => "no suspicious pattern detected",
            FrameSuspicious::PayloadTimeInconsistent => "payload timing inconsistent",
            FrameSuspicious::FrameSizeInconsistent => "frame size well below recent average",
            FrameSuspicious::PayloadCountInconsistent => "payload count below recent average",
            FrameSuspicious::PtsDecrease => "presentation time stamp decreased",
            FrameSuspicious::StcDecrease => "source clock decreased",
            FrameSuspicious::Overcompressed => "frame smaller than 5% of raw size",
            FrameSuspicious::ErrorChecked => "frame already has an error",
            FrameSuspicious::Unknown => "unclassified suspicion",
            FrameSuspicious::Unchecked => "heuristics disabled",
        }
    }
}

impl fmt::Display for FrameSuspicious {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
