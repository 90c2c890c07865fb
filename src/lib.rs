//! `uvc-inspector` - UVC payload stream checker
//!
//! Parses and validates UVC payload headers, assembles payloads into frames,
//! flags suspicious frames and keeps per-interval statistics. Packets arrive
//! from a live source, a recorded capture or a tshark dump and are checked on
//! a dedicated worker thread.

pub mod capture;
pub mod checker;
pub mod config;
pub mod error;
pub mod frame;
pub mod frame_assembler;
pub mod frame_log;
pub mod header;
pub mod pipeline;
pub mod replay;
pub mod sink;
pub mod stats;
pub mod suspicion;
pub mod test_utils;
pub mod timing;
pub mod tshark;
pub mod validator;

pub use checker::{CheckerOptions, PacketChecker};
pub use config::{CaptureFlags, FrameFormat, SharedConfig, StreamConfig};
pub use error::{FrameError, FrameSuspicious, UvcError};
pub use frame::{FrameImage, FrameRecord};
pub use header::PayloadHeader;
pub use pipeline::{Packet, PacketSender, Pipeline, PipelineHandle};
pub use sink::FrameSink;
pub use stats::{Statistics, StatsSnapshot};

/// Initialize logging from `RUST_LOG`, defaulting to `info`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
