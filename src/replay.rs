//! Capture file replay into the packet pipeline.
//!
//! Replays a capture written by [`crate::capture`] with its recorded packet
//! timing (optionally scaled), so offline analysis sees the same intervals
//! the live checker would have.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::path::Path;
//! use uvc_inspector::replay::{PacketReplay, ReplayConfig};
//!
//! let mut replay = PacketReplay::load(Path::new("capture_12345.bin"))?;
//! replay.set_config(ReplayConfig { speed: 2.0, ..Default::default() });
//! replay.start(handle.sender())?;
//! replay.wait()?;
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::capture::{read_capture, read_metadata, CaptureError, CaptureMetadata, CapturedPacket};
use crate::checker::PacketChecker;
use crate::config::StreamConfig;
use crate::pipeline::{PacketSender, PipelineError};
use crate::sink::FrameSink;

/// Sleep granularity while waiting for the next packet.
const SLEEP_CHUNK: Duration = Duration::from_millis(10);

/// Errors that can occur during packet replay operations.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// Capture file could not be read.
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// Replay is already running.
    #[error("replay is already running")]
    AlreadyRunning,

    /// Replay is not running.
    #[error("replay is not running")]
    NotRunning,

    /// The replay thread could not be started or panicked.
    #[error("replay thread failed: {0}")]
    Thread(String),
}

/// Result type alias for replay operations.
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Configuration for packet replay.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayConfig {
    /// Playback speed multiplier (1.0 = realtime, 2.0 = 2x speed, 0.0 = as fast as possible).
    pub speed: f64,
    /// Whether to loop the replay when reaching the end.
    pub loop_playback: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            loop_playback: false,
        }
    }
}

/// Outcome of a finished replay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Packets accepted by the pipeline
    pub sent: u64,
    /// Packets refused by a full queue
    pub refused: u64,
    /// Playback ended early on a stop request or a stopped pipeline
    pub interrupted: bool,
}

/// Replays captured packets.
pub struct PacketReplay {
    packets: Arc<Vec<CapturedPacket>>,
    metadata: Option<CaptureMetadata>,
    config: ReplayConfig,
    thread_handle: Option<JoinHandle<ReplaySummary>>,
    stop_flag: Arc<AtomicBool>,
}

impl PacketReplay {
    /// Load a capture file and its companion `.json` metadata, if present.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::Capture` if the capture file cannot be read.
    pub fn load(path: &Path) -> Result<Self> {
        let packets = read_capture(path)?;
        let metadata = Self::try_load_metadata(path);

        log::info!("Loaded {} packets from {}", packets.len(), path.display());
        if let Some(ref meta) = metadata {
            log::info!(
                "Metadata: {}x{} {} @ {} fps, {} packets, {} ms",
                meta.stream.width,
                meta.stream.height,
                meta.stream.frame_format,
                meta.stream.fps,
                meta.total_packets,
                meta.duration_ms
            );
        }

        Ok(Self::from_packets(packets, metadata))
    }

    /// Replay packets already in memory.
    pub fn from_packets(packets: Vec<CapturedPacket>, metadata: Option<CaptureMetadata>) -> Self {
        Self {
            packets: Arc::new(packets),
            metadata,
            config: ReplayConfig::default(),
            thread_handle: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    fn try_load_metadata(path: &Path) -> Option<CaptureMetadata> {
        let json_path = path.with_extension("json");
        if !json_path.exists() {
            return None;
        }
        match read_metadata(&json_path) {
            Ok(meta) => Some(meta),
            Err(e) => {
                log::warn!("Ignoring unreadable metadata {}: {}", json_path.display(), e);
                None
            }
        }
    }

    /// Metadata loaded with the capture.
    #[must_use]
    pub fn metadata(&self) -> Option<&CaptureMetadata> {
        self.metadata.as_ref()
    }

    /// Stream configuration recorded with the capture.
    #[must_use]
    pub fn stream_config(&self) -> Option<StreamConfig> {
        self.metadata.as_ref().map(|m| m.stream.clone())
    }

    /// Number of loaded packets.
    #[must_use]
    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    /// Timestamp of the last packet in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        self.packets.last().map(|p| p.timestamp_us / 1000).unwrap_or(0)
    }

    /// Set the replay configuration.
    pub fn set_config(&mut self, config: ReplayConfig) {
        self.config = config;
    }

    /// Whether a background replay is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }

    /// Replay into `sender` on a background thread.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::AlreadyRunning` if a replay is in progress.
    pub fn start(&mut self, sender: PacketSender) -> Result<()> {
        if self.is_running() {
            return Err(ReplayError::AlreadyRunning);
        }
        self.stop_flag.store(false, Ordering::Release);

        let packets = Arc::clone(&self.packets);
        let config = self.config.clone();
        let stop_flag = Arc::clone(&self.stop_flag);

        let handle = thread::Builder::new()
            .name("uvc-replay".to_string())
            .spawn(move || replay_thread(&packets, &config, &sender, &stop_flag))
            .map_err(|e| ReplayError::Thread(e.to_string()))?;

        self.thread_handle = Some(handle);
        log::info!("Packet replay started");
        Ok(())
    }

    /// Ask the replay thread to stop and wait for it.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::NotRunning` if replay is not in progress.
    pub fn stop(&mut self) -> Result<ReplaySummary> {
        self.stop_flag.store(true, Ordering::Release);
        let summary = self.wait()?;
        log::info!("Packet replay stopped");
        Ok(summary)
    }

    /// Wait for the replay thread to finish on its own.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::NotRunning` if replay is not in progress and
    /// `ReplayError::Thread` if the thread panicked.
    pub fn wait(&mut self) -> Result<ReplaySummary> {
        let handle = self.thread_handle.take().ok_or(ReplayError::NotRunning)?;
        handle
            .join()
            .map_err(|_| ReplayError::Thread("replay thread panicked".to_string()))
    }

    /// Handle for stopping the replay from another thread.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_flag)
    }

    /// Feed every packet straight into `checker` on the calling thread,
    /// without timing. Returns the number of packets checked.
    pub fn replay_into<S: FrameSink>(&self, checker: &mut PacketChecker<S>, config: &StreamConfig) -> usize {
        for packet in self.packets.iter() {
            checker.check_packet(&packet.data, packet.received_at(), config);
        }
        self.packets.len()
    }
}

impl Drop for PacketReplay {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

/// Wall-clock offset at which a packet recorded at `at` is due.
///
/// `None` means send without waiting: a non-positive speed, or a speed so
/// small the offset does not fit in a `Duration`.
fn scaled_offset(at: Duration, speed: f64) -> Option<Duration> {
    if speed <= 0.0 || speed.is_nan() {
        return None;
    }
    Duration::try_from_secs_f64(at.as_secs_f64() / speed).ok()
}

/// Sleep until `deadline`, waking every [`SLEEP_CHUNK`] to check `stop_flag`.
///
/// Returns `false` if a stop was requested.
fn sleep_until(deadline: Instant, stop_flag: &AtomicBool) -> bool {
    loop {
        if stop_flag.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(SLEEP_CHUNK));
    }
}

fn replay_thread(
    packets: &[CapturedPacket],
    config: &ReplayConfig,
    sender: &PacketSender,
    stop_flag: &AtomicBool,
) -> ReplaySummary {
    let mut summary = ReplaySummary::default();
    let span = packets
        .last()
        .map(|p| p.received_at() + Duration::from_millis(1))
        .unwrap_or_default();
    let mut loop_offset = Duration::ZERO;

    loop {
        let replay_start = Instant::now();

        for packet in packets {
            let deadline = scaled_offset(packet.received_at(), config.speed)
                .and_then(|offset| replay_start.checked_add(offset));
            if let Some(deadline) = deadline {
                if !sleep_until(deadline, stop_flag) {
                    log::debug!("Replay thread received stop signal");
                    summary.interrupted = true;
                    return summary;
                }
            } else if stop_flag.load(Ordering::Acquire) {
                summary.interrupted = true;
                return summary;
            }

            match sender.push(packet.data.clone(), loop_offset + packet.received_at()) {
                Ok(()) => summary.sent += 1,
                Err(PipelineError::QueueFull) => summary.refused += 1,
                Err(e) => {
                    log::debug!("Pipeline closed, stopping replay: {}", e);
                    summary.interrupted = true;
                    return summary;
                }
            }
        }

        if config.loop_playback && !packets.is_empty() {
            log::debug!("Replay loop completed, restarting");
            loop_offset += span;
        } else {
            log::debug!("Replay completed: {} packets sent", summary.sent);
            return summary;
        }
    }
}
