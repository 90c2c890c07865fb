//! Packet capture files for offline analysis and replay.
//!
//! A capture is recorded from acquisition callbacks and saved as two files:
//! - `capture_<timestamp>.bin`: the packet records
//! - `capture_<timestamp>.json`: [`CaptureMetadata`], including the stream
//!   configuration that was active when the capture stopped
//!
//! # File Format
//!
//! ```text
//! [u64 LE: timestamp_us][u32 LE: length][u8: endpoint][data bytes]...
//! ```
//!
//! Timestamps are microseconds since capture start.
//!
//! # Example
//!
//! ```ignore
//! let recorder = CaptureRecorder::new();
//! recorder.start(CaptureMetadata::for_stream(config.snapshot()))?;
//!
//! // In the acquisition callback:
//! recorder.record_packet(&data, endpoint);
//!
//! // When done:
//! let result = recorder.stop(Path::new("/output"))?;
//! ```

use serde::{Deserialize, Serialize};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::StreamConfig;

/// Largest packet accepted when reading a capture file.
pub const MAX_RECORD_LEN: usize = 1024 * 1024;

/// Size of the fixed record header.
const RECORD_HEADER_LEN: u64 = 8 + 4 + 1;

/// Errors that can occur during packet capture operations.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Capture is not currently active when trying to stop.
    #[error("capture is not active")]
    NotActive,

    /// Capture is already active when trying to start.
    #[error("capture is already active")]
    AlreadyActive,

    /// Failed to acquire lock on internal state.
    #[error("failed to acquire lock: {0}")]
    LockError(String),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Output directory does not exist.
    #[error("output directory does not exist: {0}")]
    DirectoryNotFound(String),

    /// Corrupted record in a capture file.
    #[error("invalid record at offset {offset}: {message}")]
    InvalidRecord {
        /// Byte offset of the record.
        offset: u64,
        /// Description of the error.
        message: String,
    },
}

/// Result type alias for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Metadata about the capture session and stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    /// Stream configuration for replay.
    #[serde(default)]
    pub stream: StreamConfig,
    /// Total number of packets captured.
    #[serde(default)]
    pub total_packets: u64,
    /// Total number of frames closed during capture.
    #[serde(default)]
    pub total_frames: u64,
    /// Capture duration in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Total bytes captured.
    #[serde(default)]
    pub total_bytes: u64,
    /// Optional description or notes about the capture.
    #[serde(default)]
    pub description: String,
}

impl CaptureMetadata {
    /// Metadata for a capture of `stream`.
    pub fn for_stream(stream: StreamConfig) -> Self {
        Self {
            stream,
            ..Default::default()
        }
    }
}

/// A single captured packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPacket {
    /// Timestamp relative to capture start (microseconds).
    pub timestamp_us: u64,
    /// Endpoint the packet arrived on.
    pub endpoint: u8,
    /// Raw packet data.
    pub data: Vec<u8>,
}

impl CapturedPacket {
    /// Capture-clock offset of the packet.
    pub fn received_at(&self) -> Duration {
        Duration::from_micros(self.timestamp_us)
    }
}

/// Paths and summary returned when a capture is saved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResult {
    /// Path to the saved packet file.
    pub packets_path: PathBuf,
    /// Path to the saved metadata file.
    pub metadata_path: PathBuf,
    /// Summary of the capture session.
    pub metadata: CaptureMetadata,
}

/// Thread-safe recorder for incoming packets.
///
/// The packet counters are atomics so the acquisition callback only takes
/// the packet lock when a capture is running.
pub struct CaptureRecorder {
    is_capturing: AtomicBool,
    packets: Mutex<Vec<CapturedPacket>>,
    start_time: Mutex<Option<Instant>>,
    metadata: Mutex<CaptureMetadata>,
    packet_count: AtomicU64,
    byte_count: AtomicU64,
}

impl CaptureRecorder {
    /// Recorder with no active capture.
    #[must_use]
    pub fn new() -> Self {
        Self {
            is_capturing: AtomicBool::new(false),
            packets: Mutex::new(Vec::new()),
            start_time: Mutex::new(None),
            metadata: Mutex::new(CaptureMetadata::default()),
            packet_count: AtomicU64::new(0),
            byte_count: AtomicU64::new(0),
        }
    }

    /// Whether a capture is running.
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.is_capturing.load(Ordering::Acquire)
    }

    /// Packets recorded in the current capture.
    #[must_use]
    pub fn packet_count(&self) -> u64 {
        self.packet_count.load(Ordering::Relaxed)
    }

    /// Bytes recorded in the current capture.
    #[must_use]
    pub fn byte_count(&self) -> u64 {
        self.byte_count.load(Ordering::Relaxed)
    }

    /// Begin a capture.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::AlreadyActive` if a capture is running, or
    /// `CaptureError::LockError` if internal state is poisoned.
    pub fn start(&self, metadata: CaptureMetadata) -> Result<()> {
        if self
            .is_capturing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::AlreadyActive);
        }

        self.packets
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))?
            .clear();
        self.packet_count.store(0, Ordering::Release);
        self.byte_count.store(0, Ordering::Release);
        *self
            .start_time
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))? = Some(Instant::now());
        *self
            .metadata
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))? = metadata;

        log::info!("Packet capture started");
        Ok(())
    }

    /// Record a packet, stamped with the time since capture start.
    ///
    /// Ignored when no capture is running.
    pub fn record_packet(&self, data: &[u8], endpoint: u8) {
        if !self.is_capturing() {
            return;
        }
        let timestamp_us = self
            .start_time
            .lock()
            .ok()
            .and_then(|start| *start)
            .map(|s| s.elapsed().as_micros() as u64)
            .unwrap_or(0);
        self.record_packet_at(data, endpoint, timestamp_us);
    }

    /// Record a packet with an explicit timestamp.
    pub fn record_packet_at(&self, data: &[u8], endpoint: u8, timestamp_us: u64) {
        if !self.is_capturing() {
            return;
        }

        self.packet_count.fetch_add(1, Ordering::Relaxed);
        self.byte_count.fetch_add(data.len() as u64, Ordering::Relaxed);

        if let Ok(mut packets) = self.packets.lock() {
            packets.push(CapturedPacket {
                timestamp_us,
                endpoint,
                data: data.to_vec(),
            });
        } else {
            log::warn!("Failed to acquire lock for packet recording");
        }
    }

    /// Count a frame closed during the capture.
    pub fn record_frame(&self) {
        if !self.is_capturing() {
            return;
        }
        if let Ok(mut meta) = self.metadata.lock() {
            meta.total_frames += 1;
        }
    }

    /// Stop the capture and write both files into `output_dir`.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::NotActive` if no capture is running,
    /// `CaptureError::DirectoryNotFound` if `output_dir` is missing, and
    /// `CaptureError::Io`/`CaptureError::Json` if writing fails.
    pub fn stop(&self, output_dir: &Path) -> Result<CaptureResult> {
        if self
            .is_capturing
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::NotActive);
        }

        if !output_dir.is_dir() {
            return Err(CaptureError::DirectoryNotFound(
                output_dir.display().to_string(),
            ));
        }

        let start_time = *self
            .start_time
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))?;
        let duration_ms = start_time
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        let packets = std::mem::take(
            &mut *self
                .packets
                .lock()
                .map_err(|e| CaptureError::LockError(e.to_string()))?,
        );

        let metadata = {
            let mut meta = self
                .metadata
                .lock()
                .map_err(|e| CaptureError::LockError(e.to_string()))?;
            meta.duration_ms = duration_ms;
            meta.total_packets = packets.len() as u64;
            meta.total_bytes = packets.iter().map(|p| p.data.len() as u64).sum();
            meta.clone()
        };

        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let packets_path = output_dir.join(format!("capture_{}.bin", timestamp));
        let metadata_path = packets_path.with_extension("json");

        write_capture(&packets_path, &packets)?;
        write_metadata(&metadata_path, &metadata)?;

        log::info!(
            "Capture stopped: {} packets, {} bytes, {} ms",
            metadata.total_packets,
            metadata.total_bytes,
            duration_ms
        );

        Ok(CaptureResult {
            packets_path,
            metadata_path,
            metadata,
        })
    }

    /// Discard the current capture without saving.
    pub fn cancel(&self) {
        self.is_capturing.store(false, Ordering::Release);
        if let Ok(mut packets) = self.packets.lock() {
            packets.clear();
        }
        log::info!("Capture cancelled");
    }
}

impl Default for CaptureRecorder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// File I/O
// =============================================================================

/// Write packets in capture record format.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be written.
pub fn write_capture(path: &Path, packets: &[CapturedPacket]) -> Result<()> {
    let mut file = BufWriter::new(std::fs::File::create(path)?);
    for packet in packets {
        file.write_all(&packet.timestamp_us.to_le_bytes())?;
        file.write_all(&(packet.data.len() as u32).to_le_bytes())?;
        file.write_all(&[packet.endpoint])?;
        file.write_all(&packet.data)?;
    }
    file.flush()?;
    log::debug!("Saved {} packets to {}", packets.len(), path.display());
    Ok(())
}

/// Write capture metadata as pretty JSON.
///
/// # Errors
///
/// Returns `CaptureError::Json` or `CaptureError::Io` on failure.
pub fn write_metadata(path: &Path, metadata: &CaptureMetadata) -> Result<()> {
    let json = serde_json::to_string_pretty(metadata)?;
    std::fs::write(path, json)?;
    log::debug!("Saved metadata to {}", path.display());
    Ok(())
}

/// Read every record from a capture file.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be opened and
/// `CaptureError::InvalidRecord` for a truncated record or one longer than
/// [`MAX_RECORD_LEN`].
pub fn read_capture(path: &Path) -> Result<Vec<CapturedPacket>> {
    let mut file = BufReader::new(std::fs::File::open(path)?);
    let mut packets = Vec::new();
    let mut offset = 0u64;

    loop {
        let mut timestamp_bytes = [0u8; 8];
        match file.read_exact(&mut timestamp_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(CaptureError::Io(e)),
        }
        let timestamp_us = u64::from_le_bytes(timestamp_bytes);

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)
            .map_err(|_| CaptureError::InvalidRecord {
                offset,
                message: "unexpected EOF reading packet length".to_string(),
            })?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_RECORD_LEN {
            return Err(CaptureError::InvalidRecord {
                offset,
                message: format!("packet length {} exceeds 1MB limit", len),
            });
        }

        let mut endpoint = [0u8; 1];
        file.read_exact(&mut endpoint)
            .map_err(|_| CaptureError::InvalidRecord {
                offset,
                message: "unexpected EOF reading endpoint".to_string(),
            })?;

        let mut data = vec![0u8; len];
        file.read_exact(&mut data)
            .map_err(|_| CaptureError::InvalidRecord {
                offset,
                message: format!("unexpected EOF reading {} bytes of data", len),
            })?;

        packets.push(CapturedPacket {
            timestamp_us,
            endpoint: endpoint[0],
            data,
        });
        offset += RECORD_HEADER_LEN + len as u64;
    }

    Ok(packets)
}

/// Read capture metadata from a JSON file.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be read and
/// `CaptureError::Json` if it is not valid metadata.
pub fn read_metadata(path: &Path) -> Result<CaptureMetadata> {
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrameFormat;
    use std::sync::Arc;
    use std::thread;

    // ========================================================================
    // Recorder
    // ========================================================================

    #[test]
    fn test_recorder_new() {
        let recorder = CaptureRecorder::new();
        assert!(!recorder.is_capturing());
        assert_eq!(recorder.packet_count(), 0);
        assert_eq!(recorder.byte_count(), 0);
    }

    #[test]
    fn test_start_twice_fails() {
        let recorder = CaptureRecorder::new();
        recorder.start(CaptureMetadata::default()).unwrap();
        assert!(matches!(
            recorder.start(CaptureMetadata::default()),
            Err(CaptureError::AlreadyActive)
        ));
    }

    #[test]
    fn test_packets_ignored_when_idle() {
        let recorder = CaptureRecorder::new();
        recorder.record_packet(&[0x02, 0x80], 0x81);
        assert_eq!(recorder.packet_count(), 0);
    }

    #[test]
    fn test_stop_without_start() {
        let recorder = CaptureRecorder::new();
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(recorder.stop(dir.path()), Err(CaptureError::NotActive)));
    }

    #[test]
    fn test_stop_into_missing_directory() {
        let recorder = CaptureRecorder::new();
        recorder.start(CaptureMetadata::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            recorder.stop(&missing),
            Err(CaptureError::DirectoryNotFound(_))
        ));
    }

    #[test]
    fn test_cancel_allows_restart() {
        let recorder = CaptureRecorder::new();
        recorder.start(CaptureMetadata::default()).unwrap();
        recorder.record_packet(&[0x02, 0x80], 0x81);
        recorder.cancel();
        assert!(!recorder.is_capturing());
        recorder.start(CaptureMetadata::default()).unwrap();
        assert_eq!(recorder.packet_count(), 0);
    }

    #[test]
    fn test_concurrent_recording() {
        let recorder = Arc::new(CaptureRecorder::new());
        recorder.start(CaptureMetadata::default()).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let recorder = Arc::clone(&recorder);
                thread::spawn(move || {
                    for _ in 0..50 {
                        recorder.record_packet(&[i as u8; 10], 0x81);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(recorder.packet_count(), 400);
        assert_eq!(recorder.byte_count(), 4000);
    }

    #[test]
    fn test_full_capture_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = CaptureRecorder::new();
        let stream = StreamConfig {
            width: 640,
            height: 480,
            frame_format: FrameFormat::Yuyv,
            ..Default::default()
        };
        recorder.start(CaptureMetadata::for_stream(stream.clone())).unwrap();

        for i in 0..10u64 {
            recorder.record_packet_at(&vec![i as u8; (i as usize + 1) * 10], 0x81, i * 125);
        }
        recorder.record_frame();

        let result = recorder.stop(dir.path()).unwrap();
        assert_eq!(result.metadata.total_packets, 10);
        assert_eq!(result.metadata.total_frames, 1);
        assert_eq!(result.metadata.total_bytes, 550);
        assert_eq!(result.metadata_path.extension().unwrap(), "json");

        let packets = read_capture(&result.packets_path).unwrap();
        assert_eq!(packets.len(), 10);
        assert_eq!(packets[3].timestamp_us, 375);
        assert_eq!(packets[3].data, vec![3u8; 40]);
        assert_eq!(packets[3].received_at(), Duration::from_micros(375));

        let meta = read_metadata(&result.metadata_path).unwrap();
        assert_eq!(meta.stream, stream);
    }

    // ========================================================================
    // File format
    // ========================================================================

    #[test]
    fn test_truncated_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        let mut bytes = 7u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.push(0x81);
        bytes.extend_from_slice(&[0; 10]);
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            read_capture(&path),
            Err(CaptureError::InvalidRecord { offset: 0, .. })
        ));
    }

    #[test]
    fn test_oversized_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let good = CapturedPacket {
            timestamp_us: 1,
            endpoint: 0x81,
            data: vec![2, 0x80],
        };
        write_capture(&path, &[good]).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&2u64.to_le_bytes());
        bytes.extend_from_slice(&((MAX_RECORD_LEN + 1) as u32).to_le_bytes());
        std::fs::write(&path, bytes).unwrap();

        match read_capture(&path) {
            Err(CaptureError::InvalidRecord { offset, message }) => {
                assert_eq!(offset, 15);
                assert!(message.contains("1MB"));
            }
            other => panic!("expected invalid record, got {:?}", other),
        }
    }

    #[test]
    fn test_metadata_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        std::fs::write(&path, r#"{"total_packets": 3}"#).unwrap();
        let meta = read_metadata(&path).unwrap();
        assert_eq!(meta.total_packets, 3);
        assert_eq!(meta.stream, StreamConfig::default());
    }
}
