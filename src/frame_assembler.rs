//! Frame assembly from validated UVC payloads
//!
//! The assembler owns at most one open frame and a short window of recently
//! closed frames. It is driven by the [`crate::checker::PacketChecker`] with
//! the validator's verdict for each payload:
//!
//! - accepted payloads (no error, `MissingEof`, `FidMismatch`) open or extend
//!   the frame, and close it on EOF
//! - rejected payloads mark the open frame as erroneous and are recorded in
//!   its lost-payload ledger
//!
//! # Usage
//!
//! ```rust,ignore
//! use uvc_inspector::frame_assembler::FrameAssembler;
//!
//! let mut assembler = FrameAssembler::new();
//!
//! let closed = assembler.accept(&header, verdict, suspicion, &history.prev, &packet, at, &config, &filter);
//! for frame in closed {
//!     // Frame closed, record it
//!     report(frame.record);
//! }
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use crate::config::{FrameFormat, StreamConfig};
use crate::error::{FrameError, FrameSuspicious, UvcError};
use crate::frame::{Closure, Frame, FrameImage, FrameRecord, TimeTag};
use crate::header::PayloadHeader;
use crate::suspicion::FilterConfig;

/// Number of closed frames kept for irregularity heuristics
pub const WINDOW_CAPACITY: usize = 4;

/// Frame smaller than this share of the window average is inconsistent
const SIZE_INCONSISTENT_RATIO: f64 = 0.9;
/// Compressed frame smaller than this share of the raw size is overcompressed
const OVERCOMPRESSED_RATIO: f64 = 0.05;

/// A frame that has just been closed.
#[derive(Debug, Clone)]
pub struct ClosedFrame {
    /// Summary of the frame
    pub record: FrameRecord,
    /// Payload bytes of the frame
    pub image: FrameImage,
}

/// Fixed-capacity ring of the most recently closed frames.
///
/// Frames enter without their image data.
#[derive(Debug)]
pub struct FrameWindow {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl FrameWindow {
    /// Empty window holding at most `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Push a closed frame, returning the evicted oldest frame when full.
    pub fn push(&mut self, frame: Frame) -> Option<Frame> {
        let evicted = if self.frames.len() == self.capacity {
            self.frames.pop_front()
        } else {
            None
        };
        self.frames.push_back(frame);
        evicted
    }

    /// Frames in the window
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Window holds no frames
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    /// Most recently closed frame
    pub fn latest(&self) -> Option<&Frame> {
        self.frames.back()
    }

    /// Mean accepted bytes per frame, `None` when empty.
    pub fn average_total_bytes(&self) -> Option<f64> {
        if self.frames.is_empty() {
            return None;
        }
        let sum: usize = self.frames.iter().map(Frame::total_bytes).sum();
        Some(sum as f64 / self.frames.len() as f64)
    }

    /// Mean payloads per frame, `None` when empty.
    pub fn average_payload_count(&self) -> Option<f64> {
        if self.frames.is_empty() {
            return None;
        }
        let sum: usize = self.frames.iter().map(Frame::payload_count).sum();
        Some(sum as f64 / self.frames.len() as f64)
    }
}

/// Assembles frames from validated payloads.
#[derive(Debug)]
pub struct FrameAssembler {
    /// The single open frame, if any
    open: Option<Frame>,
    /// Recently closed frames
    window: FrameWindow,
    /// Number given to the next frame that opens
    next_frame_number: u64,
    /// Frames closed so far
    closed_count: u64,
    /// PTS most recently assigned to a frame
    last_frame_pts: u32,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    /// Create an assembler with no open frame.
    pub fn new() -> Self {
        Self {
            open: None,
            window: FrameWindow::new(WINDOW_CAPACITY),
            next_frame_number: 1,
            closed_count: 0,
            last_frame_pts: 0,
        }
    }

    /// Reset the assembler state
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Currently open frame
    pub fn open_frame(&self) -> Option<&Frame> {
        self.open.as_ref()
    }

    /// Recently closed frames
    pub fn window(&self) -> &FrameWindow {
        &self.window
    }

    /// Frames closed so far, cleanly or forced
    pub fn frame_count(&self) -> u64 {
        self.closed_count
    }

    /// Frames opened so far
    pub fn frames_opened(&self) -> u64 {
        self.next_frame_number - 1
    }

    /// Process an accepted payload (verdict `NoError`, `MissingEof` or `FidMismatch`).
    ///
    /// `prev` is the previous accepted header. Returns the frames closed by
    /// this payload, oldest first: a forced `MissingEof` closure and/or the
    /// frame this payload ended with EOF.
    #[allow(clippy::too_many_arguments)]
    pub fn accept(
        &mut self,
        header: &PayloadHeader,
        verdict: UvcError,
        suspicion: FrameSuspicious,
        prev: &PayloadHeader,
        payload: &[u8],
        at: Duration,
        config: &StreamConfig,
        filter: &FilterConfig,
    ) -> Vec<ClosedFrame> {
        debug_assert!(verdict.is_accepted());
        let mut closed = Vec::new();

        if verdict == UvcError::MissingEof {
            if let Some(frame) = self.open.take() {
                log::debug!(
                    "Frame {} missing EOF, closing before FID {}",
                    frame.frame_number,
                    u8::from(header.fid())
                );
                closed.push(self.close(frame, Closure::ForcedMissingEof, config, filter));
            }
        }

        let extends_open = verdict != UvcError::FidMismatch
            && !prev.eof()
            && prev.fid() == header.fid()
            && self
                .open
                .as_ref()
                .is_some_and(|frame| frame.toggle_bit == prev.fid());

        let (mut frame, tag) = if extends_open {
            match self.open.take() {
                Some(frame) => (frame, TimeTag::Valid),
                None => self.open_new(header, verdict, config, &mut closed, filter),
            }
        } else {
            self.open_new(header, verdict, config, &mut closed, filter)
        };

        self.track_pts(&mut frame, header.pts);
        frame.add_payload(*header, payload, at, tag);

        if frame.total_bytes() > config.max_frame_size {
            if frame.frame_error != FrameError::MaxFrameOverflow {
                log::warn!(
                    "Frame {} exceeds max frame size: {} > {}",
                    frame.frame_number,
                    frame.total_bytes(),
                    config.max_frame_size
                );
            }
            frame.frame_error = FrameError::MaxFrameOverflow;
        }

        if suspicion.is_suspicious() || suspicion == FrameSuspicious::Unchecked {
            frame.suspicious = suspicion;
        }

        if header.eof() {
            closed.push(self.close(frame, Closure::EofObserved, config, filter));
        } else {
            self.open = Some(frame);
        }

        closed
    }

    /// Record a rejected payload against the open frame.
    ///
    /// Returns `false` when no frame was open to take it.
    pub fn reject(&mut self, verdict: UvcError, size: usize, at: Duration) -> bool {
        match self.open.as_mut() {
            Some(frame) => {
                frame.frame_error = FrameError::Error;
                frame.add_lost(verdict, size, at);
                log::trace!(
                    "Frame {} lost {} bytes: {}",
                    frame.frame_number,
                    size,
                    verdict
                );
                true
            }
            None => false,
        }
    }

    /// Open a new frame for `header`.
    ///
    /// A frame still open at this point is force-closed first so that at
    /// most one frame is ever open.
    fn open_new(
        &mut self,
        header: &PayloadHeader,
        verdict: UvcError,
        config: &StreamConfig,
        closed: &mut Vec<ClosedFrame>,
        filter: &FilterConfig,
    ) -> (Frame, TimeTag) {
        if let Some(stale) = self.open.take() {
            log::warn!(
                "Frame {} still open when a new frame started, closing as missing EOF",
                stale.frame_number
            );
            closed.push(self.close(stale, Closure::ForcedMissingEof, config, filter));
        }

        let mut frame = Frame::new(self.next_frame_number, header.fid(), config);
        self.next_frame_number += 1;

        let tag = if verdict == UvcError::FidMismatch {
            frame.frame_error = FrameError::FidMismatch;
            TimeTag::Error
        } else {
            TimeTag::Valid
        };
        log::trace!(
            "Opened frame {} (FID {})",
            frame.frame_number,
            u8::from(frame.toggle_bit)
        );
        (frame, tag)
    }

    fn track_pts(&mut self, frame: &mut Frame, pts: u32) {
        if pts == 0 {
            return;
        }
        if self.last_frame_pts == 0 {
            self.last_frame_pts = pts;
        } else if pts != self.last_frame_pts {
            frame.frame_pts = pts;
            frame.prev_frame_pts = self.last_frame_pts;
            self.last_frame_pts = pts;
        }
    }

    /// Finalize a frame and move it into the window.
    fn close(
        &mut self,
        mut frame: Frame,
        closure: Closure,
        config: &StreamConfig,
        filter: &FilterConfig,
    ) -> ClosedFrame {
        match closure {
            Closure::ForcedMissingEof => {
                frame.frame_error = FrameError::MissingEof;
                frame.eof_reached = false;
            }
            Closure::EofObserved => {
                frame.eof_reached = true;
                self.check_format(&mut frame, config, filter);
            }
        }

        if frame.frame_error.is_error() {
            frame.suspicious = FrameSuspicious::ErrorChecked;
        }

        let record = frame.to_record(closure);
        let image = FrameImage {
            frame_number: frame.frame_number,
            format: frame.format,
            width: frame.width,
            height: frame.height,
            frame_error: frame.frame_error,
            suspicious: frame.suspicious,
            data: std::mem::take(&mut frame.image_data),
        };

        log::debug!(
            "Frame {} closed ({:?}): {} payloads, {} bytes, error={}, suspicious={}",
            record.frame_number,
            closure,
            record.payload_count,
            record.total_bytes,
            record.frame_error,
            record.suspicious
        );

        self.window.push(frame);
        self.closed_count += 1;

        ClosedFrame { record, image }
    }

    /// Format specific checks at EOF.
    fn check_format(&self, frame: &mut Frame, config: &StreamConfig, filter: &FilterConfig) {
        let total = frame.total_bytes();
        let raw_size = config.raw_frame_size();

        match config.frame_format {
            FrameFormat::Yuyv => {
                if total != raw_size {
                    log::debug!(
                        "Frame {}: {}/{} YUYV size mismatch",
                        frame.frame_number,
                        total,
                        raw_size
                    );
                    frame.frame_error = FrameError::InvalidYuyvRawSize;
                }
            }
            FrameFormat::Mjpeg if filter.enabled && filter.irregular => {
                let (Some(avg_bytes), Some(avg_count)) = (
                    self.window.average_total_bytes(),
                    self.window.average_payload_count(),
                ) else {
                    return;
                };

                if (total as f64) < avg_bytes * SIZE_INCONSISTENT_RATIO {
                    frame.suspicious = FrameSuspicious::FrameSizeInconsistent;
                }
                // Compared against this frame's own bytes; needs a non-empty window like the rest.
                if (total as f64) < raw_size as f64 * OVERCOMPRESSED_RATIO {
                    frame.suspicious = FrameSuspicious::Overcompressed;
                }
                if (frame.payload_count() as f64) < avg_count {
                    frame.suspicious = FrameSuspicious::PayloadCountInconsistent;
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Helpers
    // ========================================================================

    struct Harness {
        assembler: FrameAssembler,
        prev: PayloadHeader,
        config: StreamConfig,
        filter: FilterConfig,
        closed: Vec<ClosedFrame>,
        clock: Duration,
    }

    impl Harness {
        fn new(config: StreamConfig) -> Self {
            Self {
                assembler: FrameAssembler::new(),
                prev: PayloadHeader::default(),
                config,
                filter: FilterConfig::default(),
                closed: Vec::new(),
                clock: Duration::ZERO,
            }
        }

        fn feed(&mut self, header: PayloadHeader, verdict: UvcError, body_len: usize) {
            let mut bytes = header.encode();
            bytes.resize(bytes.len() + body_len, 0xAB);
            self.clock += Duration::from_micros(125);
            let closed = self.assembler.accept(
                &header,
                verdict,
                FrameSuspicious::None,
                &self.prev,
                &bytes,
                self.clock,
                &self.config,
                &self.filter,
            );
            self.closed.extend(closed);
            self.prev = header;
        }

        fn frame(&mut self, fid: bool, payloads: usize, body_len: usize) {
            for i in 0..payloads {
                let eof = i + 1 == payloads;
                self.feed(PayloadHeader::new(fid, eof), UvcError::NoError, body_len);
            }
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    #[test]
    fn test_single_frame_accumulates_in_order() {
        let mut h = Harness::new(StreamConfig::default());
        h.frame(false, 5, 100);

        assert_eq!(h.closed.len(), 1);
        let record = &h.closed[0].record;
        assert_eq!(record.frame_number, 1);
        assert_eq!(record.payload_count, 5);
        assert_eq!(record.total_bytes, 500);
        assert!(record.eof_reached);
        assert_eq!(record.closure, Closure::EofObserved);
        assert_eq!(h.closed[0].image.data.len(), 500);
        assert_eq!(h.assembler.frame_count(), 1);
        assert!(h.assembler.open_frame().is_none());
    }

    #[test]
    fn test_missing_eof_forces_closure() {
        let mut h = Harness::new(StreamConfig::default());
        h.feed(PayloadHeader::new(false, false), UvcError::NoError, 10);
        h.feed(PayloadHeader::new(false, false), UvcError::NoError, 10);
        h.feed(PayloadHeader::new(true, false), UvcError::MissingEof, 10);

        assert_eq!(h.closed.len(), 1);
        let record = &h.closed[0].record;
        assert_eq!(record.frame_error, FrameError::MissingEof);
        assert_eq!(record.suspicious, FrameSuspicious::ErrorChecked);
        assert_eq!(record.closure, Closure::ForcedMissingEof);
        assert!(!record.eof_reached);
        assert_eq!(h.assembler.frame_count(), 1);

        let open = h.assembler.open_frame().unwrap();
        assert!(open.toggle_bit);
        assert_eq!(open.frame_number, 2);
    }

    #[test]
    fn test_fid_mismatch_opens_flagged_frame() {
        let mut h = Harness::new(StreamConfig::default());
        h.frame(false, 2, 10);
        h.feed(PayloadHeader::new(false, false), UvcError::FidMismatch, 10);

        let open = h.assembler.open_frame().unwrap();
        assert_eq!(open.frame_number, 2);
        assert_eq!(open.frame_error, FrameError::FidMismatch);
        assert_eq!(open.received_times[0].tag, TimeTag::Error);
    }

    #[test]
    fn test_reject_marks_open_frame() {
        let mut h = Harness::new(StreamConfig::default());
        h.feed(PayloadHeader::new(false, false), UvcError::NoError, 10);
        assert!(h.assembler.reject(UvcError::ErrBitSet, 12, Duration::from_millis(1)));

        let open = h.assembler.open_frame().unwrap();
        assert_eq!(open.frame_error, FrameError::Error);
        assert_eq!(open.payload_count(), 2);
        assert_eq!(open.lost_bytes(), 12);

        h.feed(PayloadHeader::new(false, true), UvcError::NoError, 10);
        let record = &h.closed[0].record;
        assert_eq!(record.frame_error, FrameError::Error);
        assert_eq!(record.suspicious, FrameSuspicious::ErrorChecked);
        assert_eq!(record.total_bytes, 20);
    }

    #[test]
    fn test_reject_without_open_frame() {
        let mut assembler = FrameAssembler::new();
        assert!(!assembler.reject(UvcError::Swap, 4, Duration::ZERO));
        assert_eq!(assembler.frames_opened(), 0);
    }

    #[test]
    fn test_at_most_one_open_frame() {
        let mut h = Harness::new(StreamConfig::default());
        h.feed(PayloadHeader::new(false, false), UvcError::NoError, 10);
        // Different FID reported as clean (e.g. validator fed without history)
        // must not leave two frames open
        h.feed(PayloadHeader::new(true, false), UvcError::NoError, 10);

        assert_eq!(h.closed.len(), 1);
        assert_eq!(h.closed[0].record.frame_error, FrameError::MissingEof);
        assert_eq!(h.assembler.open_frame().unwrap().frame_number, 2);
    }

    #[test]
    fn test_frame_pts_tracking() {
        let mut h = Harness::new(StreamConfig::default());
        h.feed(PayloadHeader::new(false, true).with_pts(1000), UvcError::NoError, 4);
        h.feed(PayloadHeader::new(true, false).with_pts(2000), UvcError::NoError, 4);
        h.feed(PayloadHeader::new(true, true).with_pts(2000), UvcError::NoError, 4);

        // First PTS only seeds the tracker
        assert_eq!(h.closed[0].record.frame_pts, 0);
        assert_eq!(h.closed[1].record.frame_pts, 2000);
        assert_eq!(h.closed[1].record.prev_frame_pts, 1000);
    }

    #[test]
    fn test_max_frame_overflow_keeps_frame_open() {
        let config = StreamConfig {
            max_frame_size: 25,
            ..Default::default()
        };
        let mut h = Harness::new(config);
        h.feed(PayloadHeader::new(false, false), UvcError::NoError, 20);
        h.feed(PayloadHeader::new(false, false), UvcError::NoError, 20);

        let open = h.assembler.open_frame().unwrap();
        assert_eq!(open.frame_error, FrameError::MaxFrameOverflow);

        h.feed(PayloadHeader::new(false, true), UvcError::NoError, 20);
        assert_eq!(h.closed[0].record.frame_error, FrameError::MaxFrameOverflow);
    }

    // ========================================================================
    // Format checks
    // ========================================================================

    #[test]
    fn test_yuyv_exact_size() {
        let config = StreamConfig {
            frame_format: FrameFormat::Yuyv,
            width: 8,
            height: 4,
            ..Default::default()
        };
        let mut h = Harness::new(config);
        h.frame(false, 4, 16);
        h.frame(true, 4, 15);

        assert_eq!(h.closed[0].record.frame_error, FrameError::NoError);
        assert_eq!(h.closed[1].record.frame_error, FrameError::InvalidYuyvRawSize);
        assert_eq!(h.closed[1].record.suspicious, FrameSuspicious::ErrorChecked);
    }

    #[test]
    fn test_mjpeg_irregularity_heuristics() {
        let config = StreamConfig {
            width: 100,
            height: 100,
            ..Default::default()
        };
        let mut h = Harness::new(config);
        h.filter = FilterConfig::all();

        // Nothing to compare against yet
        h.frame(false, 4, 500);
        assert_eq!(h.closed[0].record.suspicious, FrameSuspicious::None);

        // Same shape as the window: clean
        h.frame(true, 4, 500);
        assert_eq!(h.closed[1].record.suspicious, FrameSuspicious::None);

        // Much smaller with the same payload count
        h.frame(false, 4, 300);
        assert_eq!(
            h.closed[2].record.suspicious,
            FrameSuspicious::FrameSizeInconsistent
        );

        // Fewer payloads wins over the size check
        h.frame(true, 2, 500);
        assert_eq!(
            h.closed[3].record.suspicious,
            FrameSuspicious::PayloadCountInconsistent
        );
    }

    #[test]
    fn test_mjpeg_overcompressed() {
        let config = StreamConfig {
            width: 100,
            height: 100,
            ..Default::default()
        };
        let mut h = Harness::new(config);
        h.filter = FilterConfig::all();
        // raw size 20000, 5% = 1000
        h.frame(false, 4, 200);
        h.frame(true, 4, 200);
        assert_eq!(h.closed[0].record.suspicious, FrameSuspicious::None);
        assert_eq!(h.closed[1].record.suspicious, FrameSuspicious::Overcompressed);
    }

    #[test]
    fn test_irregular_checks_need_filter() {
        let config = StreamConfig {
            width: 100,
            height: 100,
            ..Default::default()
        };
        let mut h = Harness::new(config);
        h.frame(false, 4, 500);
        h.frame(true, 1, 10);
        assert_eq!(h.closed[1].record.suspicious, FrameSuspicious::None);
    }

    // ========================================================================
    // Window
    // ========================================================================

    #[test]
    fn test_window_evicts_oldest() {
        let mut h = Harness::new(StreamConfig::default());
        for i in 0..6 {
            h.frame(i % 2 == 1, 1, 10);
        }
        let window = h.assembler.window();
        assert_eq!(window.len(), WINDOW_CAPACITY);
        let numbers: Vec<u64> = window.iter().map(|f| f.frame_number).collect();
        assert_eq!(numbers, vec![3, 4, 5, 6]);
        assert!(window.iter().all(|f| f.image_data.is_empty()));
        assert_eq!(window.latest().unwrap().frame_number, 6);
    }

    #[test]
    fn test_window_averages() {
        let config = StreamConfig::default();
        let mut window = FrameWindow::new(2);
        assert!(window.average_total_bytes().is_none());

        let header = PayloadHeader::new(false, true);
        let mut a = Frame::new(1, false, &config);
        a.add_payload(header, &[2, 0x82, 0, 0, 0, 0], Duration::ZERO, TimeTag::Valid);
        let mut b = Frame::new(2, true, &config);
        b.add_payload(header, &[2, 0x82, 0, 0], Duration::ZERO, TimeTag::Valid);
        b.add_lost(UvcError::ErrBitSet, 4, Duration::ZERO);

        window.push(a);
        window.push(b);
        assert_eq!(window.average_total_bytes(), Some(3.0));
        assert_eq!(window.average_payload_count(), Some(1.5));

        let evicted = window.push(Frame::new(3, false, &config));
        assert_eq!(evicted.unwrap().frame_number, 1);
    }
}
