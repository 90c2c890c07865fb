//! Per-packet orchestration.
//!
//! [`PacketChecker::check_packet`] is the single entry point the pipeline
//! worker calls for every packet. For each packet it:
//!
//! 1. classifies buffers too short or too long to inspect
//! 2. advances the one-second statistics window
//! 3. parses and validates the header against the accepted history
//! 4. runs the suspicion heuristics on accepted payloads
//! 5. hands the payload to the frame assembler
//! 6. counts the verdict
//!
//! Closed frames and interval statistics go out through the [`FrameSink`].

use std::time::Duration;

use crate::config::{CaptureFlags, StreamConfig};
use crate::error::{FrameSuspicious, UvcError};
use crate::frame_assembler::{ClosedFrame, FrameAssembler};
use crate::header::{PayloadHeader, MIN_HEADER_LEN};
use crate::sink::FrameSink;
use crate::stats::{Statistics, StatsSnapshot};
use crate::suspicion::{check_payload, FilterConfig};
use crate::timing::PtsTimeline;
use crate::validator::{validate, HeaderHistory};

/// Checker settings that do not change mid-stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckerOptions {
    /// Suspicion heuristic toggles
    pub filter: FilterConfig,
    /// Which closed frames are emitted as images
    pub capture: CaptureFlags,
}

impl CheckerOptions {
    /// Read `UVC_INSPECT_FILTER` and `UVC_INSPECT_CAPTURE`.
    pub fn from_env() -> Self {
        Self {
            filter: FilterConfig::from_env(),
            capture: CaptureFlags::from_env(),
        }
    }
}

/// Validates packets and assembles them into frames.
pub struct PacketChecker<S: FrameSink> {
    options: CheckerOptions,
    history: HeaderHistory,
    assembler: FrameAssembler,
    stats: Statistics,
    timeline: PtsTimeline,
    sink: S,
}

impl<S: FrameSink> PacketChecker<S> {
    /// Checker with fresh state.
    pub fn new(options: CheckerOptions, sink: S) -> Self {
        Self {
            options,
            history: HeaderHistory::default(),
            assembler: FrameAssembler::new(),
            stats: Statistics::new(),
            timeline: PtsTimeline::new(),
            sink,
        }
    }

    /// Inspect one packet received `at` on the capture clock.
    ///
    /// `config` is a snapshot taken for this packet. Returns the payload
    /// verdict, which is also counted in the payload table.
    pub fn check_packet(&mut self, bytes: &[u8], at: Duration, config: &StreamConfig) -> UvcError {
        if bytes.len() < usize::from(MIN_HEADER_LEN) || bytes[0] < MIN_HEADER_LEN {
            log::trace!("Empty payload ({} bytes)", bytes.len());
            self.stats.payload.record(UvcError::Empty);
            return UvcError::Empty;
        }
        if bytes.len() > config.max_payload_size {
            log::trace!(
                "Payload of {} bytes exceeds max payload size {}",
                bytes.len(),
                config.max_payload_size
            );
            self.stats.payload.record(UvcError::PayloadOverflow);
            return UvcError::PayloadOverflow;
        }

        self.tick(at, config.fps);
        self.stats.meter.record_bytes(bytes.len());

        let header = PayloadHeader::parse(bytes);
        let verdict = validate(&header, &self.history, config);
        log::trace!("{} -> {}", header, verdict);

        if verdict.is_accepted() {
            let suspicion = check_payload(&header, &self.history.prev, &self.options.filter);
            if header.has_pts() {
                self.timeline.observe(header.pts, config.effective_clock_frequency());
            }
            let closed = self.assembler.accept(
                &header,
                verdict,
                suspicion,
                &self.history.prev,
                bytes,
                at,
                config,
                &self.options.filter,
            );
            for frame in closed {
                self.finish_frame(frame);
            }
            self.history.shift(header);
        } else if !self.assembler.reject(verdict, bytes.len(), at) {
            log::trace!("Rejected payload outside any frame: {}", verdict);
        }

        self.stats.payload.record(verdict);
        verdict
    }

    fn tick(&mut self, at: Duration, expected_fps: u32) {
        let reports = self.stats.meter.tick(at, expected_fps);
        if reports.is_empty() {
            return;
        }
        for report in &reports {
            self.stats.apply_interval(report);
        }
        let snapshot = self.stats.snapshot();
        self.sink.emit_stats(&snapshot);
    }

    fn finish_frame(&mut self, frame: ClosedFrame) {
        let ClosedFrame { record, image } = frame;
        self.stats.frame.record(record.frame_error);
        self.stats.suspicious.record(record.suspicious);
        self.stats.meter.record_frame();

        let is_error = record.frame_error.is_error();
        let is_suspicious = record.suspicious.is_suspicious();
        if is_error || is_suspicious {
            log::warn!(
                "Frame {} closed with error={} suspicious={} ({} payloads, {} bytes)",
                record.frame_number,
                record.frame_error,
                record.suspicious,
                record.payload_count,
                record.total_bytes
            );
        }

        self.sink.emit_frame(&record);

        let flags = self.options.capture;
        let wanted = if is_error {
            flags.error
        } else if is_suspicious {
            flags.suspicious
        } else {
            flags.valid
        };
        if wanted {
            self.sink.emit_image(&image);
        }
    }

    /// Current statistics.
    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    /// Serializable statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Frame assembler state.
    pub fn assembler(&self) -> &FrameAssembler {
        &self.assembler
    }

    /// Accepted header history.
    pub fn history(&self) -> &HeaderHistory {
        &self.history
    }

    /// PTS timeline of accepted payloads.
    pub fn timeline(&self) -> &PtsTimeline {
        &self.timeline
    }

    /// Checker settings.
    pub fn options(&self) -> &CheckerOptions {
        &self.options
    }

    /// Sink the checker writes to.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Take the sink back.
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Frames closed so far.
    pub fn frame_count(&self) -> u64 {
        self.assembler.frame_count()
    }

    /// Suspicion status of the open frame, if any.
    pub fn open_frame_suspicion(&self) -> Option<FrameSuspicious> {
        self.assembler.open_frame().map(|f| f.suspicious)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FrameError;
    use crate::header::BFH_ERR;
    use crate::sink::{ChannelSink, NullSink, SinkEvent};

    fn packet(header: PayloadHeader, body_len: usize) -> Vec<u8> {
        let mut bytes = header.encode();
        bytes.resize(bytes.len() + body_len, 0x55);
        bytes
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    // ========================================================================
    // Short-circuit classification
    // ========================================================================

    #[test]
    fn test_empty_and_short_buffers() {
        let config = StreamConfig::default();
        let mut checker = PacketChecker::new(CheckerOptions::default(), NullSink);
        assert_eq!(checker.check_packet(&[], ms(0), &config), UvcError::Empty);
        assert_eq!(checker.check_packet(&[2], ms(0), &config), UvcError::Empty);
        assert_eq!(checker.check_packet(&[1, 0x80], ms(0), &config), UvcError::Empty);

        let stats = checker.statistics();
        assert_eq!(stats.payload.count(UvcError::Empty), 3);
        assert_eq!(stats.payload.total(), 3);
        assert!(checker.assembler().open_frame().is_none());
        assert!(!checker.history().prev.is_present());
    }

    #[test]
    fn test_payload_overflow_leaves_state_alone() {
        let config = StreamConfig {
            max_payload_size: 16,
            ..Default::default()
        };
        let mut checker = PacketChecker::new(CheckerOptions::default(), NullSink);
        let big = packet(PayloadHeader::new(false, false), 32);
        assert_eq!(checker.check_packet(&big, ms(0), &config), UvcError::PayloadOverflow);
        assert!(checker.assembler().open_frame().is_none());
        assert_eq!(checker.statistics().payload.total(), 1);
    }

    // ========================================================================
    // Frame flow
    // ========================================================================

    #[test]
    fn test_three_payload_scenario() {
        let config = StreamConfig::default();
        let mut checker = PacketChecker::new(CheckerOptions::default(), NullSink);

        let verdicts = [
            checker.check_packet(&packet(PayloadHeader::new(false, false), 10), ms(0), &config),
            checker.check_packet(&packet(PayloadHeader::new(false, true), 10), ms(1), &config),
            checker.check_packet(&packet(PayloadHeader::new(true, true), 10), ms(2), &config),
        ];
        assert_eq!(verdicts, [UvcError::NoError; 3]);
        assert_eq!(checker.frame_count(), 2);
        assert_eq!(checker.statistics().frame.count(FrameError::NoError), 2);
        assert_eq!(checker.statistics().payload.total(), 3);
    }

    #[test]
    fn test_rejected_payload_does_not_shift_history() {
        let config = StreamConfig::default();
        let mut checker = PacketChecker::new(CheckerOptions::default(), NullSink);
        let first = PayloadHeader::new(false, false).with_pts(10);
        checker.check_packet(&packet(first, 4), ms(0), &config);

        let bad = PayloadHeader::new(false, false).with_flags(BFH_ERR);
        assert_eq!(checker.check_packet(&packet(bad, 4), ms(1), &config), UvcError::ErrBitSet);
        assert_eq!(checker.history().prev, first);

        checker.check_packet(&packet(PayloadHeader::new(false, true), 4), ms(2), &config);
        assert_eq!(checker.statistics().frame.count(FrameError::Error), 1);
        assert_eq!(checker.statistics().suspicious.count(FrameSuspicious::ErrorChecked), 1);
    }

    #[test]
    fn test_pts_decrease_marks_frame() {
        let config = StreamConfig::default();
        let options = CheckerOptions {
            filter: FilterConfig::all(),
            ..Default::default()
        };
        let mut checker = PacketChecker::new(options, NullSink);
        checker.check_packet(&packet(PayloadHeader::new(false, false).with_pts(100), 4), ms(0), &config);
        checker.check_packet(&packet(PayloadHeader::new(false, false).with_pts(50), 4), ms(1), &config);
        assert_eq!(checker.open_frame_suspicion(), Some(FrameSuspicious::PtsDecrease));
        checker.check_packet(&packet(PayloadHeader::new(false, true).with_pts(60), 4), ms(2), &config);
        assert_eq!(checker.statistics().suspicious.count(FrameSuspicious::PtsDecrease), 1);
    }

    #[test]
    fn test_filter_off_reports_unchecked() {
        let config = StreamConfig::default();
        let options = CheckerOptions {
            filter: FilterConfig::off(),
            ..Default::default()
        };
        let mut checker = PacketChecker::new(options, NullSink);
        checker.check_packet(&packet(PayloadHeader::new(false, true), 4), ms(0), &config);
        assert_eq!(checker.statistics().suspicious.count(FrameSuspicious::Unchecked), 1);
    }

    // ========================================================================
    // Sink output
    // ========================================================================

    #[test]
    fn test_images_follow_capture_flags() {
        let config = StreamConfig::default();
        let (sink, rx) = ChannelSink::unbounded();
        let options = CheckerOptions {
            capture: CaptureFlags {
                error: true,
                suspicious: false,
                valid: false,
            },
            ..Default::default()
        };
        let mut checker = PacketChecker::new(options, sink);

        // Clean frame: record only
        checker.check_packet(&packet(PayloadHeader::new(false, true), 4), ms(0), &config);
        // Frame with a rejected payload: record and image
        checker.check_packet(&packet(PayloadHeader::new(true, false), 4), ms(1), &config);
        checker.check_packet(
            &packet(PayloadHeader::new(true, false).with_flags(BFH_ERR), 4),
            ms(2),
            &config,
        );
        checker.check_packet(&packet(PayloadHeader::new(true, true), 4), ms(3), &config);

        let events: Vec<_> = rx.try_iter().collect();
        let frames = events.iter().filter(|e| matches!(e, SinkEvent::Frame(_))).count();
        let images: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Image(image) => Some(image),
                _ => None,
            })
            .collect();
        assert_eq!(frames, 2);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].frame_number, 2);
        assert_eq!(images[0].data.len(), 8);
    }

    #[test]
    fn test_stats_emitted_per_interval() {
        let config = StreamConfig {
            fps: 2,
            ..Default::default()
        };
        let (sink, rx) = ChannelSink::unbounded();
        let mut checker = PacketChecker::new(CheckerOptions::default(), sink);

        checker.check_packet(&packet(PayloadHeader::new(false, true), 4), ms(0), &config);
        checker.check_packet(&packet(PayloadHeader::new(true, true), 4), ms(500), &config);
        checker.check_packet(&packet(PayloadHeader::new(false, true), 4), ms(2_100), &config);

        let stats: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                SinkEvent::Stats(s) => Some(s),
                _ => None,
            })
            .collect();
        // One emission covering the full second and the idle one
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].dropped_frames, 2);
        assert_eq!(checker.statistics().meter.intervals(), 2);
        assert_eq!(checker.snapshot().total_frames, 3);
    }
}
