//! Presentation boundary for closed frames and statistics.
//!
//! The checker calls a [`FrameSink`] from the worker thread. Implementations
//! must return promptly: anything slow (UI, disk, network) belongs on the
//! other side of a [`ChannelSink`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::sync::Arc;

use crate::frame::{FrameImage, FrameRecord};
use crate::stats::StatsSnapshot;

/// Receives checker output.
pub trait FrameSink: Send {
    /// Called once per closed frame.
    fn emit_frame(&mut self, record: &FrameRecord);

    /// Called once per completed one-second interval.
    fn emit_stats(&mut self, stats: &StatsSnapshot);

    /// Called for closed frames selected by the capture flags.
    fn emit_image(&mut self, image: &FrameImage) {
        let _ = image;
    }
}

impl<S: FrameSink + ?Sized> FrameSink for Box<S> {
    fn emit_frame(&mut self, record: &FrameRecord) {
        (**self).emit_frame(record);
    }

    fn emit_stats(&mut self, stats: &StatsSnapshot) {
        (**self).emit_stats(stats);
    }

    fn emit_image(&mut self, image: &FrameImage) {
        (**self).emit_image(image);
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn emit_frame(&mut self, _record: &FrameRecord) {}

    fn emit_stats(&mut self, _stats: &StatsSnapshot) {}
}

/// Writes frames and stats through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl FrameSink for LogSink {
    fn emit_frame(&mut self, record: &FrameRecord) {
        if record.frame_error.is_error() || record.suspicious.is_suspicious() {
            log::warn!(
                "Frame {}: {} payloads, {} bytes, error={}, suspicious={}",
                record.frame_number,
                record.payload_count,
                record.total_bytes,
                record.frame_error,
                record.suspicious
            );
        } else {
            log::debug!(
                "Frame {}: {} payloads, {} bytes",
                record.frame_number,
                record.payload_count,
                record.total_bytes
            );
        }
    }

    fn emit_stats(&mut self, stats: &StatsSnapshot) {
        log::info!("{}", stats);
    }

    fn emit_image(&mut self, image: &FrameImage) {
        log::debug!(
            "Frame {} image: {} bytes {} {}x{}",
            image.frame_number,
            image.data.len(),
            image.format,
            image.width,
            image.height
        );
    }
}

/// Output event carried by a [`ChannelSink`].
#[derive(Debug, Clone)]
pub enum SinkEvent {
    /// A frame closed
    Frame(FrameRecord),
    /// Interval statistics
    Stats(StatsSnapshot),
    /// Frame bytes
    Image(FrameImage),
}

#[derive(Debug)]
enum EventSender {
    Unbounded(Sender<SinkEvent>),
    Bounded(SyncSender<SinkEvent>),
}

/// Forwards events to another thread over an mpsc channel.
///
/// The bounded variant never blocks: events that do not fit are counted
/// and dropped.
#[derive(Debug)]
pub struct ChannelSink {
    sender: EventSender,
    dropped: Arc<AtomicU64>,
}

impl ChannelSink {
    /// Unbounded channel.
    pub fn unbounded() -> (Self, Receiver<SinkEvent>) {
        let (tx, rx) = mpsc::channel();
        let sink = Self {
            sender: EventSender::Unbounded(tx),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sink, rx)
    }

    /// Channel holding at most `capacity` undelivered events.
    pub fn bounded(capacity: usize) -> (Self, Receiver<SinkEvent>) {
        let (tx, rx) = mpsc::sync_channel(capacity);
        let sink = Self {
            sender: EventSender::Bounded(tx),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sink, rx)
    }

    /// Events dropped because the channel was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Shared drop counter, readable after the sink moves into the pipeline.
    pub fn drop_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    fn send(&self, event: SinkEvent) {
        let delivered = match &self.sender {
            EventSender::Unbounded(tx) => tx.send(event).is_ok(),
            EventSender::Bounded(tx) => match tx.try_send(event) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    log::trace!("Sink channel full, dropping event");
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            },
        };
        if !delivered {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl FrameSink for ChannelSink {
    fn emit_frame(&mut self, record: &FrameRecord) {
        self.send(SinkEvent::Frame(record.clone()));
    }

    fn emit_stats(&mut self, stats: &StatsSnapshot) {
        self.send(SinkEvent::Stats(stats.clone()));
    }

    fn emit_image(&mut self, image: &FrameImage) {
        self.send(SinkEvent::Image(image.clone()));
    }
}

/// Fans out to several sinks in order.
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn FrameSink>>,
}

impl MultiSink {
    /// No sinks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    #[must_use]
    pub fn with(mut self, sink: impl FrameSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Number of sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// No sinks registered.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl FrameSink for MultiSink {
    fn emit_frame(&mut self, record: &FrameRecord) {
        for sink in &mut self.sinks {
            sink.emit_frame(record);
        }
    }

    fn emit_stats(&mut self, stats: &StatsSnapshot) {
        for sink in &mut self.sinks {
            sink.emit_stats(stats);
        }
    }

    fn emit_image(&mut self, image: &FrameImage) {
        for sink in &mut self.sinks {
            sink.emit_image(image);
        }
    }
}
