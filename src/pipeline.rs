//! Producer/consumer scaffold around the checker.
//!
//! Acquisition threads push packets into a [`PacketQueue`]; one worker
//! thread pops them and runs [`PacketChecker::check_packet`] on each with a
//! fresh configuration snapshot.
//!
//! # Shutdown
//!
//! [`PipelineHandle::shutdown`] stops the queue, lets the worker drain
//! everything already queued, and joins it. Pushes after the stop are
//! refused with [`PipelineError::Stopped`].
//!
//! # Usage
//!
//! ```rust,ignore
//! let checker = PacketChecker::new(CheckerOptions::default(), LogSink);
//! let handle = Pipeline::new(checker, SharedConfig::default())
//!     .with_capacity(4096)
//!     .spawn()?;
//!
//! handle.push_now(packet)?;
//!
//! let report = handle.shutdown()?;
//! log::info!("{}", report.checker.snapshot());
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::checker::PacketChecker;
use crate::config::SharedConfig;
use crate::sink::FrameSink;

/// Name of the checker worker thread.
pub const WORKER_THREAD_NAME: &str = "uvc-checker";

/// Errors from the packet pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The pipeline no longer accepts packets.
    #[error("pipeline is stopped")]
    Stopped,

    /// The bounded queue was full and the packet was dropped.
    #[error("packet queue is full")]
    QueueFull,

    /// The worker thread panicked.
    #[error("checker worker panicked")]
    WorkerPanicked,

    /// The worker thread could not be started.
    #[error("failed to spawn checker worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// A packet as handed over by acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Raw payload, header included
    pub data: Vec<u8>,
    /// Offset on the capture clock
    pub received_at: Duration,
}

#[derive(Debug, Default)]
struct QueueState {
    packets: VecDeque<Packet>,
    stopped: bool,
}

/// FIFO shared between producers and the checker worker.
///
/// With a capacity set, a push into a full queue drops the new packet
/// (drop-newest) and counts it.
#[derive(Debug)]
pub struct PacketQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    capacity: Option<usize>,
    dropped: AtomicU64,
}

impl PacketQueue {
    /// Queue with an optional capacity bound.
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Queue contents stay valid even if a holder panicked
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a packet and wake the worker.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Stopped` after [`stop`](Self::stop) and
    /// `PipelineError::QueueFull` when the capacity bound is hit.
    pub fn push(&self, packet: Packet) -> Result<()> {
        {
            let mut state = self.lock();
            if state.stopped {
                return Err(PipelineError::Stopped);
            }
            if self.capacity.is_some_and(|cap| state.packets.len() >= cap) {
                drop(state);
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    log::warn!("Packet queue full, {} packets dropped so far", dropped);
                }
                return Err(PipelineError::QueueFull);
            }
            state.packets.push_back(packet);
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Block until a packet is available.
    ///
    /// Returns `None` once the queue is stopped and fully drained.
    pub fn pop(&self) -> Option<Packet> {
        let mut state = self.lock();
        loop {
            if let Some(packet) = state.packets.pop_front() {
                return Some(packet);
            }
            if state.stopped {
                return None;
            }
            state = self.ready.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Refuse further pushes and wake every waiter.
    pub fn stop(&self) {
        self.lock().stopped = true;
        self.ready.notify_all();
    }

    /// Stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Packets waiting.
    pub fn len(&self) -> usize {
        self.lock().packets.len()
    }

    /// No packets waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Packets refused because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Cloneable producer handle.
#[derive(Debug, Clone)]
pub struct PacketSender {
    queue: Arc<PacketQueue>,
    epoch: Instant,
}

impl PacketSender {
    /// Push a packet with an explicit capture-clock offset.
    ///
    /// # Errors
    ///
    /// See [`PacketQueue::push`].
    pub fn push(&self, data: Vec<u8>, received_at: Duration) -> Result<()> {
        self.queue.push(Packet { data, received_at })
    }

    /// Push a packet stamped with the time since the pipeline started.
    ///
    /// # Errors
    ///
    /// See [`PacketQueue::push`].
    pub fn push_now(&self, data: Vec<u8>) -> Result<()> {
        self.push(data, self.epoch.elapsed())
    }

    /// Request shutdown.
    pub fn stop(&self) {
        self.queue.stop();
    }

    /// Shutdown has been requested.
    pub fn is_stopped(&self) -> bool {
        self.queue.is_stopped()
    }
}

/// Builder for a running pipeline.
pub struct Pipeline<S: FrameSink + 'static> {
    checker: PacketChecker<S>,
    config: SharedConfig,
    capacity: Option<usize>,
}

impl<S: FrameSink + 'static> Pipeline<S> {
    /// Pipeline around `checker`, reading `config` once per packet.
    pub fn new(checker: PacketChecker<S>, config: SharedConfig) -> Self {
        Self {
            checker,
            config,
            capacity: None,
        }
    }

    /// Bound the queue. Zero means unbounded.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = (capacity > 0).then_some(capacity);
        self
    }

    /// Start the worker thread.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Spawn` if the thread cannot be created.
    pub fn spawn(self) -> Result<PipelineHandle<S>> {
        let queue = Arc::new(PacketQueue::new(self.capacity));
        let processed = Arc::new(AtomicU64::new(0));

        let worker = {
            let queue = Arc::clone(&queue);
            let processed = Arc::clone(&processed);
            let config = self.config;
            let mut checker = self.checker;
            thread::Builder::new()
                .name(WORKER_THREAD_NAME.to_string())
                .spawn(move || {
                    while let Some(packet) = queue.pop() {
                        let snapshot = config.snapshot();
                        checker.check_packet(&packet.data, packet.received_at, &snapshot);
                        processed.fetch_add(1, Ordering::Relaxed);
                    }
                    log::info!(
                        "Checker worker finished after {} packets",
                        processed.load(Ordering::Relaxed)
                    );
                    checker
                })?
        };

        log::info!(
            "Pipeline started (queue capacity: {})",
            self.capacity
                .map_or_else(|| "unbounded".to_string(), |c| c.to_string())
        );

        Ok(PipelineHandle {
            sender: PacketSender {
                queue,
                epoch: Instant::now(),
            },
            worker: Some(worker),
            processed,
        })
    }
}

/// Final state returned by [`PipelineHandle::shutdown`].
pub struct PipelineReport<S: FrameSink> {
    /// Packets the worker checked
    pub processed: u64,
    /// Packets refused by a full queue
    pub dropped: u64,
    /// The checker with its statistics and sink
    pub checker: PacketChecker<S>,
}

/// Owner of a running pipeline.
pub struct PipelineHandle<S: FrameSink + 'static> {
    sender: PacketSender,
    worker: Option<JoinHandle<PacketChecker<S>>>,
    processed: Arc<AtomicU64>,
}

impl<S: FrameSink + 'static> PipelineHandle<S> {
    /// Push a packet with an explicit capture-clock offset.
    ///
    /// # Errors
    ///
    /// See [`PacketQueue::push`].
    pub fn push(&self, data: Vec<u8>, received_at: Duration) -> Result<()> {
        self.sender.push(data, received_at)
    }

    /// Push a packet stamped with the time since start.
    ///
    /// # Errors
    ///
    /// See [`PacketQueue::push`].
    pub fn push_now(&self, data: Vec<u8>) -> Result<()> {
        self.sender.push_now(data)
    }

    /// Producer handle for another thread.
    pub fn sender(&self) -> PacketSender {
        self.sender.clone()
    }

    /// Packets checked so far.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Packets refused by a full queue.
    pub fn dropped(&self) -> u64 {
        self.sender.queue.dropped()
    }

    /// Packets waiting for the worker.
    pub fn pending(&self) -> usize {
        self.sender.queue.len()
    }

    /// Stop, drain and join the worker.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::WorkerPanicked` if the worker panicked, and
    /// `PipelineError::Stopped` if it was already joined.
    pub fn shutdown(mut self) -> Result<PipelineReport<S>> {
        self.sender.stop();
        let worker = self.worker.take().ok_or(PipelineError::Stopped)?;
        let checker = worker.join().map_err(|_| PipelineError::WorkerPanicked)?;
        let report = PipelineReport {
            processed: self.processed(),
            dropped: self.dropped(),
            checker,
        };
        log::info!(
            "Pipeline stopped: {} packets checked, {} dropped",
            report.processed,
            report.dropped
        );
        Ok(report)
    }
}

impl<S: FrameSink + 'static> Drop for PipelineHandle<S> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.sender.stop();
            if worker.join().is_err() {
                log::error!("Checker worker panicked during drop");
            }
        }
    }
}
