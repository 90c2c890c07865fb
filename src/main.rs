//! `uvc-inspect` command line entry point
//!
//! Feeds a recorded capture or a tshark dump through the checker pipeline and
//! reports per-interval statistics.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use uvc_inspector::frame_log::FrameLogSink;
use uvc_inspector::pipeline::PacketSender;
use uvc_inspector::replay::{PacketReplay, ReplayConfig};
use uvc_inspector::sink::{LogSink, MultiSink};
use uvc_inspector::{tshark, CheckerOptions, PacketChecker, Pipeline, SharedConfig, StreamConfig};

/// Check a UVC payload stream for header and framing errors
#[derive(Parser, Debug)]
#[command(name = "uvc-inspect")]
#[command(version, about, long_about = None)]
struct Args {
    /// Replay a capture file recorded by the capture module
    #[arg(short, long, conflicts_with = "tshark")]
    capture: Option<PathBuf>,

    /// Read tshark field lines from stdin
    #[arg(short, long)]
    tshark: bool,

    /// Stream configuration as JSON (overrides capture metadata)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write frame records and statistics as JSON lines
    #[arg(long)]
    frame_log: Option<PathBuf>,

    /// Bound the packet queue; 0 keeps it unbounded
    #[arg(short, long, default_value = "0")]
    queue_capacity: usize,

    /// Replay speed multiplier; 0 replays as fast as possible
    #[arg(short, long, default_value = "1.0")]
    speed: f64,

    /// Loop the capture until interrupted
    #[arg(long = "loop")]
    loop_playback: bool,
}

enum Input {
    Capture(PacketReplay),
    Tshark,
}

fn main() -> Result<()> {
    uvc_inspector::init_logging();
    let args = Args::parse();

    let input = match (&args.capture, args.tshark) {
        (Some(path), _) => {
            let mut replay = PacketReplay::load(path)
                .with_context(|| format!("failed to load capture {}", path.display()))?;
            replay.set_config(ReplayConfig {
                speed: args.speed,
                loop_playback: args.loop_playback,
            });
            Input::Capture(replay)
        }
        (None, true) => Input::Tshark,
        (None, false) => bail!("nothing to inspect: pass --capture <file> or --tshark"),
    };

    let stream = match (&args.config, &input) {
        (Some(path), _) => StreamConfig::from_json_file(path)
            .with_context(|| format!("failed to read stream config {}", path.display()))?,
        (None, Input::Capture(replay)) => replay.stream_config().unwrap_or_default(),
        (None, Input::Tshark) => StreamConfig::default(),
    };
    log::info!(
        "Stream: {}x{} {} @ {} fps, max frame {} bytes, max payload {} bytes",
        stream.width,
        stream.height,
        stream.frame_format,
        stream.fps,
        stream.max_frame_size,
        stream.max_payload_size
    );
    let shared = SharedConfig::new(stream);

    let mut sink = MultiSink::new().with(LogSink);
    if let Some(path) = &args.frame_log {
        let log_sink = FrameLogSink::create(path)
            .with_context(|| format!("failed to create frame log {}", path.display()))?;
        sink = sink.with(log_sink);
    }

    let checker = PacketChecker::new(CheckerOptions::from_env(), sink);
    let handle = Pipeline::new(checker, shared.clone())
        .with_capacity(args.queue_capacity)
        .spawn()
        .context("failed to start checker pipeline")?;

    let (done_tx, done_rx) = mpsc::channel::<()>();
    spawn_signal_handler(handle.sender(), done_tx.clone())?;
    spawn_input(input, handle.sender(), shared, done_tx)?;

    // Either the input ran dry or Ctrl-C was pressed.
    let _ = done_rx.recv();

    let report = handle.shutdown().context("checker pipeline failed")?;
    log::info!(
        "Processed {} packets ({} dropped at the queue)",
        report.processed,
        report.dropped
    );
    log::info!("Final statistics:\n{}", report.checker.snapshot());
    Ok(())
}

fn spawn_input(input: Input, sender: PacketSender, shared: SharedConfig, done: mpsc::Sender<()>) -> Result<()> {
    thread::Builder::new()
        .name("uvc-input".to_string())
        .spawn(move || {
            match input {
                Input::Capture(mut replay) => {
                    let result = replay.start(sender).and_then(|()| replay.wait());
                    match result {
                        Ok(summary) => log::info!(
                            "Replay finished: {} sent, {} refused{}",
                            summary.sent,
                            summary.refused,
                            if summary.interrupted { " (interrupted)" } else { "" }
                        ),
                        Err(e) => log::error!("Replay failed: {}", e),
                    }
                }
                Input::Tshark => {
                    let stdin = std::io::stdin();
                    let reader: Box<dyn BufRead> = Box::new(stdin.lock());
                    if let Err(e) = tshark::run(reader, &sender, &shared) {
                        log::error!("tshark input failed: {}", e);
                    }
                }
            }
            let _ = done.send(());
        })
        .context("failed to start input thread")?;
    Ok(())
}

fn spawn_signal_handler(sender: PacketSender, done: mpsc::Sender<()>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;

    thread::Builder::new()
        .name("uvc-signal".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    log::warn!("Cannot listen for Ctrl-C: {}", e);
                    return;
                }
                log::info!("Interrupted, shutting down");
                sender.stop();
                let _ = done.send(());
            });
        })
        .context("failed to start signal thread")?;
    Ok(())
}
