//! JSON-lines persistence of frame records and statistics.
//!
//! Each line is one object tagged with `"kind"`: `"frame"` or `"stats"`.
//! Writes never fail the checker; I/O errors are logged and the sink keeps
//! going.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::frame::FrameRecord;
use crate::sink::FrameSink;
use crate::stats::StatsSnapshot;

/// One line of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogLine {
    /// A closed frame
    Frame(FrameRecord),
    /// Interval statistics
    Stats(StatsSnapshot),
}

/// [`FrameSink`] that appends JSON lines to a writer.
pub struct FrameLogSink<W: Write + Send> {
    writer: W,
    lines: u64,
    errors: u64,
}

impl FrameLogSink<BufWriter<File>> {
    /// Create (truncate) a log file.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be created.
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = File::create(path)?;
        log::info!("Writing frame log to {}", path.display());
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> FrameLogSink<W> {
    /// Log into `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            lines: 0,
            errors: 0,
        }
    }

    /// Lines written.
    pub fn lines(&self) -> u64 {
        self.lines
    }

    /// Failed writes.
    pub fn errors(&self) -> u64 {
        self.errors
    }

    /// Flush and return the writer.
    pub fn into_inner(mut self) -> W {
        if let Err(e) = self.writer.flush() {
            log::warn!("Frame log flush failed: {}", e);
        }
        self.writer
    }

    fn write_line(&mut self, line: &LogLine) {
        let result = serde_json::to_writer(&mut self.writer, line)
            .map_err(std::io::Error::from)
            .and_then(|()| self.writer.write_all(b"\n"));
        match result {
            Ok(()) => self.lines += 1,
            Err(e) => {
                self.errors += 1;
                if self.errors == 1 {
                    log::warn!("Frame log write failed: {}", e);
                }
            }
        }
    }
}

impl<W: Write + Send> FrameSink for FrameLogSink<W> {
    fn emit_frame(&mut self, record: &FrameRecord) {
        self.write_line(&LogLine::Frame(record.clone()));
    }

    fn emit_stats(&mut self, stats: &StatsSnapshot) {
        self.write_line(&LogLine::Stats(stats.clone()));
        if let Err(e) = self.writer.flush() {
            log::warn!("Frame log flush failed: {}", e);
        }
    }
}

/// Parse a frame log back into its lines.
///
/// # Errors
///
/// Returns the first JSON error encountered.
pub fn parse_log(text: &str) -> serde_json::Result<Vec<LogLine>> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(serde_json::from_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::frame::{Closure, Frame};
    use crate::stats::Statistics;

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("disk full"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_lines_are_tagged() {
        let mut sink = FrameLogSink::new(Vec::new());
        let record = Frame::new(1, false, &StreamConfig::default()).to_record(Closure::EofObserved);
        sink.emit_frame(&record);
        sink.emit_stats(&Statistics::new().snapshot());

        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert!(text.lines().next().unwrap().contains("\"kind\":\"frame\""));

        let lines = parse_log(&text).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], LogLine::Frame(record));
        assert!(matches!(lines[1], LogLine::Stats(_)));
    }

    #[test]
    fn test_write_errors_are_swallowed() {
        let mut sink = FrameLogSink::new(FailingWriter);
        let record = Frame::new(1, false, &StreamConfig::default()).to_record(Closure::EofObserved);
        sink.emit_frame(&record);
        sink.emit_frame(&record);
        assert_eq!(sink.lines(), 0);
        assert_eq!(sink.errors(), 2);
    }

    #[test]
    fn test_create_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.jsonl");
        let mut sink = FrameLogSink::create(&path).unwrap();
        sink.emit_stats(&Statistics::new().snapshot());
        drop(sink.into_inner());

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(parse_log(&text).unwrap().len(), 1);
    }
}
