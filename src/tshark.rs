//! Reader for `tshark` field output.
//!
//! Expects one USB transfer per line with these `-e` fields, separated by
//! `;` (`-E separator=;`):
//!
//! ```text
//! usb.transfer_type;frame.time_epoch;frame.len;usb.capdata;usb.iso.data;
//! usbvideo.format.index;usbvideo.frame.index;usbvideo.frame.width;
//! usbvideo.frame.height;usbvideo.subtype;usbvideo.frame.interval;
//! usbvideo.probe.maxVideoFrameSize;usbvideo.probe.maxPayloadTransferSize
//! ```
//!
//! Isochronous and bulk transfers become packets. Control transfers carrying
//! frame descriptors or a committed probe update the [`SharedConfig`].

use std::collections::BTreeMap;
use std::io::BufRead;
use std::time::Duration;
use thiserror::Error;

use crate::config::{FrameFormat, SharedConfig};
use crate::pipeline::{Packet, PacketSender, PipelineError};

/// Descriptor subtypes that are not frame descriptors.
const NON_FRAME_SUBTYPES: [u32; 5] = [1, 4, 6, 12, 16];

/// Frame interval unit, 100 ns.
const INTERVAL_UNITS_PER_SEC: u32 = 10_000_000;

/// Errors from parsing tshark output.
#[derive(Error, Debug)]
pub enum TsharkError {
    /// A numeric field could not be parsed.
    #[error("line {line}: invalid {field} '{value}'")]
    InvalidField {
        /// 1-based line number
        line: usize,
        /// Field name
        field: &'static str,
        /// Offending text
        value: String,
    },

    /// Reading the input failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for tshark parsing.
pub type Result<T> = std::result::Result<T, TsharkError>;

/// USB transfer type as printed by tshark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferType {
    Isochronous,
    Interrupt,
    Control,
    Bulk,
    Other,
}

impl TransferType {
    fn parse(s: &str) -> Self {
        match s.trim() {
            "0x00" => Self::Isochronous,
            "0x01" => Self::Interrupt,
            "0x02" => Self::Control,
            "0x03" => Self::Bulk,
            _ => Self::Other,
        }
    }
}

/// One tshark line split into its fields. Empty fields are `None`.
#[derive(Debug, Default)]
struct Fields<'a> {
    transfer_type: &'a str,
    time_epoch: Option<&'a str>,
    frame_len: Option<&'a str>,
    capdata: Option<&'a str>,
    isodata: Option<&'a str>,
    format_index: Option<&'a str>,
    frame_index: Option<&'a str>,
    widths: Option<&'a str>,
    heights: Option<&'a str>,
    subtypes: Option<&'a str>,
    interval: Option<&'a str>,
    max_frame: Option<&'a str>,
    max_payload: Option<&'a str>,
}

impl<'a> Fields<'a> {
    fn split(line: &'a str) -> Self {
        let tokens: Vec<&str> = line.trim_end_matches(['\r', '\n']).split(';').collect();
        let get = |i: usize| tokens.get(i).copied().map(str::trim).filter(|t| !t.is_empty());
        Self {
            transfer_type: get(0).unwrap_or(""),
            time_epoch: get(1),
            frame_len: get(2),
            capdata: get(3),
            isodata: get(4),
            format_index: get(5),
            frame_index: get(6),
            widths: get(7),
            heights: get(8),
            subtypes: get(9),
            interval: get(10),
            max_frame: get(11),
            max_payload: get(12),
        }
    }
}

/// Geometry of one frame descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDescriptor {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Descriptor subtype (5 yuyv, 7 mjpeg, 13 rgb, 17 h264)
    pub subtype: u32,
}

/// Decode hex bytes, ignoring `:` separators.
///
/// Decoding stops at the first invalid pair; bytes before it are kept.
pub fn decode_hex(text: &str) -> Vec<u8> {
    let digits: Vec<u8> = text.bytes().filter(|b| *b != b':').collect();
    let mut bytes = Vec::with_capacity(digits.len() / 2);
    for pair in digits.chunks(2) {
        let parsed = std::str::from_utf8(pair)
            .ok()
            .and_then(|s| u8::from_str_radix(s, 16).ok());
        match parsed {
            Some(byte) => bytes.push(byte),
            None => {
                log::warn!(
                    "Invalid hex '{}' after {} bytes, keeping the decoded prefix",
                    String::from_utf8_lossy(pair),
                    bytes.len()
                );
                break;
            }
        }
    }
    bytes
}

/// Stateful parser for tshark lines.
#[derive(Debug, Default)]
pub struct TsharkReader {
    line_number: usize,
    first_epoch: Option<f64>,
    last_at: Duration,
    bulk_max_len: usize,
    bulk_started: bool,
    bulk_buffer: Vec<u8>,
    formats: BTreeMap<u32, BTreeMap<u32, FrameDescriptor>>,
}

impl TsharkReader {
    /// Reader with no state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Known frame descriptors by format index, then frame index.
    pub fn formats(&self) -> &BTreeMap<u32, BTreeMap<u32, FrameDescriptor>> {
        &self.formats
    }

    /// Lines processed so far.
    pub fn line_number(&self) -> usize {
        self.line_number
    }

    /// Parse one line. Returns the packets it completes.
    ///
    /// Control transfers update `config` in place.
    ///
    /// # Errors
    ///
    /// Returns `TsharkError::InvalidField` for malformed numeric fields.
    pub fn process_line(&mut self, line: &str, config: &SharedConfig) -> Result<Vec<Packet>> {
        self.line_number += 1;
        let fields = Fields::split(line);

        if fields.capdata.is_none() && fields.isodata.is_none() && fields.format_index.is_none() {
            return Ok(Vec::new());
        }

        let at = self.timestamp(&fields)?;

        match TransferType::parse(fields.transfer_type) {
            TransferType::Isochronous => Ok(fields
                .isodata
                .map(|iso| {
                    iso.split(',')
                        .map(|chunk| Packet {
                            data: decode_hex(chunk),
                            received_at: at,
                        })
                        .collect()
                })
                .unwrap_or_default()),
            TransferType::Bulk => self.bulk(&fields, at),
            TransferType::Control => {
                self.control(&fields, config)?;
                Ok(Vec::new())
            }
            TransferType::Interrupt | TransferType::Other => Ok(Vec::new()),
        }
    }

    fn timestamp(&mut self, fields: &Fields<'_>) -> Result<Duration> {
        let Some(epoch) = fields.time_epoch else {
            return Ok(self.last_at);
        };
        let epoch: f64 = self.number(epoch, "frame.time_epoch")?;
        let first = *self.first_epoch.get_or_insert(epoch);
        self.last_at = Duration::try_from_secs_f64(epoch - first).unwrap_or(self.last_at);
        Ok(self.last_at)
    }

    /// Bulk transfers arrive in chunks of the endpoint's max length; a
    /// shorter chunk ends the payload.
    fn bulk(&mut self, fields: &Fields<'_>, at: Duration) -> Result<Vec<Packet>> {
        let frame_len: usize = match fields.frame_len {
            Some(len) => self.number(len, "frame.len")?,
            None => 0,
        };
        let data = fields.capdata.map(decode_hex).unwrap_or_default();

        if frame_len == self.bulk_max_len && self.bulk_started {
            self.bulk_buffer.extend_from_slice(&data);
            return Ok(Vec::new());
        }

        if frame_len > self.bulk_max_len {
            self.bulk_max_len = frame_len;
        }
        self.bulk_started = true;
        self.bulk_buffer.extend_from_slice(&data);
        Ok(vec![Packet {
            data: std::mem::take(&mut self.bulk_buffer),
            received_at: at,
        }])
    }

    fn control(&mut self, fields: &Fields<'_>, config: &SharedConfig) -> Result<()> {
        let format_indices = list(fields.format_index);
        let frame_indices = list(fields.frame_index);

        if let (Some(widths), Some(heights)) = (fields.widths, fields.heights) {
            self.record_descriptors(&format_indices, &frame_indices, widths, heights, fields.subtypes)?;
        }

        if let (Some(max_frame), Some(max_payload)) = (fields.max_frame, fields.max_payload) {
            let (Some(format), Some(frame)) = (format_indices.first(), frame_indices.first()) else {
                log::warn!("Line {}: probe without format/frame index", self.line_number);
                return Ok(());
            };
            let format: u32 = self.number(format, "format index")?;
            let frame: u32 = self.number(frame, "frame index")?;
            let max_frame: usize = self.number(max_frame, "max frame size")?;
            let max_payload: usize = self.number(max_payload, "max payload size")?;
            let interval: u32 = match fields.interval {
                Some(i) => self.number(i, "frame interval")?,
                None => 0,
            };

            let Some(descriptor) = self.formats.get(&format).and_then(|f| f.get(&frame)).copied() else {
                log::warn!(
                    "Line {}: no frame descriptor for format {} frame {}",
                    self.line_number,
                    format,
                    frame
                );
                return Ok(());
            };

            let mut stream = config.snapshot();
            stream.width = descriptor.width;
            stream.height = descriptor.height;
            stream.frame_format = match u8::try_from(descriptor.subtype) {
                Ok(subtype) => FrameFormat::from_subtype(subtype),
                Err(_) => {
                    log::warn!(
                        "Line {}: descriptor subtype {} out of range, assuming mjpeg",
                        self.line_number,
                        descriptor.subtype
                    );
                    FrameFormat::default()
                }
            };
            if interval > 0 {
                stream.fps = INTERVAL_UNITS_PER_SEC / interval;
            }
            stream.max_frame_size = max_frame;
            stream.max_payload_size = max_payload;
            config.configure(stream);
        }
        Ok(())
    }

    fn record_descriptors(
        &mut self,
        format_indices: &[&str],
        frame_indices: &[&str],
        widths: &str,
        heights: &str,
        subtypes: Option<&str>,
    ) -> Result<()> {
        let widths = list(Some(widths));
        let heights = list(Some(heights));
        let mut frame_subtypes = Vec::new();
        for s in list(subtypes) {
            let subtype: u32 = self.number(s, "subtype")?;
            if !NON_FRAME_SUBTYPES.contains(&subtype) {
                frame_subtypes.push(subtype);
            }
        }

        let mut group = 0usize;
        for (i, frame) in frame_indices.iter().enumerate() {
            if *frame == "1" && i != 0 {
                group += 1;
            }
            let (Some(format), Some(width), Some(height), Some(subtype)) = (
                format_indices.get(group),
                widths.get(i),
                heights.get(i),
                frame_subtypes.get(i),
            ) else {
                log::warn!(
                    "Line {}: descriptor list too short at entry {}",
                    self.line_number,
                    i
                );
                break;
            };
            let descriptor = FrameDescriptor {
                width: self.number(width, "frame width")?,
                height: self.number(height, "frame height")?,
                subtype: *subtype,
            };
            let format: u32 = self.number(format, "format index")?;
            let frame: u32 = self.number(frame, "frame index")?;
            log::debug!(
                "Descriptor format {} frame {}: {}x{} subtype {}",
                format,
                frame,
                descriptor.width,
                descriptor.height,
                descriptor.subtype
            );
            self.formats.entry(format).or_default().insert(frame, descriptor);
        }
        Ok(())
    }

    fn number<T: std::str::FromStr>(&self, value: &str, field: &'static str) -> Result<T> {
        value.trim().parse().map_err(|_| TsharkError::InvalidField {
            line: self.line_number,
            field,
            value: value.to_string(),
        })
    }
}

fn list(field: Option<&str>) -> Vec<&str> {
    field
        .map(|f| f.split(',').map(str::trim).collect())
        .unwrap_or_default()
}

/// Totals from [`run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TsharkSummary {
    /// Lines read
    pub lines: usize,
    /// Packets pushed into the pipeline
    pub packets: u64,
    /// Lines skipped because of malformed fields
    pub malformed: usize,
}

/// Read tshark lines from `reader` until EOF or pipeline stop.
///
/// Malformed lines are logged and skipped.
///
/// # Errors
///
/// Returns `TsharkError::Io` if reading fails.
pub fn run<R: BufRead>(reader: R, sender: &PacketSender, config: &SharedConfig) -> Result<TsharkSummary> {
    let mut parser = TsharkReader::new();
    let mut summary = TsharkSummary::default();

    for line in reader.lines() {
        let line = line?;
        summary.lines += 1;
        let packets = match parser.process_line(&line, config) {
            Ok(packets) => packets,
            Err(e) => {
                log::warn!("Skipping malformed tshark line: {}", e);
                summary.malformed += 1;
                continue;
            }
        };
        for packet in packets {
            match sender.push(packet.data, packet.received_at) {
                Ok(()) => summary.packets += 1,
                Err(PipelineError::QueueFull) => {}
                Err(e) => {
                    log::info!("Pipeline closed, stopping tshark input: {}", e);
                    return Ok(summary);
                }
            }
        }
    }

    log::info!(
        "tshark input finished: {} lines, {} packets",
        summary.lines,
        summary.packets
    );
    Ok(summary)
}
