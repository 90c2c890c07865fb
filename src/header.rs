//! UVC payload header codec
//!
//! Every UVC payload starts with a variable-length header:
//!
//! ```text
//! byte 0      HLE   header length in bytes (2..=12)
//! byte 1      BFH   bit field header
//!                     bit 0 FID  frame identifier, toggles per frame
//!                     bit 1 EOF  end of frame
//!                     bit 2 PTS  presentation time stamp present
//!                     bit 3 SCR  source clock reference present
//!                     bit 4 RES  reserved
//!                     bit 5 STI  still image
//!                     bit 6 ERR  error
//!                     bit 7 EOH  end of header
//! bytes 2..6  PTS   u32 little-endian (only when the PTS bit is set)
//! next 6      SCR   u32 STC, then 11-bit SOF token + 5 reserved bits (only when SCR is set)
//! ```
//!
//! Parsing never fails. Malformed headers still produce a [`PayloadHeader`];
//! it is up to [`crate::validator`] to judge them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Frame identifier bit
pub const BFH_FID: u8 = 0x01;
/// End of frame bit
pub const BFH_EOF: u8 = 0x02;
/// Presentation time stamp present
pub const BFH_PTS: u8 = 0x04;
/// Source clock reference present
pub const BFH_SCR: u8 = 0x08;
/// Reserved bit (payload specific)
pub const BFH_RES: u8 = 0x10;
/// Still image bit
pub const BFH_STI: u8 = 0x20;
/// Error bit
pub const BFH_ERR: u8 = 0x40;
/// End of header bit
pub const BFH_EOH: u8 = 0x80;

/// Smallest legal header length (HLE + BFH)
pub const MIN_HEADER_LEN: u8 = 2;
/// Largest legal header length (HLE + BFH + PTS + SCR)
pub const MAX_HEADER_LEN: u8 = 12;

const PTS_LEN: usize = 4;
const SCR_LEN: usize = 6;
/// Bytes that must remain before the SCR is read.
const SCR_READ_WINDOW: usize = 8;
const SCR_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// Decoded UVC payload header.
///
/// Absent fields are zero. `scr` holds the 48-bit SCR in its low bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadHeader {
    /// Header length as found on the wire
    pub hle: u8,
    /// Raw bit field header
    pub bfh: u8,
    /// Presentation time stamp
    pub pts: u32,
    /// Source clock reference (48 bits)
    pub scr: u64,
}

impl PayloadHeader {
    /// Decode a header from the start of a payload buffer.
    ///
    /// Returns a zero header for buffers shorter than two bytes. PTS and SCR
    /// are only read when their flag is set and enough bytes remain; the SCR
    /// check is made relative to the offset after the PTS.
    pub fn parse(bytes: &[u8]) -> Self {
        if bytes.len() < usize::from(MIN_HEADER_LEN) {
            return Self::default();
        }

        let mut header = Self {
            hle: bytes[0],
            bfh: bytes[1],
            pts: 0,
            scr: 0,
        };

        let mut offset = 2;
        if header.has_pts() && offset + PTS_LEN <= bytes.len() {
            let mut pts = [0u8; PTS_LEN];
            pts.copy_from_slice(&bytes[offset..offset + PTS_LEN]);
            header.pts = u32::from_le_bytes(pts);
            offset += PTS_LEN;
        }

        if header.has_scr() && offset + SCR_READ_WINDOW <= bytes.len() {
            let mut scr = [0u8; 8];
            scr[..SCR_LEN].copy_from_slice(&bytes[offset..offset + SCR_LEN]);
            header.scr = u64::from_le_bytes(scr) & SCR_MASK;
        }

        header
    }

    /// Encode the header into its wire representation.
    ///
    /// Only fields whose flag is set are written, so the output length is the
    /// expected length for the flags, which may differ from `hle` for
    /// deliberately malformed headers.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(usize::from(MAX_HEADER_LEN));
        bytes.push(self.hle);
        bytes.push(self.bfh);
        if self.has_pts() {
            bytes.extend_from_slice(&self.pts.to_le_bytes());
        }
        if self.has_scr() {
            bytes.extend_from_slice(&(self.scr & SCR_MASK).to_le_bytes()[..SCR_LEN]);
        }
        bytes
    }

    /// Minimal header with EOH set and the given FID/EOF bits.
    pub fn new(fid: bool, eof: bool) -> Self {
        let mut bfh = BFH_EOH;
        if fid {
            bfh |= BFH_FID;
        }
        if eof {
            bfh |= BFH_EOF;
        }
        Self {
            hle: MIN_HEADER_LEN,
            bfh,
            pts: 0,
            scr: 0,
        }
    }

    /// Attach a PTS and fix up the header length.
    pub fn with_pts(mut self, pts: u32) -> Self {
        self.bfh |= BFH_PTS;
        self.pts = pts;
        self.hle = self.expected_len();
        self
    }

    /// Attach an SCR built from an STC value and SOF token and fix up the header length.
    pub fn with_scr(mut self, stc: u32, sof_token: u16) -> Self {
        self.bfh |= BFH_SCR;
        self.scr = u64::from(stc) | (u64::from(sof_token & 0x07FF) << 32);
        self.hle = self.expected_len();
        self
    }

    /// Set extra BFH bits.
    pub fn with_flags(mut self, flags: u8) -> Self {
        self.bfh |= flags;
        self
    }

    /// Override the header length.
    pub fn with_len(mut self, hle: u8) -> Self {
        self.hle = hle;
        self
    }

    /// Frame identifier
    pub fn fid(&self) -> bool {
        self.bfh & BFH_FID != 0
    }

    /// End of frame
    pub fn eof(&self) -> bool {
        self.bfh & BFH_EOF != 0
    }

    /// PTS flag
    pub fn has_pts(&self) -> bool {
        self.bfh & BFH_PTS != 0
    }

    /// SCR flag
    pub fn has_scr(&self) -> bool {
        self.bfh & BFH_SCR != 0
    }

    /// Reserved bit
    pub fn reserved(&self) -> bool {
        self.bfh & BFH_RES != 0
    }

    /// Still image bit
    pub fn still_image(&self) -> bool {
        self.bfh & BFH_STI != 0
    }

    /// Error bit
    pub fn error(&self) -> bool {
        self.bfh & BFH_ERR != 0
    }

    /// End of header bit
    pub fn end_of_header(&self) -> bool {
        self.bfh & BFH_EOH != 0
    }

    /// Source time clock, the low 32 bits of the SCR.
    pub fn stc(&self) -> u32 {
        (self.scr & 0xFFFF_FFFF) as u32
    }

    /// 11-bit USB start-of-frame token carried in the SCR.
    pub fn sof_token(&self) -> u16 {
        ((self.scr >> 32) & 0x07FF) as u16
    }

    /// Header length implied by the PTS/SCR flags: 2, 6, 8 or 12.
    pub fn expected_len(&self) -> u8 {
        match (self.has_pts(), self.has_scr()) {
            (true, true) => 12,
            (true, false) => 6,
            (false, true) => 8,
            (false, false) => 2,
        }
    }

    /// Whether this came from real bytes (a zero header has HLE 0).
    pub fn is_present(&self) -> bool {
        self.hle != 0
    }

    /// Number of payload bytes following the header in a buffer of `total_len` bytes.
    pub fn payload_len(&self, total_len: usize) -> usize {
        total_len.saturating_sub(usize::from(self.hle))
    }
}

impl fmt::Display for PayloadHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HLE={} FID={} EOF={} PTS={} SCR={} RES={} STI={} ERR={} EOH={}",
            self.hle,
            u8::from(self.fid()),
            u8::from(self.eof()),
            u8::from(self.has_pts()),
            u8::from(self.has_scr()),
            u8::from(self.reserved()),
            u8::from(self.still_image()),
            u8::from(self.error()),
            u8::from(self.end_of_header()),
        )?;
        if self.has_pts() {
            write!(f, " pts=0x{:08x}", self.pts)?;
        }
        if self.has_scr() {
            write!(f, " stc=0x{:08x} sof={}", self.stc(), self.sof_token())?;
        }
        Ok(())
    }
}
