//! Synthetic UVC payload streams
//!
//! Builds packets the way a camera would send them: each frame is split into
//! payloads of at most `max_payload_size` bytes, every payload carries a
//! header, the FID bit toggles between frames and the last payload of a frame
//! has EOF set. Faults can be injected per frame to exercise the validator.

use std::time::Duration;

use crate::header::{PayloadHeader, BFH_ERR, BFH_RES};

/// Fault to inject into the next generated frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Clear EOF on the last payload
    DropEof,
    /// Set the error bit on the payload at this index
    ErrorBit(usize),
    /// Keep the FID of the previous frame
    RepeatFid,
    /// Corrupt the header length of the payload at this index
    BadHeaderLen(usize, u8),
    /// Set the reserved bit on the payload at this index
    ReservedBit(usize),
    /// Insert an empty (header-only) packet after the payload at this index
    EmptyAfter(usize),
}

/// A generated packet and its receive offset.
#[derive(Debug, Clone)]
pub struct GeneratedPacket {
    /// Wire bytes: header followed by payload
    pub data: Vec<u8>,
    /// Offset from stream start
    pub at: Duration,
}

/// Generator for synthetic payload streams
#[derive(Debug)]
pub struct StreamGenerator {
    max_payload_size: usize,
    current_fid: bool,
    fps: u32,
    clock_frequency: u32,
    pts_enabled: bool,
    scr_enabled: bool,
    frames: u64,
    fill: u8,
}

impl StreamGenerator {
    /// Create a generator splitting frames at `max_payload_size` bytes.
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            max_payload_size: max_payload_size.max(1),
            current_fid: true,
            fps: 30,
            clock_frequency: 48_000_000,
            pts_enabled: false,
            scr_enabled: false,
            frames: 0,
            fill: 0x80,
        }
    }

    /// Frame rate used for timestamps.
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps.max(1);
        self
    }

    /// Attach a PTS to every payload.
    pub fn with_pts(mut self, clock_frequency: u32) -> Self {
        self.pts_enabled = true;
        self.clock_frequency = clock_frequency;
        self
    }

    /// Attach an SCR to every payload.
    pub fn with_scr(mut self) -> Self {
        self.scr_enabled = true;
        self
    }

    /// Frames generated so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Time at which the next frame starts.
    pub fn next_frame_time(&self) -> Duration {
        frame_time(self.frames, self.fps)
    }

    /// Generate one frame of `size` bytes.
    pub fn frame(&mut self, size: usize) -> Vec<GeneratedPacket> {
        self.frame_with(size, None)
    }

    /// Generate one frame of `size` bytes with an optional fault.
    pub fn frame_with(&mut self, size: usize, fault: Option<Fault>) -> Vec<GeneratedPacket> {
        if fault != Some(Fault::RepeatFid) {
            self.current_fid = !self.current_fid;
        }

        let start = self.next_frame_time();
        let pts = self.pts_for(self.frames);
        let data: Vec<u8> = (0..size).map(|i| self.fill.wrapping_add(i as u8)).collect();
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[][..]]
        } else {
            data.chunks(self.max_payload_size).collect()
        };
        let last = chunks.len() - 1;

        let mut packets = Vec::with_capacity(chunks.len() + 1);
        for (index, chunk) in chunks.into_iter().enumerate() {
            let eof = index == last && fault != Some(Fault::DropEof);
            let mut header = PayloadHeader::new(self.current_fid, eof);
            if self.pts_enabled {
                header = header.with_pts(pts);
            }
            if self.scr_enabled {
                header = header.with_scr(pts.wrapping_add(index as u32), (self.frames & 0x07FF) as u16);
            }
            match fault {
                Some(Fault::ErrorBit(i)) if i == index => header = header.with_flags(BFH_ERR),
                Some(Fault::ReservedBit(i)) if i == index => header = header.with_flags(BFH_RES),
                Some(Fault::BadHeaderLen(i, hle)) if i == index => header = header.with_len(hle),
                _ => {}
            }

            let mut bytes = header.encode();
            bytes.extend_from_slice(chunk);
            let at = start + Duration::from_micros(index as u64 * 100);
            packets.push(GeneratedPacket { data: bytes, at });

            if fault == Some(Fault::EmptyAfter(index)) {
                packets.push(GeneratedPacket {
                    data: vec![0, 0],
                    at: at + Duration::from_micros(50),
                });
            }
        }

        self.frames += 1;
        packets
    }

    /// Generate `count` clean frames of `size` bytes.
    pub fn frames_of(&mut self, count: usize, size: usize) -> Vec<GeneratedPacket> {
        (0..count).flat_map(|_| self.frame(size)).collect()
    }

    fn pts_for(&self, frame: u64) -> u32 {
        let ticks = u64::from(self.clock_frequency) * frame / u64::from(self.fps);
        ticks as u32
    }
}

/// Start time of frame `n` at `fps`.
pub fn frame_time(n: u64, fps: u32) -> Duration {
    Duration::from_micros(n * 1_000_000 / u64::from(fps.max(1)))
}

/// Size of an uncompressed 2-byte-per-pixel frame.
pub fn yuyv_frame_size(width: u32, height: u32) -> usize {
    width as usize * height as usize * 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packetize_small_frame() {
        let mut gen = StreamGenerator::new(1024);
        let packets = gen.frame(100);
        assert_eq!(packets.len(), 1);

        let header = PayloadHeader::parse(&packets[0].data);
        assert!(header.eof());
        assert_eq!(packets[0].data.len(), 102);
    }

    #[test]
    fn test_packetize_large_frame() {
        let mut gen = StreamGenerator::new(1000);
        let packets = gen.frame(2500);
        assert_eq!(packets.len(), 3);

        let eofs: Vec<bool> = packets.iter().map(|p| PayloadHeader::parse(&p.data).eof()).collect();
        assert_eq!(eofs, vec![false, false, true]);
        assert_eq!(packets[2].data.len(), 2 + 500);
    }

    #[test]
    fn test_fid_toggles_between_frames() {
        let mut gen = StreamGenerator::new(1024);
        let first = gen.frame(10);
        let second = gen.frame(10);
        let third = gen.frame_with(10, Some(Fault::RepeatFid));

        let fid = |p: &GeneratedPacket| PayloadHeader::parse(&p.data).fid();
        assert_ne!(fid(&first[0]), fid(&second[0]));
        assert_eq!(fid(&second[0]), fid(&third[0]));
    }

    #[test]
    fn test_pts_and_scr_set_header_length() {
        let mut gen = StreamGenerator::new(1024).with_pts(1_000).with_scr();
        gen.frame(4);
        let packets = gen.frame(4);
        let header = PayloadHeader::parse(&packets[0].data);
        assert_eq!(header.hle, 12);
        assert!(header.has_pts() && header.has_scr());
        assert_eq!(header.pts, 1_000 / 30);
    }

    #[test]
    fn test_faults() {
        let mut gen = StreamGenerator::new(4);
        let dropped = gen.frame_with(8, Some(Fault::DropEof));
        assert!(dropped.iter().all(|p| !PayloadHeader::parse(&p.data).eof()));

        let err = gen.frame_with(8, Some(Fault::ErrorBit(1)));
        assert!(PayloadHeader::parse(&err[1].data).error());

        let bad = gen.frame_with(8, Some(Fault::BadHeaderLen(0, 13)));
        assert_eq!(bad[0].data[0], 13);

        let empty = gen.frame_with(8, Some(Fault::EmptyAfter(0)));
        assert_eq!(empty.len(), 3);
        assert_eq!(empty[1].data, vec![0, 0]);
    }

    #[test]
    fn test_timestamps_follow_fps() {
        let mut gen = StreamGenerator::new(1024).with_fps(10);
        let packets = gen.frames_of(3, 10);
        assert_eq!(packets[2].at, Duration::from_millis(200));
        assert_eq!(yuyv_frame_size(1280, 720), 1_843_200);
    }
}
