//! MJPEG frame demultiplexer.
//!
//! The rover pushes an endless body of back-to-back JPEG images with no length
//! prefix and no multipart framing we can rely on. `FrameDemuxer` accumulates
//! whatever chunk sizes the network hands us and cuts complete images out of
//! the stream using the JPEG SOI (`FF D8`) and EOI (`FF D9`) markers.
//!
//! Memory is bounded by `max_buffer_bytes`. A stalled or corrupt stream that
//! never closes a frame triggers a resync instead of unbounded growth.
//!
//! Scanning is incremental: while a frame is pending, the end-marker search
//! resumes where the previous chunk left off, so each byte is examined a
//! bounded number of times however long the frame grows.

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Largest JPEG we expect from the camera.
pub const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

/// Default buffer cap: room for one oversized frame plus a partial successor.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = MAX_JPEG_BYTES * 2;

/// One complete encoded image cut from the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Absolute stream offset of the SOI marker.
    pub offset: u64,
    /// Bytes from SOI through EOI inclusive.
    pub data: Vec<u8>,
}

impl Frame {
    /// Absolute stream offset one past the EOI marker.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DemuxStats {
    pub frames_emitted: u64,
    pub bytes_discarded: u64,
    pub resyncs: u64,
}

pub struct FrameDemuxer {
    buffer: Vec<u8>,
    /// Absolute stream offset of `buffer[0]`.
    base_offset: u64,
    /// Where the EOI search resumes when `buffer` starts with SOI.
    eoi_scan_from: usize,
    max_buffer_bytes: usize,
    stats: DemuxStats,
}

impl FrameDemuxer {
    pub fn new() -> Self {
        Self::with_max_buffer(DEFAULT_MAX_BUFFER_BYTES)
    }

    pub fn with_max_buffer(max_buffer_bytes: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(64 * 1024),
            base_offset: 0,
            eoi_scan_from: SOI.len(),
            max_buffer_bytes: max_buffer_bytes.max(SOI.len()),
            stats: DemuxStats::default(),
        }
    }

    /// Append a chunk and return every frame it completes, oldest first.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            if !self.buffer.starts_with(&SOI) {
                self.trim_leading_noise();
                if !self.buffer.starts_with(&SOI) {
                    break;
                }
                self.eoi_scan_from = SOI.len();
            }
            match find_marker(&self.buffer, EOI, self.eoi_scan_from.max(SOI.len())) {
                Some(eoi) => {
                    let end = eoi + EOI.len();
                    frames.push(Frame {
                        offset: self.base_offset,
                        data: self.buffer[..end].to_vec(),
                    });
                    self.consume(end, false);
                    self.eoi_scan_from = SOI.len();
                }
                None => {
                    // The last byte may be the first half of an EOI.
                    self.eoi_scan_from = self.buffer.len().saturating_sub(1);
                    break;
                }
            }
        }
        self.stats.frames_emitted += frames.len() as u64;

        self.enforce_cap();
        frames
    }

    /// Bytes currently held waiting for a frame to complete.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> DemuxStats {
        self.stats
    }

    /// Forget everything buffered, e.g. when a stream is restarted.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.base_offset = 0;
        self.eoi_scan_from = SOI.len();
    }

    // Bytes ahead of the first SOI can never become part of a frame. Without an
    // SOI only the last byte is kept, as it may be the first half of a marker.
    fn trim_leading_noise(&mut self) {
        let keep_from = match find_marker(&self.buffer, SOI, 0) {
            Some(start) => start,
            None => self.buffer.len().saturating_sub(1),
        };
        self.consume(keep_from, true);
    }

    fn enforce_cap(&mut self) {
        if self.buffer.len() <= self.max_buffer_bytes {
            return;
        }
        self.stats.resyncs += 1;
        let latest_start = rfind_marker(&self.buffer, SOI).filter(|&start| start > 0);
        if let Some(start) = latest_start {
            self.consume(start, true);
        }
        if latest_start.is_none() || self.buffer.len() > self.max_buffer_bytes {
            let drop = self.buffer.len().saturating_sub(1);
            self.consume(drop, true);
        }
        // Everything kept was already searched for an EOI.
        self.eoi_scan_from = self.buffer.len().saturating_sub(1);
        log::warn!(
            "mjpeg buffer exceeded {} bytes without a complete frame; resynchronized",
            self.max_buffer_bytes
        );
    }

    fn consume(&mut self, len: usize, discarded: bool) {
        if len == 0 {
            return;
        }
        self.buffer.drain(..len);
        self.base_offset += len as u64;
        if discarded {
            self.stats.bytes_discarded += len as u64;
        }
    }
}

impl Default for FrameDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

fn find_marker(buffer: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(2)
        .position(|pair| pair == marker)
        .map(|pos| pos + from)
}

fn rfind_marker(buffer: &[u8], marker: [u8; 2]) -> Option<usize> {
    buffer.windows(2).rposition(|pair| pair == marker)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(payload_len: usize, fill: u8) -> Vec<u8> {
        let mut bytes = SOI.to_vec();
        bytes.extend(std::iter::repeat(fill).take(payload_len));
        bytes.extend_from_slice(&EOI);
        bytes
    }

    #[test]
    fn single_chunk_frame() {
        let mut demux = FrameDemuxer::new();
        let mut chunk = b"--boundary\r\n".to_vec();
        let image = jpeg(32, 0x11);
        chunk.extend_from_slice(&image);
        chunk.extend_from_slice(b"\r\n");

        let frames = demux.feed(&chunk);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, image);
        assert_eq!(frames[0].offset, 12);
        assert_eq!(demux.stats().frames_emitted, 1);
    }

    #[test]
    fn frame_split_across_two_chunks() {
        let mut demux = FrameDemuxer::new();
        let mut stream = b"...".to_vec();
        let image = jpeg(512, 0x42);
        stream.extend_from_slice(&image);
        stream.extend_from_slice(b"...");
        let (first, second) = stream.split_at(3 + 200);

        assert!(demux.feed(first).is_empty());
        let frames = demux.feed(second);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].offset, 3);
        assert_eq!(frames[0].end_offset(), 3 + 516);
        assert_eq!(frames[0].data, image);
    }

    #[test]
    fn marker_split_between_chunks() {
        let mut demux = FrameDemuxer::new();
        let image = jpeg(8, 0x01);
        // Split inside the SOI marker, then inside the EOI marker.
        assert!(demux.feed(&image[..1]).is_empty());
        assert!(demux.feed(&image[1..image.len() - 1]).is_empty());
        let frames = demux.feed(&image[image.len() - 1..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, image);
    }

    #[test]
    fn two_frames_in_one_chunk() {
        let mut demux = FrameDemuxer::new();
        let a = jpeg(10, 0xAA);
        let b = jpeg(20, 0xBB);
        let mut chunk = a.clone();
        chunk.extend_from_slice(b"xx");
        chunk.extend_from_slice(&b);

        let frames = demux.feed(&chunk);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, a);
        assert_eq!(frames[1].data, b);
        assert!(frames[0].end_offset() <= frames[1].offset);
        assert_eq!(demux.buffered(), 0);
    }

    #[test]
    fn start_without_end_buffers_and_never_emits() {
        let mut demux = FrameDemuxer::new();
        let mut first = SOI.to_vec();
        first.extend_from_slice(&[0x10; 100]);
        assert!(demux.feed(&first).is_empty());
        for _ in 0..10 {
            assert!(demux.feed(&[0x20; 100]).is_empty());
        }
        assert_eq!(demux.buffered(), 1102);
        assert_eq!(demux.stats().frames_emitted, 0);
    }

    #[test]
    fn no_markers_emits_nothing_and_keeps_one_byte() {
        let mut demux = FrameDemuxer::new();
        assert!(demux.feed(&[0x00; 64]).is_empty());
        assert!(demux.feed(&[0xFF]).is_empty());
        assert_eq!(demux.buffered(), 1);
        // The retained 0xFF pairs with the next chunk to form SOI.
        let mut rest = vec![0xD8, 0x33];
        rest.extend_from_slice(&EOI);
        let frames = demux.feed(&rest);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].offset, 64);
    }

    #[test]
    fn frames_advance_monotonically_for_any_chunking() {
        let mut stream = Vec::new();
        for i in 0..6u8 {
            stream.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            stream.extend_from_slice(&jpeg(37 * (i as usize + 1), i));
        }
        for chunk_size in [1, 2, 3, 7, 64, 4096] {
            let mut demux = FrameDemuxer::new();
            let frames: Vec<Frame> = stream
                .chunks(chunk_size)
                .flat_map(|chunk| demux.feed(chunk))
                .collect();
            assert_eq!(frames.len(), 6, "chunk size {chunk_size}");
            let mut last_end = 0;
            for frame in &frames {
                assert!(frame.offset >= last_end);
                let start = frame.offset as usize;
                assert_eq!(&stream[start..frame.end_offset() as usize], &frame.data[..]);
                last_end = frame.end_offset();
            }
        }
    }

    #[test]
    fn overflow_resyncs_on_latest_start_marker() {
        let mut demux = FrameDemuxer::with_max_buffer(64);
        let mut stalled = SOI.to_vec();
        stalled.extend_from_slice(&[0x01; 60]);
        assert!(demux.feed(&stalled).is_empty());

        let mut next = SOI.to_vec();
        next.extend_from_slice(&[0x02; 4]);
        assert!(demux.feed(&next).is_empty());
        assert_eq!(demux.stats().resyncs, 1);
        assert_eq!(demux.buffered(), 6);

        let frames = demux.feed(&EOI);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].offset, 62);
        assert_eq!(&frames[0].data[2..6], &[0x02; 4]);
    }

    #[test]
    fn overflow_without_new_start_clears_buffer() {
        let mut demux = FrameDemuxer::with_max_buffer(32);
        let mut stalled = SOI.to_vec();
        stalled.extend_from_slice(&[0x07; 40]);
        assert!(demux.feed(&stalled).is_empty());
        assert_eq!(demux.buffered(), 1);
        assert_eq!(demux.stats().bytes_discarded, 41);

        let image = jpeg(3, 0x09);
        let frames = demux.feed(&image);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, image);
    }

    #[test]
    fn long_pending_frame_is_scanned_incrementally() {
        let mut demux = FrameDemuxer::new();
        assert!(demux.feed(&SOI).is_empty());
        let filler = [0x5A; 4096];
        let started = std::time::Instant::now();
        for _ in 0..1024 {
            assert!(demux.feed(&filler).is_empty());
        }
        // 4 MiB in 4 KiB chunks; rescanning from the start each time would
        // take orders of magnitude longer than this.
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
        assert_eq!(demux.buffered(), 2 + 4 * 1024 * 1024);

        let mut tail = vec![0xFF];
        let frames = demux.feed(&tail);
        assert!(frames.is_empty());
        tail[0] = 0xD9;
        let frames = demux.feed(&tail);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.len(), 2 + 4 * 1024 * 1024 + 2);
        assert_eq!(demux.buffered(), 0);
    }
}
