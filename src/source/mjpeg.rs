//! Incremental splitter for HTTP motion-JPEG bodies.
//!
//! Chunk boundaries from the network carry no meaning: a chunk may hold
//! several frames, part of one, or a marker split across two reads. The
//! demuxer only tracks a byte accumulator and emits every complete
//! `FFD8 .. FFD9` range it can find.

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

pub struct MjpegDemuxer {
    buffer: Vec<u8>,
    /// Offset where the next end-marker search resumes within a pending frame.
    scan_from: usize,
    max_frame_bytes: usize,
    dropped: u64,
}

impl MjpegDemuxer {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_FRAME_BYTES)
    }

    /// Frames longer than `max_frame_bytes` are dropped whether they arrive
    /// whole or in pieces.
    pub fn with_limit(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(64 * 1024),
            scan_from: SOI.len(),
            max_frame_bytes,
            dropped: 0,
        }
    }

    /// Append `chunk` and return every encoded image completed by it, in
    /// stream order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find_marker(&self.buffer, &SOI, 0) else {
                // Nothing but noise. Keep a trailing 0xFF in case the next
                // chunk starts with 0xD8.
                let keep = usize::from(self.buffer.last() == Some(&SOI[0]));
                let discard = self.buffer.len() - keep;
                if discard > 0 {
                    tracing::trace!(bytes = discard, "discarding bytes outside any frame");
                    self.buffer.drain(..discard);
                }
                self.scan_from = SOI.len();
                break;
            };

            if start > 0 {
                tracing::trace!(bytes = start, "discarding bytes before start marker");
                self.buffer.drain(..start);
                self.scan_from = SOI.len();
            }

            match find_marker(&self.buffer, &EOI, self.scan_from) {
                Some(end) => {
                    let frame: Vec<u8> = self.buffer.drain(..end + EOI.len()).collect();
                    self.scan_from = SOI.len();
                    if frame.len() > self.max_frame_bytes {
                        tracing::warn!(
                            bytes = frame.len(),
                            limit = self.max_frame_bytes,
                            "frame exceeds limit, dropping"
                        );
                        self.dropped += 1;
                    } else {
                        frames.push(frame);
                    }
                }
                None => {
                    if self.buffer.len() > self.max_frame_bytes {
                        tracing::warn!(
                            bytes = self.buffer.len(),
                            limit = self.max_frame_bytes,
                            "incomplete frame exceeds limit, dropping"
                        );
                        self.dropped += 1;
                        self.buffer.clear();
                        self.scan_from = SOI.len();
                    } else {
                        // The last byte may be the first half of an end marker.
                        self.scan_from = self.buffer.len().saturating_sub(1).max(SOI.len());
                    }
                    break;
                }
            }
        }

        frames
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scan_from = SOI.len();
    }
}

impl Default for MjpegDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

fn find_marker(buffer: &[u8], marker: &[u8; 2], from: usize) -> Option<usize> {
    if from >= buffer.len() {
        return None;
    }
    buffer[from..]
        .windows(2)
        .position(|w| w == marker)
        .map(|pos| pos + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut frame = SOI.to_vec();
        frame.extend_from_slice(body);
        frame.extend_from_slice(&EOI);
        frame
    }

    fn multipart_stream() -> (Vec<u8>, Vec<Vec<u8>>) {
        let frames = vec![
            jpeg(&[0x10, 0x20, 0x30]),
            jpeg(&[0xFF, 0x00, 0xFF, 0xE0, 0x41]),
            jpeg(&[]),
            jpeg(&[0x7F; 40]),
        ];
        let mut stream = Vec::new();
        for frame in &frames {
            stream.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            stream.extend_from_slice(frame);
            stream.extend_from_slice(b"\r\n");
        }
        (stream, frames)
    }

    #[test]
    fn test_frame_split_across_two_chunks() {
        let mut demuxer = MjpegDemuxer::new();
        let first = [0xFF, 0xD8, 0x01, 0x02, 0x03];
        let second = [0x04, 0x05, 0xFF, 0xD9];

        assert!(demuxer.feed(&first).is_empty());
        let frames = demuxer.feed(&second);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], [&first[..], &second[..]].concat());
        assert_eq!(demuxer.pending(), 0);
    }

    #[test]
    fn test_start_marker_alone_waits() {
        let mut demuxer = MjpegDemuxer::new();
        assert!(demuxer.feed(&[0xFF, 0xD8, 0xAA, 0xBB]).is_empty());
        assert_eq!(demuxer.pending(), 4);
    }

    #[test]
    fn test_several_frames_in_one_chunk() {
        let (stream, expected) = multipart_stream();
        let mut demuxer = MjpegDemuxer::new();
        assert_eq!(demuxer.feed(&stream), expected);
    }

    #[test]
    fn test_leading_garbage_is_discarded() {
        let mut demuxer = MjpegDemuxer::new();
        assert!(demuxer.feed(b"HTTP/1.1 200 OK\r\n\r\n").is_empty());
        assert_eq!(demuxer.pending(), 0);

        let frames = demuxer.feed(&[0x00, 0x01, 0xFF, 0xD8, 0x42, 0xFF, 0xD9, 0x99]);
        assert_eq!(frames, vec![vec![0xFF, 0xD8, 0x42, 0xFF, 0xD9]]);
        assert_eq!(demuxer.pending(), 0);
    }

    #[test]
    fn test_end_marker_before_start_is_ignored() {
        let mut demuxer = MjpegDemuxer::new();
        let frames = demuxer.feed(&[0xFF, 0xD9, 0xFF, 0xD8, 0x01, 0xFF, 0xD9]);
        assert_eq!(frames, vec![vec![0xFF, 0xD8, 0x01, 0xFF, 0xD9]]);
    }

    #[test]
    fn test_markers_split_between_chunks() {
        let mut demuxer = MjpegDemuxer::new();
        assert!(demuxer.feed(&[0x00, 0xFF]).is_empty());
        assert!(demuxer.feed(&[0xD8, 0x05, 0xFF]).is_empty());
        let frames = demuxer.feed(&[0xD9]);
        assert_eq!(frames, vec![vec![0xFF, 0xD8, 0x05, 0xFF, 0xD9]]);
    }

    #[test]
    fn test_chunking_does_not_change_output() {
        let (stream, expected) = multipart_stream();

        for chunk_size in 1..=stream.len() {
            let mut demuxer = MjpegDemuxer::new();
            let mut frames = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                frames.extend(demuxer.feed(chunk));
            }
            assert_eq!(frames, expected, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn test_oversized_partial_frame_is_dropped() {
        let mut demuxer = MjpegDemuxer::with_limit(16);
        assert!(demuxer.feed(&[0xFF, 0xD8]).is_empty());
        assert!(demuxer.feed(&[0x11; 32]).is_empty());
        assert_eq!(demuxer.pending(), 0);
        assert_eq!(demuxer.dropped_frames(), 1);

        let frames = demuxer.feed(&jpeg(&[0x01]));
        assert_eq!(frames, vec![jpeg(&[0x01])]);
    }

    #[test]
    fn test_frame_limit_ignores_chunking() {
        let mut stream = jpeg(&[0x11; 30]);
        stream.extend_from_slice(b"\r\n--frame\r\n\r\n");
        stream.extend_from_slice(&jpeg(&[0x01]));

        for chunk_size in 1..=stream.len() {
            let mut demuxer = MjpegDemuxer::with_limit(16);
            let mut frames = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                frames.extend(demuxer.feed(chunk));
            }
            assert_eq!(frames, vec![jpeg(&[0x01])], "chunk size {chunk_size}");
            assert_eq!(demuxer.dropped_frames(), 1, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn test_reset_discards_pending_bytes() {
        let mut demuxer = MjpegDemuxer::new();
        demuxer.feed(&[0xFF, 0xD8, 0x01]);
        demuxer.reset();
        assert_eq!(demuxer.pending(), 0);
        assert!(demuxer.feed(&[0xFF, 0xD9]).is_empty());
    }
}
