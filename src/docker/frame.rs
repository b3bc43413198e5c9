//! Demultiplexer for Docker's non-TTY attach/exec stream framing.
//!
//! Each frame is an 8-byte header followed by the payload:
//!
//! ```text
//! ┌────────┬───────────┬──────────────────┬─────────────────┐
//! │ type:1 │ 0x000000  │ size: u32 (BE)   │ payload (size)  │
//! └────────┴───────────┴──────────────────┴─────────────────┘
//! ```
//!
//! A trailing frame whose header or payload is cut short is dropped.

/// Length of a frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 8;

/// Which stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
    Other(u8),
}

impl From<u8> for StreamKind {
    fn from(b: u8) -> Self {
        match b {
            0 => Self::Stdin,
            1 => Self::Stdout,
            2 => Self::Stderr,
            other => Self::Other(other),
        }
    }
}

/// One decoded frame borrowing its payload from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub kind: StreamKind,
    pub payload: &'a [u8],
}

/// Iterator over the complete frames in a buffer.
pub struct Frames<'a> {
    buf: &'a [u8],
}

impl<'a> Frames<'a> {
    /// Bytes not yet consumed (a truncated frame, if iteration finished).
    pub fn remainder(&self) -> &'a [u8] {
        self.buf
    }
}

impl<'a> Iterator for Frames<'a> {
    type Item = Frame<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let header = self.buf.get(..FRAME_HEADER_LEN)?;
        let size = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let end = FRAME_HEADER_LEN.checked_add(size)?;
        let payload = self.buf.get(FRAME_HEADER_LEN..end)?;

        let frame = Frame {
            kind: StreamKind::from(header[0]),
            payload,
        };
        self.buf = &self.buf[end..];
        Some(frame)
    }
}

/// Iterate the complete frames in `buf`.
pub fn frames(buf: &[u8]) -> Frames<'_> {
    Frames { buf }
}

/// Concatenate every complete frame's payload, ignoring stream type.
pub fn demux(buf: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(buf.len());
    for frame in frames(buf) {
        out.extend_from_slice(frame.payload);
    }
    out
}

/// Encode one frame. Used by tests and the stub daemon.
pub fn encode_frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.push(kind);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demux_concatenates_in_order() {
        let mut stream = Vec::new();
        stream.extend(encode_frame(1, b"hello "));
        stream.extend(encode_frame(2, b"from stderr "));
        stream.extend(encode_frame(1, b"world"));

        assert_eq!(demux(&stream), b"hello from stderr world".to_vec());
    }

    #[test]
    fn test_frame_kinds() {
        let mut stream = encode_frame(1, b"out");
        stream.extend(encode_frame(2, b"err"));

        let kinds: Vec<StreamKind> = frames(&stream).map(|f| f.kind).collect();
        assert_eq!(kinds, vec![StreamKind::Stdout, StreamKind::Stderr]);
    }

    #[test]
    fn test_truncated_payload_is_dropped() {
        let mut stream = encode_frame(1, b"complete");
        let partial = encode_frame(1, b"partial payload");
        stream.extend_from_slice(&partial[..partial.len() - 4]);

        assert_eq!(demux(&stream), b"complete".to_vec());

        let mut iter = frames(&stream);
        assert!(iter.next().is_some());
        assert!(iter.next().is_none());
        assert_eq!(iter.remainder().len(), partial.len() - 4);
    }

    #[test]
    fn test_truncated_header_is_dropped() {
        let mut stream = encode_frame(2, b"abc");
        stream.extend_from_slice(&[1, 0, 0]);
        assert_eq!(demux(&stream), b"abc".to_vec());
    }

    #[test]
    fn test_empty_and_zero_length_frames() {
        assert!(demux(&[]).is_empty());

        let mut stream = encode_frame(1, b"");
        stream.extend(encode_frame(1, b"x"));
        assert_eq!(demux(&stream), b"x".to_vec());
    }
}
