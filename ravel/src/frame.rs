// src/frame.rs
//
// Wire format: every message is `u32 length (little-endian)` followed by
// `length` payload bytes. A request payload starts with `u8 cmd_length`,
// then the command name, then the argument bytes.

use thiserror::Error;

/// Hard cap on a single frame payload.
pub const MAX_FRAME_PAYLOAD: usize = 10 * 1024 * 1024;

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Not enough buffered bytes for a whole frame yet.
    #[error("incomplete frame")]
    Incomplete,
    /// The length prefix claims more than `MAX_FRAME_PAYLOAD` bytes.
    /// The connection carrying it is considered faulty.
    #[error("frame payload of {0} bytes exceeds the 10 MiB cap")]
    Oversize(u32),
}

/// One complete frame parsed out of a buffer. `total_len` is the number of
/// buffered bytes the frame occupies, header included.
#[derive(Debug)]
pub struct Frame<'a> {
    pub payload: &'a [u8],
    pub total_len: usize,
}

/// Parses the frame starting at offset 0 of `buf`.
pub fn parse_frame(buf: &[u8]) -> Result<Frame<'_>, FrameError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Err(FrameError::Incomplete);
    }

    let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if length as usize > MAX_FRAME_PAYLOAD {
        return Err(FrameError::Oversize(length));
    }

    let total_len = FRAME_HEADER_LEN + length as usize;
    if buf.len() < total_len {
        return Err(FrameError::Incomplete);
    }

    Ok(Frame {
        payload: &buf[FRAME_HEADER_LEN..total_len],
        total_len,
    })
}

/// Prepends the length header to `payload`.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    encode_frame_into(payload, &mut out);
    out
}

pub fn encode_frame_into(payload: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
}

/// Builds a request payload: `u8 cmd_length`, command bytes, argument bytes.
/// Command names longer than 255 bytes cannot be encoded.
pub fn encode_request(command: &str, args: &[u8]) -> Vec<u8> {
    debug_assert!(command.len() <= u8::MAX as usize);
    let mut payload = Vec::with_capacity(1 + command.len() + args.len());
    payload.push(command.len() as u8);
    payload.extend_from_slice(command.as_bytes());
    payload.extend_from_slice(args);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(len: usize) {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let framed = encode_frame(&payload);
        assert_eq!(framed.len(), FRAME_HEADER_LEN + len);

        let frame = parse_frame(&framed).unwrap();
        assert_eq!(frame.payload, &payload[..]);
        assert_eq!(frame.total_len, framed.len());
    }

    #[test]
    fn test_round_trip_sizes() {
        for len in [0, 1, 1023, 1024, MAX_FRAME_PAYLOAD] {
            round_trip(len);
        }
    }

    #[test]
    fn test_incomplete_header() {
        assert!(matches!(parse_frame(&[1, 0]), Err(FrameError::Incomplete)));
    }

    #[test]
    fn test_incomplete_payload() {
        let mut buf = encode_frame(b"hello");
        buf.truncate(7);
        assert!(matches!(parse_frame(&buf), Err(FrameError::Incomplete)));
    }

    #[test]
    fn test_oversize_rejected() {
        // 16 MiB + 1 claimed, nothing buffered beyond the header.
        let buf = 0x0100_0001u32.to_le_bytes();
        assert!(matches!(
            parse_frame(&buf),
            Err(FrameError::Oversize(0x0100_0001))
        ));
    }

    #[test]
    fn test_two_frames_drained_in_order() {
        let mut buf = encode_frame(b"first");
        encode_frame_into(b"second", &mut buf);

        let frame = parse_frame(&buf).unwrap();
        assert_eq!(frame.payload, b"first");
        let consumed = frame.total_len;

        let frame = parse_frame(&buf[consumed..]).unwrap();
        assert_eq!(frame.payload, b"second");
        assert_eq!(consumed + frame.total_len, buf.len());
    }

    #[test]
    fn test_encode_request_layout() {
        let payload = encode_request("ping", b"xy");
        assert_eq!(payload, [4, b'p', b'i', b'n', b'g', b'x', b'y']);
    }
}
