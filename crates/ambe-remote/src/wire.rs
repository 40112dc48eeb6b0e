use std::io::{ErrorKind, Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{RemoteError, Result};

/// Frame header: magic (2) + length (4, LE) + tag (4, LE) = 10 bytes.
pub const HEADER_SIZE: usize = 10;

/// Magic bytes: "AM" (0x41 0x4d).
pub const MAGIC: [u8; 2] = [0x41, 0x4d];

/// Tag reserved for session control messages.
pub const CONTROL_TAG: u32 = 0;

/// Maximum frame payload. Chip packets are tiny; anything near this limit
/// is a desynchronized or hostile stream.
pub const MAX_PAYLOAD: usize = 64 * 1024;

const READ_CHUNK_SIZE: usize = 4 * 1024;

/// One tagged message on the stream.
#[derive(Debug, Clone)]
pub struct TaggedFrame {
    pub tag: u32,
    pub payload: Bytes,
}

/// Encode a frame into the wire format.
///
/// ```text
/// ┌────────────┬────────────┬──────────┬──────────────────┐
/// │ Magic (2B) │ Length (4B │ Tag (4B  │ Payload           │
/// │ 0x41 0x4d  │ LE)        │ LE)      │ (Length bytes)    │
/// └────────────┴────────────┴──────────┴──────────────────┘
/// ```
pub fn encode_frame(tag: u32, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > MAX_PAYLOAD {
        return Err(RemoteError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u32_le(payload.len() as u32);
    dst.put_u32_le(tag);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer does not hold a complete frame yet.
/// On success the frame bytes are consumed from the buffer.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<TaggedFrame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(RemoteError::InvalidMagic);
    }

    let payload_len = u32::from_le_bytes(src[2..6].try_into().unwrap()) as usize;
    let tag = u32::from_le_bytes(src[6..10].try_into().unwrap());

    if payload_len > MAX_PAYLOAD {
        return Err(RemoteError::PayloadTooLarge {
            size: payload_len,
            max: MAX_PAYLOAD,
        });
    }

    if src.len() < HEADER_SIZE + payload_len {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(TaggedFrame { tag, payload }))
}

/// Read the next complete frame from a stream (blocking).
///
/// `buf` carries partial data between calls; use one buffer per stream.
pub fn read_frame<R: Read>(stream: &mut R, buf: &mut BytesMut) -> Result<TaggedFrame> {
    loop {
        if let Some(frame) = decode_frame(buf)? {
            return Ok(frame);
        }

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let read = match stream.read(&mut chunk) {
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(RemoteError::Io(err)),
        };

        if read == 0 {
            return Err(RemoteError::ConnectionClosed);
        }

        buf.extend_from_slice(&chunk[..read]);
    }
}

/// Encode and write a complete frame (blocking).
pub fn write_frame<W: Write>(stream: &mut W, tag: u32, payload: &[u8]) -> Result<()> {
    let mut wire = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    encode_frame(tag, payload, &mut wire)?;

    let mut offset = 0;
    while offset < wire.len() {
        match stream.write(&wire[offset..]) {
            Ok(0) => return Err(RemoteError::ConnectionClosed),
            Ok(n) => offset += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(RemoteError::Io(err)),
        }
    }
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut buf = BytesMut::new();
        encode_frame(7, b"packet-bytes", &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + 12);

        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.tag, 7);
        assert_eq!(frame.payload.as_ref(), b"packet-bytes");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_complete_frame() {
        let mut wire = BytesMut::new();
        encode_frame(1, b"abcdef", &mut wire).unwrap();

        let mut partial = BytesMut::from(&wire[..HEADER_SIZE + 2]);
        assert!(decode_frame(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&wire[HEADER_SIZE + 2..]);
        let frame = decode_frame(&mut partial).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"abcdef");
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut buf = BytesMut::from(&[0xff; HEADER_SIZE][..]);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(RemoteError::InvalidMagic)
        ));
    }

    #[test]
    fn decode_rejects_oversized_payload() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(MAX_PAYLOAD as u32 + 1);
        buf.put_u32_le(1);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(RemoteError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn empty_payload_frames_work() {
        let mut buf = BytesMut::new();
        encode_frame(9, b"", &mut buf).unwrap();
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.tag, 9);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn stream_round_trip_over_socket_pair() {
        let (mut left, mut right) = std::os::unix::net::UnixStream::pair().unwrap();

        write_frame(&mut left, 3, b"hello").unwrap();
        write_frame(&mut left, 4, b"world").unwrap();

        let mut buf = BytesMut::new();
        let first = read_frame(&mut right, &mut buf).unwrap();
        let second = read_frame(&mut right, &mut buf).unwrap();
        assert_eq!((first.tag, first.payload.as_ref()), (3, b"hello".as_ref()));
        assert_eq!((second.tag, second.payload.as_ref()), (4, b"world".as_ref()));

        drop(left);
        assert!(matches!(
            read_frame(&mut right, &mut buf),
            Err(RemoteError::ConnectionClosed)
        ));
    }
}
