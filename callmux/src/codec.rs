use bytes::{Buf, Bytes, BytesMut};
use serde::Serialize;

use crate::{
    error::{Error, ErrorKind, Result},
    msg::{MsgMeta, SendMsg},
};

pub(crate) const MAGIC_NUM: u32 = u32::from_be_bytes(*b"CMUX");
const HEADER_SIZE: usize = std::mem::size_of::<u64>();

/// Transport framing: `magic (u32) | body_len (u32) | body`.
struct FrameBytes(BytesMut);

impl SendMsg for FrameBytes {
    fn size(&self) -> usize {
        self.0.size()
    }

    fn prepare(&mut self) -> Result<()> {
        self.0.extend_from_slice(&MAGIC_NUM.to_be_bytes());
        self.0.extend_from_slice(&0u32.to_be_bytes());
        self.0.prepare()
    }

    fn finish(&mut self, meta_offset: usize, payload_offset: usize) -> Result<()> {
        const S: usize = std::mem::size_of::<u32>();
        if meta_offset < S {
            return Err(Error::new(
                ErrorKind::SerializeFailed,
                format!("invalid meta offset: {meta_offset}"),
            ));
        }

        self.0.finish(meta_offset, payload_offset)?;
        let body_len = u32::try_from(self.size() - meta_offset)?;
        self.0[meta_offset - S..meta_offset].copy_from_slice(&body_len.to_be_bytes());
        Ok(())
    }

    fn writer(&mut self) -> impl std::io::Write {
        self.0.writer()
    }
}

/// Serializes one frame, header included.
///
/// # Errors
///
/// Returns an error if serialization fails or the frame reaches `max_size`.
pub(crate) fn encode_frame<P: Serialize + ?Sized>(
    meta: &MsgMeta,
    payload: &P,
    max_size: usize,
) -> Result<Bytes> {
    let mut bytes = FrameBytes(BytesMut::with_capacity(256));
    meta.serialize_to(payload, &mut bytes)?;
    if bytes.0.len() >= max_size {
        return Err(Error::new(
            ErrorKind::SerializeFailed,
            format!("msg is too long: {}", bytes.0.len()),
        ));
    }
    Ok(bytes.0.freeze())
}

/// Splits one complete frame body off the front of `buffer`.
///
/// Returns `Ok(None)` while the frame is still incomplete.
///
/// # Errors
///
/// Returns `TransportError` on a bad magic number or an oversized frame;
/// the stream cannot be resynchronized after either.
pub(crate) fn parse_frame(buffer: &mut BytesMut, max_size: usize) -> Result<Option<Bytes>> {
    let Some(header) = buffer.get(..HEADER_SIZE) else {
        return Ok(None);
    };
    let mut header_bytes = [0u8; HEADER_SIZE];
    header_bytes.copy_from_slice(header);
    let header = u64::from_be_bytes(header_bytes);
    if (header >> 32) as u32 != MAGIC_NUM {
        return Err(Error::new(
            ErrorKind::TransportError,
            format!("invalid header: {header:016X}"),
        ));
    }

    let len = usize::try_from(header & u64::from(u32::MAX))?;
    if HEADER_SIZE + len >= max_size {
        return Err(Error::new(
            ErrorKind::TransportError,
            format!("msg is too long: {len}"),
        ));
    }

    if buffer.len() < HEADER_SIZE + len {
        Ok(None)
    } else {
        buffer.advance(HEADER_SIZE);
        Ok(Some(buffer.split_to(len).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Message, MsgFlags};

    const MAX: usize = 1 << 20;

    #[test]
    fn test_frames_split_across_reads() {
        let meta = MsgMeta {
            callid: 42,
            flags: MsgFlags::IsReq | MsgFlags::Data | MsgFlags::UseMessagePack,
            ..Default::default()
        };
        let first = encode_frame(&meta, "Hello", MAX).unwrap();
        let second = encode_frame(&meta, "from", MAX).unwrap();

        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&first[..5]);
        assert!(parse_frame(&mut buffer, MAX).unwrap().is_none());
        buffer.extend_from_slice(&first[5..]);
        buffer.extend_from_slice(&second[..3]);

        let body = parse_frame(&mut buffer, MAX).unwrap().unwrap();
        let msg = Message::parse(body).unwrap();
        assert_eq!(msg.meta.callid, 42);
        assert_eq!(msg.deserialize::<String>().unwrap(), "Hello");

        assert!(parse_frame(&mut buffer, MAX).unwrap().is_none());
        buffer.extend_from_slice(&second[3..]);
        let body = parse_frame(&mut buffer, MAX).unwrap().unwrap();
        assert_eq!(Message::parse(body).unwrap().deserialize::<String>().unwrap(), "from");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_invalid_frames() {
        let mut buffer = BytesMut::from(&b"GRPC\x00\x00\x00\x01x"[..]);
        let err = parse_frame(&mut buffer, MAX).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TransportError);

        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&MAGIC_NUM.to_be_bytes());
        buffer.extend_from_slice(&u32::MAX.to_be_bytes());
        let err = parse_frame(&mut buffer, MAX).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TransportError);

        let meta = MsgMeta::default();
        let err = encode_frame(&meta, &vec![0u8; 64], 32).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SerializeFailed);
    }
}
