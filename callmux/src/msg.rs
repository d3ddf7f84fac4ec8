use std::io::Write;

use bitflags::bitflags;
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    Pattern,
    error::{Error, ErrorKind, Result},
};

/// Frame flags.
///
/// Exactly one of `IsReq` / `IsRsp` is set and gives the direction of the
/// frame. The remaining flags describe what the frame carries:
/// - `Open`: first frame of a call, carries the method, pattern and timeout
/// - `Data`: the payload is an application message
/// - `EndOfStream`: the sender will send no more messages on this call
/// - `Status`: the terminal status of the call, payload is `Option<Error>`
/// - `Cancel`: the invoker abandoned the call, payload is the reason
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
#[repr(transparent)]
#[serde(transparent)]
pub struct MsgFlags(u8);

bitflags! {
    impl MsgFlags: u8 {
        /// Invoker to dispatcher.
        const IsReq = 1;
        /// Dispatcher to invoker.
        const IsRsp = 2;
        /// Payload is MessagePack instead of JSON.
        const UseMessagePack = 4;
        const Open = 8;
        const EndOfStream = 16;
        const Status = 32;
        const Cancel = 64;
        const Data = 128;
    }
}

/// Frame metadata.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct MsgMeta {
    /// Call this frame belongs to.
    pub callid: u64,
    pub flags: MsgFlags,
    /// `Service/Method`, only present on `Open` frames.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<Pattern>,
    /// Remaining time budget of the call in milliseconds, only on `Open` frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl MsgMeta {
    #[must_use]
    pub fn is_req(&self) -> bool {
        self.flags.contains(MsgFlags::IsReq)
    }

    #[must_use]
    pub fn is_rsp(&self) -> bool {
        self.flags.contains(MsgFlags::IsRsp)
    }

    #[must_use]
    pub fn is_last(&self) -> bool {
        self.flags.contains(MsgFlags::EndOfStream)
    }
}

/// Raw bytes of a message body.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    Empty,
    Normal(Bytes),
}

impl Payload {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Empty => &[],
            Payload::Normal(bytes) => bytes,
        }
    }

    pub fn advance(&mut self, offset: usize) {
        if let Payload::Normal(bytes) = self {
            bytes.advance(offset);
        }
    }
}

impl std::ops::Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Normal(value)
    }
}

impl From<BytesMut> for Payload {
    fn from(value: BytesMut) -> Self {
        Payload::Normal(value.freeze())
    }
}

/// A decoded frame: metadata plus the still-encoded payload.
///
/// The body layout (after the transport header) is:
///
/// ```text
/// | 4 bytes  | N bytes  | M bytes |
/// | meta_len | metadata | payload |
/// ```
#[derive(Debug, Default)]
pub struct Message {
    pub meta: MsgMeta,
    pub payload: Payload,
}

impl Message {
    pub fn new(meta: MsgMeta, payload: Payload) -> Self {
        Self { meta, payload }
    }

    /// Parses a frame body. Metadata may be JSON or MessagePack and is auto-detected.
    ///
    /// # Errors
    ///
    /// Returns `DeserializeFailed` when the body is truncated or the
    /// metadata length is invalid, or the metadata decoding error.
    pub fn parse(payload: impl Into<Payload>) -> Result<Self> {
        const S: usize = std::mem::size_of::<u32>();
        let mut payload: Payload = payload.into();

        let len = payload.len();
        let meta_len = match payload.get(..S).map(<[u8; S]>::try_from) {
            Some(Ok(b)) => u32::from_be_bytes(b) as usize,
            _ => {
                return Err(Error::new(
                    ErrorKind::DeserializeFailed,
                    format!("invalid msg length: {len}"),
                ));
            }
        };

        if meta_len == 0 {
            return Err(Error::new(
                ErrorKind::DeserializeFailed,
                format!("invalid meta length: {meta_len}"),
            ));
        }

        let offset = S + meta_len;
        if offset > len {
            return Err(Error::new(
                ErrorKind::DeserializeFailed,
                format!("invalid meta length: {meta_len}, msg length: {len}"),
            ));
        }

        let meta: MsgMeta = if payload[S] == b'{' {
            serde_json::from_slice(&payload[S..offset])?
        } else {
            rmp_serde::from_slice(&payload[S..offset])?
        };

        payload.advance(offset);
        Ok(Message { meta, payload })
    }

    /// Decodes the payload with the format named by the `UseMessagePack` flag.
    /// An empty payload decodes as null.
    ///
    /// # Errors
    ///
    /// Returns the decoding error if the payload does not match `P`.
    pub fn deserialize<P: DeserializeOwned>(&self) -> Result<P> {
        if self.payload.is_empty() {
            Ok(serde_json::from_value(serde_json::Value::Null)?)
        } else if self.meta.flags.contains(MsgFlags::UseMessagePack) {
            Ok(rmp_serde::from_slice(&self.payload)?)
        } else {
            Ok(serde_json::from_slice(&self.payload)?)
        }
    }
}

/// Buffer a frame can be serialized into.
pub trait SendMsg {
    fn size(&self) -> usize;

    /// Called before anything is written, e.g. to reserve a transport header.
    ///
    /// # Errors
    fn prepare(&mut self) -> Result<()>;

    /// Patches the length prefixes once metadata and payload are written.
    ///
    /// # Errors
    fn finish(&mut self, meta_offset: usize, payload_offset: usize) -> Result<()>;

    fn writer(&mut self) -> impl std::io::Write;
}

impl MsgMeta {
    /// Writes `meta_len | meta | payload` into `msg`, using MessagePack when
    /// the `UseMessagePack` flag is set and JSON otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or finalization fails.
    pub fn serialize_to<M: SendMsg, P: Serialize + ?Sized>(
        &self,
        payload: &P,
        msg: &mut M,
    ) -> Result<()> {
        msg.prepare()?;

        let meta_offset = msg.size();
        msg.writer()
            .write_all(&0u32.to_be_bytes())
            .map_err(|e| Error::new(ErrorKind::SerializeFailed, e.to_string()))?;
        if self.flags.contains(MsgFlags::UseMessagePack) {
            rmp_serde::encode::write_named(&mut msg.writer(), self)?;
        } else {
            serde_json::to_writer(msg.writer(), self)?;
        }

        let payload_offset = msg.size();
        if self.flags.contains(MsgFlags::UseMessagePack) {
            rmp_serde::encode::write_named(&mut msg.writer(), payload)?;
        } else {
            serde_json::to_writer(msg.writer(), payload)?;
        }

        msg.finish(meta_offset, payload_offset)
    }
}

impl SendMsg for BytesMut {
    fn size(&self) -> usize {
        self.len()
    }

    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self, meta_offset: usize, payload_offset: usize) -> Result<()> {
        const S: usize = std::mem::size_of::<u32>();
        let meta_len = u32::try_from(payload_offset - meta_offset - S)?;
        self[meta_offset..meta_offset + S].copy_from_slice(&meta_len.to_be_bytes());
        Ok(())
    }

    fn writer(&mut self) -> impl std::io::Write {
        #[repr(transparent)]
        struct Writer<'a>(&'a mut BytesMut);

        impl std::io::Write for Writer<'_> {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        Writer(self)
    }
}
