//! Binary key/value protocol framing.
//!
//! Every packet carries a fixed 24-byte big-endian header:
//!
//! ```text
//! magic:1 opcode:1 key_len:2 extras_len:1 datatype:1 vbucket|status:2
//! body_len:4 opaque:4 cas:8
//! ```
//!
//! followed by `extras`, `key` and `value`, whose lengths add up to
//! `body_len`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::CoreError;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 24;
/// Magic byte of client requests.
pub const MAGIC_REQUEST: u8 = 0x80;
/// Magic byte of server responses.
pub const MAGIC_RESPONSE: u8 = 0x81;
/// Largest body accepted in either direction.
pub const MAX_BODY_SIZE: usize = 20 * 1024 * 1024;
/// Longest document key the server accepts.
pub const MAX_KEY_LEN: usize = 250;

/// Commands used by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Fetch a document.
    Get = 0x00,
    /// Store a document unconditionally.
    Set = 0x01,
    /// Store a document only if absent.
    Add = 0x02,
    /// Store a document only if present.
    Replace = 0x03,
    /// Remove a document.
    Delete = 0x04,
    /// No-op, used as a liveness probe.
    Noop = 0x0a,
    /// SASL authentication step.
    SaslAuth = 0x21,
    /// Bind the connection to a bucket.
    SelectBucket = 0x89,
    /// Fetch the cluster configuration.
    GetClusterConfig = 0xb5,
}

impl Opcode {
    /// Parses a raw opcode.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Opcode::Get),
            0x01 => Some(Opcode::Set),
            0x02 => Some(Opcode::Add),
            0x03 => Some(Opcode::Replace),
            0x04 => Some(Opcode::Delete),
            0x0a => Some(Opcode::Noop),
            0x21 => Some(Opcode::SaslAuth),
            0x89 => Some(Opcode::SelectBucket),
            0xb5 => Some(Opcode::GetClusterConfig),
            _ => None,
        }
    }

    /// Name used in logs and orphan reports.
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Get => "get",
            Opcode::Set => "set",
            Opcode::Add => "add",
            Opcode::Replace => "replace",
            Opcode::Delete => "delete",
            Opcode::Noop => "noop",
            Opcode::SaslAuth => "sasl_auth",
            Opcode::SelectBucket => "select_bucket",
            Opcode::GetClusterConfig => "get_cluster_config",
        }
    }

    /// Returns `true` for commands that modify a document.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Opcode::Set | Opcode::Add | Opcode::Replace | Opcode::Delete
        )
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// 0x00
    Success,
    /// 0x01
    KeyNotFound,
    /// 0x02
    KeyExists,
    /// 0x07, the node does not own the vBucket.
    NotMyVbucket,
    /// 0x09
    Locked,
    /// 0x20
    AuthError,
    /// 0x81
    UnknownCommand,
    /// 0x83
    NotSupported,
    /// 0x85
    Busy,
    /// 0x86
    TmpFail,
    /// 0xa2
    SyncWriteInProgress,
    /// Any other status code.
    Other(u16),
}

impl Status {
    /// Parses a raw status.
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x00 => Status::Success,
            0x01 => Status::KeyNotFound,
            0x02 => Status::KeyExists,
            0x07 => Status::NotMyVbucket,
            0x09 => Status::Locked,
            0x20 => Status::AuthError,
            0x81 => Status::UnknownCommand,
            0x83 => Status::NotSupported,
            0x85 => Status::Busy,
            0x86 => Status::TmpFail,
            0xa2 => Status::SyncWriteInProgress,
            other => Status::Other(other),
        }
    }

    /// Raw status code.
    pub fn as_u16(&self) -> u16 {
        match self {
            Status::Success => 0x00,
            Status::KeyNotFound => 0x01,
            Status::KeyExists => 0x02,
            Status::NotMyVbucket => 0x07,
            Status::Locked => 0x09,
            Status::AuthError => 0x20,
            Status::UnknownCommand => 0x81,
            Status::NotSupported => 0x83,
            Status::Busy => 0x85,
            Status::TmpFail => 0x86,
            Status::SyncWriteInProgress => 0xa2,
            Status::Other(code) => *code,
        }
    }
}

/// Framing errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl From<FrameError> for CoreError {
    fn from(err: FrameError) -> Self {
        CoreError::protocol(err.to_string())
    }
}

/// One request or response packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// [`MAGIC_REQUEST`] or [`MAGIC_RESPONSE`].
    pub magic: u8,
    /// Raw opcode.
    pub opcode: u8,
    /// Datatype flags.
    pub datatype: u8,
    /// vBucket in requests, status in responses.
    pub vbucket_or_status: u16,
    /// Correlates a response with its request.
    pub opaque: u32,
    /// Compare-and-swap value.
    pub cas: u64,
    /// Command-specific extras.
    pub extras: Bytes,
    /// Document key.
    pub key: Bytes,
    /// Value.
    pub value: Bytes,
}

impl Frame {
    /// Builds a request packet.
    pub fn request(opcode: Opcode, vbucket: u16, opaque: u32) -> Self {
        Self {
            magic: MAGIC_REQUEST,
            opcode: opcode as u8,
            datatype: 0,
            vbucket_or_status: vbucket,
            opaque,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    /// Builds a response packet.
    pub fn response(opcode: Opcode, status: Status, opaque: u32) -> Self {
        Self {
            magic: MAGIC_RESPONSE,
            vbucket_or_status: status.as_u16(),
            ..Self::request(opcode, 0, opaque)
        }
    }

    /// Sets the key.
    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    /// Sets the extras.
    pub fn with_extras(mut self, extras: impl Into<Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    /// Sets the value.
    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    /// Sets the CAS.
    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    /// Sets the datatype.
    pub fn with_datatype(mut self, datatype: u8) -> Self {
        self.datatype = datatype;
        self
    }

    /// Parsed opcode, if known.
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.opcode)
    }

    /// Response status.
    pub fn status(&self) -> Status {
        Status::from_u16(self.vbucket_or_status)
    }

    /// Total body length.
    pub fn body_len(&self) -> usize {
        self.extras.len() + self.key.len() + self.value.len()
    }

    /// Appends the encoded packet to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        if self.key.len() > u16::MAX as usize || self.extras.len() > u8::MAX as usize {
            return Err(FrameError::Malformed("key or extras too long".to_string()));
        }
        let body_len = self.body_len();
        if body_len > MAX_BODY_SIZE {
            return Err(FrameError::Malformed(format!(
                "body of {} bytes exceeds {}",
                body_len, MAX_BODY_SIZE
            )));
        }
        buf.reserve(HEADER_SIZE + body_len);
        buf.put_u8(self.magic);
        buf.put_u8(self.opcode);
        buf.put_u16(self.key.len() as u16);
        buf.put_u8(self.extras.len() as u8);
        buf.put_u8(self.datatype);
        buf.put_u16(self.vbucket_or_status);
        buf.put_u32(body_len as u32);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
        buf.put_slice(&self.extras);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
        Ok(())
    }

    /// Encodes the packet into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.body_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decodes one packet from the front of `buf`, if complete.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = Header::parse(&buf[..HEADER_SIZE])?;
        if buf.len() < HEADER_SIZE + header.body_len {
            return Ok(None);
        }
        buf.advance(HEADER_SIZE);
        let body = buf.split_to(header.body_len).freeze();
        Ok(Some(header.into_frame(body)))
    }

    /// Reads exactly one packet from `reader`.
    pub async fn read_from<R>(reader: &mut R) -> Result<Frame, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let mut raw = [0u8; HEADER_SIZE];
        reader.read_exact(&mut raw).await?;
        let header = Header::parse(&raw)?;
        let mut body = vec![0u8; header.body_len];
        reader.read_exact(&mut body).await?;
        Ok(header.into_frame(Bytes::from(body)))
    }
}

struct Header {
    magic: u8,
    opcode: u8,
    key_len: usize,
    extras_len: usize,
    datatype: u8,
    vbucket_or_status: u16,
    body_len: usize,
    opaque: u32,
    cas: u64,
}

impl Header {
    fn parse(mut raw: &[u8]) -> Result<Self, FrameError> {
        let header = Header {
            magic: raw.get_u8(),
            opcode: raw.get_u8(),
            key_len: raw.get_u16() as usize,
            extras_len: raw.get_u8() as usize,
            datatype: raw.get_u8(),
            vbucket_or_status: raw.get_u16(),
            body_len: raw.get_u32() as usize,
            opaque: raw.get_u32(),
            cas: raw.get_u64(),
        };
        if header.magic != MAGIC_REQUEST && header.magic != MAGIC_RESPONSE {
            return Err(FrameError::Malformed(format!(
                "bad magic 0x{:02x}",
                header.magic
            )));
        }
        if header.body_len > MAX_BODY_SIZE {
            return Err(FrameError::Malformed(format!(
                "body of {} bytes exceeds {}",
                header.body_len, MAX_BODY_SIZE
            )));
        }
        if header.key_len + header.extras_len > header.body_len {
            return Err(FrameError::Malformed(
                "key and extras exceed body length".to_string(),
            ));
        }
        Ok(header)
    }

    fn into_frame(self, mut body: Bytes) -> Frame {
        let extras = body.split_to(self.extras_len);
        let key = body.split_to(self.key_len);
        Frame {
            magic: self.magic,
            opcode: self.opcode,
            datatype: self.datatype,
            vbucket_or_status: self.vbucket_or_status,
            opaque: self.opaque,
            cas: self.cas,
            extras,
            key,
            value: body,
        }
    }
}
