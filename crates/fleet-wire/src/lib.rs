// Wire format for control-plane calls: a fixed header followed by a JSON payload.
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MAGIC: u32 = 0x4E46_4431;
pub const VERSION: u16 = 1;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("frame of {length} bytes exceeds limit of {limit}")]
    FrameTooLarge { length: usize, limit: usize },
    #[error("incomplete frame")]
    Incomplete,
    #[error("failed to serialize message")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize message: {0}")]
    Deserialize(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 12;

    pub fn new(flags: u16, length: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.magic.to_be_bytes());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        // Validate header before we trust the length.
        if buf.remaining() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let flags = buf.get_u16();
        let length = buf.get_u32();
        Ok(Self {
            magic,
            version,
            flags,
            length,
        })
    }

    /// Reject a declared payload length above `limit` before anything is allocated for it.
    pub fn check_length(&self, limit: usize) -> Result<usize> {
        let length = self.length as usize;
        if length > limit {
            return Err(Error::FrameTooLarge { length, limit });
        }
        Ok(length)
    }
}

/// Frame containing a header and payload.
///
/// ```
/// use bytes::Bytes;
/// use fleet_wire::Frame;
///
/// let frame = Frame::new(0, Bytes::from_static(b"{}")).expect("frame");
/// let decoded = Frame::decode(frame.encode()).expect("decode");
/// assert_eq!(decoded.payload, Bytes::from_static(b"{}"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(flags: u16, payload: Bytes) -> Result<Self> {
        let length = u32::try_from(payload.len()).map_err(|_| Error::FrameTooLarge {
            length: payload.len(),
            limit: u32::MAX as usize,
        })?;
        Ok(Self {
            header: FrameHeader::new(flags, length),
            payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        if input.len() < FrameHeader::LEN {
            return Err(Error::Incomplete);
        }
        let header = FrameHeader::decode(input.slice(0..FrameHeader::LEN))?;
        let length = header.length as usize;
        if input.len() < FrameHeader::LEN + length {
            return Err(Error::Incomplete);
        }
        let payload = input.slice(FrameHeader::LEN..FrameHeader::LEN + length);
        Ok(Self { header, payload })
    }
}

/// Outcome of writing one label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LabelStatus {
    Created,
    Updated,
    Failed { error: String },
}

impl LabelStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, LabelStatus::Failed { .. })
    }
}

/// Why a call was refused or only partly applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The connection carried no usable client identity.
    Unauthenticated,
    /// The payload names a node other than the authenticated one.
    IdentityMismatch,
    /// The request could not be decoded or was not a call.
    InvalidRequest,
    /// At least one label could not be persisted.
    Storage,
    Internal,
}

/// Messages carried in frame payloads. One request and one reply per stream.
///
/// ```
/// use fleet_wire::Message;
/// use std::collections::BTreeMap;
///
/// let message = Message::SetLabels {
///     node_name: "node-1".to_string(),
///     nfd_version: None,
///     labels: BTreeMap::from([("cpu".to_string(), "8".to_string())]),
/// };
/// let frame = message.encode().expect("encode");
/// assert_eq!(Message::decode(frame).expect("decode"), message);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // Node reports its feature labels.
    SetLabels {
        node_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nfd_version: Option<String>,
        labels: BTreeMap<String, String>,
    },
    // Every label was written.
    SetLabelsReply {
        results: BTreeMap<String, LabelStatus>,
    },
    // Refused call, or partial failure with per-label outcomes.
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        results: BTreeMap<String, LabelStatus>,
    },
}

impl Message {
    pub fn encode(&self) -> Result<Frame> {
        let payload = serde_json::to_vec(self).map_err(Error::Serialize)?;
        Frame::new(0, Bytes::from(payload))
    }

    pub fn decode(frame: Frame) -> Result<Self> {
        serde_json::from_slice(&frame.payload).map_err(Error::Deserialize)
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Message::Error {
            code,
            message: message.into(),
            results: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::SetLabels { .. } => "set_labels",
            Message::SetLabelsReply { .. } => "set_labels_reply",
            Message::Error { .. } => "error",
        }
    }
}
