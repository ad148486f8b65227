use crate::Error;

use bytes::{Bytes, BytesMut};

/// Fixed size of the header in front of every frame.
pub const HEADER_LEN: usize = 10;

/// Size of a hello body.
pub const HELLO_LEN: usize = 2;

/// Size of the fixed part of a window put body, before the data.
pub const WINDOW_PUT_HEAD_LEN: usize = 16;

/// Size of a window get request body.
pub const WINDOW_GET_REQ_LEN: usize = 24;

/// Size of the fixed part of a window get response body, before the
/// data.
pub const WINDOW_GET_RESP_HEAD_LEN: usize = 4;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A tagged two-sided message on one of the logical channels.
    Message = 0,
    /// One-sided write into an attached region, applied by the peer's
    /// demultiplexer.
    WindowPut = 1,
    /// One-sided read request against an attached region.
    WindowGetReq = 2,
    /// Data answering a [`FrameKind::WindowGetReq`].
    WindowGetResp = 3,
    /// Connection handshake, first frame in both directions.
    Hello = 4,
}

impl TryFrom<u8> for FrameKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        Ok(match value {
            0 => Self::Message,
            1 => Self::WindowPut,
            2 => Self::WindowGetReq,
            3 => Self::WindowGetResp,
            4 => Self::Hello,
            _ => return Err(Error::UnknownKind),
        })
    }
}

/// The header in front of every frame.
///
/// `channel` and `tag` are only meaningful for
/// [`FrameKind::Message`]; window frames and hellos carry zeroes
/// there. `len` is the body length in bytes.
///
/// # Test
///
/// ```
/// use ferry_codec::frame::{FrameHeader, FrameKind};
///
/// let header = FrameHeader {
///     kind: FrameKind::Message,
///     channel: 1,
///     tag: 7,
///     len: 5,
/// };
///
/// let bytes = header.encode();
///
/// assert_eq!(bytes, [0, 1, 0, 0, 0, 7, 0, 0, 0, 5]);
/// assert_eq!(FrameHeader::decode(&bytes).unwrap(), header);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub channel: u8,
    pub tag: u32,
    pub len: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = self.kind as u8;
        bytes[1] = self.channel;
        bytes[2..6].copy_from_slice(&self.tag.to_be_bytes());
        bytes[6..10].copy_from_slice(&self.len.to_be_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::BufferTooSmall);
        }

        Ok(Self {
            kind: FrameKind::try_from(bytes[0])?,
            channel: bytes[1],
            tag: u32::from_be_bytes(bytes[2..6].try_into()?),
            len: u32::from_be_bytes(bytes[6..10].try_into()?),
        })
    }
}

/// Assemble a complete frame from a header and body parts.
///
/// The body length is computed from the parts, so callers never write
/// a header whose `len` disagrees with the bytes that follow it.
pub fn build(kind: FrameKind, channel: u8, tag: u32, parts: &[&[u8]]) -> Bytes {
    let len: usize = parts.iter().map(|part| part.len()).sum();
    let header = FrameHeader {
        kind,
        channel,
        tag,
        len: len as u32,
    };

    let mut bytes = BytesMut::with_capacity(HEADER_LEN + len);
    bytes.extend_from_slice(&header.encode());
    for part in parts {
        bytes.extend_from_slice(part);
    }

    bytes.freeze()
}

/// Handshake body: the protocol revision spoken by the sender and the
/// one-sided mode it operates in, as a raw byte interpreted by the
/// transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub revision: u8,
    pub rma: u8,
}

impl Hello {
    pub fn encode(&self) -> [u8; HELLO_LEN] {
        [self.revision, self.rma]
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < HELLO_LEN {
            return Err(Error::BufferTooSmall);
        }

        Ok(Self {
            revision: bytes[0],
            rma: bytes[1],
        })
    }
}

/// Fixed head of a window put body; the data to store follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPutHead {
    pub region: u64,
    pub offset: u64,
}

impl WindowPutHead {
    pub fn encode(&self) -> [u8; WINDOW_PUT_HEAD_LEN] {
        let mut bytes = [0u8; WINDOW_PUT_HEAD_LEN];
        bytes[0..8].copy_from_slice(&self.region.to_be_bytes());
        bytes[8..16].copy_from_slice(&self.offset.to_be_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < WINDOW_PUT_HEAD_LEN {
            return Err(Error::BufferTooSmall);
        }

        Ok(Self {
            region: u64::from_be_bytes(bytes[0..8].try_into()?),
            offset: u64::from_be_bytes(bytes[8..16].try_into()?),
        })
    }
}

/// Window get request body. `seq` pairs the response with the request
/// on the initiator side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGetReq {
    pub region: u64,
    pub offset: u64,
    pub count: u32,
    pub seq: u32,
}

impl WindowGetReq {
    pub fn encode(&self) -> [u8; WINDOW_GET_REQ_LEN] {
        let mut bytes = [0u8; WINDOW_GET_REQ_LEN];
        bytes[0..8].copy_from_slice(&self.region.to_be_bytes());
        bytes[8..16].copy_from_slice(&self.offset.to_be_bytes());
        bytes[16..20].copy_from_slice(&self.count.to_be_bytes());
        bytes[20..24].copy_from_slice(&self.seq.to_be_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < WINDOW_GET_REQ_LEN {
            return Err(Error::BufferTooSmall);
        }

        Ok(Self {
            region: u64::from_be_bytes(bytes[0..8].try_into()?),
            offset: u64::from_be_bytes(bytes[8..16].try_into()?),
            count: u32::from_be_bytes(bytes[16..20].try_into()?),
            seq: u32::from_be_bytes(bytes[20..24].try_into()?),
        })
    }
}

/// Fixed head of a window get response body; the data follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGetRespHead {
    pub seq: u32,
}

impl WindowGetRespHead {
    pub fn encode(&self) -> [u8; WINDOW_GET_RESP_HEAD_LEN] {
        self.seq.to_be_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < WINDOW_GET_RESP_HEAD_LEN {
            return Err(Error::BufferTooSmall);
        }

        Ok(Self {
            seq: u32::from_be_bytes(bytes[0..4].try_into()?),
        })
    }
}
