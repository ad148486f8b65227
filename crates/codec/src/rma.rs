use crate::Error;

/// Size of a control record on the wire.
pub const CONTROL_RECORD_LEN: usize = 21;

/// Size of a serialized memory handle.
pub const MEM_HANDLE_LEN: usize = 17;

/// Region access on the wire: read-only.
pub const ACCESS_READ_ONLY: u8 = 0;

/// Region access on the wire: read-write.
pub const ACCESS_READ_WRITE: u8 = 1;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmaOp {
    /// The initiator wants to store bytes; the service posts a receive
    /// and acknowledges.
    Put = 0,
    /// The initiator wants to load bytes; the service sends them.
    Get = 1,
    /// Terminate the service loop.
    End = 2,
}

impl TryFrom<u8> for RmaOp {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        Ok(match value {
            0 => Self::Put,
            1 => Self::Get,
            2 => Self::End,
            _ => return Err(Error::UnknownOp),
        })
    }
}

/// The record sent on the side channel ahead of an emulated one-sided
/// transfer, telling the remote service which registered region to act
/// on. `region` is the identifier minted at registration, never an
/// address.
///
/// # Test
///
/// ```
/// use ferry_codec::rma::{ControlRecord, RmaOp, CONTROL_RECORD_LEN};
///
/// let record = ControlRecord {
///     op: RmaOp::Put,
///     region: 2,
///     disp: 16,
///     count: 1024,
/// };
///
/// let bytes = record.encode();
///
/// assert_eq!(bytes.len(), CONTROL_RECORD_LEN);
/// assert_eq!(ControlRecord::decode(&bytes).unwrap(), record);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRecord {
    pub op: RmaOp,
    pub region: u64,
    pub disp: u64,
    pub count: u32,
}

impl ControlRecord {
    /// The record that terminates a remote service loop.
    pub fn end() -> Self {
        Self {
            op: RmaOp::End,
            region: 0,
            disp: 0,
            count: 0,
        }
    }

    pub fn encode(&self) -> [u8; CONTROL_RECORD_LEN] {
        let mut bytes = [0u8; CONTROL_RECORD_LEN];
        bytes[0] = self.op as u8;
        bytes[1..9].copy_from_slice(&self.region.to_be_bytes());
        bytes[9..17].copy_from_slice(&self.disp.to_be_bytes());
        bytes[17..21].copy_from_slice(&self.count.to_be_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < CONTROL_RECORD_LEN {
            return Err(Error::BufferTooSmall);
        }

        Ok(Self {
            op: RmaOp::try_from(bytes[0])?,
            region: u64::from_be_bytes(bytes[1..9].try_into()?),
            disp: u64::from_be_bytes(bytes[9..17].try_into()?),
            count: u32::from_be_bytes(bytes[17..21].try_into()?),
        })
    }
}

/// Byte image of a memory handle, exchanged inside call payloads so a
/// peer can name the region in later one-sided operations.
///
/// Serialization copies the image verbatim and fails without side
/// effects when the destination is shorter than [`MEM_HANDLE_LEN`].
///
/// # Test
///
/// ```
/// use ferry_codec::rma::{MemHandleImage, ACCESS_READ_WRITE, MEM_HANDLE_LEN};
///
/// let image = MemHandleImage {
///     region: 1,
///     len: 4096,
///     access: ACCESS_READ_WRITE,
/// };
///
/// let mut bytes = [0u8; MEM_HANDLE_LEN];
/// image.write_to(&mut bytes).unwrap();
///
/// assert_eq!(MemHandleImage::read_from(&bytes).unwrap(), image);
/// assert!(image.write_to(&mut [0u8; 4]).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemHandleImage {
    pub region: u64,
    pub len: u64,
    pub access: u8,
}

impl MemHandleImage {
    pub fn write_to(&self, bytes: &mut [u8]) -> Result<(), Error> {
        if bytes.len() < MEM_HANDLE_LEN {
            return Err(Error::BufferTooSmall);
        }

        bytes[0..8].copy_from_slice(&self.region.to_be_bytes());
        bytes[8..16].copy_from_slice(&self.len.to_be_bytes());
        bytes[16] = self.access;
        Ok(())
    }

    pub fn read_from(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < MEM_HANDLE_LEN {
            return Err(Error::BufferTooSmall);
        }

        let access = bytes[16];
        if access != ACCESS_READ_ONLY && access != ACCESS_READ_WRITE {
            return Err(Error::UnknownAccess);
        }

        Ok(Self {
            region: u64::from_be_bytes(bytes[0..8].try_into()?),
            len: u64::from_be_bytes(bytes[8..16].try_into()?),
            access,
        })
    }
}
