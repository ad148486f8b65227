//! ## Wire formats for the ferry transport
//!
//! Everything that crosses a link is described here: the fixed frame
//! header that multiplexes logical channels on one connection, the
//! control records that drive the emulated one-sided service, and the
//! byte image of a memory handle that peers exchange inside call
//! payloads.
//!
//! All multi-byte fields are big-endian. The layouts are fixed per
//! build; a handle image is exactly [`rma::MEM_HANDLE_LEN`] bytes and
//! a control record exactly [`rma::CONTROL_RECORD_LEN`] bytes, so the
//! receiving side can validate lengths before touching the content.

pub mod frame;
pub mod rma;

use std::array::TryFromSliceError;

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    UnknownKind,
    UnknownOp,
    UnknownAccess,
    BufferTooSmall,
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

/// Tag reserved on the side channel for one-sided traffic, both the
/// control records and the payloads they announce.
pub const ONESIDED_TAG: u32 = 0x80;

/// Tag of the one-byte acknowledgement that completes an emulated put.
pub const ONESIDED_ACK_TAG: u32 = 0x81;

/// Maximum size of an unexpected message.
pub const MAX_UNEXPECTED_SIZE: usize = 4096;

/// A published port name is rendered into exactly this many bytes,
/// trailing NULs preserved.
pub const PORT_NAME_LEN: usize = 256;

/// Transfer counts ride in a signed 32-bit field; anything larger must
/// be split by the caller.
pub const MAX_TRANSFER_LEN: usize = i32::MAX as usize;

/// Revision of the link protocol spoken by this build. Window frames
/// exist from revision 3 on; older peers only understand two-sided
/// messages.
pub const PROTOCOL_REVISION: u8 = 3;
