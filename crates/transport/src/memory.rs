use crate::Error;

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use ahash::AHashMap;
use bytes::Bytes;
use codec::rma::{ACCESS_READ_ONLY, ACCESS_READ_WRITE, MemHandleImage};
use parking_lot::Mutex;

/// What a remote peer is allowed to do with a registered region.
///
/// Only put checks this; a put against a read-only handle is rejected
/// locally before any traffic is generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            Self::ReadOnly => ACCESS_READ_ONLY,
            Self::ReadWrite => ACCESS_READ_WRITE,
        }
    }

    pub(crate) fn from_wire(value: u8) -> Result<Self, Error> {
        match value {
            ACCESS_READ_ONLY => Ok(Self::ReadOnly),
            ACCESS_READ_WRITE => Ok(Self::ReadWrite),
            _ => Err(Error::Codec(codec::Error::UnknownAccess)),
        }
    }
}

/// A registered block of memory.
///
/// The registry owns the bytes; one-sided traffic and the local user
/// both reach them through the region mutex, and a copy never spans a
/// suspension point while the mutex is held.
pub struct MemoryRegion {
    len: usize,
    data: Mutex<Box<[u8]>>,
}

impl MemoryRegion {
    fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            len,
            data: Mutex::new(vec![0u8; len].into_boxed_slice()),
        })
    }

    pub(crate) fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<(), Error> {
        let end = offset
            .checked_add(bytes.len() as u64)
            .ok_or(Error::BufferTooSmall)?;
        if end > self.len as u64 {
            return Err(Error::BufferTooSmall);
        }

        let offset = offset as usize;
        self.data.lock()[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub(crate) fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, Error> {
        let end = offset.checked_add(len as u64).ok_or(Error::BufferTooSmall)?;
        if end > self.len as u64 {
            return Err(Error::BufferTooSmall);
        }

        let offset = offset as usize;
        Ok(Bytes::copy_from_slice(
            &self.data.lock()[offset..offset + len],
        ))
    }
}

/// An opaque descriptor of a registered region, serializable by value.
///
/// A handle produced by registration keeps the region attached so the
/// owner can fill and inspect it. A handle produced by deserialization
/// is a distinct descriptor owned by the receiver with no attached
/// region; it only names memory on the peer that registered it.
pub struct MemoryHandle {
    region_id: u64,
    len: u64,
    access: AccessMode,
    region: Option<Arc<MemoryRegion>>,
}

impl MemoryHandle {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    /// Copy bytes into the attached region.
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<(), Error> {
        self.region
            .as_ref()
            .ok_or(Error::NullArgument)?
            .write_at(offset, bytes)
    }

    /// Copy bytes out of the attached region.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, Error> {
        self.region
            .as_ref()
            .ok_or(Error::NullArgument)?
            .read_at(offset, len)
    }

    pub(crate) fn region_id(&self) -> u64 {
        self.region_id
    }

    pub(crate) fn region(&self) -> Option<Arc<MemoryRegion>> {
        self.region.clone()
    }

    pub(crate) fn image(&self) -> MemHandleImage {
        MemHandleImage {
            region: self.region_id,
            len: self.len,
            access: self.access.to_wire(),
        }
    }

    pub(crate) fn from_image(image: MemHandleImage) -> Result<Self, Error> {
        Ok(Self {
            region_id: image.region,
            len: image.len,
            access: AccessMode::from_wire(image.access)?,
            region: None,
        })
    }
}

impl std::fmt::Debug for MemoryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHandle")
            .field("region", &self.region_id)
            .field("len", &self.len)
            .field("access", &self.access)
            .finish()
    }
}

/// Region identifiers to regions, shared between the user-facing
/// registration calls and whichever engine answers one-sided traffic.
///
/// Identifiers are minted from an atomic counter, so re-registering
/// the same contents can never collide with a live registration.
pub(crate) struct RegionTable {
    next: AtomicU64,
    map: Mutex<AHashMap<u64, Arc<MemoryRegion>>>,
}

impl RegionTable {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            map: Mutex::new(AHashMap::new()),
        }
    }

    pub(crate) fn register(&self, len: usize, access: AccessMode) -> MemoryHandle {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let region = MemoryRegion::new(len);
        self.map.lock().insert(id, region.clone());

        MemoryHandle {
            region_id: id,
            len: len as u64,
            access,
            region: Some(region),
        }
    }

    pub(crate) fn lookup(&self, id: u64) -> Option<Arc<MemoryRegion>> {
        self.map.lock().get(&id).cloned()
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        self.map.lock().remove(&id).is_some()
    }
}
