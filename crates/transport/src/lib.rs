//! ## Network abstraction for function shipping
//!
//! A [`Node`] gives the call layer above it a uniform async surface:
//! addressable peers, tagged send and receive, memory registration,
//! and one-sided put and get, with non-blocking operations handed back
//! as [`Request`]s that a wait consumes. Underneath sits a
//! message-passing substrate; when its protocol revision carries
//! window frames the one-sided operations map straight onto them,
//! otherwise they are emulated by a service task on the side exposing
//! the memory, fed through a control channel.
//!
//! A server node opens a port, publishes its name, and admits peers in
//! the background. A client reaches it through [`Node::addr_lookup`]
//! with the published name. Registered memory travels by value: a
//! handle is serialized into a call payload, deserialized by the peer,
//! and used there as the remote side of a transfer.

pub mod addr;
pub mod memory;
pub mod request;
pub mod rma;

mod substrate;

pub use addr::Address;
pub use codec::{MAX_TRANSFER_LEN, MAX_UNEXPECTED_SIZE, PORT_NAME_LEN, rma::MEM_HANDLE_LEN};
pub use memory::{AccessMode, MemoryHandle};
pub use request::{Request, Status};
pub use rma::RmaMode;

use self::{
    memory::RegionTable,
    substrate::{PRIMARY, SIDE, ServerComm},
};

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use codec::rma::{ControlRecord, MemHandleImage};

#[derive(Debug)]
pub enum Error {
    /// Opening the port or the substrate itself failed; fatal.
    Init(std::io::Error),
    /// The emulated path runs without the required threading level.
    Threading,
    /// The named port could not be reached.
    Connect(std::io::Error),
    BufferTooSmall,
    /// Put against a handle that does not permit writes.
    Permission,
    NullArgument,
    /// A handle or address was released twice.
    DoubleFree,
    /// The transfer exceeds the signed 32-bit count the wire carries.
    MessageTooLarge,
    /// The link behind the operation is gone.
    Closed,
    Substrate(std::io::Error),
    Codec(codec::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        match value {
            codec::Error::BufferTooSmall => Self::BufferTooSmall,
            value => Self::Codec(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens a port, publishes its name, accepts peers.
    Server,
    Client,
}

pub struct NodeOptions {
    pub role: Role,
    /// Server bind address; a loopback ephemeral port when absent.
    pub listen: Option<SocketAddr>,
    /// Where the server publishes its port name; nothing is written
    /// when absent.
    pub port_file: Option<PathBuf>,
    pub rma: RmaMode,
}

/// An unexpected message discovered by probing.
pub struct Unexpected {
    pub request: Request,
    /// Reference address of the sender, borrowing the server link.
    pub source: Address,
    pub tag: u32,
    pub count: usize,
}

/// Process-wide transport state, created by [`Node::bind`] and torn
/// down by [`Node::finalize`].
pub struct Node {
    role: Role,
    rma: RmaMode,
    port_name: String,
    server: Option<ServerComm>,
    regions: Arc<RegionTable>,
}

impl Node {
    pub async fn bind(options: NodeOptions) -> Result<Node, Error> {
        if options.rma == RmaMode::Emulated {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::CurrentThread {
                    // User tasks and the service must be able to make
                    // progress concurrently.
                    log::error!(
                        "emulated one-sided mode needs a multi-thread runtime, continuing anyway"
                    );
                }
            }
        }

        let regions = Arc::new(RegionTable::new());

        match options.role {
            Role::Server => {
                let listen = options
                    .listen
                    .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)));
                let (server, local) =
                    ServerComm::open(listen, options.rma, regions.clone()).await?;

                let port_name = local.to_string();
                if let Some(path) = &options.port_file {
                    publish_port_name(path, &port_name).map_err(Error::Init)?;
                }

                Ok(Node {
                    role: Role::Server,
                    rma: options.rma,
                    port_name,
                    server: Some(server),
                    regions,
                })
            }
            Role::Client => Ok(Node {
                role: Role::Client,
                rma: options.rma,
                port_name: String::new(),
                server: None,
                regions,
            }),
        }
    }

    /// Tear the node down. A server first asks every connected peer's
    /// service to exit with an end record, then closes the port and
    /// the links.
    pub async fn finalize(self) -> Result<(), Error> {
        if let Some(server) = &self.server {
            if self.rma == RmaMode::Emulated {
                let record = ControlRecord::end().encode();
                for link in server.links() {
                    if let Err(e) = link.send(SIDE, codec::ONESIDED_TAG, &record) {
                        log::warn!("end record to rank {} failed: {:?}", link.rank(), e);
                    }
                }
            }

            server.shutdown().await;
        }

        Ok(())
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The published port name, unpadded.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Maximum size of an unexpected message.
    pub fn unexpected_size(&self) -> usize {
        MAX_UNEXPECTED_SIZE
    }

    /// Connect to the peer publishing `name`; trailing NULs from a
    /// port file are accepted.
    pub async fn addr_lookup(&self, name: &str) -> Result<Address, Error> {
        addr::lookup(name, self.rma, &self.regions).await
    }

    pub async fn addr_free(&self, address: &Address) -> Result<(), Error> {
        addr::free(address).await
    }

    /// No difference from [`Node::send`] on this substrate.
    pub fn send_unexpected(&self, buf: &[u8], dest: &Address, tag: u32) -> Result<Request, Error> {
        self.send(buf, dest, tag)
    }

    /// Non-blocking tagged send on the primary channel.
    pub fn send(&self, buf: &[u8], dest: &Address, tag: u32) -> Result<Request, Error> {
        if buf.len() > MAX_TRANSFER_LEN {
            return Err(Error::MessageTooLarge);
        }

        Ok(Request::send(dest.link().send(PRIMARY, tag, buf)?))
    }

    /// Non-blocking tagged receive on the primary channel.
    pub fn recv(&self, source: &Address, tag: u32) -> Result<Request, Error> {
        Ok(Request::recv(source.link().post(PRIMARY, Some(tag))?))
    }

    /// Probe the server links for a message nobody posted a receive
    /// for. Nothing pending is a success without a request. A message
    /// larger than `capacity` or the unexpected maximum fails without
    /// consuming it. Otherwise the receive is posted and the sender
    /// comes back as a reference address.
    pub fn recv_unexpected(&self, capacity: usize) -> Result<Option<Unexpected>, Error> {
        let server = self.server.as_ref().ok_or(Error::NullArgument)?;

        for link in server.links() {
            let Some((tag, count)) = link.probe(PRIMARY) else {
                continue;
            };

            if count > capacity.min(MAX_UNEXPECTED_SIZE) {
                return Err(Error::BufferTooSmall);
            }

            let request = Request::recv(link.post(PRIMARY, Some(tag))?);
            let source = Address::reference(link.clone(), link.rank());

            return Ok(Some(Unexpected {
                request,
                source,
                tag,
                count,
            }));
        }

        Ok(None)
    }

    /// Expose `len` zeroed bytes for one-sided access and hand back
    /// their descriptor. On the native path this attaches the region
    /// to the window; on the emulated path it enters the map the
    /// service resolves regions from. Either way the registry owns the
    /// bytes, reachable through the handle.
    pub fn mem_register(&self, len: usize, access: AccessMode) -> Result<MemoryHandle, Error> {
        Ok(self.regions.register(len, access))
    }

    pub fn mem_deregister(&self, handle: &MemoryHandle) -> Result<(), Error> {
        if !self.regions.remove(handle.region_id()) {
            return Err(Error::DoubleFree);
        }

        Ok(())
    }

    /// Copy the fixed-size handle image into `buf`; fails without side
    /// effects when `buf` is shorter than [`MEM_HANDLE_LEN`].
    pub fn mem_handle_serialize(&self, buf: &mut [u8], handle: &MemoryHandle) -> Result<(), Error> {
        Ok(handle.image().write_to(buf)?)
    }

    /// The returned handle is a fresh descriptor owned by the caller,
    /// naming memory on the peer that registered it.
    pub fn mem_handle_deserialize(&self, buf: &[u8]) -> Result<MemoryHandle, Error> {
        MemoryHandle::from_image(MemHandleImage::read_from(buf)?)
    }

    /// Release a handle obtained from deserialization.
    pub fn mem_handle_free(&self, handle: MemoryHandle) -> Result<(), Error> {
        drop(handle);
        Ok(())
    }

    /// Store `length` bytes from the local region into the remote one.
    ///
    /// The remote handle must permit writes; a violation is a local
    /// error and no traffic is generated.
    pub fn put(
        &self,
        local: &MemoryHandle,
        local_offset: u64,
        remote: &MemoryHandle,
        remote_offset: u64,
        length: usize,
        dest: &Address,
    ) -> Result<Request, Error> {
        if remote.access() != AccessMode::ReadWrite {
            return Err(Error::Permission);
        }
        if length > MAX_TRANSFER_LEN {
            return Err(Error::MessageTooLarge);
        }
        check_range(remote_offset, length, remote.len())?;

        let payload = local.read_at(local_offset, length)?;

        match self.rma {
            RmaMode::Emulated => {
                rma::emulated::put(dest.link(), payload, remote.region_id(), remote_offset)
            }
            RmaMode::Native => Ok(rma::native::put(
                dest.link().clone(),
                payload,
                remote.region_id(),
                remote_offset,
            )),
        }
    }

    /// Load `length` bytes from the remote region into the local one.
    pub fn get(
        &self,
        local: &MemoryHandle,
        local_offset: u64,
        remote: &MemoryHandle,
        remote_offset: u64,
        length: usize,
        source: &Address,
    ) -> Result<Request, Error> {
        if length > MAX_TRANSFER_LEN {
            return Err(Error::MessageTooLarge);
        }
        check_range(local_offset, length, local.len())?;
        check_range(remote_offset, length, remote.len())?;

        let sink = local.region().ok_or(Error::NullArgument)?;

        match self.rma {
            RmaMode::Emulated => rma::emulated::get(
                source.link(),
                sink,
                local_offset,
                remote.region_id(),
                remote_offset,
                length as u32,
            ),
            RmaMode::Native => Ok(rma::native::get(
                source.link().clone(),
                sink,
                local_offset,
                remote.region_id(),
                remote_offset,
                length as u32,
            )),
        }
    }

    /// Wait for a request.
    ///
    /// A zero timeout tests the request: when it is incomplete the
    /// status reports `completed == false`, the call succeeds, and the
    /// request stays alive. A positive timeout bounds the wait in
    /// milliseconds and expiry behaves like the zero case. Completion
    /// consumes the request; waiting again returns
    /// [`Error::DoubleFree`].
    pub async fn wait(&self, request: &mut Request, timeout_ms: u32) -> Result<Status, Error> {
        request.complete(timeout_ms).await
    }
}

fn check_range(offset: u64, length: usize, len: u64) -> Result<(), Error> {
    let end = offset
        .checked_add(length as u64)
        .ok_or(Error::BufferTooSmall)?;
    if end > len {
        return Err(Error::BufferTooSmall);
    }

    Ok(())
}

fn publish_port_name(path: &Path, name: &str) -> std::io::Result<()> {
    let mut bytes = [0u8; PORT_NAME_LEN];
    let raw = name.as_bytes();
    let len = raw.len().min(PORT_NAME_LEN);
    bytes[..len].copy_from_slice(&raw[..len]);
    std::fs::write(path, bytes)
}

/// Read a published port name, exactly [`PORT_NAME_LEN`] bytes with
/// trailing NULs preserved.
pub fn read_port_name(path: impl AsRef<Path>) -> Result<String, Error> {
    let bytes = std::fs::read(path).map_err(Error::Init)?;
    if bytes.len() < PORT_NAME_LEN {
        return Err(Error::BufferTooSmall);
    }

    Ok(String::from_utf8_lossy(&bytes[..PORT_NAME_LEN]).into_owned())
}
