use crate::{
    Error,
    memory::RegionTable,
    rma::{RmaMode, emulated::{self, ServiceHandle}},
    substrate::{self, Link},
};

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::net::TcpStream;

pub(crate) enum AddrRma {
    /// The address hosts the service answering one-sided requests from
    /// its peer.
    Emulated(ServiceHandle),
    /// Window operations need no per-address worker.
    None,
}

pub(crate) struct AddrInner {
    pub(crate) link: Arc<Link>,
    pub(crate) rank: u32,
    pub(crate) is_reference: bool,
    pub(crate) freed: AtomicBool,
    pub(crate) rma: AddrRma,
}

/// A connected peer.
///
/// Addresses come out of a lookup, which owns its connection, or out
/// of an unexpected receive, which only references the link the
/// message arrived on. A reference address never tears anything down
/// when freed.
#[derive(Clone)]
pub struct Address(pub(crate) Arc<AddrInner>);

impl Address {
    pub fn rank(&self) -> u32 {
        self.0.rank
    }

    pub fn is_reference(&self) -> bool {
        self.0.is_reference
    }

    pub(crate) fn link(&self) -> &Arc<Link> {
        &self.0.link
    }

    pub(crate) fn reference(link: Arc<Link>, rank: u32) -> Self {
        Self(Arc::new(AddrInner {
            link,
            rank,
            is_reference: true,
            freed: AtomicBool::new(false),
            rma: AddrRma::None,
        }))
    }
}

pub(crate) async fn lookup(
    name: &str,
    mode: RmaMode,
    regions: &Arc<RegionTable>,
) -> Result<Address, Error> {
    let name = name.trim_end_matches('\0');
    let peer: SocketAddr = name.parse().map_err(|_| {
        Error::Connect(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "malformed port name",
        ))
    })?;

    let mut stream = TcpStream::connect(peer).await.map_err(Error::Connect)?;
    let hello = substrate::handshake(&mut stream, mode).await?;
    substrate::validate_hello(&hello, mode)?;

    let link = Link::spawn(stream, 0, regions.clone());
    let rma = match mode {
        RmaMode::Emulated => {
            AddrRma::Emulated(emulated::spawn_service(link.clone(), regions.clone()))
        }
        RmaMode::Native => AddrRma::None,
    };

    Ok(Address(Arc::new(AddrInner {
        link,
        // The port admits a single server process.
        rank: 0,
        is_reference: false,
        freed: AtomicBool::new(false),
        rma,
    })))
}

pub(crate) async fn free(addr: &Address) -> Result<(), Error> {
    if addr.0.freed.swap(true, Ordering::AcqRel) {
        return Err(Error::DoubleFree);
    }

    // Reference addresses borrow their link from the server side and
    // must leave it alone.
    if addr.0.is_reference {
        return Ok(());
    }

    if let AddrRma::Emulated(service) = &addr.0.rma {
        service.stop().await;
    }

    addr.0.link.disconnect().await;
    Ok(())
}
