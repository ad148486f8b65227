//! One-sided operations over a substrate that carries window frames.
//!
//! The peer's demultiplexer applies puts and answers gets directly
//! against the attached regions, so no service task exists in this
//! mode. Issuance is bracketed by the per-target window lock,
//! exclusive for a put and shared for a get, released before the
//! completion is awaited.

use crate::{
    memory::MemoryRegion,
    request::{Request, Transfer},
    substrate::Link,
};

use std::sync::Arc;

use bytes::Bytes;

pub(crate) fn put(link: Arc<Link>, payload: Bytes, region: u64, offset: u64) -> Request {
    let (done, transfer) = Transfer::pair();

    tokio::spawn(async move {
        let issued = {
            let _guard = link.win_lock().write().await;
            link.window_put(region, offset, &payload)
        };

        let outcome = match issued {
            Ok(mut transfer) => transfer.recv().await,
            Err(e) => Err(e),
        };

        let _ = done.send(outcome.map(|_| None));
    });

    Request::send(transfer)
}

pub(crate) fn get(
    link: Arc<Link>,
    sink: Arc<MemoryRegion>,
    sink_offset: u64,
    region: u64,
    offset: u64,
    count: u32,
) -> Request {
    let (done, transfer) = Transfer::pair();

    tokio::spawn(async move {
        let issued = {
            let _guard = link.win_lock().read().await;
            link.window_get(region, offset, count)
        };

        let outcome = match issued {
            Ok(mut transfer) => transfer.recv().await,
            Err(e) => Err(e),
        };

        let _ = done.send(outcome);
    });

    Request::get(transfer, sink, sink_offset)
}
