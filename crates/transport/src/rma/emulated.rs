//! One-sided semantics over a two-sided substrate.
//!
//! The initiator announces every transfer with a control record on the
//! side channel. On the exposing side a service task consumes those
//! records: for a put it receives the payload into the named region
//! and acknowledges, for a get it sends the requested bytes back. The
//! acknowledgement is what makes a put observably complete at the
//! initiator; its wait blocks on both the payload and the ack.

use crate::{
    Error,
    memory::{MemoryRegion, RegionTable},
    request::Request,
    substrate::{Link, SIDE},
};

use std::sync::Arc;

use bytes::Bytes;
use codec::{
    ONESIDED_ACK_TAG, ONESIDED_TAG,
    rma::{ControlRecord, RmaOp},
};
use parking_lot::Mutex;
use tokio::{sync::watch, task::JoinHandle};

pub(crate) fn put(
    link: &Arc<Link>,
    payload: Bytes,
    region: u64,
    disp: u64,
) -> Result<Request, Error> {
    let record = ControlRecord {
        op: RmaOp::Put,
        region,
        disp,
        count: payload.len() as u32,
    };

    // Control record first, payload second; the link preserves order.
    link.send(SIDE, ONESIDED_TAG, &record.encode())?;
    let primary = link.send(SIDE, ONESIDED_TAG, &payload)?;
    let ack = link.post(SIDE, Some(ONESIDED_ACK_TAG))?;

    Ok(Request::put(primary, ack))
}

pub(crate) fn get(
    link: &Arc<Link>,
    sink: Arc<MemoryRegion>,
    sink_offset: u64,
    region: u64,
    disp: u64,
    count: u32,
) -> Result<Request, Error> {
    let record = ControlRecord {
        op: RmaOp::Get,
        region,
        disp,
        count,
    };

    link.send(SIDE, ONESIDED_TAG, &record.encode())?;
    let primary = link.post(SIDE, Some(ONESIDED_TAG))?;

    Ok(Request::get(primary, sink, sink_offset))
}

/// Handle on a running service task.
pub(crate) struct ServiceHandle {
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceHandle {
    /// Signal the loop and join it. The signal guarantees the join
    /// wakes even when no end record ever arrives.
    pub(crate) async fn stop(&self) {
        let _ = self.shutdown.send(true);

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

pub(crate) fn spawn_service(link: Arc<Link>, regions: Arc<RegionTable>) -> ServiceHandle {
    let (shutdown, observed) = watch::channel(false);
    let task = tokio::spawn(service_loop(link, regions, observed));

    ServiceHandle {
        shutdown,
        task: Mutex::new(Some(task)),
    }
}

async fn service_loop(
    link: Arc<Link>,
    regions: Arc<RegionTable>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let mut control = match link.post(SIDE, None) {
            Ok(transfer) => transfer,
            Err(_) => break,
        };

        let bytes = tokio::select! {
            _ = shutdown.changed() => break,
            outcome = control.recv() => match outcome {
                Ok(Some(bytes)) => bytes,
                _ => break,
            },
        };

        let record = match ControlRecord::decode(&bytes) {
            Ok(record) => record,
            Err(e) => {
                log::error!("malformed control record: {:?}", e);
                continue;
            }
        };

        if record.op == RmaOp::End {
            break;
        }

        let Some(region) = regions.lookup(record.region) else {
            log::error!(
                "no region {} for {:?}, registered?",
                record.region,
                record.op
            );
            continue;
        };

        match record.op {
            RmaOp::Put => {
                let mut payload = match link.post(SIDE, Some(ONESIDED_TAG)) {
                    Ok(transfer) => transfer,
                    Err(_) => break,
                };
                // The shutdown signal must also reach a service stuck
                // waiting for a payload that never comes.
                let bytes = tokio::select! {
                    _ = shutdown.changed() => break,
                    outcome = payload.recv() => match outcome {
                        Ok(Some(bytes)) => bytes,
                        _ => break,
                    },
                };

                if let Err(e) = region.write_at(record.disp, &bytes) {
                    log::error!(
                        "put of {} bytes at {} does not fit region {}: {:?}",
                        bytes.len(),
                        record.disp,
                        record.region,
                        e
                    );
                }

                // The ack tells the initiator the payload arrived.
                if link.send(SIDE, ONESIDED_ACK_TAG, &[1]).is_err() {
                    break;
                }
            }
            RmaOp::Get => match region.read_at(record.disp, record.count as usize) {
                Ok(bytes) => {
                    if link.send(SIDE, ONESIDED_TAG, &bytes).is_err() {
                        break;
                    }
                }
                Err(e) => log::error!(
                    "get of {} bytes at {} does not fit region {}: {:?}",
                    record.count,
                    record.disp,
                    record.region,
                    e
                ),
            },
            RmaOp::End => break,
        }
    }
}
