use crate::{Error, memory::MemoryRegion};

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::sync::oneshot::{self, error::TryRecvError};

/// What a finished transfer hands back: the received bytes for a
/// receive, nothing for a send.
pub(crate) type Completion = Result<Option<Bytes>, Error>;

pub(crate) type CompletionSender = oneshot::Sender<Completion>;

/// One half-completed wire operation, fulfilled by the writer task
/// (sends) or the demultiplexer (receives).
pub(crate) struct Transfer(oneshot::Receiver<Completion>);

impl Transfer {
    pub(crate) fn pair() -> (CompletionSender, Transfer) {
        let (sender, receiver) = oneshot::channel();
        (sender, Transfer(receiver))
    }

    fn try_poll(&mut self) -> Option<Completion> {
        match self.0.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(Error::Closed)),
        }
    }

    pub(crate) async fn recv(&mut self) -> Completion {
        match (&mut self.0).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Closed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Send,
    Recv,
}

/// An outstanding non-blocking operation.
///
/// Every request is consumed by exactly one completing wait. An
/// emulated put carries a second transfer for the acknowledgement and
/// does not complete until both have finished. A get carries the sink
/// the received bytes are stored into.
pub struct Request {
    kind: OpKind,
    primary: Option<Transfer>,
    ack: Option<Transfer>,
    sink: Option<(Arc<MemoryRegion>, u64)>,
}

/// Completion report of a wait.
///
/// `completed == false` means the request is still in flight and has
/// not been consumed. `count` is the received byte count for receive
/// operations and zero for sends. `data` carries the payload of a
/// plain receive; one-sided transfers deliver into their region
/// instead.
#[derive(Debug, Clone, Default)]
pub struct Status {
    pub completed: bool,
    pub count: usize,
    pub data: Option<Bytes>,
}

impl Request {
    pub(crate) fn send(primary: Transfer) -> Self {
        Self {
            kind: OpKind::Send,
            primary: Some(primary),
            ack: None,
            sink: None,
        }
    }

    pub(crate) fn recv(primary: Transfer) -> Self {
        Self {
            kind: OpKind::Recv,
            primary: Some(primary),
            ack: None,
            sink: None,
        }
    }

    pub(crate) fn put(primary: Transfer, ack: Transfer) -> Self {
        Self {
            kind: OpKind::Send,
            primary: Some(primary),
            ack: Some(ack),
            sink: None,
        }
    }

    pub(crate) fn get(primary: Transfer, region: Arc<MemoryRegion>, offset: u64) -> Self {
        Self {
            kind: OpKind::Recv,
            primary: Some(primary),
            ack: None,
            sink: Some((region, offset)),
        }
    }

    pub(crate) async fn complete(&mut self, timeout_ms: u32) -> Result<Status, Error> {
        let primary = self.primary.as_mut().ok_or(Error::DoubleFree)?;

        let outcome = if timeout_ms == 0 {
            match primary.try_poll() {
                Some(outcome) => outcome,
                None => return Ok(Status::default()),
            }
        } else {
            // The timeout only bounds the primary transfer; expiry
            // leaves the request alive, exactly like the zero case.
            match tokio::time::timeout(Duration::from_millis(timeout_ms as u64), primary.recv())
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => return Ok(Status::default()),
            }
        };

        // The request is consumed from here on, also on error paths.
        self.primary.take();
        let ack = self.ack.take();
        let sink = self.sink.take();

        let payload = outcome?;

        let count = match self.kind {
            OpKind::Recv => payload.as_ref().map(|bytes| bytes.len()).unwrap_or(0),
            OpKind::Send => 0,
        };

        let data = if let Some((region, offset)) = sink {
            if let Some(bytes) = payload.as_ref() {
                region.write_at(offset, bytes)?;
            }
            None
        } else if self.kind == OpKind::Recv {
            payload
        } else {
            None
        };

        // A put is only observably complete once the remote service
        // acknowledged the payload.
        if let Some(mut ack) = ack {
            ack.recv().await?;
        }

        Ok(Status {
            completed: true,
            count,
            data,
        })
    }
}
