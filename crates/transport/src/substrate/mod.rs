//! The message-passing layer everything else is built on.
//!
//! A [`Link`] is one TCP connection driven by two tasks: a writer fed
//! through a channel, signalling completion per frame, and a
//! demultiplexer that routes inbound frames. Two logical channels are
//! multiplexed on every link, each with its own message space: the
//! primary channel carries user traffic, the side channel is reserved
//! for one-sided operations. Tagged receives match queued frames per
//! (link, channel) in arrival order; a probe inspects the queue head
//! without consuming it.
//!
//! From protocol revision 3 on, links also carry window frames which
//! the demultiplexer applies directly against the attached regions;
//! older revisions only speak two-sided messages, and one-sided
//! semantics have to be emulated above this layer.

use crate::{
    Error,
    memory::RegionTable,
    request::{CompletionSender, Transfer},
    rma::RmaMode,
};

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use ahash::AHashMap;
use bytes::Bytes;
use codec::frame::{
    self, FrameHeader, FrameKind, HEADER_LEN, Hello, WINDOW_GET_RESP_HEAD_LEN,
    WINDOW_PUT_HEAD_LEN, WindowGetReq, WindowGetRespHead, WindowPutHead,
};
use parking_lot::{Mutex, RwLock};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    task::JoinHandle,
};

/// Channel id of the primary message space.
pub(crate) const PRIMARY: u8 = 0;

/// Channel id of the side channel reserved for one-sided traffic.
pub(crate) const SIDE: u8 = 1;

const CHANNELS: usize = 2;

enum WriteOp {
    Frame {
        bytes: Bytes,
        done: Option<CompletionSender>,
    },
    Shutdown,
}

struct PendingRecv {
    tag: Option<u32>,
    reply: CompletionSender,
}

impl PendingRecv {
    fn matches(&self, tag: u32) -> bool {
        self.tag.map(|want| want == tag).unwrap_or(true)
    }
}

#[derive(Default)]
struct Mailbox {
    queued: VecDeque<(u32, Bytes)>,
    pending: VecDeque<PendingRecv>,
    closed: bool,
}

/// One connected peer.
pub(crate) struct Link {
    rank: u32,
    peer: SocketAddr,
    writer: mpsc::UnboundedSender<WriteOp>,
    mailboxes: [Mutex<Mailbox>; CHANNELS],
    pending_gets: Mutex<AHashMap<u32, CompletionSender>>,
    get_seq: AtomicU32,
    win_lock: tokio::sync::RwLock<()>,
    regions: Arc<RegionTable>,
    demux: Mutex<Option<JoinHandle<()>>>,
}

impl Link {
    pub(crate) fn spawn(stream: TcpStream, rank: u32, regions: Arc<RegionTable>) -> Arc<Link> {
        let peer = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (read, write) = stream.into_split();

        let (writer, writer_queue) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(write, writer_queue));

        let link = Arc::new(Link {
            rank,
            peer,
            writer,
            mailboxes: [Mutex::new(Mailbox::default()), Mutex::new(Mailbox::default())],
            pending_gets: Mutex::new(AHashMap::new()),
            get_seq: AtomicU32::new(0),
            win_lock: tokio::sync::RwLock::new(()),
            regions,
            demux: Mutex::new(None),
        });

        let handle = tokio::spawn(demux_loop(link.clone(), read));
        *link.demux.lock() = Some(handle);

        link
    }

    pub(crate) fn rank(&self) -> u32 {
        self.rank
    }

    pub(crate) fn win_lock(&self) -> &tokio::sync::RwLock<()> {
        &self.win_lock
    }

    fn enqueue(&self, bytes: Bytes, done: Option<CompletionSender>) -> Result<(), Error> {
        self.writer
            .send(WriteOp::Frame { bytes, done })
            .map_err(|_| Error::Closed)
    }

    /// Non-blocking tagged send; the transfer completes once the frame
    /// reached the socket.
    pub(crate) fn send(&self, channel: u8, tag: u32, payload: &[u8]) -> Result<Transfer, Error> {
        let (done, transfer) = Transfer::pair();
        self.enqueue(
            frame::build(FrameKind::Message, channel, tag, &[payload]),
            Some(done),
        )?;
        Ok(transfer)
    }

    /// Non-blocking tagged receive. `None` matches any tag. A frame
    /// already queued is consumed immediately, otherwise the matcher
    /// waits for delivery.
    pub(crate) fn post(&self, channel: u8, tag: Option<u32>) -> Result<Transfer, Error> {
        let mut mailbox = self.mailboxes[channel as usize].lock();
        if mailbox.closed {
            return Err(Error::Closed);
        }

        let (reply, transfer) = Transfer::pair();
        let matched = mailbox
            .queued
            .iter()
            .position(|(queued, _)| tag.map(|want| want == *queued).unwrap_or(true));

        if let Some(index) = matched {
            if let Some((_, bytes)) = mailbox.queued.remove(index) {
                let _ = reply.send(Ok(Some(bytes)));
            }
        } else {
            mailbox.pending.push_back(PendingRecv { tag, reply });
        }

        Ok(transfer)
    }

    /// Inspect the oldest queued frame without consuming it.
    pub(crate) fn probe(&self, channel: u8) -> Option<(u32, usize)> {
        let mailbox = self.mailboxes[channel as usize].lock();
        mailbox
            .queued
            .front()
            .map(|(tag, bytes)| (*tag, bytes.len()))
    }

    pub(crate) fn window_put(&self, region: u64, offset: u64, data: &[u8]) -> Result<Transfer, Error> {
        let head = WindowPutHead { region, offset }.encode();
        let (done, transfer) = Transfer::pair();
        self.enqueue(
            frame::build(FrameKind::WindowPut, 0, 0, &[&head, data]),
            Some(done),
        )?;
        Ok(transfer)
    }

    pub(crate) fn window_get(&self, region: u64, offset: u64, count: u32) -> Result<Transfer, Error> {
        let seq = self.get_seq.fetch_add(1, Ordering::Relaxed);
        let (reply, transfer) = Transfer::pair();
        self.pending_gets.lock().insert(seq, reply);

        let body = WindowGetReq {
            region,
            offset,
            count,
            seq,
        }
        .encode();

        if let Err(e) = self.enqueue(frame::build(FrameKind::WindowGetReq, 0, 0, &[&body]), None) {
            self.pending_gets.lock().remove(&seq);
            return Err(e);
        }

        Ok(transfer)
    }

    fn deliver(&self, channel: u8, tag: u32, mut payload: Bytes) {
        let Some(mailbox) = self.mailboxes.get(channel as usize) else {
            log::warn!("message on unknown channel {} from rank {}", channel, self.rank);
            return;
        };

        let mut mailbox = mailbox.lock();
        let mut index = 0;
        while index < mailbox.pending.len() {
            if mailbox.pending[index].matches(tag) {
                let Some(entry) = mailbox.pending.remove(index) else {
                    break;
                };

                match entry.reply.send(Ok(Some(payload))) {
                    Ok(()) => return,
                    // The matcher was abandoned; keep the frame for
                    // the next one.
                    Err(Ok(Some(returned))) => payload = returned,
                    Err(_) => return,
                }
            } else {
                index += 1;
            }
        }

        mailbox.queued.push_back((tag, payload));
    }

    fn apply_window_put(&self, payload: Bytes) {
        let head = match WindowPutHead::decode(&payload) {
            Ok(head) => head,
            Err(e) => {
                log::warn!("malformed window put from rank {}: {:?}", self.rank, e);
                return;
            }
        };

        let data = payload.slice(WINDOW_PUT_HEAD_LEN..);
        let Some(region) = self.regions.lookup(head.region) else {
            log::error!("window put against unknown region {}, registered?", head.region);
            return;
        };

        if let Err(e) = region.write_at(head.offset, &data) {
            log::error!(
                "window put of {} bytes at {} does not fit region {}: {:?}",
                data.len(),
                head.offset,
                head.region,
                e
            );
        }
    }

    fn answer_window_get(&self, payload: Bytes) {
        let req = match WindowGetReq::decode(&payload) {
            Ok(req) => req,
            Err(e) => {
                log::warn!("malformed window get from rank {}: {:?}", self.rank, e);
                return;
            }
        };

        let Some(region) = self.regions.lookup(req.region) else {
            log::error!("window get against unknown region {}, registered?", req.region);
            return;
        };

        match region.read_at(req.offset, req.count as usize) {
            Ok(data) => {
                let head = WindowGetRespHead { seq: req.seq }.encode();
                let _ = self.enqueue(
                    frame::build(FrameKind::WindowGetResp, 0, 0, &[&head, &data]),
                    None,
                );
            }
            Err(e) => log::error!(
                "window get of {} bytes at {} does not fit region {}: {:?}",
                req.count,
                req.offset,
                req.region,
                e
            ),
        }
    }

    fn fulfill_window_get(&self, payload: Bytes) {
        let head = match WindowGetRespHead::decode(&payload) {
            Ok(head) => head,
            Err(e) => {
                log::warn!("malformed window get response from rank {}: {:?}", self.rank, e);
                return;
            }
        };

        let data = payload.slice(WINDOW_GET_RESP_HEAD_LEN..);
        match self.pending_gets.lock().remove(&head.seq) {
            Some(reply) => {
                let _ = reply.send(Ok(Some(data)));
            }
            None => log::warn!("window get response with unknown seq {}", head.seq),
        }
    }

    /// Fail every waiter behind a link that went down.
    fn close(&self) {
        for mailbox in &self.mailboxes {
            let mut mailbox = mailbox.lock();
            mailbox.closed = true;
            mailbox.queued.clear();
            for entry in mailbox.pending.drain(..) {
                let _ = entry.reply.send(Err(Error::Closed));
            }
        }

        for (_, reply) in self.pending_gets.lock().drain() {
            let _ = reply.send(Err(Error::Closed));
        }
    }

    pub(crate) async fn disconnect(&self) {
        let _ = self.writer.send(WriteOp::Shutdown);

        let handle = self.demux.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        self.close();
    }
}

async fn write_loop(mut write: OwnedWriteHalf, mut queue: mpsc::UnboundedReceiver<WriteOp>) {
    while let Some(op) = queue.recv().await {
        match op {
            WriteOp::Frame { bytes, done } => {
                let result = async {
                    write.write_all(&bytes).await?;
                    write.flush().await
                }
                .await;

                match result {
                    Ok(()) => {
                        if let Some(done) = done {
                            let _ = done.send(Ok(None));
                        }
                    }
                    Err(e) => {
                        log::warn!("link write error: {:?}", e);
                        if let Some(done) = done {
                            let _ = done.send(Err(Error::Substrate(e)));
                        }
                        break;
                    }
                }
            }
            WriteOp::Shutdown => {
                let _ = write.shutdown().await;
                break;
            }
        }
    }

    // Whatever is still queued behind a dead socket fails.
    queue.close();
    while let Ok(op) = queue.try_recv() {
        if let WriteOp::Frame {
            done: Some(done), ..
        } = op
        {
            let _ = done.send(Err(Error::Closed));
        }
    }
}

async fn demux_loop(link: Arc<Link>, mut read: OwnedReadHalf) {
    loop {
        let mut header = [0u8; HEADER_LEN];
        if read.read_exact(&mut header).await.is_err() {
            break;
        }

        let header = match FrameHeader::decode(&header) {
            Ok(header) => header,
            Err(e) => {
                log::warn!("bad frame header from rank {}: {:?}", link.rank, e);
                break;
            }
        };

        let mut payload = vec![0u8; header.len as usize];
        if read.read_exact(&mut payload).await.is_err() {
            break;
        }
        let payload = Bytes::from(payload);

        match header.kind {
            FrameKind::Message => link.deliver(header.channel, header.tag, payload),
            FrameKind::WindowPut => link.apply_window_put(payload),
            FrameKind::WindowGetReq => link.answer_window_get(payload),
            FrameKind::WindowGetResp => link.fulfill_window_get(payload),
            FrameKind::Hello => log::warn!("unexpected hello from rank {}", link.rank),
        }
    }

    log::info!("peer disconnected: rank={}, addr={}", link.rank, link.peer);
    link.close();
}

fn protocol_error(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message)
}

/// Exchange hello frames on a fresh connection, before the link tasks
/// take over the stream.
pub(crate) async fn handshake(stream: &mut TcpStream, rma: RmaMode) -> Result<Hello, Error> {
    let hello = Hello {
        revision: codec::PROTOCOL_REVISION,
        rma: rma.to_wire(),
    };

    stream
        .write_all(&frame::build(FrameKind::Hello, 0, 0, &[&hello.encode()]))
        .await
        .map_err(Error::Connect)?;

    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.map_err(Error::Connect)?;
    let header = FrameHeader::decode(&header)?;
    if header.kind != FrameKind::Hello {
        return Err(Error::Connect(protocol_error("expected hello")));
    }

    let mut payload = vec![0u8; header.len as usize];
    stream.read_exact(&mut payload).await.map_err(Error::Connect)?;
    Ok(Hello::decode(&payload)?)
}

pub(crate) fn validate_hello(hello: &Hello, rma: RmaMode) -> Result<(), Error> {
    if hello.rma != rma.to_wire() {
        return Err(Error::Connect(protocol_error("one-sided mode mismatch")));
    }

    if rma == RmaMode::Native && hello.revision < codec::PROTOCOL_REVISION {
        return Err(Error::Connect(protocol_error(
            "peer does not speak window operations",
        )));
    }

    Ok(())
}

/// The server side of the port: an accept loop admitting peers into a
/// growing set of links, ranks assigned in accept order.
pub(crate) struct ServerComm {
    links: Arc<RwLock<Vec<Arc<Link>>>>,
    accept: JoinHandle<()>,
}

impl ServerComm {
    pub(crate) async fn open(
        listen: SocketAddr,
        rma: RmaMode,
        regions: Arc<RegionTable>,
    ) -> Result<(Self, SocketAddr), Error> {
        let listener = TcpListener::bind(listen).await.map_err(Error::Init)?;
        let local = listener.local_addr().map_err(Error::Init)?;

        let links: Arc<RwLock<Vec<Arc<Link>>>> = Default::default();
        let accept_links = links.clone();
        let accept = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("accept error: {:?}", e);
                        continue;
                    }
                };

                let links = accept_links.clone();
                let regions = regions.clone();
                tokio::spawn(async move {
                    let mut stream = stream;
                    let hello = match handshake(&mut stream, rma).await {
                        Ok(hello) => hello,
                        Err(e) => {
                            log::warn!("handshake with {} failed: {:?}", peer, e);
                            return;
                        }
                    };

                    if let Err(e) = validate_hello(&hello, rma) {
                        log::warn!("peer {} rejected: {:?}", peer, e);
                        return;
                    }

                    let mut guard = links.write();
                    let rank = guard.len() as u32;
                    guard.push(Link::spawn(stream, rank, regions));
                    drop(guard);

                    log::info!("peer connected: rank={}, addr={}", rank, peer);
                });
            }
        });

        Ok((Self { links, accept }, local))
    }

    pub(crate) fn links(&self) -> Vec<Arc<Link>> {
        self.links.read().clone()
    }

    pub(crate) async fn shutdown(&self) {
        self.accept.abort();
        for link in self.links() {
            link.disconnect().await;
        }
    }
}

impl Drop for ServerComm {
    fn drop(&mut self) {
        self.accept.abort();
    }
}
