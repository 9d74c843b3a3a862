//! A remote peer in the network that downloads and uploads data.
//!
//! A [`PeerSession`] owns no socket. The reactor hands it the bytes read
//! from the socket, and asks it for the next bytes to write whenever the
//! socket can take them. Every decision about a connection is taken on the
//! reactor task.
pub mod session;
mod types;

// re-exports
pub use session::{CoreState, HandshakeState, Pending};
pub use types::*;

use std::{collections::VecDeque, net::SocketAddr, time::Duration};

use bytes::{Buf, Bytes, BytesMut};
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    config::Config,
    counter::Counter,
    disk::{DiskCtx, DiskMsg},
    error::Error,
    metainfo::Metadata,
    piece::BlockStatus,
    scheduler::{self, RequestWindow, Scheduler},
    state::{Progress, TransferState},
    tcp_wire::{self, BlockInfo, CoreCodec, Handshake, HandshakeCodec, Message},
};

/// Everything a session needs from the torrent while it handles an event.
pub struct SessionCtx<'a> {
    pub meta: &'a Metadata,
    pub state: &'a mut TransferState,
    pub disk: &'a DiskCtx,
    pub scheduler: &'a mut Scheduler,
    /// Totals of the whole torrent.
    pub counter: &'a mut Counter,
    pub config: &'a Config,
    /// Our own peer id.
    pub peer_id: &'a PeerId,
    pub now: Instant,
}

/// The protocol state of a connection with a remote peer.
#[derive(Debug)]
pub struct PeerSession {
    pub id: ConnId,
    pub addr: SocketAddr,
    pub direction: Direction,
    /// Known once the handshake of the peer arrived.
    pub peer_id: Option<PeerId>,
    pub handshake: HandshakeState,
    pub state: CoreState,
    /// Pieces the peer advertised.
    pub pieces: Bitfield,
    /// Blocks reserved for this peer, in the order they are requested. They
    /// stay `Unrequested` until the request is handed to the socket.
    pub send_requests: VecDeque<BlockInfo>,
    /// Blocks the peer asked us for that the disk is still reading, oldest
    /// first.
    pub receive_requests: VecDeque<BlockInfo>,
    /// Blocks read from disk, waiting for their turn to be uploaded.
    pub ready: VecDeque<tcp_wire::Block>,
    /// The requested block that arrived in part.
    pub incoming: Option<BlockInfo>,
    pub pending: Pending,
    pub window: RequestWindow,
    pub counter: Counter,
    pub connected_at: Instant,
    /// Last time a message was handed to the socket.
    pub last_sent: Instant,
    /// Pieces the peer heard about from us, by bitfield or have.
    advertised: Bitfield,
    bitfield_sent: bool,
    read_buf: BytesMut,
    /// What is left to write of the current message.
    write_buf: Bytes,
    /// A chunk of `write_buf` is with the socket, waiting for
    /// [`PeerSession::on_written`].
    writing: bool,
    codec: CoreCodec,
}

impl PeerSession {
    pub fn new(
        id: ConnId,
        addr: SocketAddr,
        direction: Direction,
        config: &Config,
        piece_count: usize,
        now: Instant,
    ) -> Self {
        Self {
            id,
            addr,
            direction,
            peer_id: None,
            handshake: HandshakeState::default(),
            state: CoreState::default(),
            pieces: Bitfield::from_piece(piece_count),
            send_requests: VecDeque::new(),
            receive_requests: VecDeque::new(),
            ready: VecDeque::new(),
            incoming: None,
            pending: Pending::default(),
            window: RequestWindow::new(
                config.min_request_queue,
                config.max_request_queue,
            ),
            counter: Counter::new(now),
            connected_at: now,
            last_sent: now,
            advertised: Bitfield::from_piece(piece_count),
            bitfield_sent: false,
            read_buf: BytesMut::with_capacity(Handshake::LEN),
            write_buf: Bytes::new(),
            writing: false,
            codec: CoreCodec::new(config.max_frame_len),
        }
    }

    /// Both handshakes went through.
    pub fn is_established(&self) -> bool {
        self.handshake.is_done()
    }

    /// Handle bytes read from the socket.
    ///
    /// The handshake of the peer is checked before anything else is decoded,
    /// a rejected handshake changes nothing in the torrent. Any error means
    /// the connection must be dropped.
    pub fn on_read(
        &mut self,
        bytes: &[u8],
        ctx: &mut SessionCtx,
    ) -> Result<(), Error> {
        self.read_buf.extend_from_slice(bytes);

        if !self.handshake.received {
            let Some(handshake) = HandshakeCodec.decode(&mut self.read_buf)?
            else {
                return Ok(());
            };

            handshake.validate(&ctx.meta.info_hash)?;

            if handshake.peer_id == *ctx.peer_id {
                return Err(Error::SelfConnection);
            }

            debug!("{} < handshake {:?}", self.addr, handshake.peer_id);
            self.peer_id = Some(handshake.peer_id);
            self.handshake.received = true;
        }

        while let Some(msg) = self.codec.decode(&mut self.read_buf)? {
            self.handle(msg, ctx)?;
        }

        Ok(())
    }

    /// Apply a message of the peer.
    pub fn handle(
        &mut self,
        msg: Message,
        ctx: &mut SessionCtx,
    ) -> Result<(), Error> {
        let remote = self.addr;

        match msg {
            Message::KeepAlive => {
                debug!("{remote} < keepalive");
            }
            Message::Choke => {
                debug!("{remote} < choke");
                self.state.peer_choking = true;
                self.release_requests(ctx.state);
            }
            Message::Unchoke => {
                debug!("{remote} < unchoke");
                self.state.peer_choking = false;
                self.fill(ctx);
            }
            Message::Interested => {
                debug!("{remote} < interested");
                self.state.peer_interested = true;
            }
            Message::NotInterested => {
                debug!("{remote} < not_interested");
                self.state.peer_interested = false;
            }
            Message::Have(index) => {
                debug!("{remote} < have {index}");

                if index as usize >= self.pieces.len() {
                    return Err(Error::ProtocolViolation(format!(
                        "have {index} but the torrent has {} pieces",
                        self.pieces.len()
                    )));
                }

                if !self.pieces.has(index as usize) {
                    self.pieces.set(index as usize, true);
                    ctx.state.peer_has(index);
                }
                self.refresh_interest(ctx.state);
            }
            Message::Bitfield(mut bitfield) => {
                bitfield.resize(self.pieces.len(), false);
                debug!(
                    "{remote} < bitfield len: {} ones: {}",
                    bitfield.len(),
                    bitfield.count_ones()
                );

                for i in 0..bitfield.len() {
                    match (self.pieces.has(i), bitfield.has(i)) {
                        (false, true) => ctx.state.peer_has(i as u32),
                        (true, false) => ctx.state.peer_lost(i as u32),
                        _ => {}
                    }
                }

                self.pieces = bitfield;
                self.refresh_interest(ctx.state);
            }
            Message::Request(info) => {
                debug!("{remote} < request {info:?}");

                let index = info.index as usize;
                let valid = index < ctx.meta.piece_count()
                    && ctx.state.completed.has(index)
                    && info.fits(ctx.meta.piece_len(info.index));

                if !valid {
                    return Err(Error::RequestOutOfRange {
                        index: info.index,
                        begin: info.begin,
                        len: info.len,
                    });
                }

                if self.state.am_choking
                    || self.upload_queue_len() >= ctx.config.max_receive_requests
                    || self.is_queued_upload(&info)
                {
                    debug!("{remote} dropping request {info:?}");
                    return Ok(());
                }

                self.receive_requests.push_back(info);
                ctx.disk.send(DiskMsg::ReadBlock { conn: self.id, info })?;
            }
            Message::Piece(block) => {
                self.on_piece(block, ctx)?;
            }
            Message::Cancel(info) => {
                debug!("{remote} < cancel {info:?}");
                self.receive_requests.retain(|v| *v != info);
                self.ready.retain(|b| BlockInfo::from(b) != info);
            }
            Message::Unknown(id) => {
                debug!("{remote} < unknown message {id}");
            }
        }

        Ok(())
    }

    fn on_piece(
        &mut self,
        block: tcp_wire::Block,
        ctx: &mut SessionCtx,
    ) -> Result<(), Error> {
        let tcp_wire::Block { index, begin, block: data } = block;
        let remote = self.addr;

        self.counter.record_download(data.len() as u64);
        ctx.counter.record_download(data.len() as u64);

        let Some(pos) = self.send_requests.iter().position(|r| {
            r.index == index
                && begin >= r.begin
                && (begin as u64) < r.begin as u64 + r.len as u64
        }) else {
            debug!("{remote} < piece {index}:{begin} that we didn't request");
            return Ok(());
        };
        let requested = self.send_requests[pos];

        let progress =
            ctx.state.write_block(index, begin, data.len(), ctx.now);
        if progress == Progress::Ignored {
            return Ok(());
        }

        ctx.disk.send(DiskMsg::WriteBlock { index, begin, data })?;

        if progress == Progress::Partial {
            self.incoming = Some(requested);
            return Ok(());
        }

        debug!("{remote} < piece {requested:?} {progress:?}");
        if let Progress::PieceFinished(index) = progress {
            ctx.disk.send(DiskMsg::ValidatePiece(index))?;
        }
        self.send_requests.remove(pos);
        if self.incoming == Some(requested) {
            self.incoming = None;
        }
        self.window.on_served();

        Ok(())
    }

    /// The disk finished reading a block the peer asked for. It is only
    /// uploaded if the peer still wants it, and `None` drops the request.
    pub fn on_block_read(&mut self, info: BlockInfo, data: Option<Bytes>) {
        let Some(pos) = self.receive_requests.iter().position(|r| *r == info)
        else {
            debug!("{} read {info:?} that is not wanted anymore", self.addr);
            return;
        };
        self.receive_requests.remove(pos);

        if let Some(block) = data {
            self.ready.push_back(tcp_wire::Block {
                index: info.index,
                begin: info.begin,
                block,
            });
        }
    }

    fn upload_queue_len(&self) -> usize {
        self.receive_requests.len() + self.ready.len()
    }

    fn is_queued_upload(&self, info: &BlockInfo) -> bool {
        self.receive_requests.contains(info)
            || self.ready.iter().any(|b| BlockInfo::from(b) == *info)
    }

    /// The next bytes to hand to the socket, if any.
    ///
    /// At most one message is encoded per call, and a message is only
    /// started once the previous one was fully written. Nothing is returned
    /// while a chunk is still with the socket.
    pub fn poll_write(
        &mut self,
        ctx: &mut SessionCtx,
    ) -> Result<Option<Bytes>, Error> {
        if self.writing {
            return Ok(None);
        }

        if self.write_buf.is_empty() {
            let mut buf = BytesMut::new();
            if !self.next_message(&mut buf, ctx)? {
                return Ok(None);
            }
            self.write_buf = buf.freeze();
        }

        self.writing = true;
        Ok(Some(self.write_buf.clone()))
    }

    /// The socket wrote `n` bytes of the last chunk of
    /// [`PeerSession::poll_write`].
    pub fn on_written(&mut self, n: usize) {
        self.writing = false;
        self.write_buf.advance(n.min(self.write_buf.len()));
    }

    /// Encode the most important message that is due, in this order:
    /// handshake, bitfield, choke change, interest change, cancel, request,
    /// piece, have and keepalive.
    fn next_message(
        &mut self,
        buf: &mut BytesMut,
        ctx: &mut SessionCtx,
    ) -> Result<bool, Error> {
        let remote = self.addr;

        if !self.handshake.sent {
            // the side that accepted the connection waits for the peer
            if self.direction == Direction::Inbound && !self.handshake.received
            {
                return Ok(false);
            }
            debug!("{remote} > handshake");
            let handshake =
                Handshake::new(ctx.meta.info_hash.clone(), ctx.peer_id.clone());
            HandshakeCodec.encode(handshake, buf)?;
            self.handshake.sent = true;
            self.last_sent = ctx.now;
            return Ok(true);
        }

        if !self.handshake.received {
            return Ok(false);
        }

        if !self.bitfield_sent {
            self.bitfield_sent = true;
            if ctx.state.completed.any() {
                debug!(
                    "{remote} > bitfield ones: {}",
                    ctx.state.completed.count_ones()
                );
                self.advertised = ctx.state.completed.clone();
                let msg = Message::Bitfield(ctx.state.completed.clone());
                return self.encode(msg, buf, ctx.now);
            }
        }

        if let Some(choke) = self.pending.choke.take() {
            self.state.am_choking = choke;
            let msg = if choke {
                debug!("{remote} > choke");
                self.receive_requests.clear();
                self.ready.clear();
                Message::Choke
            } else {
                debug!("{remote} > unchoke");
                Message::Unchoke
            };
            return self.encode(msg, buf, ctx.now);
        }

        if let Some(interested) = self.pending.interest.take() {
            self.state.am_interested = interested;
            let msg = if interested {
                debug!("{remote} > interested");
                Message::Interested
            } else {
                debug!("{remote} > not_interested");
                Message::NotInterested
            };
            return self.encode(msg, buf, ctx.now);
        }

        if let Some(info) = self.pending.cancels.pop_front() {
            debug!("{remote} > cancel {info:?}");
            return self.encode(Message::Cancel(info), buf, ctx.now);
        }

        if self.state.am_interested && !self.state.peer_choking {
            if let Some(info) = self.next_request(ctx) {
                debug!("{remote} > request {info:?}");
                return self.encode(Message::Request(info), buf, ctx.now);
            }
        }

        if !self.state.am_choking {
            if let Some(block) = self.ready.pop_front() {
                debug!("{remote} > piece {:?}", BlockInfo::from(&block));
                let len = block.block.len() as u64;
                self.counter.record_upload(len);
                ctx.counter.record_upload(len);
                return self.encode(Message::Piece(block), buf, ctx.now);
            }
        }

        while let Some(index) = self.pending.haves.pop_front() {
            let i = index as usize;
            if i >= self.advertised.len() || self.advertised.has(i) {
                continue;
            }
            self.advertised.set(i, true);
            debug!("{remote} > have {index}");
            return self.encode(Message::Have(index), buf, ctx.now);
        }

        if ctx.now.saturating_duration_since(self.last_sent)
            >= ctx.config.keep_alive()
        {
            debug!("{remote} > keepalive");
            return self.encode(Message::KeepAlive, buf, ctx.now);
        }

        Ok(false)
    }

    fn encode(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
        now: Instant,
    ) -> Result<bool, Error> {
        self.codec.encode(msg, buf)?;
        self.last_sent = now;
        Ok(true)
    }

    /// The first `Unrequested` block of the queue, refilling the queue when
    /// there is none and the window has room. The block becomes
    /// `Requested`.
    fn next_request(&mut self, ctx: &mut SessionCtx) -> Option<BlockInfo> {
        let mut next = self.first_unrequested(ctx.state);

        if next.is_none() && self.send_requests.len() < self.window.cap {
            self.fill(ctx);
            next = self.first_unrequested(ctx.state);
        }

        let info = next?;
        if let Some(block) = ctx.state.block_mut(&info) {
            block.touch(BlockStatus::Requested, ctx.now);
        }
        Some(info)
    }

    fn first_unrequested(&self, state: &TransferState) -> Option<BlockInfo> {
        self.send_requests
            .iter()
            .find(|info| {
                state
                    .block(info)
                    .is_some_and(|b| b.status == BlockStatus::Unrequested)
            })
            .copied()
    }

    /// Reserve blocks this peer can serve, up to the request window.
    fn fill(&mut self, ctx: &mut SessionCtx) {
        let n = ctx.scheduler.fill(
            ctx.state,
            &self.pieces,
            &mut self.send_requests,
            self.window.cap,
        );
        if n > 0 {
            debug!("{} queued {n} blocks", self.addr);
        }
    }

    /// Recompute whether we want something from the peer, and queue the
    /// message that tells them if that changed.
    pub fn refresh_interest(&mut self, state: &TransferState) {
        let wants = state.needs(&self.pieces);
        self.pending.interest =
            session::pending_change(self.state.am_interested, wants);
    }

    /// Queue a choke or an unchoke, unless the peer is already in that
    /// state.
    pub fn set_choke(&mut self, choke: bool) {
        self.pending.choke =
            session::pending_change(self.state.am_choking, choke);
    }

    /// Tell the peer about a piece we just completed.
    pub fn notify_have(&mut self, index: u32) {
        self.pending.haves.push_back(index);
    }

    /// Take back the requests that made no progress for `timeout`, and
    /// cancel them.
    pub fn reclaim_stale(
        &mut self,
        state: &mut TransferState,
        now: Instant,
        timeout: Duration,
    ) {
        let stale = scheduler::reclaim_stale(
            state,
            &mut self.send_requests,
            now,
            timeout,
        );
        if stale.is_empty() {
            return;
        }

        debug!("{} {} requests timed out", self.addr, stale.len());
        self.window.on_timeout();
        if self.incoming.is_some_and(|i| stale.contains(&i)) {
            self.incoming = None;
        }
        self.pending.cancels.extend(stale);
    }

    /// Give every reserved block back to the pool.
    pub fn release_requests(&mut self, state: &mut TransferState) {
        if !self.send_requests.is_empty() {
            debug!(
                "{} freeing {} blocks",
                self.addr,
                self.send_requests.len()
            );
        }
        for info in self.send_requests.drain(..) {
            state.release(&info);
        }
        self.incoming = None;
    }

    /// The block was reset by the torrent, stop waiting for it.
    pub fn forget_request(&mut self, info: &BlockInfo) {
        self.send_requests.retain(|r| r != info);
        if self.incoming.as_ref() == Some(info) {
            self.incoming = None;
        }
    }

    /// The connection is gone, undo everything it holds in the torrent.
    pub fn release(&mut self, state: &mut TransferState) {
        self.release_requests(state);
        state.peer_gone(&self.pieces);
        self.pieces.fill(false);
    }
}
