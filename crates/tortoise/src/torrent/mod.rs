//! Torrent reactor.
//!
//! A [`Torrent`] is a single task that owns the transfer state, every
//! [`PeerSession`] and the timers. Socket tasks, the [`Disk`] and the
//! tracker talk to it with messages, so nothing in here is ever shared or
//! locked.
//!
//! [`Disk`]: crate::disk::Disk

mod connection;
mod types;

// re-exports
pub use types::*;

use std::{
    collections::{HashSet, VecDeque},
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};

use rand::{rngs::StdRng, SeedableRng};
use tokio::{
    net::TcpListener,
    select, spawn,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep_until, timeout, Instant},
};
use tracing::{debug, info, warn};

use self::connection::{dial, ConnIo, Connection, ConnectionTable};
use crate::{
    choke,
    config::Config,
    counter::{to_human_bytes, to_human_rate, Counter},
    disk::{Disk, DiskCtx, DiskMsg},
    error::Error,
    metainfo::Metadata,
    peer::{ConnId, Direction, PeerId, PeerSession, SessionCtx},
    resume,
    scheduler::Scheduler,
    state::TransferState,
    storage::Storage,
    tracker::{AnnounceRequest, AnnounceResponse, Event, TrackerCtx, TrackerMsg},
};

/// How long the stopped announce may take when we shut down.
const STOP_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);

/// The parts of the torrent that sessions work on.
pub struct TorrentCtx {
    pub meta: Metadata,
    pub state: TransferState,
    pub disk: DiskCtx,
    pub scheduler: Scheduler,
    /// Totals of every connection.
    pub counter: Counter,
    pub config: Config,
    /// Our peer id.
    pub peer_id: PeerId,
}

impl TorrentCtx {
    fn session_ctx(&mut self, now: Instant) -> SessionCtx<'_> {
        SessionCtx {
            meta: &self.meta,
            state: &mut self.state,
            disk: &self.disk,
            scheduler: &mut self.scheduler,
            counter: &mut self.counter,
            config: &self.config,
            peer_id: &self.peer_id,
            now,
        }
    }
}

/// What a torrent needs to start, the listener is bound by the caller so
/// a port that is taken fails before any network activity.
pub struct TorrentParams<S: Storage> {
    pub meta: Metadata,
    pub state: TransferState,
    /// Moved to the disk task of the torrent.
    pub storage: S,
    pub config: Config,
    pub peer_id: PeerId,
    pub listener: TcpListener,
    pub tracker: TrackerCtx,
    /// Keep serving peers after the download completes.
    pub continue_seeding: bool,
    /// Where the block states are saved when the torrent stops.
    pub resume_path: Option<PathBuf>,
}

/// This is the main entity responsible for the high-level management of
/// a torrent download or upload.
pub struct Torrent {
    pub ctx: TorrentCtx,
    /// Send [`TorrentMsg::Quit`] or [`TorrentMsg::AddPeers`] here.
    pub tx: mpsc::Sender<TorrentMsg>,
    pub status: TorrentStatus,
    rx: mpsc::Receiver<TorrentMsg>,
    disk_handle: Option<JoinHandle<()>>,
    conns: ConnectionTable,
    tracker: TrackerCtx,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    /// Peers to dial, oldest first.
    known: VecDeque<SocketAddr>,
    /// Peers known, dialing or connected, so none of them is added twice.
    seen: HashSet<SocketAddr>,
    choke_timer: Periodic,
    tick: Periodic,
    announce: AnnounceSchedule,
    /// Sent `completed` to the tracker, or started as a seeder.
    completed_announced: bool,
    continue_seeding: bool,
    resume_path: Option<PathBuf>,
    key: u32,
    rng: StdRng,
}

impl Torrent {
    /// Must be called inside a tokio runtime, the disk task of the torrent
    /// is spawned here.
    pub fn new<S: Storage>(params: TorrentParams<S>) -> Result<Self, Error> {
        let TorrentParams {
            meta,
            state,
            storage,
            config,
            peer_id,
            listener,
            tracker,
            continue_seeding,
            resume_path,
        } = params;

        let now = Instant::now();
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel::<TorrentMsg>(100);

        let (disk, disk_ctx) = Disk::new(meta.clone(), storage);
        let disk_handle = spawn(disk.run(tx.clone()));

        let seeding = state.is_complete();
        let status = if seeding {
            TorrentStatus::Seeding
        } else {
            TorrentStatus::Downloading
        };

        Ok(Self {
            tx,
            rx,
            disk_handle: Some(disk_handle),
            status,
            conns: ConnectionTable::default(),
            tracker,
            listener: Some(listener),
            local_addr,
            known: VecDeque::new(),
            seen: HashSet::new(),
            choke_timer: Periodic::new(config.choke_interval(), now),
            tick: Periodic::new(config.tick(), now),
            announce: AnnounceSchedule::new(config.announce_interval()),
            completed_announced: seeding,
            continue_seeding,
            resume_path,
            key: rand::random(),
            rng: StdRng::from_entropy(),
            ctx: TorrentCtx {
                scheduler: Scheduler::new(config.piece_strategy),
                counter: Counter::new(now),
                meta,
                state,
                disk: disk_ctx,
                config,
                peer_id,
            },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the torrent until it completes or is asked to quit.
    ///
    /// Only errors that concern the whole torrent end the run, a failing
    /// connection is dropped and the run goes on.
    #[tracing::instrument(name = "torrent", skip_all, fields(name = %self.ctx.meta.name))]
    pub async fn run(mut self) -> Result<Outcome, Error> {
        info!(
            "{} {} pieces of {}, listening on {}",
            self.ctx.meta.info_hash,
            self.ctx.meta.piece_count(),
            to_human_bytes(self.ctx.meta.piece_length as u64),
            self.local_addr
        );

        let accept = self.listener.take().map(|l| self.spawn_accept(l));

        self.send_announce(Event::Started, Instant::now(), None);
        let outcome = self.run_loop().await;

        if let Some(accept) = accept {
            accept.abort();
        }
        self.shutdown().await?;

        let outcome = outcome?;
        info!("torrent stopped: {outcome:?}");
        Ok(outcome)
    }

    async fn run_loop(&mut self) -> Result<Outcome, Error> {
        let mut tracker_alive = true;

        loop {
            let deadline = self.next_deadline();

            select! {
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { return Ok(Outcome::Quit) };
                    if let Some(outcome) = self.handle(msg, Instant::now())? {
                        return Ok(outcome);
                    }
                }
                changed = self.tracker.latest.changed(), if tracker_alive => {
                    if changed.is_err() {
                        warn!("tracker task stopped");
                        tracker_alive = false;
                        continue;
                    }
                    let latest = self.tracker.latest.borrow_and_update().clone();
                    if let Some(res) = latest {
                        self.on_announce(res);
                    }
                }
                _ = sleep_until(deadline) => {}
            }

            if let Some(outcome) = self.after_event(Instant::now())? {
                return Ok(outcome);
            }
        }
    }

    fn spawn_accept(&self, listener: TcpListener) -> JoinHandle<()> {
        let tx = self.tx.clone();

        spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, addr)) => {
                        debug!("received inbound connection from {addr}");
                        if tx.send(TorrentMsg::Accepted(socket, addr)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
        })
    }

    /// The reactor sleeps at most until the earliest timer.
    fn next_deadline(&self) -> Instant {
        let mut deadline = self.choke_timer.deadline().min(self.tick.deadline());
        if let Some(announce) = self.announce.deadline(self.known.is_empty()) {
            deadline = deadline.min(announce);
        }
        deadline
    }

    /// Errors that concern the whole torrent are returned, connection
    /// errors drop the connection.
    fn handle(
        &mut self,
        msg: TorrentMsg,
        now: Instant,
    ) -> Result<Option<Outcome>, Error> {
        match msg {
            TorrentMsg::Accepted(socket, addr) => {
                if self.conns.len() >= self.ctx.config.max_connections {
                    debug!("{addr} refused, {} connections", self.conns.len());
                    return Ok(None);
                }
                let id = self.conns.next_id();
                self.seen.insert(addr);
                self.add_connection(id, addr, socket, Direction::Inbound, now);
            }
            TorrentMsg::Connected(id, socket) => {
                let Some(addr) = self.conns.dialing.remove(&id) else {
                    return Ok(None);
                };
                self.add_connection(id, addr, socket, Direction::Outbound, now);
            }
            TorrentMsg::ConnectFailed(id, e) => {
                if let Some(addr) = self.conns.dialing.remove(&id) {
                    debug!("{addr} could not connect: {e}");
                    self.seen.remove(&addr);
                }
            }
            TorrentMsg::Read(id, bytes) => {
                let Some(conn) = self.conns.active.get_mut(&id) else {
                    return Ok(None);
                };
                let mut ctx = self.ctx.session_ctx(now);
                match conn.session.on_read(&bytes, &mut ctx) {
                    Err(e) if e.is_connection_scoped() => {
                        self.drop_connection(id, &e.to_string());
                    }
                    r => r?,
                }
            }
            TorrentMsg::Written(id, n) => {
                if let Some(conn) = self.conns.active.get_mut(&id) {
                    conn.session.on_written(n);
                }
            }
            TorrentMsg::Closed(id, e) => {
                let reason = match e {
                    Some(e) => e.to_string(),
                    None => Error::PeerClosedSocket.to_string(),
                };
                self.drop_connection(id, &reason);
            }
            TorrentMsg::BlockRead { conn, info, data } => {
                if let Some(conn) = self.conns.active.get_mut(&conn) {
                    conn.session.on_block_read(info, data);
                }
            }
            TorrentMsg::PieceChecked { index, valid } => {
                self.ctx.state.piece_checked(index, valid);
            }
            TorrentMsg::WriteFailed { index, begin, error } => {
                warn!("data of piece {index} at {begin} is lost: {error}");
                if let Some(info) = self.ctx.state.write_failed(index, begin) {
                    for conn in self.conns.active.values_mut() {
                        conn.session.forget_request(&info);
                    }
                }
            }
            TorrentMsg::AddPeers(peers) => {
                self.add_known(peers);
            }
            TorrentMsg::Quit => {
                info!("quitting");
                return Ok(Some(Outcome::Quit));
            }
        }

        Ok(None)
    }

    fn add_connection(
        &mut self,
        id: ConnId,
        addr: SocketAddr,
        socket: tokio::net::TcpStream,
        direction: Direction,
        now: Instant,
    ) {
        debug!("{addr} connected {id} {direction:?}");

        let session = PeerSession::new(
            id,
            addr,
            direction,
            &self.ctx.config,
            self.ctx.meta.piece_count(),
            now,
        );
        let io = ConnIo::spawn(id, socket, self.tx.clone());

        self.conns.active.insert(id, Connection { session, io });
    }

    /// Remove a connection, every block it held goes back to the pool.
    fn drop_connection(&mut self, id: ConnId, reason: &str) {
        let Some(mut conn) = self.conns.active.remove(&id) else {
            return;
        };
        debug!("{} {id} dropped: {reason}", conn.session.addr);

        conn.session.release(&mut self.ctx.state);
        self.seen.remove(&conn.session.addr);
    }

    fn is_own_addr(&self, addr: &SocketAddr) -> bool {
        addr.port() == self.local_addr.port()
            && (addr.ip().is_loopback()
                || addr.ip().is_unspecified()
                || addr.ip() == self.local_addr.ip())
    }

    fn add_known(&mut self, peers: Vec<SocketAddr>) {
        let before = self.known.len();
        for addr in peers {
            if self.is_own_addr(&addr) || !self.seen.insert(addr) {
                continue;
            }
            self.known.push_back(addr);
        }
        if self.known.len() > before {
            debug!("{} new peers, {} known", self.known.len() - before, self.known.len());
        }
    }

    fn on_announce(&mut self, res: AnnounceResponse) {
        self.announce.update(&res);
        if let (Some(seeders), Some(leechers)) = (res.complete, res.incomplete) {
            debug!("swarm has {seeders} seeders and {leechers} leechers");
        }
        self.add_known(res.peers);
    }

    /// Work that follows every event: completed pieces, timers, dialing, and
    /// handing the next bytes to every socket.
    fn after_event(&mut self, now: Instant) -> Result<Option<Outcome>, Error> {
        let completed = self.ctx.state.take_completed();
        if !completed.is_empty() {
            for conn in self.conns.active.values_mut() {
                for index in &completed {
                    conn.session.notify_have(*index);
                }
                conn.session.refresh_interest(&self.ctx.state);
            }
        }

        if self.ctx.state.is_complete() && !self.completed_announced {
            self.completed_announced = true;
            self.status = TorrentStatus::Seeding;
            info!(
                "download completed, {} downloaded",
                to_human_bytes(self.ctx.counter.total_downloaded)
            );
            self.send_announce(Event::Completed, now, None);

            if !self.continue_seeding {
                return Ok(Some(Outcome::Completed));
            }
            info!("seeding");
        }

        if self.choke_timer.fire_if_due(now) {
            self.choke_round();
        }

        if self.tick.fire_if_due(now) {
            self.housekeeping(now);
        }

        if self.announce.is_due(now, self.known.is_empty()) {
            self.send_announce(Event::None, now, None);
        }

        self.dial_known();
        self.pump(now)?;

        Ok(None)
    }

    /// Unchoke the peers that gave us the most during the round, plus an
    /// optimistic one, and choke everyone else.
    fn choke_round(&mut self) {
        let mut sessions: Vec<&mut PeerSession> = self
            .conns
            .active
            .values_mut()
            .map(|c| &mut c.session)
            .collect();

        let unchoked = choke::choke_round(
            &mut sessions,
            self.ctx.config.unchoke_slots,
            &mut self.rng,
        );
        debug!("choke round, unchoking {unchoked:?}");
        self.ctx.counter.reset_round();
    }

    fn housekeeping(&mut self, now: Instant) {
        let request_timeout = self.ctx.config.request_timeout();

        for conn in self.conns.active.values_mut() {
            conn.session.reclaim_stale(&mut self.ctx.state, now, request_timeout);
            conn.session.counter.update_rates(now);
        }
        self.ctx.counter.update_rates(now);

        let counter = &self.ctx.counter;
        debug!(
            "{}/{} pieces, {} peers, d: {} u: {}",
            self.ctx.state.completed.count_ones(),
            self.ctx.state.piece_count(),
            self.conns.active.len(),
            to_human_rate(counter.download_rate),
            to_human_rate(counter.upload_rate),
        );
    }

    fn dial_known(&mut self) {
        if self.ctx.state.is_complete() {
            return;
        }
        while self.conns.len() < self.ctx.config.max_active_peers {
            let Some(addr) = self.known.pop_front() else { break };
            let id = self.conns.next_id();
            debug!("{addr} dialing {id}");

            self.conns.dialing.insert(id, addr);
            dial(id, addr, self.ctx.config.connect_timeout(), self.tx.clone());
        }
    }

    /// Give every idle socket the next bytes of its session.
    fn pump(&mut self, now: Instant) -> Result<(), Error> {
        let mut failed = Vec::new();

        for (id, conn) in self.conns.active.iter_mut() {
            let mut ctx = self.ctx.session_ctx(now);
            match conn.session.poll_write(&mut ctx) {
                Ok(Some(chunk)) => {
                    // a dead writer shows up as a closed message
                    conn.io.send(chunk);
                }
                Ok(None) => {}
                Err(e) if e.is_connection_scoped() => failed.push((*id, e)),
                Err(e) => return Err(e),
            }
        }

        for (id, e) in failed {
            self.drop_connection(id, &e.to_string());
        }
        Ok(())
    }

    fn send_announce(
        &mut self,
        event: Event,
        now: Instant,
        recipient: Option<oneshot::Sender<Result<AnnounceResponse, Error>>>,
    ) {
        let numwant = match event {
            Event::Stopped | Event::Completed => 0,
            _ => self.ctx.config.numwant,
        };

        let request = AnnounceRequest {
            info_hash: self.ctx.meta.info_hash.clone(),
            peer_id: self.ctx.peer_id.clone(),
            port: self.local_addr.port(),
            uploaded: self.ctx.counter.total_uploaded,
            downloaded: self.ctx.counter.total_downloaded,
            left: self.ctx.state.left(&self.ctx.meta),
            key: self.key,
            event,
            numwant,
            tracker_id: self.announce.tracker_id.clone(),
        };

        self.announce.mark(now);
        if let Err(e) = self.tracker.tx.try_send(TrackerMsg::Announce { request, recipient }) {
            warn!("could not queue the {event} announce: {e}");
        }
    }

    /// Drop every connection, wait for the disk to finish what was queued,
    /// save the resume file and leave the swarm.
    async fn shutdown(&mut self) -> Result<(), Error> {
        for id in self.conns.ids() {
            self.drop_connection(id, "shutting down");
        }
        self.conns.dialing.clear();

        // the disk may be blocked sending us an answer nobody will read
        let _ = self.ctx.disk.send(DiskMsg::Quit);
        self.rx.close();
        if let Some(disk) = self.disk_handle.take() {
            if let Err(e) = disk.await {
                warn!("disk task failed: {e}");
            }
        }

        if let Some(path) = &self.resume_path {
            resume::save(path, &self.ctx.state).await?;
        }

        let (tx, rx) = oneshot::channel();
        self.send_announce(Event::Stopped, Instant::now(), Some(tx));
        match timeout(STOP_ANNOUNCE_TIMEOUT, rx).await {
            Ok(Ok(Ok(_))) => debug!("stopped announce sent"),
            Ok(Ok(Err(e))) => warn!("stopped announce failed: {e}"),
            Ok(Err(_)) => debug!("tracker gone before the stopped announce"),
            Err(_) => warn!("stopped announce timed out"),
        }

        Ok(())
    }
}
