//! Sockets of the connections of a torrent.
//!
//! Each socket gets a reader task and a writer task. They never look at the
//! bytes they move, they only report to the reactor with [`TorrentMsg`].

use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use hashbrown::HashMap;
use tokio::{
    io::AsyncReadExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    spawn,
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tracing::debug;

use super::TorrentMsg;
use crate::peer::{ConnId, PeerSession};

const READ_CHUNK: usize = 32 * 1024;

/// The tasks of a connected socket. Dropping it aborts both tasks, which
/// closes the socket.
#[derive(Debug)]
pub(crate) struct ConnIo {
    tx: mpsc::Sender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ConnIo {
    pub fn spawn(
        id: ConnId,
        stream: TcpStream,
        torrent_tx: mpsc::Sender<TorrentMsg>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        // a session only hands out a new chunk once the last one is written
        let (tx, rx) = mpsc::channel::<Bytes>(1);

        let reader = spawn(read_loop(id, read_half, torrent_tx.clone()));
        let writer = spawn(write_loop(id, write_half, rx, torrent_tx));

        Self { tx, reader, writer }
    }

    /// Hand a chunk to the writer task. Returns false if the writer is gone,
    /// the reactor hears about it with [`TorrentMsg::Closed`].
    pub fn send(&self, chunk: Bytes) -> bool {
        self.tx.try_send(chunk).is_ok()
    }
}

impl Drop for ConnIo {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn read_loop(
    id: ConnId,
    mut half: OwnedReadHalf,
    tx: mpsc::Sender<TorrentMsg>,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        buf.reserve(READ_CHUNK);

        let msg = match half.read_buf(&mut buf).await {
            Ok(0) => TorrentMsg::Closed(id, None),
            Ok(_) => TorrentMsg::Read(id, buf.split().freeze()),
            Err(e) => TorrentMsg::Closed(id, Some(e)),
        };
        let closed = matches!(msg, TorrentMsg::Closed(..));

        if tx.send(msg).await.is_err() || closed {
            return;
        }
    }
}

/// Writes each chunk with a single `try_write` once the socket is writable,
/// and reports how much of it went through.
async fn write_loop(
    id: ConnId,
    half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    tx: mpsc::Sender<TorrentMsg>,
) {
    while let Some(chunk) = rx.recv().await {
        let written = loop {
            if let Err(e) = half.writable().await {
                break Err(e);
            }
            match half.try_write(&chunk) {
                Ok(n) => break Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => break Err(e),
            }
        };

        let msg = match written {
            Ok(0) if !chunk.is_empty() => TorrentMsg::Closed(id, None),
            Ok(n) => TorrentMsg::Written(id, n),
            Err(e) => TorrentMsg::Closed(id, Some(e)),
        };
        let closed = matches!(msg, TorrentMsg::Closed(..));

        if tx.send(msg).await.is_err() || closed {
            return;
        }
    }
}

/// Dial `addr` in the background, the outcome is sent to the reactor.
pub(crate) fn dial(
    id: ConnId,
    addr: SocketAddr,
    connect_timeout: Duration,
    tx: mpsc::Sender<TorrentMsg>,
) {
    spawn(async move {
        let msg = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => TorrentMsg::Connected(id, stream),
            Ok(Err(e)) => TorrentMsg::ConnectFailed(id, e),
            Err(_) => TorrentMsg::ConnectFailed(
                id,
                io::Error::new(ErrorKind::TimedOut, "connect timed out"),
            ),
        };
        if tx.send(msg).await.is_err() {
            debug!("{addr} dialed after the torrent stopped");
        }
    });
}

/// A connected peer.
#[derive(Debug)]
pub(crate) struct Connection {
    pub session: PeerSession,
    pub io: ConnIo,
}

/// Every connection of a torrent, the ones being dialed and the connected
/// ones, by [`ConnId`].
#[derive(Debug, Default)]
pub(crate) struct ConnectionTable {
    next_id: u64,
    pub dialing: HashMap<ConnId, SocketAddr>,
    pub active: HashMap<ConnId, Connection>,
}

impl ConnectionTable {
    pub fn next_id(&mut self) -> ConnId {
        self.next_id += 1;
        ConnId(self.next_id)
    }

    /// Connections that count against the connection caps.
    pub fn len(&self) -> usize {
        self.dialing.len() + self.active.len()
    }

    pub fn ids(&self) -> Vec<ConnId> {
        self.active.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    #[tokio::test]
    async fn socket_tasks_report_to_the_reactor() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(16);

        dial(ConnId(7), addr, Duration::from_secs(5), tx.clone());
        let (mut remote, _) = listener.accept().await.unwrap();

        let Some(TorrentMsg::Connected(id, stream)) = rx.recv().await else {
            panic!("expected a connected stream");
        };
        assert_eq!(id, ConnId(7));
        let io = ConnIo::spawn(id, stream, tx);

        assert!(io.send(Bytes::from_static(b"hello")));
        match rx.recv().await {
            Some(TorrentMsg::Written(ConnId(7), 5)) => {}
            other => panic!("unexpected {other:?}"),
        }
        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        remote.write_all(b"world").await.unwrap();
        match rx.recv().await {
            Some(TorrentMsg::Read(ConnId(7), bytes)) => {
                assert_eq!(&bytes[..], b"world")
            }
            other => panic!("unexpected {other:?}"),
        }

        drop(remote);
        assert!(matches!(rx.recv().await, Some(TorrentMsg::Closed(ConnId(7), _))));
    }

    #[tokio::test]
    async fn failed_dial() {
        // nothing listens there anymore
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut rx) = mpsc::channel(1);
        dial(ConnId(1), addr, Duration::from_secs(5), tx);

        assert!(matches!(
            rx.recv().await,
            Some(TorrentMsg::ConnectFailed(ConnId(1), _))
        ));
    }

    #[test]
    fn ids_are_never_reused() {
        let mut table = ConnectionTable::default();
        let a = table.next_id();
        let b = table.next_id();
        assert_ne!(a, b);
        table.dialing.insert(a, "127.0.0.1:1".parse().unwrap());
        assert_eq!(table.len(), 1);
    }
}
