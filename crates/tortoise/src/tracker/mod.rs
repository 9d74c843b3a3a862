//! A tracker is a server that tells us the peers of a torrent.
pub mod http;

use std::{fmt::Display, future::Future, net::SocketAddr};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

pub use self::http::HttpTracker;
use crate::{error::Error, peer::PeerId, torrent::InfoHash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Event {
    /// A regular announce.
    #[default]
    None,
    /// The first announce of a session.
    Started,
    /// We are leaving the swarm.
    Stopped,
    /// The download just completed, sent once.
    Completed,
}

impl Event {
    /// Value of the `event` query parameter, absent for [`Event::None`].
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            Event::None => None,
            Event::Started => Some("started"),
            Event::Stopped => Some("stopped"),
            Event::Completed => Some("completed"),
        }
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str().unwrap_or("none"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    /// Port we listen on.
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Bytes we still have to download.
    pub left: u64,
    /// Random value that identifies us across IP changes.
    pub key: u32,
    pub event: Event,
    pub numwant: u32,
    /// Echoed back when a previous response had one.
    pub tracker_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnounceResponse {
    pub peers: Vec<SocketAddr>,
    /// Seconds until the next regular announce.
    pub interval: u32,
    /// Seconds we must wait between announces, at least.
    pub min_interval: Option<u32>,
    pub tracker_id: Option<String>,
    /// Number of seeders.
    pub complete: Option<u32>,
    /// Number of leechers.
    pub incomplete: Option<u32>,
    pub warning: Option<String>,
}

/// Something that can announce us and hand back peers.
pub trait TrackerPort: Send + 'static {
    /// Announce ourselves. A tracker that answers with a failure reason is
    /// an [`Error::TrackerFailure`].
    fn announce(
        &mut self,
        request: AnnounceRequest,
    ) -> impl Future<Output = Result<AnnounceResponse, Error>> + Send;
}

/// A tracker that always answers with the same peers, for trackerless runs
/// where the peers come from the command line, and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticTracker {
    pub peers: Vec<SocketAddr>,
    pub interval: u32,
}

impl StaticTracker {
    pub fn new(peers: Vec<SocketAddr>) -> Self {
        Self { peers, interval: 1800 }
    }
}

impl TrackerPort for StaticTracker {
    async fn announce(
        &mut self,
        request: AnnounceRequest,
    ) -> Result<AnnounceResponse, Error> {
        let peers = self
            .peers
            .iter()
            .take(request.numwant as usize)
            .copied()
            .collect();
        Ok(AnnounceResponse { peers, interval: self.interval, ..Default::default() })
    }
}

#[derive(Debug)]
pub enum TrackerMsg {
    Announce {
        request: AnnounceRequest,
        /// Gets the result of this announce, successful or not.
        recipient: Option<oneshot::Sender<Result<AnnounceResponse, Error>>>,
    },
}

/// Handle to a running [`Tracker`].
#[derive(Debug, Clone)]
pub struct TrackerCtx {
    pub tx: mpsc::Sender<TrackerMsg>,
    /// The latest successful announce.
    pub latest: watch::Receiver<Option<AnnounceResponse>>,
}

/// Task that performs the announces of a torrent, so the reactor never
/// waits on the network.
pub struct Tracker<T: TrackerPort> {
    port: T,
    rx: mpsc::Receiver<TrackerMsg>,
    latest: watch::Sender<Option<AnnounceResponse>>,
}

impl<T: TrackerPort> Tracker<T> {
    pub fn new(port: T) -> (Self, TrackerCtx) {
        let (tx, rx) = mpsc::channel::<TrackerMsg>(100);
        let (latest, latest_rx) = watch::channel(None);

        (Self { port, rx, latest }, TrackerCtx { tx, latest: latest_rx })
    }

    #[tracing::instrument(name = "tracker", skip_all)]
    pub async fn run(mut self) {
        debug!("running tracker");

        while let Some(msg) = self.rx.recv().await {
            match msg {
                TrackerMsg::Announce { request, recipient } => {
                    let event = request.event;
                    debug!("announcing {event}");

                    let res = self.port.announce(request).await;

                    match &res {
                        Ok(r) => {
                            if let Some(warning) = &r.warning {
                                warn!("tracker warning: {warning}");
                            }
                            info!(
                                "tracker returned {} peers, next announce in {}s",
                                r.peers.len(),
                                r.interval
                            );
                            self.latest.send_replace(Some(r.clone()));
                        }
                        Err(e) => {
                            warn!("{event} announce failed: {e}");
                        }
                    }

                    if let Some(recipient) = recipient {
                        let _ = recipient.send(res);
                    }
                }
            }
        }

        debug!("tracker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(event: Event, numwant: u32) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: InfoHash([1; 20]),
            peer_id: PeerId([2; 20]),
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 100,
            key: 7,
            event,
            numwant,
            tracker_id: None,
        }
    }

    #[tokio::test]
    async fn actor_publishes_the_latest_response() {
        let peers: Vec<SocketAddr> =
            vec!["127.0.0.1:6881".parse().unwrap(), "127.0.0.1:6882".parse().unwrap()];
        let (tracker, mut ctx) = Tracker::new(StaticTracker::new(peers.clone()));
        let handle = tokio::spawn(tracker.run());

        assert!(ctx.latest.borrow().is_none());

        ctx.tx
            .send(TrackerMsg::Announce { request: request(Event::Started, 50), recipient: None })
            .await
            .unwrap();

        ctx.latest.changed().await.unwrap();
        let latest = ctx.latest.borrow_and_update().clone().unwrap();
        assert_eq!(latest.peers, peers);
        assert_eq!(latest.interval, 1800);

        // stopped announces want no peers
        let (tx, rx) = oneshot::channel();
        ctx.tx
            .send(TrackerMsg::Announce {
                request: request(Event::Stopped, 0),
                recipient: Some(tx),
            })
            .await
            .unwrap();
        assert!(rx.await.unwrap().unwrap().peers.is_empty());

        drop(ctx);
        handle.await.unwrap();
    }

    #[test]
    fn event_names() {
        assert_eq!(Event::None.as_str(), None);
        assert_eq!(Event::Started.to_string(), "started");
        assert_eq!(Event::Completed.as_str(), Some("completed"));
    }
}
