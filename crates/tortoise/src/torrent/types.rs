use std::{fmt::Display, io, net::SocketAddr, ops::Deref, time::Duration};

use bytes::Bytes;
use speedy::{Readable, Writable};
use tokio::{net::TcpStream, time::Instant};

use crate::{peer::ConnId, tcp_wire::BlockInfo, tracker::AnnounceResponse};

/// Messages received by the [`Torrent`] reactor. Socket tasks only move
/// bytes, every decision is taken by the reactor when it handles these.
///
/// [`Torrent`]: super::Torrent
#[derive(Debug)]
pub enum TorrentMsg {
    /// The listener accepted an inbound connection.
    Accepted(TcpStream, SocketAddr),

    /// An outbound dial completed.
    Connected(ConnId, TcpStream),

    /// An outbound dial failed or timed out.
    ConnectFailed(ConnId, io::Error),

    /// Bytes read from the socket of a connection.
    Read(ConnId, Bytes),

    /// The socket of a connection became writable and this many bytes of
    /// the last chunk handed to it were written.
    Written(ConnId, usize),

    /// The socket was closed by the peer, or failed.
    Closed(ConnId, Option<io::Error>),

    /// The disk read a block the peer of `conn` asked for, `None` if the
    /// read failed.
    BlockRead { conn: ConnId, info: BlockInfo, data: Option<Bytes> },

    /// The disk hashed a piece whose blocks were all written.
    PieceChecked { index: u32, valid: bool },

    /// The disk could not write the data received at `begin` of piece
    /// `index`.
    WriteFailed { index: u32, begin: u32, error: io::Error },

    /// Add peers to the known peer list, for example from the CLI.
    AddPeers(Vec<SocketAddr>),

    /// Gracefully stop, sending the stopped event to the tracker.
    Quit,
}

/// How [`Torrent::run`] ended.
///
/// [`Torrent::run`]: super::Torrent::run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every piece is downloaded and verified.
    Completed,
    /// The user asked to quit.
    Quit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TorrentStatus {
    #[default]
    Downloading,
    Seeding,
}

#[derive(Clone, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct InfoHash(pub [u8; 20]);

impl Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Deref for InfoHash {
    type Target = [u8; 20];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.to_string();
        f.write_str(&s[..10])
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl From<InfoHash> for [u8; 20] {
    fn from(value: InfoHash) -> Self {
        value.0
    }
}

/// A timer that fires when at least `period` has elapsed since it last
/// fired, however late the check happens.
#[derive(Debug, Clone, Copy)]
pub struct Periodic {
    period: Duration,
    last: Instant,
}

impl Periodic {
    pub fn new(period: Duration, now: Instant) -> Self {
        Self { period, last: now }
    }

    pub fn deadline(&self) -> Instant {
        self.last + self.period
    }

    /// Returns true and restarts the period if it is due.
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last) >= self.period {
            self.last = now;
            return true;
        }
        false
    }
}

/// Decides when to announce to the tracker again.
///
/// Announces happen every `interval`, or every `min_interval` while we have
/// no peer left to dial.
#[derive(Debug, Clone)]
pub struct AnnounceSchedule {
    pub interval: Duration,
    pub min_interval: Duration,
    pub tracker_id: Option<String>,
    pub last: Option<Instant>,
}

impl AnnounceSchedule {
    /// Used when the tracker doesn't send a `min interval`.
    pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(60);

    pub fn new(interval: Duration) -> Self {
        Self {
            min_interval: Self::DEFAULT_MIN_INTERVAL.min(interval),
            interval,
            tracker_id: None,
            last: None,
        }
    }

    pub fn deadline(&self, starving: bool) -> Option<Instant> {
        let last = self.last?;
        let wait = if starving {
            self.min_interval.min(self.interval)
        } else {
            self.interval
        };
        Some(last + wait)
    }

    pub fn is_due(&self, now: Instant, starving: bool) -> bool {
        match self.deadline(starving) {
            None => true,
            Some(deadline) => now >= deadline,
        }
    }

    pub fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }

    /// Adopt the intervals of a successful announce.
    pub fn update(&mut self, res: &AnnounceResponse) {
        if res.interval > 0 {
            self.interval = Duration::from_secs(res.interval as u64);
        }
        self.min_interval = match res.min_interval {
            Some(min) => Duration::from_secs(min as u64),
            None => Self::DEFAULT_MIN_INTERVAL.min(self.interval),
        };
        if res.tracker_id.is_some() {
            self.tracker_id = res.tracker_id.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periodic_fires_after_period_since_last_firing() {
        let start = Instant::now();
        let mut timer = Periodic::new(Duration::from_secs(10), start);

        assert!(!timer.fire_if_due(start + Duration::from_millis(9_999)));
        // a late check still fires, there is no exact instant to hit
        assert!(timer.fire_if_due(start + Duration::from_millis(10_437)));
        assert_eq!(
            timer.deadline(),
            start + Duration::from_millis(20_437)
        );
        assert!(!timer.fire_if_due(start + Duration::from_secs(20)));
        assert!(timer.fire_if_due(start + Duration::from_secs(21)));
    }

    #[test]
    fn announce_schedule() {
        let start = Instant::now();
        let mut schedule = AnnounceSchedule::new(Duration::from_secs(1800));

        // never announced
        assert!(schedule.is_due(start, false));
        schedule.mark(start);

        let res = AnnounceResponse {
            interval: 900,
            min_interval: Some(30),
            tracker_id: Some("abc".into()),
            ..Default::default()
        };
        schedule.update(&res);

        assert!(!schedule.is_due(start + Duration::from_secs(30), false));
        assert!(schedule.is_due(start + Duration::from_secs(30), true));
        assert!(schedule.is_due(start + Duration::from_secs(900), false));
        assert_eq!(schedule.tracker_id.as_deref(), Some("abc"));

        // a later response without a tracker id keeps the previous one
        schedule.update(&AnnounceResponse { interval: 900, ..Default::default() });
        assert_eq!(schedule.tracker_id.as_deref(), Some("abc"));
        assert_eq!(schedule.min_interval, Duration::from_secs(60));
    }
}
