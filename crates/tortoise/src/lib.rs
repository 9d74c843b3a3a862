//! A BitTorrent peer session engine, protocol V1 over TCP.
//!
//! This crate downloads and seeds a single-file torrent. Everything that
//! touches the transfer state runs on one reactor task, the [`torrent`]
//! module, which owns every [`peer::PeerSession`]. Sessions are sans-IO:
//! they turn the bytes read from a socket into state changes and decide what
//! to write next, following a strict priority between messages.
//!
//! The outside world is reached through small ports: [`storage::Storage`]
//! for the bytes of the torrent, [`tracker::TrackerPort`] for announces and
//! [`metainfo`] for the torrent file. Storage is only touched by the
//! [`disk`] task of the torrent, so the reactor never waits on file I/O.
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> Result<(), tortoise::error::Error> {
//! use tokio::{net::TcpListener, spawn};
//! use tortoise::{
//!     config::Config,
//!     metainfo::Metadata,
//!     peer::PeerId,
//!     state::TransferState,
//!     storage::MemoryStorage,
//!     torrent::{Torrent, TorrentParams},
//!     tracker::{StaticTracker, Tracker},
//! };
//!
//! let content = vec![7u8; 100_000];
//! let meta = Metadata::from_content("file", "", 16384, &content)?;
//! let config = Config::default();
//!
//! let (tracker, tracker_ctx) =
//!     Tracker::new(StaticTracker::new(vec!["127.0.0.1:6881".parse().unwrap()]));
//! spawn(tracker.run());
//!
//! let torrent = Torrent::new(TorrentParams {
//!     state: TransferState::new(&meta, config.block_len),
//!     storage: MemoryStorage::new(meta.total_length),
//!     listener: TcpListener::bind("0.0.0.0:0").await?,
//!     peer_id: PeerId::generate(),
//!     tracker: tracker_ctx,
//!     continue_seeding: false,
//!     resume_path: None,
//!     meta,
//!     config,
//! })?;
//!
//! let outcome = torrent.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod bitfield;
pub mod choke;
pub mod config;
pub mod counter;
pub mod disk;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod piece;
pub mod resume;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod tcp_wire;
pub mod torrent;
pub mod tracker;
