mod args;

use std::{collections::BTreeMap, path::Path};

use clap::Parser;
use tokio::{net::TcpListener, spawn};
use tracing::{info, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;

use args::Args;
use tortoise::{
    config::Config,
    error::Error,
    metainfo::{MetaInfo, Metadata},
    peer::PeerId,
    resume,
    state::TransferState,
    storage::{FileStorage, Storage},
    torrent::{Outcome, Torrent, TorrentMsg, TorrentParams},
    tracker::{HttpTracker, StaticTracker, Tracker, TrackerCtx},
};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();
    let _guard = init_tracing(&args)?;

    let mut config = Config::load(args.config.as_deref()).await?;
    if let Some(port) = args.port {
        config.listen_port = port;
    }

    let buf = tokio::fs::read(&args.torrent)
        .await
        .map_err(|_| Error::FileOpenError(args.torrent.display().to_string()))?;
    let meta = Metadata::try_from(MetaInfo::from_bytes(&buf)?)?;

    let dest = args.dest();
    info!("{} {:?} -> {dest:?}", meta.info_hash, meta.name);
    let mut storage = FileStorage::open(&dest, meta.total_length).await?;

    let state = if args.seed {
        resume::check_seed(&meta, &mut storage).await?;
        TransferState::complete(&meta, config.block_len)
    } else {
        load_state(&args, &meta, &mut storage, config.block_len).await?
    };

    let listener = TcpListener::bind(("0.0.0.0", config.listen_port)).await?;

    let tracker = spawn_tracker(&meta, &args);

    let torrent = Torrent::new(TorrentParams {
        state,
        storage,
        peer_id: PeerId::generate(),
        listener,
        tracker,
        continue_seeding: args.continue_seeding,
        resume_path: args.resume.clone(),
        meta,
        config,
    })?;
    let tx = torrent.tx.clone();

    if !args.peers.is_empty() {
        tx.send(TorrentMsg::AddPeers(args.peers.clone())).await?;
    }

    spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(TorrentMsg::Quit).await;
        }
    });

    match torrent.run().await? {
        Outcome::Completed => info!("download finished"),
        Outcome::Quit => info!("bye"),
    }

    Ok(())
}

/// Logs go to stdout, or to `--log-file`. The guard must live as long as
/// the program so buffered lines are flushed.
fn init_tracing(args: &Args) -> Result<Option<WorkerGuard>, Error> {
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };

    let Some(path) = &args.log_file else {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .without_time()
            .init();
        return Ok(None);
    };

    let dir = path.parent().unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::FileOpenError(path.display().to_string()))?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_ansi(false)
        .without_time()
        .with_writer(writer)
        .init();

    Ok(Some(guard))
}

/// The progress of a previous run. Without a resume file every piece
/// already in storage is checked.
async fn load_state<S: Storage>(
    args: &Args,
    meta: &Metadata,
    storage: &mut S,
    block_len: u32,
) -> Result<TransferState, Error> {
    match &args.resume {
        Some(path) => resume::load(path, meta, storage, block_len).await,
        None => Ok(resume::rehydrate(BTreeMap::new(), meta, storage, block_len).await),
    }
}

/// Announce to the http tracker of the torrent, or only use the `--peer`
/// addresses when there is none we can talk to.
fn spawn_tracker(meta: &Metadata, args: &Args) -> TrackerCtx {
    match HttpTracker::new(&meta.announce) {
        Ok(http) => {
            info!("tracker {}", http.url());
            let (tracker, ctx) = Tracker::new(http);
            spawn(tracker.run());
            ctx
        }
        Err(e) => {
            warn!("{e}, only using the peers from the command line");
            let (tracker, ctx) = Tracker::new(StaticTracker::new(args.peers.clone()));
            spawn(tracker.run());
            ctx
        }
    }
}
