use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{create_dir_all, File, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{debug, warn};

use crate::{error::Error, scheduler::PieceStrategy};

/// Tunables of the engine. Every field has a default, so a config file
/// only needs the values it changes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// TCP port for inbound connections.
    pub listen_port: u16,
    /// Inbound connections are refused above this many connections.
    pub max_connections: usize,
    /// We stop dialing known peers above this many connections.
    pub max_active_peers: usize,
    /// How many peers the choke round unchokes, not counting the
    /// optimistic unchoke.
    pub unchoke_slots: usize,
    pub choke_interval_ms: u64,
    /// A requested block that didn't progress for this long is taken back.
    pub request_timeout_ms: u64,
    /// Send a keepalive after this long without sending anything.
    pub keep_alive_ms: u64,
    pub connect_timeout_ms: u64,
    /// Upper bound between two runs of the periodic work.
    pub tick_ms: u64,
    pub block_len: u32,
    pub min_request_queue: usize,
    pub max_request_queue: usize,
    /// Frames larger than this are discarded.
    pub max_frame_len: usize,
    /// Requests from a peer queued above this many are dropped.
    pub max_receive_requests: usize,
    pub numwant: u32,
    /// Used until the tracker tells us its interval.
    pub default_announce_interval_s: u64,
    pub piece_strategy: PieceStrategy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            max_connections: 56,
            max_active_peers: 30,
            unchoke_slots: 3,
            choke_interval_ms: 10_000,
            request_timeout_ms: 120_000,
            keep_alive_ms: 120_000,
            connect_timeout_ms: 10_000,
            tick_ms: 1_000,
            block_len: 16_384,
            min_request_queue: 4,
            max_request_queue: 64,
            max_frame_len: 2 * 1024 * 1024,
            max_receive_requests: 256,
            numwant: 50,
            default_announce_interval_s: 1_800,
            piece_strategy: PieceStrategy::Random,
        }
    }
}

impl Config {
    pub fn choke_interval(&self) -> Duration {
        Duration::from_millis(self.choke_interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.default_announce_interval_s)
    }

    /// Path of the config file in the user's config folder.
    ///
    /// # Errors
    ///
    /// Fails if the user has no home folder.
    pub fn default_path() -> Result<PathBuf, Error> {
        let dotfile =
            ProjectDirs::from("", "", "Tortoise").ok_or(Error::HomeInvalid)?;
        Ok(dotfile.config_dir().join("config.toml"))
    }

    /// Load the configuration at `path`, or at [`Config::default_path`].
    ///
    /// An explicit path must exist and be valid toml. The default path is
    /// created with the default configuration if it's missing, and any
    /// problem with it falls back to the defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self, Error> {
        if let Some(path) = path {
            let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                Error::ConfigError(format!("{}: {e}", path.display()))
            })?;
            return Ok(toml::from_str(&content)?);
        }

        let path = match Self::default_path() {
            Ok(path) => path,
            Err(e) => {
                warn!("{e}, using the default configuration");
                return Ok(Self::default());
            }
        };

        match Self::load_or_create(&path).await {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!("could not use {path:?}: {e}, using the default configuration");
                Ok(Self::default())
            }
        }
    }

    async fn load_or_create(path: &Path) -> Result<Self, Error> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                create_dir_all(dir).await?;
            }
        }

        // this will only fail if we dont have permission to read or write to
        // this path.
        let mut file: File = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;

        let mut content = String::new();
        file.read_to_string(&mut content).await?;

        if content.trim().is_empty() {
            debug!("writing the default configuration to {path:?}");
            let config = Self::default();
            file.write_all(toml::to_string(&config)?.as_bytes()).await?;
            return Ok(config);
        }

        Ok(toml::from_str(&content)?)
    }
}
