use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

#[derive(Parser, Debug, Default)]
#[clap(name = "Tortoise")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path of the .torrent file.
    pub torrent: PathBuf,

    /// Where the file is downloaded, or seeded from. Defaults to the name
    /// of the torrent file without `.torrent`.
    #[clap(short, long)]
    pub dest: Option<PathBuf>,

    /// Port to listen on for other peers, overrides the configuration.
    #[clap(short, long)]
    pub port: Option<u16>,

    /// Log debug messages.
    #[clap(short, long)]
    pub verbose: bool,

    /// Seed a file that is already complete. Every piece is checked first.
    #[clap(short, long)]
    pub seed: bool,

    /// Keep seeding once the download completes, until Ctrl-C.
    #[clap(short = 'c', long)]
    pub continue_seeding: bool,

    /// Resume file with the progress of a previous run, written back on
    /// exit.
    #[clap(short, long)]
    pub resume: Option<PathBuf>,

    /// Configuration file, instead of the one in the user config folder.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Write the logs to this file instead of stdout.
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Address of a peer to connect to, may be repeated.
    #[clap(long = "peer")]
    pub peers: Vec<SocketAddr>,
}

impl Args {
    /// The `--dest` path or the torrent path without its extension.
    pub fn dest(&self) -> PathBuf {
        if let Some(dest) = &self.dest {
            return dest.clone();
        }
        let name = self.torrent.file_stem().unwrap_or(self.torrent.as_os_str());
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags() {
        let args = Args::parse_from([
            "tortoise",
            "files/debian.iso.torrent",
            "-p",
            "7000",
            "-vsc",
            "--peer",
            "127.0.0.1:6881",
            "--peer",
            "10.0.0.1:51413",
        ]);

        assert_eq!(args.port, Some(7000));
        assert!(args.verbose && args.seed && args.continue_seeding);
        assert_eq!(args.peers.len(), 2);
        assert_eq!(args.dest(), PathBuf::from("debian.iso"));

        let args = Args::parse_from(["tortoise", "a.torrent", "-d", "/tmp/out"]);
        assert_eq!(args.dest(), PathBuf::from("/tmp/out"));
        assert!(args.resume.is_none());
    }

    #[test]
    fn torrent_is_required() {
        assert!(Args::try_parse_from(["tortoise"]).is_err());
    }
}
