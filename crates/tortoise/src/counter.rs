use tokio::time::Instant;

/// Exponential Moving Average (EMA) smoothing factor
/// Higher values = more responsive to changes, lower values = smoother
const EMA_ALPHA: f64 = 0.3;

/// Byte counters of a peer or of the whole torrent.
///
/// The totals never reset. The round counters are reset by every choke
/// round, they rank the peers.
#[derive(Debug, Clone)]
pub struct Counter {
    // -- cumulative counters --
    pub total_downloaded: u64,
    pub total_uploaded: u64,

    // -- choke round --
    pub round_downloaded: u64,
    pub round_uploaded: u64,

    // -- rate calculation, bytes per second --
    pub download_rate: u64,
    pub upload_rate: u64,

    // -- internal state --
    window_downloaded: u64,
    window_uploaded: u64,
    last_update: Instant,
    ema_download: f64,
    ema_upload: f64,
}

impl Counter {
    pub fn new(now: Instant) -> Self {
        Self {
            total_downloaded: 0,
            total_uploaded: 0,
            round_downloaded: 0,
            round_uploaded: 0,
            download_rate: 0,
            upload_rate: 0,
            window_downloaded: 0,
            window_uploaded: 0,
            last_update: now,
            ema_download: 0.0,
            ema_upload: 0.0,
        }
    }

    /// Record downloaded bytes
    pub fn record_download(&mut self, bytes: u64) {
        self.total_downloaded += bytes;
        self.round_downloaded += bytes;
        self.window_downloaded += bytes;
    }

    /// Record uploaded bytes
    pub fn record_upload(&mut self, bytes: u64) {
        self.total_uploaded += bytes;
        self.round_uploaded += bytes;
        self.window_uploaded += bytes;
    }

    pub fn reset_round(&mut self) {
        self.round_downloaded = 0;
        self.round_uploaded = 0;
    }

    /// Update rates with EMA smoothing
    pub fn update_rates(&mut self, now: Instant) {
        let elapsed =
            now.saturating_duration_since(self.last_update).as_secs_f64();

        if elapsed < 0.001 {
            // Minimum 1ms elapsed
            return;
        }

        let downloaded = std::mem::take(&mut self.window_downloaded);
        let uploaded = std::mem::take(&mut self.window_uploaded);

        // instantaneous rates
        let dl_rate = downloaded as f64 / elapsed;
        let ul_rate = uploaded as f64 / elapsed;

        self.ema_download = if self.ema_download == 0.0 {
            dl_rate
        } else {
            EMA_ALPHA * dl_rate + (1.0 - EMA_ALPHA) * self.ema_download
        };

        self.ema_upload = if self.ema_upload == 0.0 {
            ul_rate
        } else {
            EMA_ALPHA * ul_rate + (1.0 - EMA_ALPHA) * self.ema_upload
        };

        self.download_rate = self.ema_download as u64;
        self.upload_rate = self.ema_upload as u64;
        self.last_update = now;
    }
}

/// Format bytes per second, `1.5 MiB/s`.
pub fn to_human_rate(bytes_per_sec: u64) -> String {
    format!("{}/s", to_human_bytes(bytes_per_sec))
}

/// Format a byte count with binary units.
pub fn to_human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;

    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
