//! Speed limits and transfer rates of a torrent.
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Exponential Moving Average (EMA) smoothing factor
/// Higher values = more responsive to changes, lower values = smoother
const EMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
}

/// Speed limit of one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeedLimit {
    /// KiB/s
    pub speed: u32,
    /// Whether `speed` applies.
    pub limited: bool,
    /// Whether the session-wide limit applies as well.
    pub honor_session: bool,
}

impl Default for SpeedLimit {
    fn default() -> Self {
        Self { speed: 0, limited: false, honor_session: true }
    }
}

/// Counter of rates, used in downloaded and uploaded.
#[derive(Debug)]
pub struct Counter {
    // -- cumulative counters --
    pub total_downloaded: AtomicU64,
    pub total_uploaded: AtomicU64,

    // -- rate calculation, bytes/sec --
    pub download_rate: AtomicU64,
    pub upload_rate: AtomicU64,

    // -- internal state --
    window_downloaded: AtomicU64,
    window_uploaded: AtomicU64,
    state: Mutex<EmaState>,
}

#[derive(Debug)]
struct EmaState {
    last_update: Instant,
    download: f64,
    upload: f64,
}

impl Default for Counter {
    fn default() -> Self {
        Self {
            total_downloaded: AtomicU64::new(0),
            total_uploaded: AtomicU64::new(0),
            download_rate: AtomicU64::new(0),
            upload_rate: AtomicU64::new(0),
            window_downloaded: AtomicU64::new(0),
            window_uploaded: AtomicU64::new(0),
            state: Mutex::new(EmaState {
                last_update: Instant::now(),
                download: 0.0,
                upload: 0.0,
            }),
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, dir: Direction, bytes: u64) {
        match dir {
            Direction::Down => {
                self.total_downloaded.fetch_add(bytes, Ordering::Relaxed);
                self.window_downloaded.fetch_add(bytes, Ordering::Relaxed);
            }
            Direction::Up => {
                self.total_uploaded.fetch_add(bytes, Ordering::Relaxed);
                self.window_uploaded.fetch_add(bytes, Ordering::Relaxed);
            }
        }
    }

    /// Update rates with EMA smoothing
    pub fn update_rates(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();

        // Minimum 1ms elapsed
        if elapsed < 0.001 {
            return;
        }

        let dl_rate = self.window_downloaded.swap(0, Ordering::Relaxed) as f64 / elapsed;
        let ul_rate = self.window_uploaded.swap(0, Ordering::Relaxed) as f64 / elapsed;

        state.download = if state.download == 0.0 {
            dl_rate
        } else {
            EMA_ALPHA * dl_rate + (1.0 - EMA_ALPHA) * state.download
        };
        state.upload = if state.upload == 0.0 {
            ul_rate
        } else {
            EMA_ALPHA * ul_rate + (1.0 - EMA_ALPHA) * state.upload
        };

        self.download_rate.store(state.download as u64, Ordering::Relaxed);
        self.upload_rate.store(state.upload as u64, Ordering::Relaxed);
        state.last_update = now;
    }

    /// KiB/s
    pub fn rate(&self, dir: Direction) -> f64 {
        let bytes = match dir {
            Direction::Down => self.download_rate.load(Ordering::Relaxed),
            Direction::Up => self.upload_rate.load(Ordering::Relaxed),
        };
        bytes as f64 / 1024.0
    }
}

/// A torrent's limits plus counters of everything it moves: `raw` counts
/// protocol overhead too, `piece` only payload.
#[derive(Debug, Default)]
pub struct Bandwidth {
    up: SpeedLimit,
    down: SpeedLimit,
    pub raw: Counter,
    pub piece: Counter,
}

impl Bandwidth {
    pub fn limit(&self, dir: Direction) -> SpeedLimit {
        match dir {
            Direction::Up => self.up,
            Direction::Down => self.down,
        }
    }

    pub fn limit_mut(&mut self, dir: Direction) -> &mut SpeedLimit {
        match dir {
            Direction::Up => &mut self.up,
            Direction::Down => &mut self.down,
        }
    }

    pub fn raw_speed(&self, dir: Direction) -> f64 {
        self.raw.rate(dir)
    }

    pub fn piece_speed(&self, dir: Direction) -> f64 {
        self.piece.rate(dir)
    }
}
