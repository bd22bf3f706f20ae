use std::{fmt::Display, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    completion::Completeness, peer::PeerManagerStats, tracker::TrackerStats,
    utils::Ratio,
};

use super::Torrent;

/// Process-lifetime identifier of a torrent, never reused.
pub type TorrentId = u32;

/// Where the seed ratio limit of a torrent comes from.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum RatioMode {
    /// Use the session's limit.
    #[default]
    Global,
    /// Use the torrent's own limit.
    Single,
    /// Seed forever.
    Unlimited,
}

/// What a torrent is doing right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Activity {
    /// Queued for verification.
    CheckWait,
    /// Verifying its local data.
    Check,
    Download,
    Seed,
    #[default]
    Stopped,
}

impl Display for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CheckWait => write!(f, "Waiting to verify"),
            Self::Check => write!(f, "Verifying"),
            Self::Download => write!(f, "Downloading"),
            Self::Seed => write!(f, "Seeding"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Recoverable error of a torrent, reported by its tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TorrentError {
    #[default]
    None,
    TrackerWarning,
    TrackerError,
}

impl TorrentError {
    pub fn code(&self) -> i32 {
        match self {
            Self::None => 0,
            Self::TrackerWarning => -1,
            Self::TrackerError => -2,
        }
    }
}

/// Estimated time until the current goal is reached, downloading
/// everything we want or seeding up to the ratio limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Eta {
    /// There is no goal, or it can't be reached with the peers we know.
    #[default]
    NotAvailable,
    /// We are not moving enough data to tell.
    Unknown,
    Seconds(u64),
}

/// A snapshot of a torrent's state, see [`Torrent::stat`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stat {
    pub id: TorrentId,
    pub activity: Activity,
    pub error: TorrentError,
    pub error_string: String,

    pub tracker: TrackerStats,
    pub peers: PeerManagerStats,

    /// KiB/s
    pub raw_upload_speed: f64,
    /// KiB/s
    pub raw_download_speed: f64,
    /// KiB/s
    pub piece_upload_speed: f64,
    /// KiB/s
    pub piece_download_speed: f64,

    pub percent_complete: f64,
    pub percent_done: f64,
    pub left_until_done: u64,
    pub size_when_done: u64,
    /// Between 0 and 1 while verifying, 0 otherwise.
    pub recheck_progress: f64,
    /// Bytes we want that connected peers can give us.
    pub desired_available: u64,
    pub have_valid: u64,
    pub have_unchecked: u64,

    pub corrupt_ever: u64,
    pub downloaded_ever: u64,
    pub uploaded_ever: u64,
    pub ratio: Ratio,
    /// How far we are towards the ratio limit, 1 when there is none.
    pub percent_ratio: f64,
    pub eta: Eta,

    pub activity_date: i64,
    pub added_date: i64,
    pub done_date: i64,
    pub start_date: i64,
}

/// Download progress of one file.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FileStat {
    pub bytes_completed: u64,
    pub progress: f64,
}

pub type CompletenessCallback = Arc<dyn Fn(&Torrent, Completeness) + Send + Sync>;
pub type RatioLimitHitCallback = Arc<dyn Fn(&Torrent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Callbacks {
    pub completeness: Option<CompletenessCallback>,
    pub ratio_limit_hit: Option<RatioLimitHitCallback>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("completeness", &self.completeness.is_some())
            .field("ratio_limit_hit", &self.ratio_limit_hit.is_some())
            .finish()
    }
}
