//! Per-torrent state that survives restarts: progress, dates, limits and
//! file wishes.
use std::{
    fs,
    ops::{BitAnd, BitOr, BitOrAssign, Not},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    bandwidth::SpeedLimit, error::Error, metainfo::Priority, torrent::RatioMode,
};

/// Which groups of fields to load, or were loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ResumeFields(u32);

impl ResumeFields {
    pub const TOTALS: Self = Self(1 << 0);
    pub const DATES: Self = Self(1 << 1);
    pub const DOWNLOAD_DIR: Self = Self(1 << 2);
    pub const RUN: Self = Self(1 << 3);
    pub const PEER_LIMIT: Self = Self(1 << 4);
    pub const PRIORITY: Self = Self(1 << 5);
    pub const DND: Self = Self(1 << 6);
    pub const SPEEDLIMIT: Self = Self(1 << 7);
    pub const RATIOLIMIT: Self = Self(1 << 8);
    pub const PROGRESS: Self = Self(1 << 9);
    pub const ALL: Self = Self((1 << 10) - 1);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for ResumeFields {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ResumeFields {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ResumeFields {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for ResumeFields {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0 & Self::ALL.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Raw block bitfield.
    pub blocks: Vec<u8>,
    /// Raw bitfield of the pieces that passed a hash check.
    pub checked: Vec<u8>,
    /// Modification time of every file when the progress was saved, in
    /// seconds since the epoch, `0` when the file didn't exist.
    pub mtimes: Vec<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeedLimits {
    pub up: SpeedLimit,
    pub down: SpeedLimit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RatioLimit {
    pub mode: RatioMode,
    pub limit: f64,
}

/// Everything that is saved for a torrent, fields that were never saved
/// are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeData {
    pub corrupt: Option<u64>,
    pub downloaded: Option<u64>,
    pub uploaded: Option<u64>,
    pub added_date: Option<i64>,
    pub done_date: Option<i64>,
    pub activity_date: Option<i64>,
    pub download_dir: Option<PathBuf>,
    pub paused: Option<bool>,
    pub peer_limit: Option<u16>,
    pub priorities: Option<Vec<Priority>>,
    pub dnd: Option<Vec<bool>>,
    pub speed_limit: Option<SpeedLimits>,
    pub ratio_limit: Option<RatioLimit>,
    pub progress: Option<Progress>,
}

impl ResumeData {
    /// The groups of fields that are present.
    pub fn fields(&self) -> ResumeFields {
        let mut f = ResumeFields::empty();
        if self.corrupt.is_some() || self.downloaded.is_some() || self.uploaded.is_some() {
            f |= ResumeFields::TOTALS;
        }
        if self.added_date.is_some() || self.done_date.is_some() || self.activity_date.is_some() {
            f |= ResumeFields::DATES;
        }
        if self.download_dir.is_some() {
            f |= ResumeFields::DOWNLOAD_DIR;
        }
        if self.paused.is_some() {
            f |= ResumeFields::RUN;
        }
        if self.peer_limit.is_some() {
            f |= ResumeFields::PEER_LIMIT;
        }
        if self.priorities.is_some() {
            f |= ResumeFields::PRIORITY;
        }
        if self.dnd.is_some() {
            f |= ResumeFields::DND;
        }
        if self.speed_limit.is_some() {
            f |= ResumeFields::SPEEDLIMIT;
        }
        if self.ratio_limit.is_some() {
            f |= ResumeFields::RATIOLIMIT;
        }
        if self.progress.is_some() {
            f |= ResumeFields::PROGRESS;
        }
        f
    }
}

/// Where resume state is kept, keyed by the torrent's hash string.
pub trait ResumeStore: Send + Sync {
    fn load(&self, hash_string: &str) -> Option<ResumeData>;
    fn save(&self, hash_string: &str, data: &ResumeData) -> Result<(), Error>;
    fn remove(&self, hash_string: &str);
}

/// Keeps nothing.
#[derive(Debug, Default)]
pub struct NoResume;

impl ResumeStore for NoResume {
    fn load(&self, _hash_string: &str) -> Option<ResumeData> {
        None
    }

    fn save(&self, _hash_string: &str, _data: &ResumeData) -> Result<(), Error> {
        Ok(())
    }

    fn remove(&self, _hash_string: &str) {}
}

/// One TOML file per torrent, `<dir>/<hash>.resume`.
#[derive(Debug, Clone)]
pub struct TomlResumeStore {
    dir: PathBuf,
}

impl TomlResumeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, hash_string: &str) -> PathBuf {
        self.dir.join(format!("{hash_string}.resume"))
    }
}

impl ResumeStore for TomlResumeStore {
    fn load(&self, hash_string: &str) -> Option<ResumeData> {
        let path = self.path(hash_string);
        let s = fs::read_to_string(&path).ok()?;
        match toml::from_str(&s) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!("ignoring unreadable resume file {path:?}: {e}");
                None
            }
        }
    }

    fn save(&self, hash_string: &str, data: &ResumeData) -> Result<(), Error> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(hash_string);
        let s = toml::to_string(data)?;
        // write then rename, a crash never leaves half a file behind
        let tmp = path.with_extension("resume.tmp");
        fs::write(&tmp, s)?;
        fs::rename(&tmp, &path)?;
        debug!("saved resume {path:?}");
        Ok(())
    }

    fn remove(&self, hash_string: &str) {
        let path = self.path(hash_string);
        if let Err(e) = fs::remove_file(&path) {
            debug!("could not remove {path:?}: {e}");
        }
    }
}
