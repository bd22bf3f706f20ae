//! Options used to build a torrent.
//!
//! Every option can be given at two levels: [`CtorMode::Force`] values win
//! over anything saved in the torrent's resume state, [`CtorMode::Fallback`]
//! values are only used when nothing was saved.
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{error::Error, session::Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CtorMode {
    Force,
    Fallback,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Level {
    paused: Option<bool>,
    peer_limit: Option<u16>,
    download_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ctor {
    metainfo: Option<Vec<u8>>,
    source_file: Option<PathBuf>,
    delete_source: bool,
    save: bool,
    force: Level,
    fallback: Level,
}

impl Default for Ctor {
    fn default() -> Self {
        Self {
            metainfo: None,
            source_file: None,
            delete_source: false,
            save: true,
            force: Level::default(),
            fallback: Level::default(),
        }
    }
}

impl Ctor {
    /// A ctor whose fallback values come from the session.
    pub fn new(session: &Session) -> Self {
        let mut ctor = Self::default();
        ctor.set_paused(CtorMode::Fallback, false);
        ctor.set_peer_limit(CtorMode::Fallback, session.peer_limit_per_torrent());
        ctor.set_download_dir(CtorMode::Fallback, &session.config().download_dir);
        ctor
    }

    pub fn set_metainfo(&mut self, bytes: impl Into<Vec<u8>>) {
        self.metainfo = Some(bytes.into());
        self.source_file = None;
    }

    /// Read the metainfo of a .torrent file, and remember where it came
    /// from.
    pub fn set_metainfo_from_file(&mut self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        self.metainfo = Some(fs::read(path)?);
        self.source_file = Some(path.to_owned());
        Ok(())
    }

    pub fn from_file(session: &Session, path: impl AsRef<Path>) -> Result<Self, Error> {
        let mut ctor = Self::new(session);
        ctor.set_metainfo_from_file(path)?;
        Ok(ctor)
    }

    pub fn metainfo(&self) -> Option<&[u8]> {
        self.metainfo.as_deref()
    }

    pub fn source_file(&self) -> Option<&Path> {
        self.source_file.as_deref()
    }

    /// Name of the source file without its `.torrent` extension.
    pub(crate) fn source_name(&self) -> Option<String> {
        let path = self.source_file.as_ref()?;
        let name = path.file_name()?.to_string_lossy();
        let name = name.strip_suffix(".torrent").unwrap_or(&name);
        Some(name.to_owned())
    }

    /// Remove the source file once the torrent was added.
    pub fn set_delete_source(&mut self, delete: bool) {
        self.delete_source = delete;
    }

    pub fn delete_source(&self) -> bool {
        self.delete_source
    }

    /// Keep a copy of the metainfo in the session's torrent folder.
    pub fn set_save(&mut self, save: bool) {
        self.save = save;
    }

    pub fn save(&self) -> bool {
        self.save
    }

    fn level(&self, mode: CtorMode) -> &Level {
        match mode {
            CtorMode::Force => &self.force,
            CtorMode::Fallback => &self.fallback,
        }
    }

    fn level_mut(&mut self, mode: CtorMode) -> &mut Level {
        match mode {
            CtorMode::Force => &mut self.force,
            CtorMode::Fallback => &mut self.fallback,
        }
    }

    pub fn set_paused(&mut self, mode: CtorMode, paused: bool) {
        self.level_mut(mode).paused = Some(paused);
    }

    pub fn paused(&self, mode: CtorMode) -> Option<bool> {
        self.level(mode).paused
    }

    pub fn set_peer_limit(&mut self, mode: CtorMode, limit: u16) {
        self.level_mut(mode).peer_limit = Some(limit);
    }

    pub fn peer_limit(&self, mode: CtorMode) -> Option<u16> {
        self.level(mode).peer_limit
    }

    pub fn set_download_dir(&mut self, mode: CtorMode, dir: impl Into<PathBuf>) {
        self.level_mut(mode).download_dir = Some(dir.into());
    }

    pub fn download_dir(&self, mode: CtorMode) -> Option<&Path> {
        self.level(mode).download_dir.as_deref()
    }

    /// The forced download dir, or the fallback one.
    pub fn resolved_download_dir(&self) -> Option<&Path> {
        self.download_dir(CtorMode::Force)
            .or_else(|| self.download_dir(CtorMode::Fallback))
    }
}
