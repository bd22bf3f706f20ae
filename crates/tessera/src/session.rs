//! The session owns every torrent, the collaborators they share, and the
//! threads they run on.
//!
//! A [`Session`] is built from a [`ResolvedConfig`] and a set of
//! [`Collaborators`]: the peer manager, the tracker factory and the resume
//! store. Torrents are added with a [`Ctor`], and live until they are freed
//! or the session is closed.
//!
//! # Example
//!
//! ```no_run
//! use tessera::{config::Config, ctor::Ctor, session::{Collaborators, Session}};
//!
//! let config = Config::load(Config::default()).unwrap();
//! let session = Session::new(config, Collaborators::default()).unwrap();
//!
//! let ctor = Ctor::from_file(&session, "debian.torrent").unwrap();
//! let torrent = session.add_torrent(&ctor).unwrap();
//! println!("{}", torrent.stat().activity);
//!
//! session.close();
//! ```
use std::{
    fs,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    bandwidth::Direction,
    config::ResolvedConfig,
    ctor::Ctor,
    error::Error,
    event::{EventHandle, EventLoop},
    fdlimit::FdCache,
    metainfo::{Geometry, Info, InfoHash},
    peer::{NoPeers, PeerManager},
    resume::{NoResume, ResumeStore, TomlResumeStore},
    torrent::{Torrent, TorrentId},
    tracker::{NoTrackers, TrackerFactory},
    verify::Verifier,
};

/// Default session speed limit in KiB/s, used when the config has none.
pub const DEFAULT_SPEED_LIMIT: u32 = 100;

/// Default session seed ratio, used when the config has none.
pub const DEFAULT_RATIO_LIMIT: f64 = 2.0;

/// A session-wide speed limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSpeed {
    pub enabled: bool,
    /// KiB/s
    pub speed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Limits {
    pub up: SessionSpeed,
    pub down: SessionSpeed,
    pub ratio_limited: bool,
    pub ratio_limit: f64,
    pub peer_limit_per_torrent: u16,
}

impl Limits {
    fn new(config: &ResolvedConfig) -> Self {
        let speed = |limit: Option<u32>| SessionSpeed {
            enabled: limit.is_some(),
            speed: limit.unwrap_or(DEFAULT_SPEED_LIMIT),
        };
        Self {
            up: speed(config.speed_limit_up),
            down: speed(config.speed_limit_down),
            ratio_limited: config.ratio_limit.is_some(),
            ratio_limit: config.ratio_limit.unwrap_or(DEFAULT_RATIO_LIMIT),
            peer_limit_per_torrent: config.peer_limit_per_torrent,
        }
    }

    pub fn speed(&self, dir: Direction) -> SessionSpeed {
        match dir {
            Direction::Up => self.up,
            Direction::Down => self.down,
        }
    }

    fn speed_mut(&mut self, dir: Direction) -> &mut SessionSpeed {
        match dir {
            Direction::Up => &mut self.up,
            Direction::Down => &mut self.down,
        }
    }
}

/// What the session plugs its torrents into.
#[derive(Clone)]
pub struct Collaborators {
    pub peers: Arc<dyn PeerManager>,
    pub trackers: Arc<dyn TrackerFactory>,
    pub resume: Arc<dyn ResumeStore>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            peers: Arc::new(NoPeers),
            trackers: Arc::new(NoTrackers),
            resume: Arc::new(NoResume),
        }
    }
}

impl Collaborators {
    /// No peers and no trackers, resume state kept in the config's resume
    /// dir.
    pub fn with_resume_dir(config: &ResolvedConfig) -> Self {
        Self {
            resume: Arc::new(TomlResumeStore::new(&config.resume_dir)),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    torrents: Vec<Arc<Torrent>>,
    next_id: TorrentId,
}

/// State shared by the session and its torrents.
pub(crate) struct Shared {
    pub config: ResolvedConfig,
    pub fd: FdCache,
    pub verifier: Arc<Verifier>,
    pub events: EventHandle,
    pub limits: Mutex<Limits>,
    pub peers: Arc<dyn PeerManager>,
    pub trackers: Arc<dyn TrackerFactory>,
    pub resume: Arc<dyn ResumeStore>,
    pub registry: Mutex<Registry>,
}

impl Shared {
    /// Drop a freed torrent from the registry.
    pub fn unregister(&self, id: TorrentId) {
        self.registry.lock().torrents.retain(|t| t.id() != id);
    }
}

pub struct Session {
    shared: Arc<Shared>,
    events: EventLoop,
    closed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("download_dir", &self.shared.config.download_dir)
            .field("torrents", &self.torrent_count())
            .finish()
    }
}

impl Session {
    #[tracing::instrument(skip_all, name = "session::new")]
    pub fn new(config: ResolvedConfig, collaborators: Collaborators) -> Result<Self, Error> {
        let events = EventLoop::spawn()?;
        let fd = FdCache::new(config.open_file_limit, config.socket_limit);

        info!("download dir: {:?}", config.download_dir);

        let shared = Arc::new(Shared {
            limits: Mutex::new(Limits::new(&config)),
            config,
            fd,
            verifier: Verifier::new(),
            events: events.handle().clone(),
            peers: collaborators.peers,
            trackers: collaborators.trackers,
            resume: collaborators.resume,
            registry: Mutex::new(Registry::default()),
        });

        Ok(Self { shared, events, closed: AtomicBool::new(false) })
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.shared.config
    }

    /// Parse the ctor's metainfo and make sure it can be added.
    pub fn parse(&self, ctor: &Ctor) -> Result<(Info, Geometry), Error> {
        let bytes = ctor.metainfo().ok_or_else(|| Error::InvalidMetadata("info".into()))?;
        let fallback = ctor.source_name();
        let info = Info::parse(bytes, fallback.as_deref())?;
        let geometry = Geometry::new(info.total_size, info.piece_size)?;

        if self.exists(&info.info_hash) {
            return Err(Error::Duplicate);
        }

        Ok((info, geometry))
    }

    /// Add a torrent, starting it unless the ctor or its resume state
    /// says it is paused.
    #[tracing::instrument(skip_all, name = "session::add_torrent")]
    pub fn add_torrent(&self, ctor: &Ctor) -> Result<Arc<Torrent>, Error> {
        let (info, geometry) = self.parse(ctor)?;

        let (tor, do_start) = {
            let mut registry = self.shared.registry.lock();
            // checked again under the lock, two threads may add the same
            // torrent
            if registry.torrents.iter().any(|t| *t.info_hash() == info.info_hash) {
                return Err(Error::Duplicate);
            }
            let id = registry.next_id;
            registry.next_id += 1;

            let (tor, do_start) = Torrent::new(&self.shared, id, info, geometry, ctor);
            registry.torrents.push(Arc::clone(&tor));
            (tor, do_start)
        };

        info!(name = %tor.name(), id = tor.id(), "added torrent");

        if ctor.save() {
            if let Some(bytes) = ctor.metainfo() {
                if let Err(e) = tor.save_metainfo(bytes) {
                    warn!(name = %tor.name(), "could not save the metainfo: {e}");
                }
            }
        }

        if ctor.delete_source() {
            if let Some(source) = ctor.source_file() {
                if let Err(e) = fs::remove_file(source) {
                    warn!("could not delete {source:?}: {e}");
                }
            }
        }

        if do_start {
            tor.start_impl(false);
        }

        Ok(tor)
    }

    pub fn find_by_id(&self, id: TorrentId) -> Option<Arc<Torrent>> {
        self.shared.registry.lock().torrents.iter().find(|t| t.id() == id).cloned()
    }

    pub fn find_by_hash(&self, hash: &InfoHash) -> Option<Arc<Torrent>> {
        self.shared.registry.lock().torrents.iter().find(|t| t.info_hash() == hash).cloned()
    }

    /// Case insensitive.
    pub fn find_by_hash_string(&self, hash: &str) -> Option<Arc<Torrent>> {
        let hash = InfoHash::try_from(hash).ok()?;
        self.find_by_hash(&hash)
    }

    /// Find a torrent by the hash peers send during encrypted handshakes.
    pub fn find_by_obfuscated_hash(&self, hash: &[u8; 20]) -> Option<Arc<Torrent>> {
        self.shared
            .registry
            .lock()
            .torrents
            .iter()
            .find(|t| t.obfuscated_hash() == hash)
            .cloned()
    }

    pub fn exists(&self, hash: &InfoHash) -> bool {
        self.find_by_hash(hash).is_some()
    }

    /// The torrent after `prev` in the order they were added, the first
    /// one if `prev` is `None`.
    pub fn next(&self, prev: Option<&Torrent>) -> Option<Arc<Torrent>> {
        let registry = self.shared.registry.lock();
        let torrents = &registry.torrents;
        match prev {
            None => torrents.first().cloned(),
            Some(prev) => {
                let pos = torrents.iter().position(|t| t.id() == prev.id())?;
                torrents.get(pos + 1).cloned()
            }
        }
    }

    /// Every torrent, in the order they were added.
    pub fn torrents(&self) -> Vec<Arc<Torrent>> {
        self.shared.registry.lock().torrents.clone()
    }

    pub fn torrent_count(&self) -> usize {
        self.shared.registry.lock().torrents.len()
    }

    pub fn set_speed_limit(&self, dir: Direction, speed: u32) {
        self.shared.limits.lock().speed_mut(dir).speed = speed;
    }

    pub fn speed_limit(&self, dir: Direction) -> u32 {
        self.shared.limits.lock().speed(dir).speed
    }

    pub fn set_speed_limit_enabled(&self, dir: Direction, enabled: bool) {
        self.shared.limits.lock().speed_mut(dir).enabled = enabled;
    }

    pub fn is_speed_limit_enabled(&self, dir: Direction) -> bool {
        self.shared.limits.lock().speed(dir).enabled
    }

    /// Set the ratio at which torrents in [`RatioMode::Global`] stop
    /// seeding.
    ///
    /// [`RatioMode::Global`]: crate::torrent::RatioMode::Global
    pub fn set_ratio_limit(&self, ratio: f64) {
        self.shared.limits.lock().ratio_limit = ratio;
        self.check_seed_ratios();
    }

    pub fn ratio_limit(&self) -> f64 {
        self.shared.limits.lock().ratio_limit
    }

    pub fn set_ratio_limited(&self, limited: bool) {
        self.shared.limits.lock().ratio_limited = limited;
        self.check_seed_ratios();
    }

    pub fn is_ratio_limited(&self) -> bool {
        self.shared.limits.lock().ratio_limited
    }

    fn check_seed_ratios(&self) {
        for tor in self.torrents() {
            tor.check_seed_ratio();
        }
    }

    pub fn set_peer_limit_per_torrent(&self, limit: u16) {
        self.shared.limits.lock().peer_limit_per_torrent = limit;
    }

    pub fn peer_limit_per_torrent(&self) -> u16 {
        self.shared.limits.lock().peer_limit_per_torrent
    }

    /// Session-wide socket budget.
    pub fn set_peer_limit(&self, limit: usize) {
        self.shared.fd.set_peer_limit(limit);
    }

    pub fn peer_limit(&self) -> usize {
        self.shared.fd.peer_limit()
    }

    pub fn fd(&self) -> &FdCache {
        &self.shared.fd
    }

    /// Number of torrents being verified or waiting to be.
    pub fn verify_queue_len(&self) -> usize {
        self.shared.verifier.len()
    }

    /// Run `f` on the event thread without waiting for it.
    pub fn run_in_event_thread<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.events.run(f);
    }

    /// Run `f` on the event thread and wait for its result.
    pub fn call_in_event_thread<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.shared.events.call(f)
    }

    /// Wait until everything posted to the event thread so far has run.
    pub fn flush(&self) -> Result<(), Error> {
        self.shared.events.flush()
    }

    /// Free every torrent and stop the event thread. Resume state is saved
    /// on the way out.
    #[tracing::instrument(skip(self), name = "session::close")]
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let torrents = self.torrents();
        info!("closing session with {} torrents", torrents.len());

        for tor in &torrents {
            tor.free();
        }
        if let Err(e) = self.shared.events.flush() {
            warn!("could not flush the event thread: {e}");
        }

        self.events.shutdown();
        debug!("session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
