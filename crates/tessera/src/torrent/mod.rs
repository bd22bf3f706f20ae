//! A torrent and its start/stop state machine.
//!
//! A [`Torrent`] owns its [`Info`] and its bandwidth counters, and talks to
//! the session's collaborators (tracker, peer manager, verifier) by
//! handle. Its mutable state lives behind one lock, which is never held
//! while calling into the verifier, the tracker or a user callback.
mod files;
mod resume;
mod stat;
mod types;

use std::{
    fmt::Debug,
    ops::RangeInclusive,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

pub use types::*;

use crate::{
    bandwidth::{Bandwidth, Direction},
    bitfield::{Bitfield, TrBitfield},
    completion::{Completeness, Completion},
    ctor::Ctor,
    fdlimit::{FdCache, Preallocation},
    inout::{self, Segment},
    metainfo::{Geometry, Info, InfoHash, TrackerInfo, MAX_BLOCK_SIZE},
    peer::{PeerSource, ADDED_F_SEED_FLAG},
    resume::ResumeFields,
    session::Shared,
    tracker::{Tracker, TrackerEvent, TrackerSubscription},
    utils::{now_secs, Ratio},
    verify::VerifyDone,
};

pub struct Torrent {
    id: TorrentId,
    info_hash: InfoHash,
    obfuscated_hash: [u8; 20],
    name: String,
    geometry: Geometry,
    /// Our copy of the metainfo.
    torrent_file: PathBuf,
    session: Arc<Shared>,
    state: Mutex<State>,
    /// Only mutated on the event thread.
    tracker: Mutex<Option<Box<dyn Tracker>>>,
    callbacks: Mutex<Callbacks>,
}

impl Debug for Torrent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Torrent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("info_hash", &self.info_hash)
            .finish()
    }
}

/// Everything about a torrent that changes after it was created.
#[derive(Debug)]
pub(crate) struct State {
    info: Info,
    download_dir: PathBuf,
    completion: Completion,
    completeness: Completeness,
    /// Pieces that were hash checked since the last [`Torrent::verify`].
    checked: Bitfield,
    is_running: bool,
    is_deleting: bool,
    delete_local_data: bool,
    is_freed: bool,
    error: TorrentError,
    error_string: String,
    bandwidth: Bandwidth,
    ratio_mode: RatioMode,
    desired_ratio: f64,
    peer_limit: u16,

    added_date: i64,
    start_date: i64,
    done_date: i64,
    activity_date: i64,

    // "cur" is this session, "prev" everything before it
    downloaded_cur: u64,
    downloaded_prev: u64,
    uploaded_cur: u64,
    uploaded_prev: u64,
    corrupt_cur: u64,
    corrupt_prev: u64,

    last_stat_time: i64,
    stats: Option<Stat>,
}

impl State {
    fn reset_transfer_stats(&mut self) {
        self.downloaded_prev += self.downloaded_cur;
        self.downloaded_cur = 0;
        self.uploaded_prev += self.uploaded_cur;
        self.uploaded_cur = 0;
        self.corrupt_prev += self.corrupt_cur;
        self.corrupt_cur = 0;
    }

    fn downloaded_ever(&self) -> u64 {
        self.downloaded_cur + self.downloaded_prev
    }

    fn uploaded_ever(&self) -> u64 {
        self.uploaded_cur + self.uploaded_prev
    }

    fn refresh_completeness(&mut self) -> Completeness {
        self.completion.status(&self.info.pieces)
    }
}

impl Torrent {
    /// Build a torrent and load its resume state, the caller registers it.
    /// Returns whether it should be started.
    #[tracing::instrument(skip_all, name = "torrent::new", fields(name = %info.name))]
    pub(crate) fn new(
        session: &Arc<Shared>,
        id: TorrentId,
        mut info: Info,
        geometry: Geometry,
        ctor: &Ctor,
    ) -> (Arc<Self>, bool) {
        info.randomize_tiers();
        files::init_piece_priorities(&mut info);

        let name = info.name.clone();
        let info_hash = info.info_hash;
        let torrent_file = session
            .config
            .torrent_dir
            .join(format!("{name}.{}.torrent", &info.hash_string[..16]));
        let download_dir = ctor
            .resolved_download_dir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| session.config.download_dir.clone());

        let mut state = State {
            checked: Bitfield::from_piece(geometry.piece_count),
            completion: Completion::new(geometry),
            completeness: Completeness::Leech,
            info,
            download_dir,
            is_running: false,
            is_deleting: false,
            delete_local_data: false,
            is_freed: false,
            error: TorrentError::None,
            error_string: String::new(),
            bandwidth: Bandwidth::default(),
            ratio_mode: RatioMode::Global,
            desired_ratio: 0.0,
            peer_limit: session.config.peer_limit_per_torrent,
            added_date: now_secs(),
            start_date: 0,
            done_date: 0,
            activity_date: 0,
            downloaded_cur: 0,
            downloaded_prev: 0,
            uploaded_cur: 0,
            uploaded_prev: 0,
            corrupt_cur: 0,
            corrupt_prev: 0,
            last_stat_time: 0,
            stats: None,
        };

        let saved = session.resume.load(&state.info.hash_string);
        let loaded = state.apply_resume(saved, ResumeFields::ALL, Some(ctor));
        debug!("loaded resume fields {loaded:?}");

        let do_start = state.is_running;
        state.is_running = false;

        let limits = *session.limits.lock();
        if !loaded.contains(ResumeFields::SPEEDLIMIT) {
            for dir in [Direction::Up, Direction::Down] {
                state.bandwidth.limit_mut(dir).speed = limits.speed(dir).speed;
            }
        }
        if !loaded.contains(ResumeFields::RATIOLIMIT) {
            state.ratio_mode = RatioMode::Global;
            state.desired_ratio = limits.ratio_limit;
        }
        state.completeness = state.refresh_completeness();

        session.peers.add_torrent(id, info_hash);

        let tor = Arc::new_cyclic(|weak| {
            let subscription = TrackerSubscription::new(weak.clone(), session.events.clone());
            let tracker = session.trackers.new_tracker(&state.info, subscription);
            Torrent {
                id,
                info_hash,
                obfuscated_hash: info_hash.obfuscated(),
                name,
                geometry,
                torrent_file,
                session: Arc::clone(session),
                state: Mutex::new(state),
                tracker: Mutex::new(Some(tracker)),
                callbacks: Mutex::new(Callbacks::default()),
            }
        });

        (tor, do_start)
    }

    pub fn id(&self) -> TorrentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info_hash(&self) -> &InfoHash {
        &self.info_hash
    }

    pub fn hash_string(&self) -> String {
        self.info_hash.to_string()
    }

    pub fn obfuscated_hash(&self) -> &[u8; 20] {
        &self.obfuscated_hash
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// A copy of the metainfo, with the current priorities and trackers.
    pub fn info(&self) -> Info {
        self.state.lock().info.clone()
    }

    pub fn file_count(&self) -> usize {
        self.state.lock().info.file_count()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_running
    }

    pub fn completeness(&self) -> Completeness {
        self.state.lock().completeness
    }

    /// Has every piece we want.
    pub fn is_seed(&self) -> bool {
        self.completeness() != Completeness::Leech
    }

    pub fn error(&self) -> (TorrentError, String) {
        let s = self.state.lock();
        (s.error, s.error_string.clone())
    }

    pub(crate) fn fd(&self) -> &FdCache {
        &self.session.fd
    }

    pub(crate) fn preallocation(&self) -> Preallocation {
        self.session.config.preallocation
    }

    /// The download dir and the file segments of a request.
    pub(crate) fn locate(&self, piece: usize, offset: u64, length: u64) -> (PathBuf, Vec<Segment>) {
        let pos = self.geometry.piece_size * piece as u64 + offset;
        let s = self.state.lock();
        (s.download_dir.clone(), inout::segments(&s.info.files, pos, length))
    }

    pub(crate) fn piece_hash(&self, piece: usize) -> Option<[u8; 20]> {
        self.state.lock().info.pieces.get(piece).map(|p| p.hash)
    }

    /// Path of `file` and the pieces it touches, `None` for empty files.
    pub(crate) fn file_location(&self, file: usize) -> Option<(PathBuf, RangeInclusive<usize>)> {
        let s = self.state.lock();
        let f = s.info.files.get(file)?;
        // an empty file owns no bytes of the pieces it maps to
        if f.length == 0 {
            return None;
        }
        Some((s.download_dir.join(&f.name), f.first_piece..=f.last_piece))
    }

    // -- start / stop --

    /// Start downloading or seeding, after checking the local data if
    /// needed.
    pub fn start(self: &Arc<Self>) {
        self.start_impl(true);
    }

    #[tracing::instrument(skip(self), name = "torrent::start", fields(name = %self.name))]
    pub(crate) fn start_impl(self: &Arc<Self>, reload_progress: bool) {
        let verifying = self.session.verifier.in_progress(self);
        let saved = if !verifying && reload_progress {
            self.session.resume.load(&self.hash_string())
        } else {
            None
        };

        {
            let mut s = self.state.lock();
            if s.is_running {
                return;
            }
            if saved.is_some() {
                s.apply_resume(saved, ResumeFields::PROGRESS, None);
            }
            s.is_running = true;
        }

        info!("Starting torrent");

        if !verifying {
            let done: VerifyDone = Box::new(|tor: &Arc<Torrent>| {
                let t = Arc::clone(tor);
                tor.session.events.run(move || t.check_and_start());
            });
            self.session.verifier.add(Arc::clone(self), Some(done));
        }
    }

    /// The actual start, on the event thread once the data was checked.
    fn check_and_start(self: &Arc<Self>) {
        {
            let mut s = self.state.lock();
            // stopped or freed while it was being checked
            if s.is_freed || !s.is_running {
                return;
            }
            s.error = TorrentError::None;
            s.error_string.clear();
            s.reset_transfer_stats();
            s.completeness = s.refresh_completeness();
            s.start_date = now_secs();
        }

        self.save_resume();
        if let Some(tracker) = self.tracker.lock().as_mut() {
            tracker.start();
        }
        self.session.peers.start_torrent(self.id);
        self.check_seed_ratio();
    }

    #[tracing::instrument(skip(self), name = "torrent::stop", fields(name = %self.name))]
    pub fn stop(self: &Arc<Self>) {
        let is_deleting = {
            let mut s = self.state.lock();
            s.is_running = false;
            s.is_deleting
        };

        info!("Stopping torrent");

        if !is_deleting {
            self.save_resume();
        }

        let tor = Arc::clone(self);
        self.session.events.run(move || tor.stop_torrent());
    }

    /// Detach from everything that makes a torrent active, on the event
    /// thread.
    fn stop_torrent(&self) {
        self.session.verifier.remove(self);
        self.session.peers.stop_torrent(self.id);
        if let Some(tracker) = self.tracker.lock().as_mut() {
            tracker.stop();
        }
        self.close_local_files();
    }

    /// Check every piece again.
    #[tracing::instrument(skip(self), name = "torrent::verify", fields(name = %self.name))]
    pub fn verify(self: &Arc<Self>) {
        self.session.verifier.remove(self);
        self.uncheck();

        let done: VerifyDone = Box::new(|tor: &Arc<Torrent>| {
            let t = Arc::clone(tor);
            tor.session.events.run(move || t.recheck_completeness());
        });
        self.session.verifier.add(Arc::clone(self), Some(done));
    }

    /// Unload the torrent, keeping its resume state and metainfo copy.
    pub fn free(self: &Arc<Self>) {
        self.clear_completeness_callback();
        let tor = Arc::clone(self);
        self.session.events.run(move || tor.close_torrent());
    }

    /// Unload the torrent and forget it: its resume state and metainfo
    /// copy are removed, and its downloaded files too if
    /// `delete_local_data`.
    pub fn remove(self: &Arc<Self>, delete_local_data: bool) {
        {
            let mut s = self.state.lock();
            s.is_deleting = true;
            s.delete_local_data = delete_local_data;
        }
        self.free();
    }

    fn close_torrent(self: &Arc<Self>) {
        if self.state.lock().is_freed {
            return;
        }

        info!(name = %self.name, "Removing torrent");
        self.save_resume();

        let (is_deleting, delete_local_data) = {
            let mut s = self.state.lock();
            s.is_running = false;
            (s.is_deleting, s.delete_local_data)
        };

        self.stop_torrent();

        if is_deleting {
            self.remove_saved_metainfo();
            self.remove_resume();
            if delete_local_data {
                if let Err(e) = self.delete_local_data() {
                    warn!(name = %self.name, "could not delete local data: {e}");
                }
            }
        }

        self.free_torrent();
    }

    /// Teardown order: peer manager, tracker, then the registry.
    fn free_torrent(&self) {
        self.state.lock().is_freed = true;
        self.session.peers.remove_torrent(self.id);
        drop(self.tracker.lock().take());
        self.session.unregister(self.id);
    }

    pub(crate) fn close_local_files(&self) {
        let paths: Vec<PathBuf> = {
            let s = self.state.lock();
            s.info.files.iter().map(|f| s.download_dir.join(&f.name)).collect()
        };
        for path in paths {
            self.session.fd.close_by_name(&path);
        }
    }

    // -- completeness --

    /// Compare the completeness with what it was, and act on a change.
    pub fn recheck_completeness(self: &Arc<Self>) {
        let change = {
            let mut s = self.state.lock();
            let completeness = s.refresh_completeness();
            if completeness == s.completeness {
                None
            } else {
                let recent_change = s.downloaded_cur != 0;
                if recent_change {
                    info!(
                        name = %self.name,
                        "State changed from \"{}\" to \"{}\"",
                        s.completeness,
                        completeness
                    );
                }
                s.completeness = completeness;
                if recent_change && completeness == Completeness::Seed {
                    s.done_date = now_secs();
                }
                Some((completeness, recent_change))
            }
        };

        let Some((completeness, recent_change)) = change else { return };

        self.close_local_files();

        let callback = self.callbacks.lock().completeness.clone();
        if let Some(callback) = callback {
            callback(self.as_ref(), completeness);
        }

        if recent_change && completeness == Completeness::Seed {
            if let Some(tracker) = self.tracker.lock().as_mut() {
                tracker.completed();
            }
        }

        self.save_resume();
        self.check_seed_ratio();
    }

    /// Stop a seeding torrent that reached its ratio limit.
    pub fn check_seed_ratio(self: &Arc<Self>) {
        let hit = {
            let mut s = self.state.lock();
            if !s.is_running || s.completeness == Completeness::Leech {
                return;
            }
            let Some(limit) = self.seed_ratio_of(&s) else { return };
            let up = s.uploaded_ever();
            let mut down = s.downloaded_ever();
            // maybe we're the initial seeder and never downloaded anything
            if down == 0 {
                down = s.completion.have_valid();
            }
            Ratio::new(up, down).reached(limit)
        };

        if !hit {
            return;
        }

        info!(name = %self.name, "Seed ratio reached, stopping");
        self.stop();
        self.set_ratio_mode(RatioMode::Unlimited);

        let callback = self.callbacks.lock().ratio_limit_hit.clone();
        if let Some(callback) = callback {
            callback(self.as_ref());
        }
    }

    pub fn set_completeness_callback<F>(&self, f: F)
    where
        F: Fn(&Torrent, Completeness) + Send + Sync + 'static,
    {
        self.callbacks.lock().completeness = Some(Arc::new(f));
    }

    pub fn clear_completeness_callback(&self) {
        self.callbacks.lock().completeness = None;
    }

    pub fn set_ratio_limit_hit_callback<F>(&self, f: F)
    where
        F: Fn(&Torrent) + Send + Sync + 'static,
    {
        self.callbacks.lock().ratio_limit_hit = Some(Arc::new(f));
    }

    pub fn clear_ratio_limit_hit_callback(&self) {
        self.callbacks.lock().ratio_limit_hit = None;
    }

    // -- tracker --

    /// Handle an event published by our tracker, on the event thread.
    pub(crate) fn on_tracker_event(&self, event: TrackerEvent) {
        if self.state.lock().is_freed {
            return;
        }
        match event {
            TrackerEvent::Peers { compact, all_are_seeds } => {
                let peers = &self.session.peers;
                let mut pex = peers.array_to_pex(&compact);
                if all_are_seeds {
                    debug!(name = %self.name, "Got {} seeds from tracker", pex.len());
                } else {
                    info!(name = %self.name, "Got {} peers from tracker", pex.len());
                }
                for p in &mut pex {
                    if all_are_seeds {
                        p.flags |= ADDED_F_SEED_FLAG;
                    }
                    peers.add_pex(self.id, PeerSource::Tracker, p);
                }
            }
            TrackerEvent::Warning(text) => {
                warn!(name = %self.name, "Tracker warning: \"{text}\"");
                let mut s = self.state.lock();
                s.error = TorrentError::TrackerWarning;
                s.error_string = text;
            }
            TrackerEvent::Error(text) => {
                error!(name = %self.name, "Tracker error: \"{text}\"");
                let mut s = self.state.lock();
                s.error = TorrentError::TrackerError;
                s.error_string = text;
            }
            TrackerEvent::ErrorClear => {
                let mut s = self.state.lock();
                s.error = TorrentError::None;
                s.error_string.clear();
            }
        }
    }

    /// Announce now instead of waiting for the tracker's interval.
    pub fn manual_announce(self: &Arc<Self>) {
        let tor = Arc::clone(self);
        self.session.events.run(move || {
            if tor.is_running() {
                if let Some(tracker) = tor.tracker.lock().as_mut() {
                    tracker.manual_announce();
                }
            }
        });
    }

    pub fn can_manual_announce(&self) -> bool {
        self.is_running()
            && self
                .tracker
                .lock()
                .as_ref()
                .is_some_and(|t| t.can_manual_announce())
    }

    pub fn change_my_port(&self) {
        if let Some(tracker) = self.tracker.lock().as_mut() {
            tracker.change_my_port();
        }
    }

    pub fn trackers(&self) -> Vec<TrackerInfo> {
        self.state.lock().info.trackers.clone()
    }

    /// Move the tracker at `pos` to the front of its tier, returning its
    /// new position.
    pub fn promote_tracker(&self, pos: usize) -> usize {
        self.state.lock().info.promote_tracker(pos)
    }

    // -- settings --

    pub fn set_download_dir(&self, path: impl AsRef<Path>) {
        let changed = {
            let mut s = self.state.lock();
            if s.download_dir == path.as_ref() {
                false
            } else {
                s.download_dir = path.as_ref().to_owned();
                true
            }
        };
        if changed {
            self.save_resume();
        }
    }

    pub fn download_dir(&self) -> PathBuf {
        self.state.lock().download_dir.clone()
    }

    pub fn set_peer_limit(&self, limit: u16) {
        self.state.lock().peer_limit = limit;
    }

    pub fn peer_limit(&self) -> u16 {
        self.state.lock().peer_limit
    }

    /// KiB/s
    pub fn set_speed_limit(&self, dir: Direction, speed: u32) {
        self.state.lock().bandwidth.limit_mut(dir).speed = speed;
    }

    pub fn speed_limit(&self, dir: Direction) -> u32 {
        self.state.lock().bandwidth.limit(dir).speed
    }

    pub fn use_speed_limit(&self, dir: Direction, limited: bool) {
        self.state.lock().bandwidth.limit_mut(dir).limited = limited;
    }

    pub fn uses_speed_limit(&self, dir: Direction) -> bool {
        self.state.lock().bandwidth.limit(dir).limited
    }

    /// Whether the session's limits apply to this torrent as well.
    pub fn use_session_limits(&self, dir: Direction, honor: bool) {
        self.state.lock().bandwidth.limit_mut(dir).honor_session = honor;
    }

    pub fn uses_session_limits(&self, dir: Direction) -> bool {
        self.state.lock().bandwidth.limit(dir).honor_session
    }

    /// Whether the speed limits let any piece data through.
    pub fn is_piece_transfer_allowed(&self, dir: Direction) -> bool {
        let limit = self.state.lock().bandwidth.limit(dir);
        let mut allowed = true;

        if limit.limited && limit.speed == 0 {
            allowed = false;
        }
        if limit.honor_session {
            let session = self.session.limits.lock().speed(dir);
            if session.enabled && session.speed == 0 {
                allowed = false;
            }
        }

        allowed
    }

    pub fn set_ratio_mode(self: &Arc<Self>, mode: RatioMode) {
        self.state.lock().ratio_mode = mode;
        self.check_seed_ratio();
    }

    pub fn ratio_mode(&self) -> RatioMode {
        self.state.lock().ratio_mode
    }

    pub fn set_ratio_limit(self: &Arc<Self>, ratio: f64) {
        self.state.lock().desired_ratio = ratio;
        self.check_seed_ratio();
    }

    pub fn ratio_limit(&self) -> f64 {
        self.state.lock().desired_ratio
    }

    /// The ratio at which seeding stops, `None` if it never does.
    pub fn seed_ratio(&self) -> Option<f64> {
        let s = self.state.lock();
        self.seed_ratio_of(&s)
    }

    fn seed_ratio_of(&self, s: &State) -> Option<f64> {
        match s.ratio_mode {
            RatioMode::Single => Some(s.desired_ratio),
            RatioMode::Global => {
                let limits = self.session.limits.lock();
                limits.ratio_limited.then_some(limits.ratio_limit)
            }
            RatioMode::Unlimited => None,
        }
    }

    // -- transfers --

    /// Account for piece data moved by the peer manager.
    pub fn on_piece_data(&self, dir: Direction, bytes: u64) {
        let mut s = self.state.lock();
        s.bandwidth.piece.record(dir, bytes);
        s.bandwidth.raw.record(dir, bytes);
        match dir {
            Direction::Up => s.uploaded_cur += bytes,
            Direction::Down => s.downloaded_cur += bytes,
        }
        s.activity_date = now_secs();
    }

    /// Account for protocol overhead.
    pub fn on_raw_data(&self, dir: Direction, bytes: u64) {
        self.state.lock().bandwidth.raw.record(dir, bytes);
    }

    /// Account for downloaded data that failed its hash check.
    pub fn on_corrupt(&self, bytes: u64) {
        self.state.lock().corrupt_cur += bytes;
    }

    /// Recompute the transfer rates, called periodically.
    pub fn update_rates(&self) {
        let s = self.state.lock();
        s.bandwidth.raw.update_rates();
        s.bandwidth.piece.update_rates();
    }

    /// Fold this session's transfer counters into the totals.
    pub fn reset_transfer_stats(&self) {
        self.state.lock().reset_transfer_stats();
    }

    // -- pieces --

    pub fn set_has_piece(&self, piece: usize, has: bool) {
        self.state.lock().completion.set_has_piece(piece, has);
    }

    /// A block was written to disk.
    pub fn add_block(&self, block: usize) {
        self.state.lock().completion.add_block(block);
    }

    pub fn piece_is_complete(&self, piece: usize) -> bool {
        self.state.lock().completion.piece_is_complete(piece)
    }

    pub fn block_is_complete(&self, block: usize) -> bool {
        self.state.lock().completion.block_is_complete(block)
    }

    /// Block view of what we have.
    pub fn block_bitfield(&self) -> Bitfield {
        self.state.lock().completion.block_bitfield().clone()
    }

    /// Piece view of what we have.
    pub fn piece_bitfield(&self) -> Bitfield {
        self.state.lock().completion.piece_bitfield().clone()
    }

    /// Whether a peer may request `length` bytes at `offset` in `index`.
    pub fn req_is_valid(&self, index: usize, offset: u64, length: u64) -> bool {
        let g = &self.geometry;
        let err = if index >= g.piece_count {
            Some(1)
        } else if length < 1 {
            Some(2)
        } else if offset + length > g.piece_size(index) {
            Some(3)
        } else if length > MAX_BLOCK_SIZE {
            Some(4)
        } else if g.piece_offset(index, offset, length) > g.total_size {
            Some(5)
        } else {
            None
        };

        if let Some(err) = err {
            debug!(
                name = %self.name,
                "index {index} offset {offset} length {length} err {err}"
            );
        }

        err.is_none()
    }

    /// Absolute position right after `length` bytes at `offset` in `index`.
    pub fn piece_offset(&self, index: usize, offset: u64, length: u64) -> u64 {
        self.geometry.piece_offset(index, offset, length)
    }
}
