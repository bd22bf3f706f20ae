#![allow(dead_code)]

use std::{
    borrow::Cow,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use bendy::{encoding::ToBencode, value::Value};
use parking_lot::Mutex;
use tempfile::TempDir;
use tessera::{
    bitfield::Bitfield,
    config::ResolvedConfig,
    ctor::Ctor,
    metainfo::{Info, InfoHash},
    peer::{PeerManager, PeerManagerStats, PeerSource, PeerStat, Pex},
    resume::TomlResumeStore,
    session::{Collaborators, Session},
    torrent::{Torrent, TorrentId},
    tracker::{Tracker, TrackerFactory, TrackerStats, TrackerSubscription},
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .compact()
        .with_file(false)
        .without_time()
        .with_test_writer()
        .try_init();
}

/// Poll `f` until it holds, panics after a few seconds.
pub fn wait_until(what: &str, mut f: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Calls made to the collaborators, in order.
pub type Log = Arc<Mutex<Vec<String>>>;

/// A .torrent with real piece hashes over some generated content.
#[derive(Debug, Clone)]
pub struct TorrentFile {
    pub name: String,
    pub piece_length: u64,
    /// Paths relative to the torrent's folder, `None` for a single file.
    pub files: Vec<(Option<String>, Vec<u8>)>,
    pub trackers: Vec<Vec<String>>,
}

impl TorrentFile {
    pub fn single(name: &str, length: usize, piece_length: u64) -> Self {
        Self {
            name: name.to_owned(),
            piece_length,
            files: vec![(None, content(name, length))],
            trackers: vec![vec!["http://tracker.example.org/announce".into()]],
        }
    }

    pub fn multi(name: &str, files: &[(&str, usize)], piece_length: u64) -> Self {
        Self {
            name: name.to_owned(),
            piece_length,
            files: files
                .iter()
                .map(|(path, len)| (Some((*path).to_owned()), content(path, *len)))
                .collect(),
            trackers: vec![vec!["http://tracker.example.org/announce".into()]],
        }
    }

    pub fn data(&self) -> Vec<u8> {
        self.files.iter().flat_map(|(_, d)| d.iter().copied()).collect()
    }

    pub fn total_size(&self) -> u64 {
        self.data().len() as u64
    }

    /// Path of file `i` under `dir`.
    pub fn path(&self, dir: &Path, i: usize) -> PathBuf {
        match &self.files[i].0 {
            Some(p) => dir.join(&self.name).join(p),
            None => dir.join(&self.name),
        }
    }

    /// Write the content where the torrent expects it.
    pub fn write_data(&self, dir: &Path) {
        for i in 0..self.files.len() {
            let path = self.path(dir, i);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, &self.files[i].1).unwrap();
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let data = self.data();
        let mut pieces = Vec::new();
        for chunk in data.chunks(self.piece_length as usize) {
            let mut hasher = sha1_smol::Sha1::new();
            hasher.update(chunk);
            pieces.extend(hasher.digest().bytes());
        }

        let mut info = vec![
            ("name", bytes(&self.name)),
            ("piece length", Value::Integer(self.piece_length as i64)),
            ("pieces", bytes(&pieces)),
        ];
        if self.files[0].0.is_none() {
            info.push(("length", Value::Integer(data.len() as i64)));
        } else {
            let files = self
                .files
                .iter()
                .map(|(path, d)| {
                    let path = path
                        .as_deref()
                        .unwrap_or_default()
                        .split('/')
                        .map(bytes)
                        .collect();
                    dict(vec![
                        ("length", Value::Integer(d.len() as i64)),
                        ("path", Value::List(path)),
                    ])
                })
                .collect();
            info.push(("files", Value::List(files)));
        }

        let mut meta = vec![("info", dict(info))];
        if let Some(first) = self.trackers.first().and_then(|t| t.first()) {
            meta.push(("announce", bytes(first)));
        }
        let tiers = self
            .trackers
            .iter()
            .map(|tier| Value::List(tier.iter().map(bytes).collect()))
            .collect();
        meta.push(("announce-list", Value::List(tiers)));

        dict(meta).to_bencode().unwrap()
    }

    pub fn info(&self) -> Info {
        Info::parse(&self.to_bytes(), None).unwrap()
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info().info_hash
    }
}

/// Deterministic bytes that differ between files.
fn content(seed: &str, len: usize) -> Vec<u8> {
    let seed = seed.bytes().fold(7u8, |a, b| a.wrapping_mul(31).wrapping_add(b));
    (0..len).map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed)).collect()
}

fn bytes(s: impl AsRef<[u8]>) -> Value<'static> {
    Value::Bytes(Cow::Owned(s.as_ref().to_vec()))
}

fn dict(pairs: Vec<(&'static str, Value<'static>)>) -> Value<'static> {
    Value::Dict(pairs.into_iter().map(|(k, v)| (Cow::Borrowed(k.as_bytes()), v)).collect())
}

#[derive(Debug)]
pub struct RecordingPeers {
    pub log: Log,
    pub stats: Mutex<PeerManagerStats>,
    pub available: Mutex<Option<Bitfield>>,
    pub pex: Mutex<Vec<(PeerSource, Pex)>>,
}

impl RecordingPeers {
    pub fn new(log: Log) -> Self {
        Self {
            log,
            stats: Mutex::default(),
            available: Mutex::default(),
            pex: Mutex::default(),
        }
    }
}

impl PeerManager for RecordingPeers {
    fn add_torrent(&self, id: TorrentId, _info_hash: InfoHash) {
        self.log.lock().push(format!("peers.add {id}"));
    }

    fn remove_torrent(&self, id: TorrentId) {
        self.log.lock().push(format!("peers.remove {id}"));
    }

    fn start_torrent(&self, id: TorrentId) {
        self.log.lock().push(format!("peers.start {id}"));
    }

    fn stop_torrent(&self, id: TorrentId) {
        self.log.lock().push(format!("peers.stop {id}"));
    }

    fn torrent_stats(&self, _id: TorrentId) -> PeerManagerStats {
        self.stats.lock().clone()
    }

    fn add_pex(&self, _id: TorrentId, from: PeerSource, pex: &Pex) {
        self.pex.lock().push((from, *pex));
    }

    fn peer_stats(&self, _id: TorrentId) -> Vec<PeerStat> {
        Vec::new()
    }

    fn web_speeds(&self, _id: TorrentId) -> Vec<f64> {
        Vec::new()
    }

    fn availability(&self, _id: TorrentId, size: usize) -> Vec<i8> {
        vec![1; size]
    }

    fn available_pieces(&self, _id: TorrentId) -> Option<Bitfield> {
        self.available.lock().clone()
    }
}

#[derive(Debug)]
pub struct RecordingTrackers {
    pub log: Log,
    pub subscriptions: Mutex<Vec<TrackerSubscription>>,
}

impl TrackerFactory for RecordingTrackers {
    fn new_tracker(&self, info: &Info, events: TrackerSubscription) -> Box<dyn Tracker> {
        self.subscriptions.lock().push(events);
        Box::new(RecordingTracker {
            log: self.log.clone(),
            announce: info.trackers.first().map(|t| t.announce.clone()),
            running: false,
        })
    }
}

#[derive(Debug)]
struct RecordingTracker {
    log: Log,
    announce: Option<String>,
    running: bool,
}

impl Tracker for RecordingTracker {
    fn start(&mut self) {
        self.running = true;
        self.log.lock().push("tracker.start".into());
    }

    fn stop(&mut self) {
        self.running = false;
        self.log.lock().push("tracker.stop".into());
    }

    fn completed(&mut self) {
        self.log.lock().push("tracker.completed".into());
    }

    fn manual_announce(&mut self) {
        self.log.lock().push("tracker.manual_announce".into());
    }

    fn can_manual_announce(&self) -> bool {
        self.running
    }

    fn change_my_port(&mut self) {}

    fn stats(&self) -> TrackerStats {
        TrackerStats { announce_url: self.announce.clone(), ..Default::default() }
    }
}

impl Drop for RecordingTracker {
    fn drop(&mut self) {
        self.log.lock().push("tracker.drop".into());
    }
}

pub struct Setup {
    pub session: Session,
    pub config: ResolvedConfig,
    pub log: Log,
    pub peers: Arc<RecordingPeers>,
    pub trackers: Arc<RecordingTrackers>,
}

impl Setup {
    pub fn download_dir(&self) -> &Path {
        &self.config.download_dir
    }

    /// A ctor for `file`, as if it was opened from disk.
    pub fn ctor(&self, file: &TorrentFile) -> Ctor {
        let mut ctor = Ctor::new(&self.session);
        ctor.set_metainfo(file.to_bytes());
        ctor
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Wait until `tor` was handed to the peer manager `times` times, and
    /// the event thread is idle again.
    pub fn wait_started(&self, tor: &Torrent, times: usize) {
        let entry = format!("peers.start {}", tor.id());
        wait_until(&entry, || self.log.lock().iter().filter(|l| **l == entry).count() >= times);
        self.session.flush().unwrap();
    }
}

/// A session living in `root`, keeping its resume state there.
pub fn setup_in(root: &Path) -> Setup {
    init_tracing();
    let config = ResolvedConfig::in_dir(root);
    fs::create_dir_all(&config.download_dir).unwrap();

    let log = Log::default();
    let peers = Arc::new(RecordingPeers::new(log.clone()));
    let trackers = Arc::new(RecordingTrackers {
        log: log.clone(),
        subscriptions: Mutex::default(),
    });
    let collaborators = Collaborators {
        peers: peers.clone(),
        trackers: trackers.clone(),
        resume: Arc::new(TomlResumeStore::new(&config.resume_dir)),
    };

    let session = Session::new(config.clone(), collaborators).unwrap();
    Setup { session, config, log, peers, trackers }
}

pub fn setup() -> (TempDir, Setup) {
    let dir = tempfile::tempdir().unwrap();
    let setup = setup_in(dir.path());
    (dir, setup)
}
