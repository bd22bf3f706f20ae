//! Background hash-checking of local data.
//!
//! One worker thread checks one torrent at a time, in the order they were
//! queued. The thread is spawned when something is queued and exits once
//! the queue is empty.
use std::{
    collections::VecDeque,
    fs,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::{inout, torrent::Torrent};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum VerifyState {
    #[default]
    None,
    /// Queued behind another torrent.
    Wait,
    /// Being checked right now.
    Now,
}

/// Called on the verify thread once a torrent was checked to the end.
pub type VerifyDone = Box<dyn FnOnce(&Arc<Torrent>) + Send>;

struct Node {
    tor: Arc<Torrent>,
    done: Option<VerifyDone>,
}

#[derive(Default)]
struct Queue {
    current: Option<Arc<Torrent>>,
    pending: VecDeque<Node>,
    has_worker: bool,
}

impl Queue {
    fn is_current(&self, tor: &Torrent) -> bool {
        self.current.as_ref().is_some_and(|c| c.id() == tor.id())
    }
}

pub struct Verifier {
    queue: Mutex<Queue>,
    /// Raised to abort the torrent being checked.
    stop_current: AtomicBool,
    /// Signalled every time the worker is done with a torrent.
    finished: Condvar,
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let q = self.queue.lock();
        f.debug_struct("Verifier")
            .field("current", &q.current.as_ref().map(|t| t.id()))
            .field("pending", &q.pending.len())
            .finish()
    }
}

impl Verifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(Queue::default()),
            stop_current: AtomicBool::new(false),
            finished: Condvar::new(),
        })
    }

    /// Queue `tor` for checking. A torrent without unchecked pieces is
    /// not queued, `done` runs right away instead.
    pub fn add(self: &Arc<Self>, tor: Arc<Torrent>, done: Option<VerifyDone>) {
        if tor.count_unchecked() == 0 {
            debug!(name = %tor.name(), "nothing to verify");
            if let Some(done) = done {
                done(&tor);
            }
            return;
        }

        let mut q = self.queue.lock();
        if q.pending.iter().any(|n| n.tor.id() == tor.id()) {
            debug!(name = %tor.name(), "already queued for verification");
            return;
        }

        info!(name = %tor.name(), "Queued for verification");
        q.pending.push_back(Node { tor, done });

        if !q.has_worker {
            let this = Arc::clone(self);
            match thread::Builder::new()
                .name("tessera-verify".into())
                .spawn(move || this.run())
            {
                Ok(_) => q.has_worker = true,
                Err(e) => error!("could not spawn the verify thread: {e}"),
            }
        }
    }

    /// Take `tor` out of the queue. If it is being checked right now, this
    /// blocks until the worker let go of it.
    pub fn remove(&self, tor: &Torrent) {
        let mut q = self.queue.lock();
        if q.is_current(tor) {
            debug!(name = %tor.name(), "aborting verification");
            self.stop_current.store(true, Ordering::SeqCst);
            while q.is_current(tor) {
                self.finished.wait(&mut q);
            }
        } else {
            q.pending.retain(|n| n.tor.id() != tor.id());
        }
    }

    pub fn state(&self, tor: &Torrent) -> VerifyState {
        let q = self.queue.lock();
        if q.is_current(tor) {
            VerifyState::Now
        } else if q.pending.iter().any(|n| n.tor.id() == tor.id()) {
            VerifyState::Wait
        } else {
            VerifyState::None
        }
    }

    pub fn in_progress(&self, tor: &Torrent) -> bool {
        self.state(tor) != VerifyState::None
    }

    /// Number of torrents being checked or waiting to be.
    pub fn len(&self) -> usize {
        let q = self.queue.lock();
        q.pending.len() + usize::from(q.current.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[tracing::instrument(skip(self), name = "verify::run")]
    fn run(self: Arc<Self>) {
        loop {
            let node = {
                let mut q = self.queue.lock();
                match q.pending.pop_front() {
                    Some(node) => {
                        q.current = Some(node.tor.clone());
                        node
                    }
                    None => {
                        q.has_worker = false;
                        debug!("verify queue is empty, exiting");
                        return;
                    }
                }
            };

            info!(name = %node.tor.name(), "Verifying torrent");
            let changed = verify_torrent(&node.tor, &self.stop_current);

            let aborted = {
                let mut q = self.queue.lock();
                q.current = None;
                let aborted = self.stop_current.swap(false, Ordering::SeqCst);
                self.finished.notify_all();
                aborted
            };

            if aborted {
                debug!(name = %node.tor.name(), "verification aborted");
                continue;
            }
            if changed {
                node.tor.save_resume();
            }
            if let Some(done) = node.done {
                done(&node.tor);
            }
        }
    }
}

fn verify_torrent(tor: &Torrent, stop: &AtomicBool) -> bool {
    let mut buf = Vec::with_capacity(tor.geometry().piece_size as usize);
    let mut changed = false;
    for file in 0..tor.file_count() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        changed |= check_file(tor, file, &mut buf, stop);
    }
    changed
}

/// Check every unchecked piece touching `file`, returns whether a piece
/// changed its completeness.
fn check_file(tor: &Torrent, file: usize, buf: &mut Vec<u8>, stop: &AtomicBool) -> bool {
    let Some((path, pieces)) = tor.file_location(file) else { return false };
    let no_file = !fs::metadata(&path).map(|m| m.is_file()).unwrap_or(false);
    if no_file {
        debug!(name = %tor.name(), "{path:?} is missing");
    }

    let mut changed = false;

    for piece in pieces {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        let was_complete = tor.piece_is_complete(piece);

        if no_file {
            tor.set_has_piece(piece, false);
            changed |= was_complete;
        } else if !tor.piece_checked(piece) {
            if inout::test_piece(tor, piece, buf) {
                tor.set_has_piece(piece, true);
                changed |= !was_complete;
            } else if was_complete {
                // pieces that were incomplete keep their blocks
                tor.set_has_piece(piece, false);
                changed = true;
            }
        }

        tor.set_piece_checked(piece, true);
    }

    changed
}
