//! A bounded pool of open files shared by every torrent of a session, and
//! the socket budget that competes with it for file descriptors.
//!
//! Checking out a file that someone else holds, or checking out anything
//! while every slot is busy, blocks the caller until a file is returned.
use std::{
    fs::{self, File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Error;

/// How often a file that is being written to is flushed to disk.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(15);

/// File descriptors kept aside for everything that is not a peer socket.
pub const NOFILE_BUFFER: usize = 512;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preallocation {
    None,
    #[default]
    Sparse,
    Full,
}

#[derive(Debug)]
struct Slot {
    filename: Option<PathBuf>,
    /// `None` while the file is checked out, or when the slot is empty.
    file: Option<File>,
    is_checked_out: bool,
    is_writable: bool,
    close_pending: bool,
    last_used: Instant,
    sync_at: Instant,
}

impl Slot {
    fn empty() -> Self {
        let now = Instant::now();
        Self {
            filename: None,
            file: None,
            is_checked_out: false,
            is_writable: false,
            close_pending: false,
            last_used: now,
            sync_at: now,
        }
    }

    fn close(&mut self) {
        if let Some(name) = &self.filename {
            debug!("closing {name:?}");
        }
        *self = Self::empty();
    }
}

#[derive(Debug)]
struct Pool {
    slots: Vec<Slot>,
    socket_count: usize,
    socket_limit: usize,
}

#[derive(Debug)]
pub struct FdCache {
    pool: Mutex<Pool>,
    returned: Condvar,
}

/// A file checked out of the cache, it goes back when dropped.
#[derive(Debug)]
pub struct FileLease<'a> {
    cache: &'a FdCache,
    slot: usize,
    file: Option<File>,
}

impl Deref for FileLease<'_> {
    type Target = File;

    fn deref(&self) -> &Self::Target {
        self.file.as_ref().expect("the file is only taken on drop")
    }
}

impl DerefMut for FileLease<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.file.as_mut().expect("the file is only taken on drop")
    }
}

impl Drop for FileLease<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            self.cache.release(self.slot, file);
        }
    }
}

impl FdCache {
    /// `open_file_limit` is the number of file slots, `socket_limit` the
    /// number of peer sockets we would like to have, it is clamped against
    /// what the OS allows us.
    pub fn new(open_file_limit: usize, socket_limit: usize) -> Self {
        let socket_limit = clamp_socket_limit(socket_limit);
        debug!("{open_file_limit} file slots, {socket_limit} sockets");
        Self {
            pool: Mutex::new(Pool {
                slots: (0..open_file_limit.max(1)).map(|_| Slot::empty()).collect(),
                socket_count: 0,
                socket_limit,
            }),
            returned: Condvar::new(),
        }
    }

    /// Open (or reuse) `folder/name`.
    ///
    /// Fails when `folder` doesn't exist, the parent directories of `name`
    /// are created when writing.
    pub fn checkout(
        &self,
        folder: &Path,
        name: &str,
        write: bool,
        preallocation: Preallocation,
        desired_size: u64,
    ) -> Result<FileLease<'_>, Error> {
        let path = folder.join(name);
        let mut pool = self.pool.lock();

        let winner = loop {
            if let Some(i) = pool
                .slots
                .iter()
                .position(|s| s.filename.as_deref() == Some(path.as_path()))
            {
                let slot = &mut pool.slots[i];
                if slot.is_checked_out {
                    debug!("{path:?} is checked out, waiting");
                    self.returned.wait(&mut pool);
                    continue;
                }
                if write && !slot.is_writable {
                    debug!("{path:?} is open read-only, reopening");
                    slot.close();
                    break i;
                }
                slot.is_checked_out = true;
                slot.last_used = Instant::now();
                return Ok(FileLease { cache: self, slot: i, file: slot.file.take() });
            }

            if let Some(i) = pool.slots.iter().position(|s| s.filename.is_none()) {
                break i;
            }

            let lru = pool
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| !s.is_checked_out)
                .min_by_key(|(_, s)| s.last_used)
                .map(|(i, _)| i);

            if let Some(i) = lru {
                debug!("evicting {:?}", pool.slots[i].filename);
                pool.slots[i].close();
                break i;
            }

            debug!("every file is checked out, waiting");
            self.returned.wait(&mut pool);
        };

        let file = open_file(folder, &path, write, preallocation, desired_size)?;
        let now = Instant::now();
        pool.slots[winner] = Slot {
            filename: Some(path),
            file: None,
            is_checked_out: true,
            is_writable: write,
            close_pending: false,
            last_used: now,
            sync_at: now + SYNC_INTERVAL,
        };

        Ok(FileLease { cache: self, slot: winner, file: Some(file) })
    }

    fn release(&self, slot: usize, file: File) {
        let mut pool = self.pool.lock();
        let s = &mut pool.slots[slot];
        s.is_checked_out = false;
        s.file = Some(file);

        if s.close_pending {
            s.close();
        } else if Instant::now() >= s.sync_at {
            if let Some(file) = &s.file {
                if let Err(e) = file.sync_all() {
                    warn!("could not sync {:?}: {e}", s.filename);
                }
            }
            s.sync_at = Instant::now() + SYNC_INTERVAL;
        }

        self.returned.notify_all();
    }

    /// Close `path` now if nobody is using it, or as soon as it is
    /// returned otherwise.
    pub fn close_by_name(&self, path: &Path) {
        let mut pool = self.pool.lock();
        if let Some(slot) =
            pool.slots.iter_mut().find(|s| s.filename.as_deref() == Some(path))
        {
            if slot.is_checked_out {
                debug!("{path:?} is checked out, closing on return");
                slot.close_pending = true;
            } else {
                slot.close();
            }
        }
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.pool.lock().slots.iter().any(|s| s.filename.as_deref() == Some(path))
    }

    pub fn open_file_count(&self) -> usize {
        self.pool.lock().slots.iter().filter(|s| s.filename.is_some()).count()
    }

    fn reserve_socket(&self) -> Result<(), Error> {
        let mut pool = self.pool.lock();
        if pool.socket_count >= pool.socket_limit {
            return Err(Error::SocketLimit(pool.socket_limit));
        }
        pool.socket_count += 1;
        Ok(())
    }

    fn free_socket(&self) {
        let mut pool = self.pool.lock();
        pool.socket_count = pool.socket_count.saturating_sub(1);
    }

    /// Connect to `addr`, counting the socket against the budget.
    pub fn socket_create(&self, addr: SocketAddr) -> Result<TcpStream, Error> {
        self.reserve_socket()?;
        TcpStream::connect(addr).map_err(|e| {
            self.free_socket();
            e.into()
        })
    }

    /// Accept an incoming connection, counting it against the budget.
    pub fn socket_accept(
        &self,
        listener: &TcpListener,
    ) -> Result<(TcpStream, SocketAddr), Error> {
        self.reserve_socket()?;
        listener.accept().map_err(|e| {
            self.free_socket();
            e.into()
        })
    }

    pub fn socket_close(&self, socket: TcpStream) {
        drop(socket);
        self.free_socket();
    }

    pub fn socket_count(&self) -> usize {
        self.pool.lock().socket_count
    }

    /// Change the socket budget, clamped to what the open files limit
    /// allows.
    pub fn set_peer_limit(&self, limit: usize) {
        let limit = clamp_socket_limit(limit);
        self.pool.lock().socket_limit = limit;
    }

    pub fn peer_limit(&self) -> usize {
        self.pool.lock().socket_limit
    }
}

fn open_file(
    folder: &Path,
    path: &Path,
    write: bool,
    preallocation: Preallocation,
    desired_size: u64,
) -> Result<File, Error> {
    if !folder.is_dir() {
        return Err(Error::FolderNotFound(folder.to_path_buf()));
    }

    if write {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
    }

    let existed = path.is_file();

    let mut file = OpenOptions::new()
        .read(true)
        .write(write)
        .create(write)
        .truncate(false)
        .open(path)?;

    if write && !existed && desired_size > 0 {
        match preallocation {
            Preallocation::None => {}
            Preallocation::Sparse => {
                file.seek(SeekFrom::Start(desired_size - 1))?;
                file.write_all(&[0])?;
            }
            Preallocation::Full => {
                let zeros = vec![0u8; 64 * 1024];
                let mut left = desired_size;
                while left > 0 {
                    let n = left.min(zeros.len() as u64) as usize;
                    file.write_all(&zeros[..n])?;
                    left -= n as u64;
                }
            }
        }
        file.rewind()?;
    }

    Ok(file)
}

#[cfg(unix)]
fn clamp_socket_limit(wanted: usize) -> usize {
    let mut rlim = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    // SAFETY: rlim is a valid, exclusively borrowed rlimit.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } != 0 {
        return wanted;
    }
    let want = wanted.saturating_add(NOFILE_BUFFER) as libc::rlim_t;
    if want > rlim.rlim_cur {
        // never lowered, other handles may already be open
        rlim.rlim_cur = rlim.rlim_max.min(want);
        // SAFETY: same as above.
        if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) } != 0 {
            warn!("could not raise the open files limit to {want}");
            // SAFETY: same as above.
            unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
        }
    }
    let ceiling = usize::try_from(rlim.rlim_cur).unwrap_or(usize::MAX);
    wanted.min(ceiling.saturating_sub(NOFILE_BUFFER))
}

#[cfg(not(unix))]
fn clamp_socket_limit(wanted: usize) -> usize {
    wanted
}
