//! Files of a torrent: priorities, do-not-download wishes, progress and the
//! data on disk.
use std::{
    fs,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use hashbrown::HashSet;
use tracing::{debug, info};

use super::{FileStat, State, Torrent};
use crate::{
    bitfield::TrBitfield,
    error::Error,
    metainfo::{File, Info, Priority},
    peer::PeerStat,
    utils::mtime_secs,
};

/// A piece's priority is the highest of the files touching it. Files we
/// care about get their first and last pieces early, so that previews
/// work.
fn piece_priority(info: &Info, piece: usize, file_hint: usize) -> Priority {
    let touches = |f: &File| f.first_piece <= piece && piece <= f.last_piece;
    let mut priority = Priority::Low;

    // files are sorted by offset, every file touching `piece` is next to
    // the hint
    let before = info.files[..file_hint].iter().rev().take_while(|f| touches(f));
    let after = info.files[file_hint..].iter().take_while(|f| touches(f));

    for file in before.chain(after) {
        priority = priority.max(file.priority);
        if file.priority >= Priority::Normal
            && (piece == file.first_piece || piece == file.last_piece)
        {
            priority = Priority::High;
        }
    }

    priority
}

pub(super) fn init_piece_priorities(info: &mut Info) {
    let mut file = 0;
    for piece in 0..info.piece_count() {
        while info.files[file].last_piece < piece {
            file += 1;
        }
        let priority = piece_priority(info, piece, file);
        info.pieces[piece].priority = priority;
    }
}

impl State {
    fn init_file_priority(&mut self, index: usize, priority: Priority) {
        self.info.files[index].priority = priority;
        let (first, last) = (self.info.files[index].first_piece, self.info.files[index].last_piece);
        for piece in first..=last {
            let p = piece_priority(&self.info, piece, index);
            self.info.pieces[piece].priority = p;
        }
    }

    /// A piece shared with other files only becomes do-not-download when
    /// every file touching it is.
    pub(super) fn set_file_dnd(&mut self, index: usize, do_download: bool) {
        let dnd = !do_download;
        let files = &mut self.info.files;
        files[index].dnd = dnd;

        let first = files[index].first_piece;
        let last = files[index].last_piece;
        let touches = |f: &File, piece: usize| f.first_piece <= piece && piece <= f.last_piece;

        let first_dnd =
            dnd && files[..index].iter().rev().take_while(|f| touches(f, first)).all(|f| f.dnd);
        let last_dnd = dnd
            && files[index + 1..].iter().take_while(|f| touches(f, last)).all(|f| f.dnd);

        let pieces = &mut self.info.pieces;
        if first == last {
            pieces[first].dnd = first_dnd && last_dnd;
        } else {
            pieces[first].dnd = first_dnd;
            pieces[last].dnd = last_dnd;
            for piece in &mut pieces[first + 1..last] {
                piece.dnd = dnd;
            }
        }
    }

    pub(super) fn apply_priorities(&mut self, priorities: &[Priority]) {
        for (i, p) in priorities.iter().enumerate() {
            self.init_file_priority(i, *p);
        }
    }

    pub(super) fn apply_dnd(&mut self, dnd: &[bool]) {
        for (i, dnd) in dnd.iter().enumerate() {
            self.set_file_dnd(i, !dnd);
        }
        self.completion.invalidate_dnd();
    }

    fn check_file_indices(&self, files: &[usize]) -> Result<(), Error> {
        match files.iter().find(|i| **i >= self.info.file_count()) {
            Some(i) => Err(Error::FileIndexInvalid(*i)),
            None => Ok(()),
        }
    }

    /// Bytes of `index` that are in blocks we have.
    fn file_bytes_completed(&self, index: usize) -> u64 {
        let file = &self.info.files[index];
        if file.length == 0 {
            return 0;
        }

        let g = self.completion.geometry();
        let block_size = g.block_size;
        let first_block = (file.offset / block_size) as usize;
        let first_block_offset = file.offset % block_size;
        let last_offset = file.offset + file.length - 1;
        let last_block = (last_offset / block_size) as usize;
        let last_block_offset = last_offset % block_size;
        let has = |b: usize| self.completion.block_is_complete(b);

        if first_block == last_block {
            return if has(first_block) { file.length } else { 0 };
        }

        let mut have = 0;
        if has(first_block) {
            have += block_size - first_block_offset;
        }
        have += (first_block + 1..last_block).filter(|b| has(*b)).count() as u64 * block_size;
        if has(last_block) {
            have += last_block_offset + 1;
        }
        have
    }

    pub(super) fn mtimes(&self) -> Vec<i64> {
        self.info
            .files
            .iter()
            .map(|f| {
                fs::metadata(self.download_dir.join(&f.name))
                    .map(|m| mtime_secs(&m))
                    .unwrap_or(0)
            })
            .collect()
    }

    /// Forget every hash check.
    pub(super) fn uncheck(&mut self) {
        self.checked.fill(false);
    }
}

impl Torrent {
    /// Set the priority of `files` and recompute their pieces' priorities.
    pub fn set_file_priorities(&self, files: &[usize], priority: Priority) -> Result<(), Error> {
        {
            let mut s = self.state.lock();
            s.check_file_indices(files)?;
            for file in files {
                s.init_file_priority(*file, priority);
            }
        }
        self.save_resume();
        Ok(())
    }

    pub fn file_priority(&self, file: usize) -> Option<Priority> {
        self.state.lock().info.files.get(file).map(|f| f.priority)
    }

    pub fn file_priorities(&self) -> Vec<Priority> {
        self.state.lock().info.files.iter().map(|f| f.priority).collect()
    }

    /// Like [`Self::set_file_dls`], without saving the resume state.
    pub fn init_file_dls(self: &Arc<Self>, files: &[usize], do_download: bool) -> Result<(), Error> {
        {
            let mut s = self.state.lock();
            s.check_file_indices(files)?;
            for file in files {
                s.set_file_dnd(*file, do_download);
            }
            s.completion.invalidate_dnd();
        }
        self.check_seed_ratio();
        Ok(())
    }

    /// Mark `files` as wanted or not.
    pub fn set_file_dls(self: &Arc<Self>, files: &[usize], do_download: bool) -> Result<(), Error> {
        self.init_file_dls(files, do_download)?;
        self.save_resume();
        Ok(())
    }

    pub fn file_dl(&self, file: usize) -> Option<bool> {
        self.state.lock().info.files.get(file).map(|f| !f.dnd)
    }

    /// Progress of every file.
    pub fn files(&self) -> Vec<FileStat> {
        let s = self.state.lock();
        (0..s.info.file_count())
            .map(|i| {
                let bytes_completed = s.file_bytes_completed(i);
                let length = s.info.files[i].length;
                let progress =
                    if length == 0 { 1.0 } else { bytes_completed as f64 / length as f64 };
                FileStat { bytes_completed, progress }
            })
            .collect()
    }

    pub fn file_bytes_completed(&self, file: usize) -> Option<u64> {
        let s = self.state.lock();
        (file < s.info.file_count()).then(|| s.file_bytes_completed(file))
    }

    pub fn piece_checked(&self, piece: usize) -> bool {
        self.state.lock().checked.has(piece)
    }

    pub fn set_piece_checked(&self, piece: usize, checked: bool) {
        let mut s = self.state.lock();
        if piece < s.checked.len() {
            s.checked.set(piece, checked);
        }
    }

    /// Whether every piece of `file` was checked.
    pub fn file_checked(&self, file: usize) -> bool {
        let s = self.state.lock();
        let Some(f) = s.info.files.get(file) else { return false };
        (f.first_piece..=f.last_piece).all(|p| s.checked.has(p))
    }

    pub fn set_file_checked(&self, file: usize, checked: bool) {
        let mut s = self.state.lock();
        let Some(f) = s.info.files.get(file) else { return };
        let (first, last) = (f.first_piece, f.last_piece);
        let _ = if checked {
            s.checked.add_range(first, last + 1)
        } else {
            s.checked.rem_range(first, last + 1)
        };
    }

    pub fn uncheck(&self) {
        self.state.lock().uncheck();
    }

    pub fn count_unchecked(&self) -> usize {
        let s = self.state.lock();
        s.checked.len() - s.checked.count_true_bits()
    }

    /// Modification time of every file, 0 for the missing ones.
    pub fn mtimes(&self) -> Vec<i64> {
        self.state.lock().mtimes()
    }

    /// Bytes still to be written before every wanted file has its full
    /// length on disk.
    pub fn bytes_left_to_allocate(&self) -> u64 {
        let s = self.state.lock();
        s.info
            .files
            .iter()
            .filter(|f| !f.dnd)
            .map(|f| {
                let on_disk = fs::metadata(s.download_dir.join(&f.name))
                    .ok()
                    .filter(|m| m.is_file() && m.len() <= f.length)
                    .map(|m| m.len())
                    .unwrap_or(0);
                f.length - on_disk
            })
            .sum()
    }

    /// Fraction of each sampled piece that we have.
    pub fn amount_finished(&self, size: usize) -> Vec<f32> {
        self.state.lock().completion.amount_done(size)
    }

    pub fn availability(&self, size: usize) -> Vec<i8> {
        self.session.peers.availability(self.id, size)
    }

    pub fn peers(&self) -> Vec<PeerStat> {
        self.session.peers.peer_stats(self.id)
    }

    /// KiB/s of every web seed.
    pub fn web_speeds(&self) -> Vec<f64> {
        self.session.peers.web_speeds(self.id)
    }

    /// Delete the torrent's files, and the folders they leave empty.
    ///
    /// A folder holding anything that is not part of the torrent is kept,
    /// along with every folder above it.
    #[tracing::instrument(skip(self), name = "torrent::delete_local_data", fields(name = %self.name))]
    pub fn delete_local_data(&self) -> Result<(), Error> {
        self.close_local_files();

        let (dir, names, is_multifile) = {
            let s = self.state.lock();
            let names: Vec<String> = s.info.files.iter().map(|f| f.name.clone()).collect();
            (s.download_dir.clone(), names, s.info.is_multifile)
        };

        if !is_multifile {
            for name in &names {
                remove_file(&dir.join(name))?;
            }
            return Ok(());
        }

        let Some(top) = names.first().and_then(|n| n.split('/').next()) else { return Ok(()) };
        let root = dir.join(top);
        if !root.is_dir() {
            return Ok(());
        }

        let torrent_files: HashSet<PathBuf> = names.iter().map(|n| dir.join(n)).collect();
        let mut folders = vec![root.clone()];
        let mut dirty = HashSet::new();
        walk(&root, &root, &torrent_files, &mut folders, &mut dirty)?;

        let clean: Vec<&PathBuf> = folders.iter().filter(|f| !dirty.contains(*f)).collect();

        // whole folders first, parents come before their children
        for folder in &clean {
            if folder.exists() {
                debug!("removing {folder:?}");
                let _ = fs::remove_dir_all(folder);
            }
        }

        for file in &torrent_files {
            remove_file(file)?;
        }

        // then whatever is left empty, deepest first
        let mut leftover = clean;
        leftover.sort_by_key(|f| std::cmp::Reverse(f.components().count()));
        for folder in leftover {
            let _ = fs::remove_dir(folder);
        }

        info!("deleted local data");
        Ok(())
    }
}

fn remove_file(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Collect the folders under `folder`, marking as dirty the ones that
/// hold a non-empty file the torrent doesn't know about, and their
/// parents up to `root`. Dotfiles are ignored.
fn walk(
    root: &Path,
    folder: &Path,
    torrent_files: &HashSet<PathBuf>,
    folders: &mut Vec<PathBuf>,
    dirty: &mut HashSet<PathBuf>,
) -> Result<(), Error> {
    for entry in fs::read_dir(folder)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        let meta = entry.metadata()?;

        if meta.is_dir() {
            folders.push(path.clone());
            walk(root, &path, torrent_files, folders, dirty)?;
        } else if meta.is_file() && meta.len() > 0 && !torrent_files.contains(&path) {
            debug!("keeping the folders above {path:?}");
            for parent in path.ancestors().skip(1) {
                dirty.insert(parent.to_path_buf());
                if parent == root {
                    break;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::{tests::Fixture, Geometry};
    use bendy::encoding::ToBencode;

    fn info(files: &[(&str, u64)], piece_length: u64) -> Info {
        let bytes = Fixture::multi("t", files, piece_length).to_bencode().unwrap();
        let mut info = Info::parse(&bytes, None).unwrap();
        init_piece_priorities(&mut info);
        info
    }

    fn state(info: Info) -> State {
        let g = Geometry::new(info.total_size, info.piece_size).unwrap();
        State {
            checked: crate::bitfield::Bitfield::from_piece(g.piece_count),
            completion: crate::completion::Completion::new(g),
            completeness: Default::default(),
            info,
            download_dir: PathBuf::from("/nonexistent"),
            is_running: false,
            is_deleting: false,
            delete_local_data: false,
            is_freed: false,
            error: Default::default(),
            error_string: String::new(),
            bandwidth: Default::default(),
            ratio_mode: Default::default(),
            desired_ratio: 0.0,
            peer_limit: 0,
            added_date: 0,
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
        }
    }

    #[test]
    fn boundary_pieces_get_high_priority() {
        // pieces of 10: a = 0..25, b = 25..60
        let info = info(&[("a", 25), ("b", 35)], 10);
        let p: Vec<_> = info.pieces.iter().map(|p| p.priority).collect();
        use Priority::*;
        assert_eq!(p, [High, Normal, High, Normal, Normal, High]);
    }

    #[test]
    fn shared_piece_takes_the_highest_priority() {
        let mut s = state(info(&[("a", 25), ("b", 35)], 10));
        s.init_file_priority(0, Priority::Low);
        // piece 1 only belongs to a
        assert_eq!(s.info.pieces[1].priority, Priority::Low);
        assert_eq!(s.info.pieces[0].priority, Priority::Low);
        // piece 2 is shared with b, which is normal and starts there
        assert_eq!(s.info.pieces[2].priority, Priority::High);

        s.init_file_priority(1, Priority::Low);
        assert_eq!(s.info.pieces[2].priority, Priority::Low);
    }

    #[test]
    fn shared_piece_is_dnd_only_when_every_file_is() {
        let mut s = state(info(&[("a", 25), ("b", 35)], 10));

        s.set_file_dnd(0, false);
        assert!(s.info.files[0].dnd);
        assert!(s.info.pieces[0].dnd && s.info.pieces[1].dnd);
        assert!(!s.info.pieces[2].dnd, "piece 2 is still wanted by b");

        s.set_file_dnd(1, false);
        assert!(s.info.pieces.iter().all(|p| p.dnd));

        s.set_file_dnd(0, true);
        assert!(!s.info.pieces[0].dnd && !s.info.pieces[2].dnd);
        assert!(s.info.pieces[3].dnd);
    }

    #[test]
    fn first_file_can_be_dnd() {
        let mut s = state(info(&[("a", 5), ("b", 5), ("c", 20)], 10));
        // a and b share piece 0
        s.set_file_dnd(1, false);
        assert!(!s.info.pieces[0].dnd);
        s.set_file_dnd(0, false);
        assert!(s.info.pieces[0].dnd);
        assert!(!s.info.pieces[1].dnd);
    }

    #[test]
    fn bytes_completed_per_file() {
        // block size is the piece size when pieces are small
        let mut s = state(info(&[("a", 25), ("b", 35)], 10));
        s.completion.add_piece(0);
        s.completion.add_piece(2);
        // a has [0..10) and [20..25)
        assert_eq!(s.file_bytes_completed(0), 15);
        // b has [25..30)
        assert_eq!(s.file_bytes_completed(1), 5);

        for piece in 0..6 {
            s.completion.add_piece(piece);
        }
        assert_eq!(s.file_bytes_completed(0), 25);
        assert_eq!(s.file_bytes_completed(1), 35);
    }
}
