//! Saving and restoring a torrent across restarts, and our copy of its
//! metainfo.
use std::{borrow::Cow, fs};

use bendy::{decoding::FromBencode, encoding::ToBencode, value::Value};
use tracing::{debug, info, warn};

use super::{State, Torrent};
use crate::{
    bandwidth::Direction,
    bitfield::{Bitfield, TrBitfield},
    ctor::{Ctor, CtorMode},
    error::Error,
    metainfo::{Info, TrackerInfo},
    resume::{Progress, RatioLimit, ResumeData, ResumeFields, SpeedLimits},
};

impl State {
    pub(super) fn resume_data(&self) -> ResumeData {
        ResumeData {
            corrupt: Some(self.corrupt_prev + self.corrupt_cur),
            downloaded: Some(self.downloaded_ever()),
            uploaded: Some(self.uploaded_ever()),
            added_date: Some(self.added_date),
            done_date: Some(self.done_date),
            activity_date: Some(self.activity_date),
            download_dir: Some(self.download_dir.clone()),
            paused: Some(!self.is_running),
            peer_limit: Some(self.peer_limit),
            priorities: Some(self.info.files.iter().map(|f| f.priority).collect()),
            dnd: Some(self.info.files.iter().map(|f| f.dnd).collect()),
            speed_limit: Some(SpeedLimits {
                up: self.bandwidth.limit(Direction::Up),
                down: self.bandwidth.limit(Direction::Down),
            }),
            ratio_limit: Some(RatioLimit { mode: self.ratio_mode, limit: self.desired_ratio }),
            progress: Some(Progress {
                blocks: self.completion.block_bitfield().as_raw_slice().to_vec(),
                checked: self.checked.as_raw_slice().to_vec(),
                mtimes: self.mtimes(),
            }),
        }
    }

    /// Apply the `fields` of `saved`. Forced ctor values win over saved
    /// ones, and fallback ctor values fill whatever is still missing.
    /// Returns the fields that were set.
    pub(super) fn apply_resume(
        &mut self,
        saved: Option<ResumeData>,
        fields: ResumeFields,
        ctor: Option<&Ctor>,
    ) -> ResumeFields {
        let mut loaded = ResumeFields::empty();

        if let Some(ctor) = ctor {
            loaded |= self.apply_ctor(ctor, CtorMode::Force, fields);
        }

        if let Some(data) = saved {
            loaded |= self.apply_saved(data, fields & !loaded);
        }

        if let Some(ctor) = ctor {
            loaded |= self.apply_ctor(ctor, CtorMode::Fallback, fields & !loaded);
        }

        loaded
    }

    fn apply_ctor(&mut self, ctor: &Ctor, mode: CtorMode, fields: ResumeFields) -> ResumeFields {
        let mut loaded = ResumeFields::empty();

        if fields.contains(ResumeFields::RUN) {
            if let Some(paused) = ctor.paused(mode) {
                self.is_running = !paused;
                loaded |= ResumeFields::RUN;
            }
        }
        if fields.contains(ResumeFields::PEER_LIMIT) {
            if let Some(limit) = ctor.peer_limit(mode) {
                self.peer_limit = limit;
                loaded |= ResumeFields::PEER_LIMIT;
            }
        }
        if fields.contains(ResumeFields::DOWNLOAD_DIR) {
            if let Some(dir) = ctor.download_dir(mode) {
                self.download_dir = dir.to_owned();
                loaded |= ResumeFields::DOWNLOAD_DIR;
            }
        }

        loaded
    }

    fn apply_saved(&mut self, data: ResumeData, fields: ResumeFields) -> ResumeFields {
        let mut loaded = ResumeFields::empty();
        let present = data.fields();
        let wants = |f: ResumeFields| fields.contains(f) && present.contains(f);

        if wants(ResumeFields::TOTALS) {
            self.corrupt_prev = data.corrupt.unwrap_or(0);
            self.downloaded_prev = data.downloaded.unwrap_or(0);
            self.uploaded_prev = data.uploaded.unwrap_or(0);
            self.corrupt_cur = 0;
            self.downloaded_cur = 0;
            self.uploaded_cur = 0;
            loaded |= ResumeFields::TOTALS;
        }

        if wants(ResumeFields::DATES) {
            if let Some(d) = data.added_date {
                self.added_date = d;
            }
            self.done_date = data.done_date.unwrap_or(self.done_date);
            self.activity_date = data.activity_date.unwrap_or(self.activity_date);
            loaded |= ResumeFields::DATES;
        }

        if wants(ResumeFields::DOWNLOAD_DIR) {
            if let Some(dir) = &data.download_dir {
                self.download_dir = dir.clone();
                loaded |= ResumeFields::DOWNLOAD_DIR;
            }
        }

        if wants(ResumeFields::RUN) {
            if let Some(paused) = data.paused {
                self.is_running = !paused;
                loaded |= ResumeFields::RUN;
            }
        }

        if wants(ResumeFields::PEER_LIMIT) {
            if let Some(limit) = data.peer_limit {
                self.peer_limit = limit;
                loaded |= ResumeFields::PEER_LIMIT;
            }
        }

        let file_count = self.info.file_count();

        if wants(ResumeFields::PRIORITY) {
            match &data.priorities {
                Some(p) if p.len() == file_count => {
                    self.apply_priorities(p);
                    loaded |= ResumeFields::PRIORITY;
                }
                _ => debug!("ignoring saved priorities, the file count differs"),
            }
        }

        if wants(ResumeFields::DND) {
            match &data.dnd {
                Some(dnd) if dnd.len() == file_count => {
                    self.apply_dnd(dnd);
                    loaded |= ResumeFields::DND;
                }
                _ => debug!("ignoring saved dnd flags, the file count differs"),
            }
        }

        if wants(ResumeFields::SPEEDLIMIT) {
            if let Some(limits) = data.speed_limit {
                *self.bandwidth.limit_mut(Direction::Up) = limits.up;
                *self.bandwidth.limit_mut(Direction::Down) = limits.down;
                loaded |= ResumeFields::SPEEDLIMIT;
            }
        }

        if wants(ResumeFields::RATIOLIMIT) {
            if let Some(ratio) = data.ratio_limit {
                self.ratio_mode = ratio.mode;
                self.desired_ratio = ratio.limit;
                loaded |= ResumeFields::RATIOLIMIT;
            }
        }

        if wants(ResumeFields::PROGRESS) {
            if let Some(progress) = data.progress {
                if self.apply_progress(progress) {
                    loaded |= ResumeFields::PROGRESS;
                }
            }
        }

        loaded
    }

    /// Restore the blocks we have and the pieces we checked. Files that
    /// changed on disk since the progress was saved must be checked again.
    fn apply_progress(&mut self, progress: Progress) -> bool {
        let g = *self.completion.geometry();
        let blocks = Bitfield::new_and_resize(progress.blocks, g.block_count);
        if let Err(e) = self.completion.set_block_bitfield(&blocks) {
            warn!("ignoring saved progress: {e}");
            return false;
        }

        self.checked = Bitfield::new_and_resize(progress.checked, g.piece_count);

        let mtimes = self.mtimes();
        if progress.mtimes.len() != mtimes.len() {
            debug!("file count changed, every piece will be checked");
            self.uncheck();
            return true;
        }

        for (i, (saved, now)) in progress.mtimes.iter().zip(&mtimes).enumerate() {
            if saved != now {
                let f = &self.info.files[i];
                debug!("{} changed on disk, it will be checked", f.name);
                let (first, last) = (f.first_piece, f.last_piece);
                let _ = self.checked.rem_range(first, last + 1);
            }
        }

        true
    }
}

impl Torrent {
    pub fn save_resume(&self) {
        let data = self.state.lock().resume_data();
        if let Err(e) = self.session.resume.save(&self.hash_string(), &data) {
            warn!(name = %self.name, "could not save resume state: {e}");
        }
    }

    /// Load the `fields` of the saved resume state, with `ctor`'s values
    /// on top. Returns the fields that were set.
    pub fn load_resume(&self, fields: ResumeFields, ctor: Option<&Ctor>) -> ResumeFields {
        let saved = self.session.resume.load(&self.hash_string());
        self.state.lock().apply_resume(saved, fields, ctor)
    }

    pub(crate) fn remove_resume(&self) {
        self.session.resume.remove(&self.hash_string());
    }

    /// Where our copy of the metainfo is kept.
    pub fn torrent_file(&self) -> &std::path::Path {
        &self.torrent_file
    }

    pub(crate) fn save_metainfo(&self, bytes: &[u8]) -> Result<(), Error> {
        if let Some(dir) = self.torrent_file.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.torrent_file, bytes)?;
        debug!("saved metainfo to {:?}", self.torrent_file);
        Ok(())
    }

    pub(crate) fn remove_saved_metainfo(&self) {
        if let Err(e) = fs::remove_file(&self.torrent_file) {
            debug!("could not remove {:?}: {e}", self.torrent_file);
        }
    }

    /// Replace the trackers, in our metainfo copy too. Nothing changes if
    /// the result isn't a valid metainfo.
    #[tracing::instrument(skip_all, name = "torrent::set_announce_list", fields(name = %self.name))]
    pub fn set_announce_list(&self, trackers: &[TrackerInfo]) -> Result<(), Error> {
        let Some(first) = trackers.first() else { return Err(Error::TrackerListInvalid) };

        let bytes = fs::read(&self.torrent_file)?;
        let mut meta = Value::from_bencode(&bytes)?;
        let Value::Dict(dict) = &mut meta else { return Err(Error::TrackerListInvalid) };

        let mut tiers: Vec<Value> = Vec::new();
        let mut current: Vec<Value> = Vec::new();
        let mut tier = first.tier;
        for t in trackers {
            if t.tier != tier && !current.is_empty() {
                tiers.push(Value::List(std::mem::take(&mut current)));
                tier = t.tier;
            }
            current.push(Value::Bytes(Cow::Owned(t.announce.clone().into_bytes())));
        }
        tiers.push(Value::List(current));

        dict.insert(
            Cow::Borrowed(&b"announce"[..]),
            Value::Bytes(Cow::Owned(first.announce.clone().into_bytes())),
        );
        dict.insert(Cow::Borrowed(&b"announce-list"[..]), Value::List(tiers));

        let out = meta.to_bencode()?;
        let parsed = Info::parse(&out, Some(&self.name)).map_err(|e| {
            debug!("rejecting the new tracker list: {e}");
            Error::TrackerListInvalid
        })?;

        fs::write(&self.torrent_file, &out)?;
        self.state.lock().info.trackers = parsed.trackers;
        info!("tracker list updated");
        Ok(())
    }
}
