use std::sync::Arc;

use super::{Activity, Eta, Stat, Torrent};
use crate::{
    bandwidth::Direction,
    bitfield::TrBitfield,
    completion::Completeness,
    tracker::TrackerStats,
    utils::{now_secs, Ratio},
    verify::VerifyState,
};

impl Torrent {
    pub fn activity(self: &Arc<Self>) -> Activity {
        self.recheck_completeness();

        match self.session.verifier.state(self) {
            VerifyState::Now => Activity::Check,
            VerifyState::Wait => Activity::CheckWait,
            VerifyState::None => {
                let s = self.state.lock();
                if !s.is_running {
                    Activity::Stopped
                } else if s.completeness == Completeness::Leech {
                    Activity::Download
                } else {
                    Activity::Seed
                }
            }
        }
    }

    fn tracker_stats(&self) -> TrackerStats {
        self.tracker.lock().as_ref().map(|t| t.stats()).unwrap_or_default()
    }

    /// A fresh snapshot of the torrent.
    pub fn stat(self: &Arc<Self>) -> Stat {
        let activity = self.activity();
        let tracker = self.tracker_stats();
        let mut peers = self.session.peers.torrent_stats(self.id);
        let now = now_secs();

        // asked before locking, the peer manager may need the torrent
        let available = if peers.peers_connected > 0 && peers.usable_seeds == 0 {
            self.session.peers.available_pieces(self.id)
        } else {
            None
        };

        let mut guard = self.state.lock();
        let seed_ratio = self.seed_ratio_of(&guard);
        let s = &mut *guard;

        peers.usable_seeds += s.info.webseeds.len();

        let raw_upload_speed = s.bandwidth.raw_speed(Direction::Up);
        let raw_download_speed = s.bandwidth.raw_speed(Direction::Down);
        let piece_upload_speed = s.bandwidth.piece_speed(Direction::Up);
        let piece_download_speed = s.bandwidth.piece_speed(Direction::Down);

        let percent_complete = s.completion.percent_complete();
        let percent_done = s.completion.percent_done(&s.info.pieces);
        let left_until_done = s.completion.left_until_done(&s.info.pieces);
        let size_when_done = s.completion.size_when_done(&s.info.pieces);
        let have_valid = s.completion.have_valid();
        let have_unchecked = s.completion.have_total() - have_valid;

        let recheck_progress = if activity == Activity::Check {
            let piece_count = self.geometry.piece_count;
            let unchecked = piece_count - s.checked.count_true_bits();
            1.0 - unchecked as f64 / piece_count as f64
        } else {
            0.0
        };

        let desired_available = if peers.usable_seeds > 0 {
            left_until_done
        } else if left_until_done == 0 || peers.peers_connected == 0 {
            0
        } else {
            let block_size = self.geometry.block_size;
            available
                .map(|pieces| {
                    s.info
                        .pieces
                        .iter()
                        .enumerate()
                        .filter(|(i, p)| !p.dnd && pieces.has(*i))
                        .map(|(i, _)| s.completion.missing_blocks_in_piece(i) as u64)
                        .sum::<u64>()
                        * block_size
                })
                .unwrap_or(0)
        };

        let downloaded_ever = s.downloaded_ever();
        let uploaded_ever = s.uploaded_ever();
        let down = if downloaded_ever > 0 { downloaded_ever } else { have_valid };
        let ratio = Ratio::new(uploaded_ever, down);

        let eta = match activity {
            Activity::Download => {
                if left_until_done > desired_available {
                    Eta::NotAvailable
                } else if piece_download_speed < 0.1 {
                    Eta::Unknown
                } else {
                    Eta::Seconds((left_until_done as f64 / piece_download_speed / 1024.0) as u64)
                }
            }
            Activity::Seed => match seed_ratio {
                Some(_) if piece_upload_speed < 0.1 => Eta::Unknown,
                Some(limit) => {
                    let current = ratio.value().unwrap_or(0.0);
                    let bytes_left = (down as f64 * (limit - current)).max(0.0);
                    Eta::Seconds((bytes_left / piece_upload_speed / 1024.0) as u64)
                }
                None => Eta::NotAvailable,
            },
            _ => Eta::NotAvailable,
        };

        let percent_ratio = match (seed_ratio, ratio) {
            (None, _) | (_, Ratio::Infinite) => 1.0,
            (_, Ratio::NotAvailable) => 0.0,
            (Some(limit), Ratio::Value(r)) if r >= limit => 1.0,
            (Some(limit), Ratio::Value(r)) => r / limit,
        };

        let (error, error_string) = (s.error, s.error_string.clone());

        let stat = Stat {
            id: self.id,
            activity,
            error,
            error_string,
            tracker,
            peers,
            raw_upload_speed,
            raw_download_speed,
            piece_upload_speed,
            piece_download_speed,
            percent_complete,
            percent_done,
            left_until_done,
            size_when_done,
            recheck_progress,
            desired_available,
            have_valid,
            have_unchecked,
            corrupt_ever: s.corrupt_cur + s.corrupt_prev,
            downloaded_ever,
            uploaded_ever,
            ratio,
            percent_ratio,
            eta,
            activity_date: s.activity_date,
            added_date: s.added_date,
            done_date: s.done_date,
            start_date: s.start_date,
        };

        s.last_stat_time = now;
        s.stats = Some(stat.clone());
        stat
    }

    /// Same as [`Self::stat`], but reuses the snapshot taken during the
    /// current second.
    pub fn stat_cached(self: &Arc<Self>) -> Stat {
        {
            let s = self.state.lock();
            if s.last_stat_time == now_secs() {
                if let Some(stat) = &s.stats {
                    return stat.clone();
                }
            }
        }
        self.stat()
    }
}
