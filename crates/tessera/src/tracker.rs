//! The tracker client as seen by a torrent.
//!
//! The announce protocol itself lives behind [`Tracker`]. A tracker talks
//! back to its torrent by publishing [`TrackerEvent`]s on the
//! [`TrackerSubscription`] it was created with, the events are delivered on
//! the session's event thread.
use std::{sync::Weak, time::SystemTime};

use crate::{event::EventHandle, metainfo::Info, torrent::Torrent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    /// A compact peer list from an announce.
    Peers { compact: Vec<u8>, all_are_seeds: bool },
    Warning(String),
    Error(String),
    ErrorClear,
}

/// Scrape and announce counters for the stat snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub announce_url: Option<String>,
    pub scrape_url: Option<String>,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub times_completed: Option<u32>,
    pub last_announce: Option<SystemTime>,
    pub next_announce: Option<SystemTime>,
    pub next_manual_announce: Option<SystemTime>,
}

pub trait Tracker: Send {
    fn start(&mut self);
    fn stop(&mut self);
    /// We just finished downloading.
    fn completed(&mut self);
    fn manual_announce(&mut self);
    fn can_manual_announce(&self) -> bool;
    fn change_my_port(&mut self);
    fn stats(&self) -> TrackerStats;
}

/// Builds one [`Tracker`] per torrent.
pub trait TrackerFactory: Send + Sync {
    fn new_tracker(&self, info: &Info, events: TrackerSubscription) -> Box<dyn Tracker>;
}

/// The way back from a tracker to the torrent that owns it.
#[derive(Debug, Clone)]
pub struct TrackerSubscription {
    torrent: Weak<Torrent>,
    events: EventHandle,
}

impl TrackerSubscription {
    pub(crate) fn new(torrent: Weak<Torrent>, events: EventHandle) -> Self {
        Self { torrent, events }
    }

    /// Deliver `event` to the torrent on the event thread. Events for a
    /// torrent that was already freed are dropped.
    pub fn publish(&self, event: TrackerEvent) {
        let torrent = self.torrent.clone();
        self.events.run(move || {
            if let Some(tor) = torrent.upgrade() {
                tor.on_tracker_event(event);
            }
        });
    }
}

/// A tracker that never announces, for torrents that rely on other peer
/// sources and for tests.
#[derive(Debug, Default)]
pub struct NoTracker {
    running: bool,
}

impl Tracker for NoTracker {
    fn start(&mut self) {
        self.running = true;
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn completed(&mut self) {}

    fn manual_announce(&mut self) {}

    fn can_manual_announce(&self) -> bool {
        self.running
    }

    fn change_my_port(&mut self) {}

    fn stats(&self) -> TrackerStats {
        TrackerStats::default()
    }
}

#[derive(Debug, Default)]
pub struct NoTrackers;

impl TrackerFactory for NoTrackers {
    fn new_tracker(&self, _info: &Info, _events: TrackerSubscription) -> Box<dyn Tracker> {
        Box::new(NoTracker::default())
    }
}
