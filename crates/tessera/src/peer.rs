//! The peer manager as seen by a torrent: connecting, choking and the wire
//! protocol all live behind [`PeerManager`], the torrent only tells it when
//! to start and stop and polls it for statistics.
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::{bitfield::Bitfield, metainfo::InfoHash, torrent::TorrentId};

/// The peer is a seed, as flagged by trackers and PEX.
pub const ADDED_F_SEED_FLAG: u8 = 0x2;

/// A peer address exchanged between trackers, PEX and the peer manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pex {
    pub addr: SocketAddr,
    pub flags: u8,
}

impl Pex {
    /// Parse a compact peer list: 4 bytes of IPv4 followed by a big-endian
    /// port, per peer. Trailing bytes that don't form a full peer are
    /// ignored.
    pub fn from_compact(buf: &[u8], flags: u8) -> Vec<Pex> {
        buf.chunks_exact(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                Pex { addr: SocketAddr::V4(SocketAddrV4::new(ip, port)), flags }
            })
            .collect()
    }

    pub fn is_seed(&self) -> bool {
        self.flags & ADDED_F_SEED_FLAG != 0
    }
}

/// Where we learned about a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerSource {
    Incoming = 0,
    Ltep = 1,
    Tracker = 2,
    Pex = 3,
    Resume = 4,
}

pub const PEER_FROM_COUNT: usize = 5;

/// Counters the peer manager keeps per torrent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerManagerStats {
    pub peers_known: usize,
    pub peers_connected: usize,
    /// Seeds we are connected to and could download from.
    pub usable_seeds: usize,
    pub webseeds_sending_to_us: usize,
    pub peers_sending_to_us: usize,
    pub peers_getting_from_us: usize,
    pub peers_from: [usize; PEER_FROM_COUNT],
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerStat {
    pub addr: SocketAddr,
    pub client: String,
    pub progress: f32,
    pub is_seed: bool,
    pub is_encrypted: bool,
    pub is_downloading_from: bool,
    pub is_uploading_to: bool,
    /// KiB/s
    pub rate_to_peer: f64,
    /// KiB/s
    pub rate_to_client: f64,
}

pub trait PeerManager: Send + Sync {
    fn add_torrent(&self, id: TorrentId, info_hash: InfoHash);
    fn remove_torrent(&self, id: TorrentId);
    fn start_torrent(&self, id: TorrentId);
    fn stop_torrent(&self, id: TorrentId);

    fn torrent_stats(&self, id: TorrentId) -> PeerManagerStats;

    fn array_to_pex(&self, compact: &[u8]) -> Vec<Pex> {
        Pex::from_compact(compact, 0)
    }

    fn add_pex(&self, id: TorrentId, from: PeerSource, pex: &Pex);

    fn peer_stats(&self, id: TorrentId) -> Vec<PeerStat>;

    /// KiB/s of every web seed, in metainfo order.
    fn web_speeds(&self, id: TorrentId) -> Vec<f64>;

    /// How many connected peers have each piece, sampled into `size`
    /// slots. `-1` means we have that piece ourselves.
    fn availability(&self, id: TorrentId, size: usize) -> Vec<i8>;

    /// Pieces that at least one connected peer has.
    fn available_pieces(&self, id: TorrentId) -> Option<Bitfield>;
}

/// A peer manager that never connects to anyone.
#[derive(Debug, Default)]
pub struct NoPeers;

impl PeerManager for NoPeers {
    fn add_torrent(&self, _id: TorrentId, _info_hash: InfoHash) {}
    fn remove_torrent(&self, _id: TorrentId) {}
    fn start_torrent(&self, _id: TorrentId) {}
    fn stop_torrent(&self, _id: TorrentId) {}

    fn torrent_stats(&self, _id: TorrentId) -> PeerManagerStats {
        PeerManagerStats::default()
    }

    fn add_pex(&self, _id: TorrentId, _from: PeerSource, _pex: &Pex) {}

    fn peer_stats(&self, _id: TorrentId) -> Vec<PeerStat> {
        Vec::new()
    }

    fn web_speeds(&self, _id: TorrentId) -> Vec<f64> {
        Vec::new()
    }

    fn availability(&self, _id: TorrentId, size: usize) -> Vec<i8> {
        vec![0; size]
    }

    fn available_pieces(&self, _id: TorrentId) -> Option<Bitfield> {
        None
    }
}
