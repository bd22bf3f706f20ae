//! Metainfo is a .torrent file with information about the Torrent.
//!
//! The bencoded dictionary is decoded with bendy into a loose
//! representation first, and only then validated into [`Info`], so that
//! a malformed file is rejected naming the entry that failed.
use std::{fmt::Display, ops::Deref};

use bendy::decoding::{self, Decoder, FromBencode, Object};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;

/// Largest block we ever request or serve.
pub const MAX_BLOCK_SIZE: u64 = 16 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// SHA-1 of the raw bencoded `info` dictionary.
    pub fn from_raw_info(buf: &[u8]) -> Self {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(buf);
        Self(hasher.digest().bytes())
    }

    /// SHA1("req2" + info hash), used to recognize a torrent during
    /// encrypted handshakes without revealing the info hash.
    pub fn obfuscated(&self) -> [u8; 20] {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(b"req2");
        hasher.update(&self.0);
        hasher.digest().bytes()
    }
}

impl Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.to_string();
        f.write_str(&s[..10])
    }
}

impl Deref for InfoHash {
    type Target = [u8; 20];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl TryFrom<&str> for InfoHash {
    type Error = &'static str;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let buff = hex::decode(value).map_err(|_| "invalid hex string")?;
        let buff: [u8; 20] = buff
            .try_into()
            .map_err(|_| "The infohash must have exactly 20 bytes")?;
        Ok(Self(buff))
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub enum Priority {
    Low = -1,
    #[default]
    Normal = 0,
    High = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub hash: [u8; 20],
    pub priority: Priority,
    pub dnd: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    /// Path relative to the download directory, `/` separated.
    pub name: String,
    pub length: u64,
    /// Byte offset of the file inside the torrent.
    pub offset: u64,
    pub first_piece: usize,
    pub last_piece: usize,
    pub priority: Priority,
    pub dnd: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerInfo {
    pub tier: usize,
    pub announce: String,
    pub scrape: Option<String>,
}

impl TrackerInfo {
    pub fn new(tier: usize, announce: &str) -> Option<Self> {
        let announce = announce.trim();
        if !is_valid_url(announce) {
            return None;
        }
        Some(Self {
            tier,
            announce: announce.to_owned(),
            scrape: announce_to_scrape(announce),
        })
    }
}

/// Everything we know about a torrent from its metainfo.
#[derive(Debug, Clone, PartialEq)]
pub struct Info {
    pub name: String,
    pub comment: String,
    pub creator: String,
    pub date_created: i64,
    pub is_private: bool,
    pub info_hash: InfoHash,
    pub hash_string: String,
    pub total_size: u64,
    pub piece_size: u64,
    pub pieces: Vec<Piece>,
    pub files: Vec<File>,
    pub trackers: Vec<TrackerInfo>,
    pub webseeds: Vec<String>,
    pub is_multifile: bool,
}

impl Info {
    /// Parse a bencoded metainfo buffer.
    ///
    /// `fallback_name` is used when the info dictionary has no usable name,
    /// usually the basename of the .torrent file.
    pub fn parse(bytes: &[u8], fallback_name: Option<&str>) -> Result<Self, Error> {
        let mut meta = MetaInfo::from_bencode(bytes).map_err(|e| {
            debug!("metainfo is not a bencoded dictionary: {e}");
            invalid("info")
        })?;
        let raw = meta.info.take().ok_or_else(|| invalid("info"))?;

        let name = raw
            .name_utf8
            .clone()
            .or(raw.name.clone())
            .filter(|n| !n.is_empty())
            .or_else(|| fallback_name.map(ToOwned::to_owned))
            .filter(|n| !n.is_empty())
            .ok_or_else(|| invalid("name"))?;

        let piece_size = raw
            .piece_length
            .filter(|l| *l >= 1)
            .ok_or_else(|| invalid("piece length"))? as u64;

        let hashes = raw
            .pieces
            .as_ref()
            .filter(|p| p.len() % 20 == 0)
            .ok_or_else(|| invalid("pieces"))?;

        let (is_multifile, raw_files) = raw.files(&name)?;
        let total_size = raw_files
            .iter()
            .try_fold(0u64, |acc, (_, len)| acc.checked_add(*len))
            .ok_or_else(|| invalid("files"))?;
        if raw_files.is_empty() || total_size == 0 {
            return Err(invalid("files"));
        }
        let piece_count = hashes.len() / 20;
        if piece_count as u64 != total_size.div_ceil(piece_size) {
            return Err(invalid("files"));
        }

        let trackers = meta.trackers();
        if trackers.is_empty() {
            return Err(invalid("announce"));
        }

        let pieces = hashes
            .chunks_exact(20)
            .map(|h| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(h);
                Piece { hash, priority: Priority::Normal, dnd: false }
            })
            .collect();

        let mut offset = 0;
        let files = raw_files
            .into_iter()
            .map(|(name, length)| {
                // an empty trailing file still maps to the last piece
                let last_byte = offset + length.saturating_sub(1);
                let first_piece = ((offset / piece_size) as usize).min(piece_count - 1);
                let last_piece = ((last_byte / piece_size) as usize).min(piece_count - 1);
                let file = File {
                    name,
                    length,
                    offset,
                    first_piece,
                    last_piece,
                    priority: Priority::Normal,
                    dnd: false,
                };
                offset += length;
                file
            })
            .collect();

        let info_hash = raw.info_hash;

        Ok(Self {
            name,
            comment: meta.comment_utf8.or(meta.comment).unwrap_or_default(),
            creator: meta.created_by_utf8.or(meta.created_by).unwrap_or_default(),
            date_created: meta.creation_date.unwrap_or(0),
            is_private: raw.private.or(meta.private).unwrap_or(0) != 0,
            hash_string: info_hash.to_string(),
            info_hash,
            total_size,
            piece_size,
            pieces,
            files,
            trackers,
            webseeds: meta.url_list.unwrap_or_default(),
            is_multifile,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Shuffle the trackers inside each tier, keeping the tiers in order.
    pub fn randomize_tiers(&mut self) {
        let mut rng = rand::thread_rng();
        let mut start = 0;
        while start < self.trackers.len() {
            let tier = self.trackers[start].tier;
            let end = self.trackers[start..]
                .iter()
                .position(|t| t.tier != tier)
                .map(|p| start + p)
                .unwrap_or(self.trackers.len());
            self.trackers[start..end].shuffle(&mut rng);
            start = end;
        }
    }

    /// Move the tracker at `pos` to the front of its tier, returning its
    /// new position.
    pub fn promote_tracker(&mut self, pos: usize) -> usize {
        let Some(tracker) = self.trackers.get(pos) else { return pos };
        let tier = tracker.tier;
        let first = self
            .trackers
            .iter()
            .position(|t| t.tier == tier)
            .unwrap_or(pos);
        self.trackers[first..=pos].rotate_right(1);
        first
    }
}

/// Piece and block sizes derived from the piece size and total size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub total_size: u64,
    pub piece_size: u64,
    pub piece_count: usize,
    pub last_piece_size: u64,
    pub block_size: u64,
    pub block_count: usize,
    pub last_block_size: u64,
    pub blocks_per_piece: usize,
    pub blocks_in_last_piece: usize,
}

/// Halve the piece size until it fits in a block.
/// `None` when the result doesn't divide the piece evenly.
pub fn block_size_for(piece_size: u64) -> Option<u64> {
    let mut b = piece_size;
    while b > MAX_BLOCK_SIZE {
        b /= 2;
    }
    if b == 0 || piece_size % b != 0 {
        return None;
    }
    Some(b)
}

impl Geometry {
    pub fn new(total_size: u64, piece_size: u64) -> Result<Self, Error> {
        let block_size = block_size_for(piece_size)
            .ok_or(Error::InvalidBlockSize(piece_size))?;

        let last_piece_size = match total_size % piece_size {
            0 => piece_size,
            n => n,
        };
        let last_block_size = match total_size % block_size {
            0 => block_size,
            n => n,
        };

        Ok(Self {
            total_size,
            piece_size,
            piece_count: total_size.div_ceil(piece_size) as usize,
            last_piece_size,
            block_size,
            block_count: total_size.div_ceil(block_size) as usize,
            last_block_size,
            blocks_per_piece: (piece_size / block_size) as usize,
            blocks_in_last_piece: last_piece_size.div_ceil(block_size) as usize,
        })
    }

    pub fn piece_size(&self, piece: usize) -> u64 {
        if piece + 1 == self.piece_count {
            self.last_piece_size
        } else {
            self.piece_size
        }
    }

    pub fn piece_block_count(&self, piece: usize) -> usize {
        if piece + 1 == self.piece_count {
            self.blocks_in_last_piece
        } else {
            self.blocks_per_piece
        }
    }

    pub fn block_size(&self, block: usize) -> u64 {
        if block + 1 == self.block_count {
            self.last_block_size
        } else {
            self.block_size
        }
    }

    /// Index of the block holding `offset` bytes into `piece`.
    pub fn block_index(&self, piece: usize, offset: u64) -> usize {
        piece * self.blocks_per_piece + (offset / self.block_size) as usize
    }

    /// Blocks of `piece`, as a half-open range.
    pub fn piece_blocks(&self, piece: usize) -> std::ops::Range<usize> {
        let first = piece * self.blocks_per_piece;
        first..first + self.piece_block_count(piece)
    }

    pub fn block_piece(&self, block: usize) -> usize {
        block / self.blocks_per_piece
    }

    /// Absolute position right after `length` bytes at `offset` in `piece`.
    pub fn piece_offset(&self, piece: usize, offset: u64, length: u64) -> u64 {
        self.piece_size * piece as u64 + offset + length
    }
}

fn invalid(field: &str) -> Error {
    Error::InvalidMetadata(field.to_owned())
}

fn is_valid_url(url: &str) -> bool {
    ["http://", "https://", "udp://"]
        .iter()
        .any(|scheme| url.len() > scheme.len() && url.starts_with(scheme))
}

/// Find the last `/` of the announce URL, if the text right after it
/// starts with `announce`, replace that with `scrape`.
fn announce_to_scrape(announce: &str) -> Option<String> {
    let slash = announce.rfind('/')?;
    let rest = announce[slash + 1..].strip_prefix("announce")?;
    Some(format!("{}scrape{rest}", &announce[..=slash]))
}

fn lossy_string(value: Object) -> Option<String> {
    bendy::encoding::AsString::<Vec<u8>>::decode_bencode_object(value)
        .ok()
        .map(|s| String::from_utf8_lossy(&s.0).into_owned())
}

fn lossy_list(value: Object) -> Option<Vec<String>> {
    Vec::<bendy::encoding::AsString<Vec<u8>>>::decode_bencode_object(value)
        .ok()
        .map(|list| {
            list.into_iter()
                .map(|s| String::from_utf8_lossy(&s.0).into_owned())
                .collect()
        })
}

/// Top level dictionary of a .torrent file, every entry optional.
#[derive(Debug, Default)]
struct MetaInfo {
    announce: Option<String>,
    announce_list: Option<Vec<Vec<String>>>,
    comment: Option<String>,
    comment_utf8: Option<String>,
    created_by: Option<String>,
    created_by_utf8: Option<String>,
    creation_date: Option<i64>,
    private: Option<i64>,
    url_list: Option<Vec<String>>,
    info: Option<RawInfo>,
}

impl MetaInfo {
    /// Trackers from `announce-list`, falling back to `announce`.
    /// Tiers without any valid URL are skipped.
    fn trackers(&self) -> Vec<TrackerInfo> {
        let mut trackers = Vec::new();
        if let Some(tiers) = &self.announce_list {
            let mut valid_tiers = 0;
            for tier in tiers {
                let before = trackers.len();
                trackers.extend(
                    tier.iter().filter_map(|url| TrackerInfo::new(valid_tiers, url)),
                );
                if trackers.len() > before {
                    valid_tiers += 1;
                }
            }
        }
        if trackers.is_empty() {
            if let Some(t) =
                self.announce.as_deref().and_then(|url| TrackerInfo::new(0, url))
            {
                trackers.push(t);
            }
        }
        trackers
    }
}

#[derive(Debug, Default)]
struct RawInfo {
    info_hash: InfoHash,
    name: Option<String>,
    name_utf8: Option<String>,
    piece_length: Option<i64>,
    pieces: Option<Vec<u8>>,
    length: Option<i64>,
    files: Option<Vec<RawFile>>,
    files_malformed: bool,
    private: Option<i64>,
}

impl RawInfo {
    /// Names and lengths of the files, in order.
    fn files(&self, name: &str) -> Result<(bool, Vec<(String, u64)>), Error> {
        if self.files_malformed {
            return Err(invalid("files"));
        }
        if let Some(files) = &self.files {
            let mut out = Vec::with_capacity(files.len());
            for file in files {
                let path = file
                    .path_utf8
                    .as_ref()
                    .or(file.path.as_ref())
                    .ok_or_else(|| invalid("path"))?;
                let length = file
                    .length
                    .filter(|l| *l >= 0)
                    .ok_or_else(|| invalid("length"))?;

                let mut full = name.to_owned();
                for part in path.iter().filter(|p| !p.is_empty() && *p != "..") {
                    full.push('/');
                    full.push_str(part);
                }
                out.push((full, length as u64));
            }
            return Ok((true, out));
        }
        match self.length {
            Some(len) if len >= 0 => Ok((false, vec![(name.to_owned(), len as u64)])),
            _ => Err(invalid("length")),
        }
    }
}

#[derive(Debug, Default)]
struct RawFile {
    length: Option<i64>,
    path: Option<Vec<String>>,
    path_utf8: Option<Vec<String>>,
}

impl FromBencode for RawFile {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut dict_dec = object.try_into_dictionary()?;
        let mut file = RawFile::default();

        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"length", value) => {
                    file.length = i64::decode_bencode_object(value).ok();
                }
                (b"path", value) => {
                    file.path = lossy_list(value);
                }
                (b"path.utf-8", value) => {
                    file.path_utf8 = lossy_list(value);
                }
                _ => {}
            }
        }

        Ok(file)
    }
}

impl FromBencode for MetaInfo {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut meta = MetaInfo::default();

        let mut dict_dec = object.try_into_dictionary()?;
        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"announce", value) => {
                    meta.announce = lossy_string(value);
                }
                (b"announce-list", value) => {
                    meta.announce_list =
                        Vec::<Vec<String>>::decode_bencode_object(value).ok();
                }
                (b"comment", value) => {
                    meta.comment = lossy_string(value);
                }
                (b"comment.utf-8", value) => {
                    meta.comment_utf8 = lossy_string(value);
                }
                (b"created by", value) => {
                    meta.created_by = lossy_string(value);
                }
                (b"created by.utf-8", value) => {
                    meta.created_by_utf8 = lossy_string(value);
                }
                (b"creation date", value) => {
                    meta.creation_date = i64::decode_bencode_object(value).ok();
                }
                (b"private", value) => {
                    meta.private = i64::decode_bencode_object(value).ok();
                }
                (b"url-list", value) => {
                    meta.url_list = match value {
                        Object::Bytes(url) => {
                            Some(vec![String::from_utf8_lossy(url).into_owned()])
                        }
                        other => lossy_list(other),
                    };
                }
                (b"info", value) => {
                    meta.info = RawInfo::decode_bencode_object(value).ok();
                }
                _ => {}
            }
        }

        Ok(meta)
    }
}

impl FromBencode for RawInfo {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let bytes = object.try_into_dictionary()?.into_raw()?;
        let mut info = RawInfo {
            info_hash: InfoHash::from_raw_info(bytes),
            ..Default::default()
        };

        let mut decoder = Decoder::new(bytes);
        let mut dict = decoder
            .next_object()?
            .ok_or_else(|| decoding::Error::missing_field("info"))?
            .try_into_dictionary()?;

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"name", value) => {
                    info.name = lossy_string(value);
                }
                (b"name.utf-8", value) => {
                    info.name_utf8 = lossy_string(value);
                }
                (b"piece length", value) => {
                    info.piece_length = i64::decode_bencode_object(value).ok();
                }
                (b"pieces", value) => {
                    info.pieces =
                        bendy::encoding::AsString::<Vec<u8>>::decode_bencode_object(value)
                            .ok()
                            .map(|p| p.0);
                }
                (b"length", value) => {
                    info.length = i64::decode_bencode_object(value).ok();
                }
                (b"files", value) => {
                    match Vec::<RawFile>::decode_bencode_object(value) {
                        Ok(files) => info.files = Some(files),
                        Err(_) => info.files_malformed = true,
                    }
                }
                (b"private", value) => {
                    info.private = i64::decode_bencode_object(value).ok();
                }
                _ => {}
            }
        }

        Ok(info)
    }
}
