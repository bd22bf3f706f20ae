//! Reading and writing pieces to the files of a torrent.
//!
//! A piece can span many files, every request is split into one
//! [`Segment`] per file and each file goes through the session's
//! [`FdCache`](crate::fdlimit::FdCache).
use std::io::{Read, Seek, SeekFrom, Write};

use tracing::{debug, warn};

use crate::{error::Error, metainfo::File, torrent::Torrent};

/// The part of a request that falls in one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Name of the file, relative to the download dir.
    pub name: String,
    /// Full length of the file.
    pub file_length: u64,
    /// Where the segment starts in the file.
    pub file_offset: u64,
    pub length: u64,
}

/// Split `length` bytes at the absolute position `pos` into segments.
/// Empty files never get a segment.
pub fn segments(files: &[File], pos: u64, length: u64) -> Vec<Segment> {
    let mut out = Vec::new();
    let end = pos + length;
    // index of the first file that ends after `pos`
    let first = files.partition_point(|f| f.offset + f.length <= pos);

    for file in &files[first..] {
        if file.offset >= end {
            break;
        }
        if file.length == 0 {
            continue;
        }
        let begin = pos.max(file.offset);
        let stop = end.min(file.offset + file.length);
        out.push(Segment {
            name: file.name.clone(),
            file_length: file.length,
            file_offset: begin - file.offset,
            length: stop - begin,
        });
    }

    out
}

fn check_bounds(tor: &Torrent, piece: usize, offset: u64, length: u64) -> Result<(), Error> {
    let g = tor.geometry();
    if piece >= g.piece_count || offset + length > g.piece_size(piece) {
        return Err(Error::InvalidRequest { piece, offset, length });
    }
    Ok(())
}

/// Fill `buf` with the bytes at `offset` in `piece`.
pub fn read(tor: &Torrent, piece: usize, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
    check_bounds(tor, piece, offset, buf.len() as u64)?;
    let (dir, segments) = tor.locate(piece, offset, buf.len() as u64);
    let fd = tor.fd();
    let preallocation = tor.preallocation();

    let mut at = 0;
    for seg in segments {
        let mut file = fd.checkout(&dir, &seg.name, false, preallocation, seg.file_length)?;
        file.seek(SeekFrom::Start(seg.file_offset))?;
        file.read_exact(&mut buf[at..at + seg.length as usize])?;
        at += seg.length as usize;
    }

    Ok(())
}

/// Write `data` at `offset` in `piece`, creating the files as needed.
pub fn write(tor: &Torrent, piece: usize, offset: u64, data: &[u8]) -> Result<(), Error> {
    check_bounds(tor, piece, offset, data.len() as u64)?;
    let (dir, segments) = tor.locate(piece, offset, data.len() as u64);
    let fd = tor.fd();
    let preallocation = tor.preallocation();

    let mut at = 0;
    for seg in segments {
        let mut file = fd.checkout(&dir, &seg.name, true, preallocation, seg.file_length)?;
        file.seek(SeekFrom::Start(seg.file_offset))?;
        file.write_all(&data[at..at + seg.length as usize])?;
        at += seg.length as usize;
    }

    Ok(())
}

/// Read `piece` from disk and compare it with its hash. `buf` is scratch
/// space, reused between calls.
pub fn test_piece(tor: &Torrent, piece: usize, buf: &mut Vec<u8>) -> bool {
    let Some(expected) = tor.piece_hash(piece) else { return false };
    let len = tor.geometry().piece_size(piece) as usize;
    buf.resize(len, 0);

    if let Err(e) = read(tor, piece, 0, buf) {
        debug!(name = %tor.name(), "could not read piece {piece}: {e}");
        return false;
    }

    let mut hash = sha1_smol::Sha1::new();
    hash.update(buf);
    let valid = hash.digest().bytes() == expected;
    if !valid {
        warn!(name = %tor.name(), "piece {piece} is corrupted");
    }
    valid
}
