//! Which pieces and blocks of a torrent we have, and everything derived
//! from that: percent done, bytes left, completeness.
use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::{
    bitfield::{Bitfield, TrBitfield},
    error::Error,
    metainfo::{Geometry, Piece},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Completeness {
    /// Still missing wanted pieces.
    #[default]
    Leech,
    /// Has every piece.
    Seed,
    /// Has every wanted piece, but not the ones marked do-not-download.
    PartialSeed,
}

impl Display for Completeness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Leech => write!(f, "Incomplete"),
            Self::Seed => write!(f, "Complete"),
            Self::PartialSeed => write!(f, "Done"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    geometry: Geometry,
    blocks: Bitfield,
    pieces: Bitfield,
    /// Number of blocks we have, per piece.
    complete_blocks: Vec<u32>,
    /// Bytes of every block we have.
    size_now: u64,
    size_when_done: Option<u64>,
    have_valid: Option<u64>,
}

impl Completion {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            blocks: Bitfield::from_piece(geometry.block_count),
            pieces: Bitfield::from_piece(geometry.piece_count),
            complete_blocks: vec![0; geometry.piece_count],
            size_now: 0,
            size_when_done: None,
            have_valid: None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.geometry);
    }

    /// Must be called every time a piece flips its do-not-download flag.
    pub fn invalidate_dnd(&mut self) {
        self.size_when_done = None;
    }

    fn invalidate(&mut self) {
        self.size_when_done = None;
        self.have_valid = None;
    }

    pub fn add_block(&mut self, block: usize) {
        if block >= self.geometry.block_count || self.blocks.has(block) {
            return;
        }
        let piece = self.geometry.block_piece(block);
        // the index was checked above
        let _ = self.blocks.add(block);
        self.complete_blocks[piece] += 1;
        self.size_now += self.geometry.block_size(block);
        if self.complete_blocks[piece] as usize == self.geometry.piece_block_count(piece) {
            let _ = self.pieces.add(piece);
        }
        self.invalidate();
    }

    pub fn add_piece(&mut self, piece: usize) {
        if piece >= self.geometry.piece_count {
            return;
        }
        for block in self.geometry.piece_blocks(piece) {
            self.add_block(block);
        }
    }

    pub fn remove_piece(&mut self, piece: usize) {
        if piece >= self.geometry.piece_count {
            return;
        }
        for block in self.geometry.piece_blocks(piece) {
            if self.blocks.has(block) {
                self.size_now -= self.geometry.block_size(block);
            }
        }
        let range = self.geometry.piece_blocks(piece);
        let _ = self.blocks.rem_range(range.start, range.end);
        let _ = self.pieces.rem(piece);
        self.complete_blocks[piece] = 0;
        self.invalidate();
    }

    pub fn set_has_piece(&mut self, piece: usize, has: bool) {
        if has {
            self.add_piece(piece);
        } else {
            self.remove_piece(piece);
        }
    }

    pub fn piece_is_complete(&self, piece: usize) -> bool {
        self.pieces.has(piece)
    }

    pub fn block_is_complete(&self, block: usize) -> bool {
        self.blocks.has(block)
    }

    pub fn missing_blocks_in_piece(&self, piece: usize) -> usize {
        self.geometry.piece_block_count(piece) - self.complete_blocks[piece] as usize
    }

    pub fn complete_blocks_in_piece(&self, piece: usize) -> usize {
        self.complete_blocks[piece] as usize
    }

    pub fn block_bitfield(&self) -> &Bitfield {
        &self.blocks
    }

    pub fn piece_bitfield(&self) -> &Bitfield {
        &self.pieces
    }

    /// Replace the block view, e.g. with one loaded from resume state.
    pub fn set_block_bitfield(&mut self, blocks: &Bitfield) -> Result<(), Error> {
        if blocks.len() != self.geometry.block_count {
            return Err(Error::BitfieldLength(self.geometry.block_count, blocks.len()));
        }
        self.reset();
        for block in blocks.iter_ones() {
            self.add_block(block);
        }
        Ok(())
    }

    pub fn have_total(&self) -> u64 {
        self.size_now
    }

    /// Bytes of every complete piece, which are the only bytes that
    /// passed (or will pass) a hash check.
    pub fn have_valid(&mut self) -> u64 {
        if let Some(v) = self.have_valid {
            return v;
        }
        let v = self
            .pieces
            .iter_ones()
            .map(|piece| self.geometry.piece_size(piece))
            .sum();
        self.have_valid = Some(v);
        v
    }

    /// Bytes we will have once every wanted piece is complete.
    pub fn size_when_done(&mut self, pieces: &[Piece]) -> u64 {
        if let Some(v) = self.size_when_done {
            return v;
        }
        let mut size = 0;
        for (i, piece) in pieces.iter().enumerate() {
            if !piece.dnd {
                size += self.geometry.piece_size(i);
            } else {
                size += self
                    .geometry
                    .piece_blocks(i)
                    .filter(|b| self.blocks.has(*b))
                    .map(|b| self.geometry.block_size(b))
                    .sum::<u64>();
            }
        }
        self.size_when_done = Some(size);
        size
    }

    pub fn left_until_done(&mut self, pieces: &[Piece]) -> u64 {
        self.size_when_done(pieces).saturating_sub(self.size_now)
    }

    pub fn left_until_complete(&self) -> u64 {
        self.geometry.total_size - self.size_now
    }

    pub fn percent_complete(&self) -> f64 {
        self.size_now as f64 / self.geometry.total_size as f64
    }

    pub fn percent_done(&mut self, pieces: &[Piece]) -> f64 {
        let done = self.size_when_done(pieces);
        if done == 0 {
            1.0
        } else {
            self.size_now as f64 / done as f64
        }
    }

    pub fn status(&mut self, pieces: &[Piece]) -> Completeness {
        if self.size_now == self.geometry.total_size {
            Completeness::Seed
        } else if self.left_until_done(pieces) == 0 {
            Completeness::PartialSeed
        } else {
            Completeness::Leech
        }
    }

    /// Fraction of each sampled piece that we have, spread over `size`
    /// slots.
    pub fn amount_done(&self, size: usize) -> Vec<f32> {
        let piece_count = self.geometry.piece_count;
        (0..size)
            .map(|i| {
                let piece = i * piece_count / size;
                self.complete_blocks[piece] as f32
                    / self.geometry.piece_block_count(piece) as f32
            })
            .collect()
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }
}
