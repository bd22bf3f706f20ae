//! Wrapper types around Bitvec.
use bitvec::prelude::*;

use crate::error::Error;

/// Bitfield where index = piece (or block).
///
/// The backing storage is `ceil(len / 8)` bytes and bit 0 is the most
/// significant bit of byte 0, the same layout used on the wire.
pub type Bitfield = BitVec<u8, Msb0>;

pub trait TrBitfield {
    /// A bitfield of `len` bits, all of them unset.
    fn from_piece(len: usize) -> Bitfield {
        bitvec![u8, Msb0; 0; len]
    }

    /// Build a bitfield of `len` bits from raw bytes, padding or trimming
    /// the vector as needed.
    fn new_and_resize(mut vec: Vec<u8>, len: usize) -> Bitfield {
        vec.resize(len.div_ceil(8), 0);
        let mut s = Bitfield::from_vec(vec);
        s.truncate(len);
        s
    }

    fn add(&mut self, index: usize) -> Result<(), Error>;
    fn rem(&mut self, index: usize) -> Result<(), Error>;

    /// Set every bit of the half-open range `begin..end`.
    fn add_range(&mut self, begin: usize, end: usize) -> Result<(), Error>;

    /// Clear every bit of the half-open range `begin..end`.
    fn rem_range(&mut self, begin: usize, end: usize) -> Result<(), Error>;

    /// Same as `get`, but out of range reads as false.
    fn has(&self, index: usize) -> bool;

    fn count_true_bits(&self) -> usize;

    /// True when no bit is set. Not to be confused with `is_empty`,
    /// which is about the length.
    fn has_none(&self) -> bool;

    /// `self |= other`, both must have the same length.
    fn union_with(&mut self, other: &Bitfield) -> Result<(), Error>;

    /// `self &= !other`, both must have the same length.
    fn difference_with(&mut self, other: &Bitfield) -> Result<(), Error>;
}

impl TrBitfield for Bitfield {
    fn add(&mut self, index: usize) -> Result<(), Error> {
        if index >= self.len() {
            return Err(Error::BitOutOfRange(index, self.len()));
        }
        self.set(index, true);
        Ok(())
    }

    fn rem(&mut self, index: usize) -> Result<(), Error> {
        if index >= self.len() {
            return Err(Error::BitOutOfRange(index, self.len()));
        }
        self.set(index, false);
        Ok(())
    }

    fn add_range(&mut self, begin: usize, end: usize) -> Result<(), Error> {
        if begin > end || end > self.len() {
            return Err(Error::BitOutOfRange(end, self.len()));
        }
        // bitvec masks the partial head and tail elements and fills the
        // whole bytes in between.
        self[begin..end].fill(true);
        Ok(())
    }

    fn rem_range(&mut self, begin: usize, end: usize) -> Result<(), Error> {
        if begin > end || end > self.len() {
            return Err(Error::BitOutOfRange(end, self.len()));
        }
        self[begin..end].fill(false);
        Ok(())
    }

    fn has(&self, index: usize) -> bool {
        self.get(index).map(|b| *b).unwrap_or(false)
    }

    fn count_true_bits(&self) -> usize {
        self.count_ones()
    }

    fn has_none(&self) -> bool {
        self.not_any()
    }

    fn union_with(&mut self, other: &Bitfield) -> Result<(), Error> {
        if self.len() != other.len() {
            return Err(Error::BitfieldLength(self.len(), other.len()));
        }
        // bit by bit, the padding past `len` is never read
        for index in other.iter_ones() {
            self.set(index, true);
        }
        Ok(())
    }

    fn difference_with(&mut self, other: &Bitfield) -> Result<(), Error> {
        if self.len() != other.len() {
            return Err(Error::BitfieldLength(self.len(), other.len()));
        }
        for index in other.iter_ones() {
            self.set(index, false);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn from_piece() {
        let bitfield = Bitfield::from_piece(1407);
        assert_eq!(bitfield.len(), 1407);
        assert_eq!(bitfield.as_raw_slice().len(), 176);
        assert!(bitfield.has_none());
    }

    #[test]
    fn msb_first_layout() {
        let mut bitfield = Bitfield::from_piece(10);
        bitfield.add(0).unwrap();
        bitfield.add(9).unwrap();
        assert_eq!(bitfield.as_raw_slice(), &[0b1000_0000, 0b0100_0000]);
    }

    #[test]
    fn add_out_of_range() {
        let mut bitfield = Bitfield::from_piece(8);
        assert!(bitfield.add(8).is_err());
        assert!(bitfield.rem(8).is_err());
        assert!(bitfield.add_range(3, 9).is_err());
        assert!(!bitfield.has(100));
        assert!(bitfield.has_none());
    }

    #[test]
    fn ranges_across_bytes() {
        let mut bitfield = Bitfield::from_piece(24);
        bitfield.add_range(5, 19).unwrap();
        assert_eq!(
            bitfield.as_raw_slice(),
            &[0b0000_0111, 0b1111_1111, 0b1110_0000]
        );
        assert_eq!(bitfield.count_true_bits(), 14);

        bitfield.rem_range(6, 18).unwrap();
        assert_eq!(
            bitfield.as_raw_slice(),
            &[0b0000_0100, 0b0000_0000, 0b0010_0000]
        );

        // single bit range
        bitfield.rem_range(5, 6).unwrap();
        bitfield.rem_range(18, 19).unwrap();
        assert!(bitfield.has_none());
    }

    #[test]
    fn union_and_difference() {
        let mut a = Bitfield::new_and_resize(vec![0b1100_0000], 4);
        let b = Bitfield::new_and_resize(vec![0b0110_0000], 4);
        a.union_with(&b).unwrap();
        assert_eq!(a.as_raw_slice(), &[0b1110_0000]);

        a.difference_with(&b).unwrap();
        assert_eq!(a.as_raw_slice(), &[0b1000_0000]);

        let c = Bitfield::from_piece(5);
        assert!(a.union_with(&c).is_err());
        assert!(a.difference_with(&c).is_err());
    }

    #[test]
    fn union_ignores_padding() {
        // 0xff with a length of 3 keeps five set bits in the padding
        let mut dirty = Bitfield::from_vec(vec![0xff]);
        dirty.truncate(3);

        let mut a = Bitfield::from_piece(3);
        a.union_with(&dirty).unwrap();
        assert_eq!(a.count_true_bits(), 3);
        assert_eq!(a.as_raw_slice(), &[0b1110_0000]);

        a.difference_with(&dirty).unwrap();
        assert!(a.has_none());
        assert_eq!(a.as_raw_slice(), &[0]);
    }

    #[test]
    fn new_and_resize() {
        let bitfield = Bitfield::new_and_resize(vec![0xff], 5);
        assert_eq!(bitfield.len(), 5);
        assert_eq!(bitfield.count_true_bits(), 5);

        let bitfield = Bitfield::new_and_resize(vec![], 9);
        assert_eq!(bitfield.len(), 9);
        assert_eq!(bitfield.as_raw_slice().len(), 2);
    }

    proptest! {
        #[test]
        fn range_matches_single_bits(
            (len, begin, end) in (1usize..300)
                .prop_flat_map(|len| (Just(len), 0..len))
                .prop_flat_map(|(len, begin)| (Just(len), Just(begin), begin + 1..=len))
        ) {
            let mut ranged = Bitfield::from_piece(len);
            ranged.add_range(begin, end).unwrap();

            let mut single = Bitfield::from_piece(len);
            for i in begin..end {
                single.add(i).unwrap();
            }
            prop_assert_eq!(ranged.as_raw_slice(), single.as_raw_slice());

            ranged.rem_range(begin, end).unwrap();
            for i in begin..end {
                single.rem(i).unwrap();
            }
            prop_assert_eq!(ranged.as_raw_slice(), single.as_raw_slice());
            prop_assert!(ranged.has_none());
        }

        #[test]
        fn popcount_matches_adds(
            ops in proptest::collection::vec((0usize..200, any::<bool>()), 0..400)
        ) {
            let mut bitfield = Bitfield::from_piece(200);
            let mut expected = std::collections::BTreeSet::new();
            for (i, set) in ops {
                if set {
                    bitfield.add(i).unwrap();
                    expected.insert(i);
                } else {
                    bitfield.rem(i).unwrap();
                    expected.remove(&i);
                }
            }
            prop_assert_eq!(bitfield.count_true_bits(), expected.len());
        }
    }
}
