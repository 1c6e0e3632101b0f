//! Wrapper types around Bitvec.
use bitvec::prelude::*;

/// Bitfield where index = piece (or block, for per-piece progress).
pub type Bitfield = BitVec<u8, Msb0>;

/// Reserved bytes exchanged during handshake.
type ReservedAlias = BitArray<[u8; 8], Msb0>;

#[derive(Debug, Clone, Default, Copy, PartialEq, Eq)]
pub struct Reserved(pub ReservedAlias);

impl From<[u8; 8]> for Reserved {
    fn from(value: [u8; 8]) -> Self {
        Self(ReservedAlias::from(value))
    }
}

impl From<Reserved> for [u8; 8] {
    fn from(value: Reserved) -> Self {
        value.0.into_inner()
    }
}

impl Reserved {
    /// Bit 44 (counting from 1), the `extension protocol`.
    pub const EXTENSION: usize = 43;

    /// Bit 64 (counting from 1), mainline DHT.
    pub const DHT: usize = 63;

    /// Reserved bits of protocols that the client supports.
    pub fn supported() -> Reserved {
        // we only support the `extension protocol`
        let mut reserved = Reserved::default();
        reserved.0.set(Self::EXTENSION, true);
        reserved
    }

    pub fn supports_extended(&self) -> bool {
        self.0[Self::EXTENSION]
    }

    pub fn supports_dht(&self) -> bool {
        self.0[Self::DHT]
    }
}

pub trait BitfieldExt {
    fn from_piece(piece: usize) -> Bitfield {
        bitvec![u8, Msb0; 0; piece]
    }

    /// Build a bitfield of exactly `len` bits out of raw wire bytes.
    /// Missing bytes are treated as zero and padding bits are cleared.
    fn from_bytes(bytes: &[u8], len: usize) -> Bitfield {
        let mut s = Bitfield::from_slice(bytes);
        s.resize(len, false);
        s.set_uninitialized(false);
        s
    }

    /// Set a bit, out of range indices are ignored.
    fn safe_set(&mut self, index: usize);
    /// Unset a bit, out of range indices are ignored.
    fn safe_unset(&mut self, index: usize);
    /// Out of range indices are never set.
    fn safe_get(&self, index: usize) -> bool;

    fn count_set(&self) -> usize;
    /// All bits are set.
    fn completed(&self) -> bool;
    /// Fraction of bits set, between 0 and 1.
    fn progress(&self) -> f64;

    /// `None` when the lengths differ.
    fn and(&self, other: &Bitfield) -> Option<Bitfield>;
    fn or(&self, other: &Bitfield) -> Option<Bitfield>;
    fn xor(&self, other: &Bitfield) -> Option<Bitfield>;
    fn inverted(&self) -> Bitfield;

    /// In place OR, returns false and leaves `self` untouched when the
    /// lengths differ.
    fn merge(&mut self, other: &Bitfield) -> bool;

    /// Index of a bit we have that the fewest of `others` also have,
    /// skipping indices rejected by `exclude`. Ties go to the lowest index.
    fn find_rarest<F>(&self, others: &[Bitfield], exclude: F) -> Option<usize>
    where
        F: Fn(usize) -> bool;
}

fn zip_with(
    a: &Bitfield,
    b: &Bitfield,
    f: impl Fn(bool, bool) -> bool,
) -> Option<Bitfield> {
    if a.len() != b.len() {
        return None;
    }
    Some(
        a.iter()
            .by_vals()
            .zip(b.iter().by_vals())
            .map(|(x, y)| f(x, y))
            .collect(),
    )
}

impl BitfieldExt for Bitfield {
    fn safe_set(&mut self, index: usize) {
        if let Some(mut bit) = self.get_mut(index) {
            *bit = true;
        }
    }

    fn safe_unset(&mut self, index: usize) {
        if let Some(mut bit) = self.get_mut(index) {
            *bit = false;
        }
    }

    fn safe_get(&self, index: usize) -> bool {
        self.get(index).map(|b| *b).unwrap_or(false)
    }

    fn count_set(&self) -> usize {
        self.count_ones()
    }

    fn completed(&self) -> bool {
        self.all()
    }

    fn progress(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.count_ones() as f64 / self.len() as f64
    }

    fn and(&self, other: &Bitfield) -> Option<Bitfield> {
        zip_with(self, other, |a, b| a & b)
    }

    fn or(&self, other: &Bitfield) -> Option<Bitfield> {
        zip_with(self, other, |a, b| a | b)
    }

    fn xor(&self, other: &Bitfield) -> Option<Bitfield> {
        zip_with(self, other, |a, b| a ^ b)
    }

    fn inverted(&self) -> Bitfield {
        self.iter().by_vals().map(|b| !b).collect()
    }

    fn merge(&mut self, other: &Bitfield) -> bool {
        if self.len() != other.len() {
            return false;
        }
        for i in other.iter_ones() {
            self.set(i, true);
        }
        true
    }

    fn find_rarest<F>(&self, others: &[Bitfield], exclude: F) -> Option<usize>
    where
        F: Fn(usize) -> bool,
    {
        let mut rarest: Option<(usize, usize)> = None;

        for index in self.iter_ones() {
            if exclude(index) {
                continue;
            }
            let count = others.iter().filter(|o| o.safe_get(index)).count();
            match rarest {
                Some((_, min)) if min <= count => {}
                _ => rarest = Some((index, count)),
            }
        }

        rarest.map(|(index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_piece() {
        let bitfield = Bitfield::from_piece(1407);
        assert_eq!(bitfield.len(), 1407);
        assert_eq!(bitfield.as_raw_slice().len(), 176);
    }

    #[test]
    fn out_of_range_is_ignored() {
        let mut bitfield = Bitfield::from_piece(10);
        bitfield.safe_set(3);
        bitfield.safe_set(10);
        bitfield.safe_set(400);
        assert_eq!(bitfield.len(), 10);
        assert!(bitfield.safe_get(3));
        assert!(!bitfield.safe_get(10));
        assert!(!bitfield.safe_get(400));
        assert_eq!(bitfield.count_set(), 1);

        bitfield.safe_unset(3);
        bitfield.safe_unset(99);
        assert_eq!(bitfield.count_set(), 0);
    }

    #[test]
    fn completed() {
        let mut bitfield = Bitfield::from_piece(9);
        for i in 0..8 {
            bitfield.safe_set(i);
        }
        assert!(!bitfield.completed());
        assert_eq!(bitfield.count_set(), 8);
        bitfield.safe_set(8);
        assert!(bitfield.completed());
        assert_eq!(bitfield.progress(), 1.0);
    }

    #[test]
    fn from_bytes_clears_padding() {
        // 0b1111_1111, 0b1111_1111 but only 10 pieces
        let bitfield = Bitfield::from_bytes(&[0xff, 0xff], 10);
        assert_eq!(bitfield.len(), 10);
        assert!(bitfield.completed());
        assert_eq!(bitfield.as_raw_slice(), &[0xff, 0b1100_0000]);

        let short = Bitfield::from_bytes(&[0b1000_0000], 12);
        assert_eq!(short.len(), 12);
        assert_eq!(short.count_set(), 1);
        assert!(short.safe_get(0));
    }

    #[test]
    fn set_algebra() {
        let a = Bitfield::from_bytes(&[0b1100_0000], 4);
        let b = Bitfield::from_bytes(&[0b1010_0000], 4);

        assert_eq!(a.and(&b).unwrap(), Bitfield::from_bytes(&[0b1000_0000], 4));
        assert_eq!(a.or(&b).unwrap(), Bitfield::from_bytes(&[0b1110_0000], 4));
        assert_eq!(a.xor(&b).unwrap(), Bitfield::from_bytes(&[0b0110_0000], 4));
        assert_eq!(a.inverted(), Bitfield::from_bytes(&[0b0011_0000], 4));

        let c = Bitfield::from_piece(5);
        assert!(a.and(&c).is_none());
        assert!(a.or(&c).is_none());
        assert!(a.xor(&c).is_none());

        let mut m = a.clone();
        assert!(m.merge(&b));
        assert_eq!(m.count_set(), 3);
        assert!(!m.merge(&c));
        assert_eq!(m.count_set(), 3);
    }

    #[test]
    fn find_rarest() {
        // we have pieces 0, 1, 2, 3
        let ours = Bitfield::from_bytes(&[0b1111_0000], 8);
        let others = vec![
            Bitfield::from_bytes(&[0b1101_0000], 8),
            Bitfield::from_bytes(&[0b1001_0000], 8),
            Bitfield::from_bytes(&[0b1110_0000], 8),
        ];
        // counts: 0 -> 3, 1 -> 2, 2 -> 1, 3 -> 2
        assert_eq!(ours.find_rarest(&others, |_| false), Some(2));
        assert_eq!(ours.find_rarest(&others, |i| i == 2), Some(1));
        assert_eq!(ours.find_rarest(&others, |i| i != 0), Some(0));
        assert_eq!(ours.find_rarest(&others, |_| true), None);

        let empty = Bitfield::from_piece(8);
        assert_eq!(empty.find_rarest(&others, |_| false), None);
        assert_eq!(ours.find_rarest(&[], |_| false), Some(0));
    }

    #[test]
    fn reserved_bits() {
        let reserved = Reserved::supported();
        assert!(reserved.supports_extended());
        assert!(!reserved.supports_dht());

        let raw: [u8; 8] = reserved.into();
        assert_eq!(raw, [0, 0, 0, 0, 0, 0x10, 0, 0]);

        let dht = Reserved::from([0, 0, 0, 0, 0, 0, 0, 0x01]);
        assert!(dht.supports_dht());
        assert!(!dht.supports_extended());
    }
}
