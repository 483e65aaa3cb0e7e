//! A fixed-width, MSB-first bit array used for piece/block ownership and
//! availability tracking.
//!
//! Bit 0 of the field is the `0x80` bit of byte 0, bit 1 is `0x40`, and so
//! on — this is the wire format BitTorrent's `bitfield` message uses, so a
//! [`Bitfield`]'s raw bytes ([`Bitfield::as_bytes`]) are exactly what goes
//! on (or comes off) the wire.
//!
//! This is deliberately its own small bit-vector rather than a wrapper
//! around a general-purpose one: the effective length (in bits) and the
//! backing array length (in bytes, rounded up) are tracked separately, and
//! every bulk operation needs to agree on effective length while still
//! operating byte-wise for speed. That's exactly the shape of the
//! reference implementation this module is grounded on.

use crate::error::{Error, Result};

const BITS_PER_BYTE: usize = 8;

/// A fixed-width bit array, MSB-first within each byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
    /// The number of logical bits this field represents. May be smaller
    /// than `bytes.len() * 8` if the length isn't a multiple of 8, in
    /// which case the trailing padding bits are always 0 and never
    /// reported by any operation.
    len: usize,
}

impl Bitfield {
    /// Creates a new bitfield of `len` bits, all initially clear.
    pub fn new(len: usize) -> Self {
        let byte_len = (len + BITS_PER_BYTE - 1) / BITS_PER_BYTE;
        Self {
            bytes: vec![0; byte_len],
            len,
        }
    }

    /// Wraps raw MSB-first bytes as a bitfield of the given effective
    /// length (as received in a peer's `bitfield` message payload).
    ///
    /// Fails with [`Error::Protocol`] if `bytes` is shorter than
    /// `ceil(len / 8)`.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self> {
        let expected_byte_len = (len + BITS_PER_BYTE - 1) / BITS_PER_BYTE;
        if bytes.len() != expected_byte_len {
            return Err(Error::Protocol(format!(
                "bitfield has {} bytes, expected {}",
                bytes.len(),
                expected_byte_len
            )));
        }
        Ok(Self {
            bytes: bytes.to_vec(),
            len,
        })
    }

    /// The number of logical bits in this field.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The raw MSB-first bytes backing this field, as sent on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn index(&self, index: usize) -> (usize, u32) {
        assert!(
            index < self.len,
            "bitfield index {} out of bounds (len {})",
            index,
            self.len
        );
        (index / BITS_PER_BYTE, (index % BITS_PER_BYTE) as u32)
    }

    /// Sets the bit at `index` to 1.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`; out-of-range access is a fatal
    /// programming error.
    pub fn set(&mut self, index: usize) {
        let (byte_index, bit_index) = self.index(index);
        self.bytes[byte_index] |= 0x80u8 >> bit_index;
    }

    /// Clears the bit at `index` to 0.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`.
    pub fn clear(&mut self, index: usize) {
        let (byte_index, bit_index) = self.index(index);
        self.bytes[byte_index] &= !(0x80u8 >> bit_index);
    }

    /// Returns the bit at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`.
    pub fn get(&self, index: usize) -> bool {
        let (byte_index, bit_index) = self.index(index);
        (self.bytes[byte_index] << bit_index) & 0x80 != 0
    }

    /// Counts the number of bits equal to `value`.
    pub fn count(&self, value: bool) -> usize {
        let full_byte = if value { 0xFFu8 } else { 0x00u8 };
        let mut count = 0;
        let full_bytes = self.len / BITS_PER_BYTE;
        for &byte in &self.bytes[..full_bytes] {
            if byte == full_byte {
                count += BITS_PER_BYTE;
            } else {
                count += (0..BITS_PER_BYTE)
                    .filter(|bit| (byte << bit) & 0x80 != 0 == value)
                    .count();
            }
        }
        // the tail, if len isn't a multiple of 8: iterate only the logical
        // bits, never the zero-padded remainder of the last byte
        for index in full_bytes * BITS_PER_BYTE..self.len {
            if self.get(index) == value {
                count += 1;
            }
        }
        count
    }

    /// Returns the smallest index `i >= start` with `get(i) == value`, or
    /// `self.len()` if there is no such index.
    ///
    /// Whole bytes that are already saturated at `value` are skipped
    /// without inspecting individual bits, keeping this O(n / 8) in the
    /// common case rather than O(n).
    pub fn first_index(&self, start: usize, value: bool) -> usize {
        if start >= self.len {
            return self.len;
        }

        let skip_byte = if value { 0x00u8 } else { 0xFFu8 };

        let (mut byte_index, mut bit_index) = self.index(start);
        while byte_index < self.bytes.len() {
            if self.bytes[byte_index] != skip_byte {
                while bit_index < BITS_PER_BYTE as u32 {
                    let candidate = byte_index * BITS_PER_BYTE + bit_index as usize;
                    if candidate >= self.len {
                        return self.len;
                    }
                    if ((self.bytes[byte_index] << bit_index) & 0x80 != 0) == value {
                        return candidate;
                    }
                    bit_index += 1;
                }
            }
            bit_index = 0;
            byte_index += 1;
        }

        self.len
    }

    fn check_operand(&self, other: &Bitfield) -> Result<()> {
        if self.len != other.len || self.bytes.len() != other.bytes.len() {
            return Err(Error::Protocol(format!(
                "bitfield operands have different lengths ({} vs {})",
                self.len, other.len
            )));
        }
        Ok(())
    }

    /// Bitwise AND of two same-length bitfields.
    pub fn and(&self, other: &Bitfield) -> Result<Bitfield> {
        self.check_operand(other)?;
        let bytes = self
            .bytes
            .iter()
            .zip(&other.bytes)
            .map(|(a, b)| a & b)
            .collect();
        Ok(Bitfield {
            bytes,
            len: self.len,
        })
    }

    /// Bitwise OR of two same-length bitfields.
    pub fn or(&self, other: &Bitfield) -> Result<Bitfield> {
        self.check_operand(other)?;
        let bytes = self
            .bytes
            .iter()
            .zip(&other.bytes)
            .map(|(a, b)| a | b)
            .collect();
        Ok(Bitfield {
            bytes,
            len: self.len,
        })
    }

    /// Bitwise XOR of two same-length bitfields.
    pub fn xor(&self, other: &Bitfield) -> Result<Bitfield> {
        self.check_operand(other)?;
        let bytes = self
            .bytes
            .iter()
            .zip(&other.bytes)
            .map(|(a, b)| a ^ b)
            .collect();
        Ok(Bitfield {
            bytes,
            len: self.len,
        })
    }

    /// Bitwise AND-NOT (`self & !other`) of two same-length bitfields.
    pub fn and_not(&self, other: &Bitfield) -> Result<Bitfield> {
        self.check_operand(other)?;
        let bytes = self
            .bytes
            .iter()
            .zip(&other.bytes)
            .map(|(a, b)| a & !b)
            .collect();
        Ok(Bitfield {
            bytes,
            len: self.len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_set_matches_wire_layout() {
        let mut b = Bitfield::new(896);
        b.set(0);
        assert_eq!(b.as_bytes()[0], 0x80);
        b.set(5);
        assert_eq!(b.as_bytes()[0], 0x84);
        b.set(7);
        assert_eq!(b.as_bytes()[0], 0x85);
        b.set(8);
        assert_eq!(b.as_bytes()[1], 0x80);
        b.set(125);
        assert_eq!(b.as_bytes()[15], 0x04);
    }

    #[test]
    fn test_first_index() {
        let mut b = Bitfield::new(896);
        b.set(2);
        b.set(5);
        assert_eq!(b.first_index(0, true), 2);
        assert_eq!(b.first_index(3, true), 5);
        assert_eq!(b.first_index(2, false), 3);

        b.set(125);
        b.set(127);
        assert_eq!(b.first_index(6, true), 125);
        assert_eq!(b.first_index(126, true), 127);
        assert_eq!(b.first_index(125, false), 126);
    }

    #[test]
    fn test_first_index_saturated() {
        let mut b = Bitfield::new(16);
        for i in 0..16 {
            b.set(i);
        }
        assert_eq!(b.first_index(0, false), b.len());
    }

    #[test]
    fn test_set_get_clear_roundtrip() {
        let mut b = Bitfield::new(32);
        for i in 0..32 {
            assert!(!b.get(i));
        }
        b.set(10);
        assert!(b.get(10));
        b.clear(10);
        assert!(!b.get(10));
    }

    #[test]
    fn test_count() {
        let mut b = Bitfield::new(20);
        b.set(0);
        b.set(3);
        b.set(19);
        assert_eq!(b.count(true), 3);
        assert_eq!(b.count(false), 17);
    }

    #[test]
    fn test_bulk_ops_agree_bitwise() {
        let mut a = Bitfield::new(20);
        let mut b = Bitfield::new(20);
        a.set(0);
        a.set(5);
        b.set(5);
        b.set(6);

        let and = a.and(&b).unwrap();
        let or = a.or(&b).unwrap();
        let xor = a.xor(&b).unwrap();
        let and_not = a.and_not(&b).unwrap();

        for i in 0..20 {
            assert_eq!(and.get(i), a.get(i) && b.get(i), "and at {}", i);
            assert_eq!(or.get(i), a.get(i) || b.get(i), "or at {}", i);
            assert_eq!(xor.get(i), a.get(i) != b.get(i), "xor at {}", i);
            assert_eq!(and_not.get(i), a.get(i) && !b.get(i), "and_not at {}", i);
        }
    }

    #[test]
    fn test_bulk_ops_reject_mismatched_length() {
        let a = Bitfield::new(20);
        let b = Bitfield::new(21);
        assert!(a.and(&b).is_err());
    }

    #[test]
    #[should_panic]
    fn test_out_of_bounds_is_fatal() {
        let b = Bitfield::new(8);
        b.get(8);
    }

    #[test]
    fn test_from_bytes_wrong_length_rejected() {
        assert!(Bitfield::from_bytes(&[0u8; 1], 9).is_err());
        assert!(Bitfield::from_bytes(&[0u8; 2], 9).is_ok());
    }
}
