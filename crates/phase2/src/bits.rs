//! Bit-level access to packed table entries.
//!
//! Entries store their fields back to back, most significant bit first, with
//! no regard for byte boundaries.  Field `n` of an entry occupies bits
//! `[start, start + width)` counted from the top bit of byte 0.

use std::cmp::Ordering;

/// Returns the number of bytes needed to hold `bits` bits.
pub const fn bytes_for_bits(bits: usize) -> usize {
    bits.div_ceil(8)
}

/// Extracts `num_bits` bits (at most 64) of `bytes` starting at bit
/// `start_bit`, as an unsigned integer.
///
/// # Panics
///
/// Panics if the bit range extends past the end of `bytes`.
#[inline]
pub fn slice_u64(bytes: &[u8], start_bit: usize, num_bits: usize) -> u64 {
    debug_assert!(num_bits <= 64);
    if num_bits == 0 {
        return 0;
    }
    let first = start_bit / 8;
    let last = (start_bit + num_bits - 1) / 8;

    // At most 9 bytes, so this can't overflow.
    let mut acc: u128 = 0;
    for &byte in &bytes[first..=last] {
        acc = (acc << 8) | byte as u128;
    }
    let shift = (last - first + 1) * 8 - start_bit % 8 - num_bits;
    ((acc >> shift) & ((1u128 << num_bits) - 1)) as u64
}

/// Compares the bit strings of `a` and `b` that start at bit `begin_bits`
/// and run to the end of each slice, as unsigned big-endian numbers.
///
/// `a` and `b` must have the same length.
#[inline]
pub fn cmp_from_bit(a: &[u8], b: &[u8], begin_bits: usize) -> Ordering {
    debug_assert_eq!(a.len(), b.len());
    let first = begin_bits / 8;
    if first >= a.len() {
        return Ordering::Equal;
    }
    let mask = 0xffu8 >> (begin_bits % 8);
    (a[first] & mask)
        .cmp(&(b[first] & mask))
        .then_with(|| a[first + 1..].cmp(&b[first + 1..]))
}

/// Compares the first `end_bits` bits of `a` and `b` as unsigned big-endian
/// numbers.
///
/// `a` and `b` must have the same length, at least `end_bits` bits.
#[inline]
pub fn cmp_before_bit(a: &[u8], b: &[u8], end_bits: usize) -> Ordering {
    debug_assert_eq!(a.len(), b.len());
    let full = end_bits / 8;
    let rest = end_bits % 8;
    a[..full].cmp(&b[..full]).then_with(|| {
        if rest == 0 {
            return Ordering::Equal;
        }
        let mask = !(0xffu8 >> rest);
        (a[full] & mask).cmp(&(b[full] & mask))
    })
}

/// Packs fields most significant bit first into a fixed-width entry.
///
/// The output is zeroed when the writer is created, so any bits after the
/// last field stay zero.
pub struct EntryWriter<'a> {
    out: &'a mut [u8],
    bit: usize,
}

impl<'a> EntryWriter<'a> {
    pub fn new(out: &'a mut [u8]) -> Self {
        out.fill(0);
        Self { out, bit: 0 }
    }

    /// Appends the low `num_bits` bits of `value`.
    ///
    /// # Panics
    ///
    /// Panics if the field does not fit in the remaining space.  A misfit
    /// means the entry width and the field widths disagree, which no caller
    /// can recover from.
    pub fn append(&mut self, value: u64, num_bits: usize) -> &mut Self {
        assert!(
            self.bit + num_bits <= self.out.len() * 8,
            "{num_bits}-bit field at bit {} overflows a {}-byte entry",
            self.bit,
            self.out.len()
        );
        debug_assert!(
            num_bits >= 64 || value >> num_bits == 0,
            "value {value} does not fit in {num_bits} bits"
        );

        let mut remaining = num_bits;
        while remaining > 0 {
            let byte = self.bit / 8;
            let free = 8 - self.bit % 8;
            let take = free.min(remaining);
            let chunk = (value >> (remaining - take)) & ((1u64 << take) - 1);
            self.out[byte] |= (chunk as u8) << (free - take);
            self.bit += take;
            remaining -= take;
        }
        self
    }

    /// Number of bits written so far.
    pub fn bits(&self) -> usize {
        self.bit
    }
}
