//! Dense per-entry liveness marks.

/// One bit per entry of a table, set for entries that must be kept.
///
/// Bits are packed 64 to a word, bit `i` of the set being bit `i % 64` of
/// word `i / 64`.  Bits past [`len`](Self::len) in the last word are always
/// clear, so whole-word population counts never need masking.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LivenessSet {
    words: Vec<u64>,
    len: u64,
}

impl LivenessSet {
    /// Returns a set of `len` clear bits.
    pub fn new(len: u64) -> Self {
        Self {
            words: vec![0; len.div_ceil(64) as usize],
            len,
        }
    }

    /// Returns a set of `len` bits that are all set.
    pub fn all_live(len: u64) -> Self {
        let mut set = Self {
            words: vec![u64::MAX; len.div_ceil(64) as usize],
            len,
        };
        let tail = len % 64;
        if tail != 0 {
            if let Some(last) = set.words.last_mut() {
                *last = (1 << tail) - 1;
            }
        }
        set
    }

    /// Number of bits (live or not).
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Marks entry `index` live.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range, which means an entry references a
    /// position past the end of the table below it.
    #[inline]
    pub fn set(&mut self, index: u64) {
        assert!(
            index < self.len,
            "position {index} is out of range for a table of {} entries",
            self.len
        );
        self.words[(index / 64) as usize] |= 1 << (index % 64);
    }

    /// Returns whether entry `index` is live.
    #[inline]
    pub fn get(&self, index: u64) -> bool {
        debug_assert!(index < self.len);
        self.words[(index / 64) as usize] & (1 << (index % 64)) != 0
    }

    /// Number of live entries.
    pub fn count_live(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    /// The packed words, for building a [`RankIndex`](crate::rank::RankIndex).
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Indexes of the live entries, in ascending order.
    pub fn iter_live(&self) -> impl Iterator<Item = u64> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(word_index, &word)| {
                let base = word_index as u64 * 64;
                let mut rest = word;
                std::iter::from_fn(move || {
                    if rest == 0 {
                        None
                    } else {
                        let bit = rest.trailing_zeros() as u64;
                        rest &= rest - 1;
                        Some(base + bit)
                    }
                })
            })
    }
}
