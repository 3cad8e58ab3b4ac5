//! Maps sparse live positions to dense compacted positions.
//!
//! [`RankIndex`] is a two-level cumulative popcount directory built once over
//! a finished [`LivenessSet`]:
//!
//! - **L1**: absolute number of live bits before every 128-word (8192-bit)
//!   superblock, as `u64`, so tables larger than 2^32 entries work.
//! - **L2**: number of live bits before every 8-word (512-bit) block,
//!   relative to its superblock, as `u16`.
//!
//! `rank(p)` is then `l1[w / 128] + l2[w / 8]` plus the popcount of at most
//! seven whole words and one masked word, where `w = p / 64`.  The directory
//! adds about 3.3% to the size of the liveness set.

use crate::liveness::LivenessSet;

/// Words per L1 superblock.
const L1_WORDS: usize = 128;

/// Words per L2 block.
const L2_WORDS: usize = 8;

/// Rank directory over a borrowed [`LivenessSet`].
#[derive(Clone, Debug)]
pub struct RankIndex<'a> {
    live: &'a LivenessSet,
    l1: Vec<u64>,
    l2: Vec<u16>,
}

impl<'a> RankIndex<'a> {
    pub fn new(live: &'a LivenessSet) -> Self {
        let words = live.words();
        let mut l1 = Vec::with_capacity(words.len().div_ceil(L1_WORDS));
        let mut l2 = Vec::with_capacity(words.len().div_ceil(L2_WORDS));

        let mut absolute = 0u64;
        for superblock in words.chunks(L1_WORDS) {
            l1.push(absolute);
            let mut relative = 0u16;
            for block in superblock.chunks(L2_WORDS) {
                l2.push(relative);
                let ones: u32 = block.iter().map(|w| w.count_ones()).sum();
                relative += ones as u16;
                absolute += ones as u64;
            }
        }

        Self { live, l1, l2 }
    }

    /// Returns the number of live positions before `pos`.
    #[inline]
    pub fn rank(&self, pos: u64) -> u64 {
        debug_assert!(pos <= self.live.len());
        let words = self.live.words();
        let word = (pos / 64) as usize;
        if word >= words.len() {
            return self.total();
        }

        let block = word / L2_WORDS;
        let mut count = self.l1[word / L1_WORDS] + self.l2[block] as u64;
        for w in &words[block * L2_WORDS..word] {
            count += w.count_ones() as u64;
        }
        let mask = (1u64 << (pos % 64)) - 1;
        count + (words[word] & mask).count_ones() as u64
    }

    /// Number of live positions overall.
    pub fn total(&self) -> u64 {
        match (self.l1.last(), self.live.words().len()) {
            (None, _) => 0,
            (Some(&last), len) => {
                let start = (len - 1) / L1_WORDS * L1_WORDS;
                last + self.live.words()[start..]
                    .iter()
                    .map(|w| w.count_ones() as u64)
                    .sum::<u64>()
            }
        }
    }

    /// Translates a `(pos, offset)` reference into the compacted position
    /// space, keeping the convention that the second referenced entry is at
    /// `pos + offset`.
    ///
    /// Both `pos` and `pos + offset` must be live.
    #[inline]
    pub fn lookup(&self, pos: u64, offset: u64) -> (u64, u64) {
        debug_assert!(self.live.get(pos), "position {pos} is not live");
        debug_assert!(
            self.live.get(pos + offset),
            "position {} is not live",
            pos + offset
        );
        let new_pos = self.rank(pos);
        let new_offset = self.rank(pos + offset) - new_pos;
        (new_pos, new_offset)
    }
}
