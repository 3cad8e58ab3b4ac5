//! Fixed entry widths of the seven tables.

use serde::{Deserialize, Serialize};

use crate::bits::bytes_for_bits;
use crate::error::ConfigError;

/// Number of tables in a plot.
pub const NUM_TABLES: usize = 7;

/// Width in bits of the `offset` field: the second entry a table entry
/// refers to is `pos + offset`.
pub const OFFSET_SIZE: usize = 10;

/// Extra bits of `f` values beyond `k`, used by the table 1 layout.
pub const EXTRA_BITS: usize = 6;

/// Largest supported `k`.
pub const MAX_K: u8 = 50;

/// Smallest supported `k`.
pub const MIN_K: u8 = 1;

/// Byte width of the entries of each table, indexed by table number (index 0
/// is unused).
///
/// The widths must be large enough for every layout a table has during this
/// phase:
///
/// - table 1: opaque, any non-zero width;
/// - tables 2 to 6: `pos(k) | offset` on input and
///   `sort_key(k + 1) | pos(k) | offset` on output;
/// - table 7: `f7(k) | pos(k) | offset`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntrySizes([usize; NUM_TABLES + 1]);

impl EntrySizes {
    /// Returns the default widths for `k`: the largest size each table
    /// reaches after phase 1, so that a table can be rewritten on top of
    /// itself.
    pub fn new(k: u8) -> Self {
        let k = k as usize;
        let mut sizes = [0; NUM_TABLES + 1];
        // f1, x
        sizes[1] = bytes_for_bits(k + EXTRA_BITS + k);
        for size in &mut sizes[2..NUM_TABLES] {
            // sort_key, pos, offset or, in later phases, line_point, sort_key
            *size = bytes_for_bits((2 * k + 1 + OFFSET_SIZE).max((3 * k).saturating_sub(1)));
        }
        // f7, pos, offset or line_point, f7
        sizes[NUM_TABLES] = bytes_for_bits((2 * k + OFFSET_SIZE).max((3 * k).saturating_sub(1)));
        Self(sizes)
    }

    /// Uses explicit widths for tables 1 to 7.
    pub fn with_sizes(sizes: [usize; NUM_TABLES]) -> Self {
        let mut all = [0; NUM_TABLES + 1];
        all[1..].copy_from_slice(&sizes);
        Self(all)
    }

    /// Returns the entry width of `table` (1 to 7) in bytes.
    pub fn get(&self, table: usize) -> usize {
        debug_assert!((1..=NUM_TABLES).contains(&table));
        self.0[table]
    }

    /// Largest entry width over all tables.
    pub fn max(&self) -> usize {
        self.0[1..].iter().copied().max().unwrap_or(0)
    }

    /// Checks that every layout this phase reads or writes fits.
    pub fn validate(&self, k: u8) -> Result<(), ConfigError> {
        let k = k as usize;
        for table in 1..=NUM_TABLES {
            let needed_bits = match table {
                1 => 1,
                NUM_TABLES => 2 * k + OFFSET_SIZE,
                _ => 2 * k + 1 + OFFSET_SIZE,
            };
            let size = self.get(table);
            if size * 8 < needed_bits {
                return Err(ConfigError::EntryTooSmall {
                    table,
                    size,
                    needed_bits,
                });
            }
        }
        Ok(())
    }
}
