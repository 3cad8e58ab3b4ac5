//! Parameters of a backpropagation run.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::entry_sizes::{EntrySizes, MAX_K, MIN_K};
use crate::error::ConfigError;

/// Configuration for [`run_backpropagation`](crate::run_backpropagation).
///
/// The memory budget is not part of the configuration: it is the length of
/// the buffer passed to the run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackpropConfig {
    /// Plot size parameter.  Positions and `f7` values are `k` bits wide.
    pub k: u8,

    /// Directory for the sort's scratch files.  It must exist.
    pub tmp_dir: PathBuf,

    /// Name of the plot.  Scratch files for table `i` are named after
    /// `<filename>.p2.t<i>`.
    pub filename: String,

    /// Number of sort buckets.  Must be `1 << log_num_buckets`.
    pub num_buckets: u32,

    /// Number of position bits that select a sort bucket.  At most `k`.
    pub log_num_buckets: u32,

    /// Entry widths of the tables, if they differ from
    /// [`EntrySizes::new(k)`](EntrySizes::new).
    #[serde(default)]
    pub entry_sizes: Option<EntrySizes>,
}

impl BackpropConfig {
    /// Returns a configuration with `2^log_num_buckets` buckets and the
    /// default entry widths for `k`.
    pub fn new(
        k: u8,
        tmp_dir: impl Into<PathBuf>,
        filename: impl Into<String>,
        log_num_buckets: u32,
    ) -> Self {
        Self {
            k,
            tmp_dir: tmp_dir.into(),
            filename: filename.into(),
            num_buckets: 1u32.checked_shl(log_num_buckets).unwrap_or(0),
            log_num_buckets,
            entry_sizes: None,
        }
    }

    /// Entry widths in effect for this run.
    pub fn entry_sizes(&self) -> EntrySizes {
        self.entry_sizes.unwrap_or_else(|| EntrySizes::new(self.k))
    }

    /// Scratch file prefix for the sort of `table`.
    pub(crate) fn scratch_prefix(&self, table: usize) -> String {
        format!("{}.p2.t{}", self.filename, table)
    }

    /// Smallest memory budget that lets every table be processed: half of it
    /// must hold one entry of the widest table, and the rest one entry per
    /// sort bucket.
    pub fn min_memory(&self) -> usize {
        2 * self.entry_sizes().max() * self.num_buckets.max(1) as usize
    }

    /// Checks the configuration for a run with `memory_len` bytes of
    /// memory.
    pub fn validate(&self, memory_len: usize) -> Result<(), ConfigError> {
        if !(MIN_K..=MAX_K).contains(&self.k) {
            return Err(ConfigError::InvalidK {
                k: self.k,
                min: MIN_K,
                max: MAX_K,
            });
        }
        if 1u32.checked_shl(self.log_num_buckets) != Some(self.num_buckets) {
            return Err(ConfigError::BucketMismatch {
                num_buckets: self.num_buckets,
                log_num_buckets: self.log_num_buckets,
            });
        }
        if self.log_num_buckets > self.k as u32 {
            return Err(ConfigError::TooManyBuckets {
                log_num_buckets: self.log_num_buckets,
                k: self.k,
            });
        }
        self.entry_sizes().validate(self.k)?;

        let needed = self.min_memory();
        if memory_len < needed {
            return Err(ConfigError::MemoryTooSmall {
                available: memory_len,
                needed,
            });
        }
        Ok(())
    }
}
