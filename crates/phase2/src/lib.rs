//! Phase 2 of plotting: backpropagation.
//!
//! Phase 1 writes seven tables of fixed-width entries, where each entry of
//! table `i` refers to two entries of table `i - 1` by position.  Many of
//! those entries lead nowhere: nothing in table 7 depends on them.  This
//! crate removes them, renumbers the survivors densely and sorts tables 2
//! to 6 by position, working on tables far larger than memory with a fixed,
//! caller-provided memory budget.
//!
//! The entry point is [`run_backpropagation`].  The building blocks are
//! public too:
//!
//! - [`liveness::LivenessSet`] records which entries of a table are kept.
//! - [`rank::RankIndex`] maps old positions to compacted positions.
//! - [`streamer::TableStreamer`] reads a table in bounded chunks.
//! - [`sort::SortManager`] sorts entries that don't fit in memory.

use std::sync::Once;

pub mod backprop;
pub mod bits;
pub mod config;
pub mod entry_sizes;
pub mod error;
pub mod liveness;
pub mod metrics;
pub mod rank;
pub mod sort;
pub mod streamer;


pub use backprop::{run_backpropagation, TableSizes};
pub use config::BackpropConfig;
pub use entry_sizes::EntrySizes;
pub use error::Phase2Error;

/// Initializes storage and describes this crate's metrics.
///
/// Idempotent.  [`run_backpropagation`] calls it, so most callers never need
/// to.
pub fn init() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        plotkit_storage::init();
        crate::metrics::describe_backprop_metrics();
    });
}
