//! Backpropagation metrics.
//!
//! Names of the counters this crate maintains via [`metrics`] crate
//! interfaces, next to the disk metrics of [`plotkit_storage::metrics`].
use ::metrics::{describe_counter, Unit};

/// Total number of table entries dropped as unreachable from table 7.
pub const ENTRIES_DROPPED: &str = "backprop.entries_dropped";

/// Total number of table entries kept.
pub const ENTRIES_KEPT: &str = "backprop.entries_kept";

/// Total number of sort buckets spilled to scratch files.
pub const SORT_SPILLS: &str = "sort.total_spills";

/// Total number of sort buckets loaded back and sorted.
pub const SORT_BUCKETS_LOADED: &str = "sort.total_buckets_loaded";

/// Adds descriptions for the metrics we expose.
pub(crate) fn describe_backprop_metrics() {
    describe_counter!(
        ENTRIES_DROPPED,
        Unit::Count,
        "total number of table entries dropped"
    );
    describe_counter!(ENTRIES_KEPT, Unit::Count, "total number of table entries kept");
    describe_counter!(SORT_SPILLS, "total number of sort bucket spills");
    describe_counter!(
        SORT_BUCKETS_LOADED,
        "total number of sort buckets loaded back for sorting"
    );
}
