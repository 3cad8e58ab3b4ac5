//! Storage metrics.
//!
//! The constants defined in this module are the names of metrics that the
//! disks maintain via [`metrics`] crate interfaces.
use ::metrics::{describe_counter, describe_histogram, Unit};

/// Total number of scratch files created.
pub const FILES_CREATED: &str = "disk.total_files_created";

/// Total number of scratch files deleted.
pub const FILES_DELETED: &str = "disk.total_files_deleted";

/// Total number of successful disk writes.
pub const WRITES_SUCCESS: &str = "disk.total_writes_success";

/// Total number of failed disk writes.
pub const WRITES_FAILED: &str = "disk.total_writes_failed";

/// Total number of successful disk reads.
pub const READS_SUCCESS: &str = "disk.total_reads_success";

/// Total number of failed disk reads.
pub const READS_FAILED: &str = "disk.total_reads_failed";

/// Total number of bytes successfully written.
pub const TOTAL_BYTES_WRITTEN: &str = "disk.total_bytes_written";

/// Total number of bytes successfully read.
pub const TOTAL_BYTES_READ: &str = "disk.total_bytes_read";

/// Total number of truncations.
pub const TRUNCATES: &str = "disk.total_truncates";

/// Histogram of read latency.
pub const READ_LATENCY: &str = "disk.read_latency";

/// Histogram of write latency.
pub const WRITE_LATENCY: &str = "disk.write_latency";

/// Adds descriptions for the metrics we expose.
pub(crate) fn describe_disk_metrics() {
    describe_counter!(FILES_CREATED, "total number of scratch files created");
    describe_counter!(FILES_DELETED, "total number of scratch files deleted");
    describe_counter!(WRITES_SUCCESS, "total number of disk writes");
    describe_counter!(WRITES_FAILED, "total number of failed writes");
    describe_counter!(READS_SUCCESS, "total number of disk reads");
    describe_counter!(READS_FAILED, "total number of failed reads");
    describe_counter!(TRUNCATES, "total number of file truncations");

    describe_counter!(
        TOTAL_BYTES_WRITTEN,
        Unit::Bytes,
        "total number of bytes written to disk"
    );
    describe_counter!(
        TOTAL_BYTES_READ,
        Unit::Bytes,
        "total number of bytes read from disk"
    );

    describe_histogram!(READ_LATENCY, Unit::Seconds, "Read request latency");
    describe_histogram!(WRITE_LATENCY, Unit::Seconds, "Write request latency");
}
