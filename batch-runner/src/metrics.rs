//! Batch-runner counters on the `metrics` facade.
//!
//! The runner only increments; whichever recorder the host installs decides
//! where the numbers go.

pub mod names {
    pub const FILES_PROCESSED: &str = "ephys_batch_files_processed";
    pub const ROWS_EMITTED: &str = "ephys_batch_rows_emitted";
    pub const FAILURES: &str = "ephys_batch_failures";
}

/// Describes the runner's counters to the installed recorder.
pub fn describe() {
    metrics::describe_counter!(
        names::FILES_PROCESSED,
        metrics::Unit::Count,
        "Batch files fully processed"
    );
    metrics::describe_counter!(
        names::ROWS_EMITTED,
        metrics::Unit::Count,
        "Rows appended to the batch table"
    );
    metrics::describe_counter!(
        names::FAILURES,
        metrics::Unit::Count,
        "Analysis units that ended in an error row"
    );
}
