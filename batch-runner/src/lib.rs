//! Batch execution of registered analyses over many files.
//!
//! A batch is a list of [`BatchFile`]s (each a set of named channels backed
//! by a [`TraceSource`]) and a list of [`PipelineStep`]s (a registered
//! analysis, its parameters, and a trial/channel scope). The worker runs
//! the pipeline strictly sequentially on its own thread, reports progress
//! after every file, honours cooperative cancellation between files, and
//! turns every per-unit failure into a row-level diagnostic instead of
//! aborting. The result is a [`BatchTable`] with one row per unit,
//! serializable to CSV for downstream statistics.

pub mod metrics;
pub mod orchestrator;
pub mod source;
pub mod table;

pub use orchestrator::{
    BatchChannel, BatchFile, BatchHandle, PipelineStep, Progress, Scope, TrialScope, run, spawn,
};
pub use source::{MemoryTraceSource, TraceSource};
pub use table::{BatchRow, BatchTable};
