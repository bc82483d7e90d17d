//! Background work: the bulk analysis coordinator, progress reporting,
//! and backfill jobs.

pub mod analyzer;
pub mod backfill;
pub mod progress;

pub use analyzer::{AnalyzeOptions, BulkOptions, BulkReport, GameAnalyzer};
pub use backfill::BackfillReport;
pub use progress::{CancelCheck, ProgressTracker};
