use chrono::Utc;
use tracing::{error, info};
use trek_core::{ProcessingRun, RunStats};
use trek_storage::ListingStore;

/// Appends one `csv_processing_history` row per processed export.
///
/// Recording is best effort: a failure is logged and reported as `false`, but
/// never undoes the batch it describes.
#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryRecorder;

impl HistoryRecorder {
    pub async fn record<S>(store: &mut S, filename: &str, stats: &RunStats) -> bool
    where
        S: ListingStore + ?Sized,
    {
        let run = ProcessingRun::from_stats(filename, stats, Utc::now().naive_utc());
        match store.record_run(&run).await {
            Ok(()) => {
                info!(
                    filename,
                    processed = run.processed_count,
                    inserted = run.inserted_count,
                    updated = run.updated_count,
                    "recorded processing history"
                );
                true
            }
            Err(err) => {
                error!(filename, error = %err, "recording processing history failed");
                false
            }
        }
    }
}
