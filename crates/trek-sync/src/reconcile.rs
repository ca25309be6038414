use tracing::{debug, info, info_span, warn, Instrument};
use trek_core::{ContentFingerprint, DuplicatePolicy, ListingRecord, RunStats};
use trek_ingest::NormalizedBatch;
use trek_storage::{ApplyIndex, IndexedListing, ListingStore, WriteOutcome};

use crate::SyncError;

/// What the reconciler decided for one record before touching the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Insert,
    Skip,
    Update { id: i64 },
}

/// Merges normalized batches into a [`ListingStore`], keyed by apply link.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler {
    policy: DuplicatePolicy,
}

impl Reconciler {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    pub fn decide(
        &self,
        index: &ApplyIndex,
        record: &ListingRecord,
        fingerprint: &ContentFingerprint,
    ) -> Decision {
        match (index.get(&record.apply_link), self.policy) {
            (None, _) => Decision::Insert,
            (Some(_), DuplicatePolicy::SkipDuplicates) => Decision::Skip,
            (Some(known), DuplicatePolicy::UpdateOnFingerprintChange) => {
                if known.content_hash.as_deref() == Some(fingerprint.as_str()) {
                    Decision::Skip
                } else {
                    Decision::Update { id: known.id }
                }
            }
        }
    }

    /// Writes every record of `batch` and commits once at the end.
    ///
    /// Only a failure to load the apply index or to commit aborts the batch;
    /// per-row store failures are counted as errors and the loop carries on.
    pub async fn reconcile<S>(&self, store: &mut S, batch: &NormalizedBatch) -> Result<RunStats, SyncError>
    where
        S: ListingStore + ?Sized,
    {
        let span = info_span!(
            "reconcile",
            source = %batch.source_name,
            category = %batch.category,
            policy = %self.policy,
        );
        self.reconcile_inner(store, batch).instrument(span).await
    }

    async fn reconcile_inner<S>(&self, store: &mut S, batch: &NormalizedBatch) -> Result<RunStats, SyncError>
    where
        S: ListingStore + ?Sized,
    {
        let mut index = store.load_apply_index().await?;
        debug!(known_links = index.len(), "loaded apply-link index");

        let mut stats = RunStats {
            processed: batch.total_rows(),
            errors: batch.rejected.len(),
            ..RunStats::default()
        };

        for record in &batch.records {
            let fingerprint = record.fingerprint();
            match self.decide(&index, record, &fingerprint) {
                Decision::Skip => {
                    debug!(row = record.source_row, apply_link = %record.apply_link, "apply link already stored");
                    stats.skipped += 1;
                }
                Decision::Insert => {
                    let outcome = store.insert_listing(record, &fingerprint).await;
                    if let WriteOutcome::Inserted { id } = outcome {
                        index.insert(
                            record.apply_link.clone(),
                            IndexedListing {
                                id,
                                content_hash: Some(fingerprint.to_string()),
                            },
                        );
                    }
                    tally(&mut stats, record, outcome);
                }
                Decision::Update { id } => {
                    let outcome = store.update_listing(id, record, &fingerprint).await;
                    if let WriteOutcome::Updated { .. } = outcome {
                        index.refresh_hash(&record.apply_link, &fingerprint);
                    }
                    tally(&mut stats, record, outcome);
                }
            }
        }

        store.commit().await?;
        debug_assert!(stats.is_balanced());
        info!(
            processed = stats.processed,
            inserted = stats.inserted,
            updated = stats.updated,
            skipped = stats.skipped,
            errors = stats.errors,
            "batch committed"
        );
        Ok(stats)
    }
}

fn tally(stats: &mut RunStats, record: &ListingRecord, outcome: WriteOutcome) {
    match outcome {
        WriteOutcome::Inserted { id } => {
            debug!(row = record.source_row, id, "inserted listing");
            stats.inserted += 1;
        }
        WriteOutcome::Updated { id } => {
            debug!(row = record.source_row, id, "updated listing");
            stats.updated += 1;
        }
        WriteOutcome::DuplicateKey => {
            debug!(row = record.source_row, apply_link = %record.apply_link, "unique conflict on insert");
            stats.skipped += 1;
        }
        WriteOutcome::ValidationError(message) | WriteOutcome::InfrastructureError(message) => {
            warn!(
                row = record.source_row,
                position_title = %record.position_title,
                company = %record.company,
                error = %message,
                "listing write failed"
            );
            stats.errors += 1;
        }
    }
}
