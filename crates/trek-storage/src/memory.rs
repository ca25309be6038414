//! In-memory [`ListingStore`] with the same uniqueness and commit semantics as
//! the Postgres store, plus fault injection for exercising failure paths.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use trek_core::{ContentFingerprint, ListingRecord, PersistedListing, ProcessingRun};

use crate::{
    ApplyIndex, DuplicateGroup, IndexedListing, IntegrityReport, ListingStore, StoreError,
    WriteOutcome,
};

#[derive(Debug, Clone)]
enum PendingWrite {
    Insert(PersistedListing),
    Update(PersistedListing),
}

#[derive(Debug, Default)]
pub struct MemoryListingStore {
    listings: Vec<PersistedListing>,
    pending: Vec<PendingWrite>,
    runs: Vec<ProcessingRun>,
    next_id: i64,
    batch_open: bool,
    commits: usize,
    closed: bool,
    conflicts: HashSet<String>,
    failures: HashMap<String, String>,
    history_failure: Option<String>,
    index_failure: Option<String>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an already-committed row, e.g. one written by an earlier run.
    pub fn seed(&mut self, listing: PersistedListing) {
        self.next_id = self.next_id.max(listing.id);
        self.listings.push(listing);
    }

    /// Makes inserts of `apply_link` fail with a uniqueness conflict, as if a
    /// concurrent writer had committed it after the index was loaded.
    pub fn inject_conflict(&mut self, apply_link: impl Into<String>) {
        self.conflicts.insert(apply_link.into());
    }

    /// Makes writes of `apply_link` fail with an infrastructure error.
    pub fn inject_failure(&mut self, apply_link: impl Into<String>, message: impl Into<String>) {
        self.failures.insert(apply_link.into(), message.into());
    }

    pub fn fail_history(&mut self, message: impl Into<String>) {
        self.history_failure = Some(message.into());
    }

    pub fn fail_index(&mut self, message: impl Into<String>) {
        self.index_failure = Some(message.into());
    }

    /// Committed listings, in insertion order.
    pub fn listings(&self) -> &[PersistedListing] {
        &self.listings
    }

    pub fn runs(&self) -> &[ProcessingRun] {
        &self.runs
    }

    pub fn commit_count(&self) -> usize {
        self.commits
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Resolves `id` against committed rows, then against this batch's own
    /// pending inserts.
    fn find_listing(&self, id: i64) -> Option<&PersistedListing> {
        self.listings.iter().find(|l| l.id == id).or_else(|| {
            self.pending.iter().find_map(|w| match w {
                PendingWrite::Insert(l) if l.id == id => Some(l),
                _ => None,
            })
        })
    }

    fn link_taken(&self, apply_link: &str) -> bool {
        self.listings.iter().any(|l| l.apply_link == apply_link)
            || self.pending.iter().any(|w| match w {
                PendingWrite::Insert(l) => l.apply_link == apply_link,
                PendingWrite::Update(_) => false,
            })
    }

    fn check_writable(&self, record: &ListingRecord) -> Option<WriteOutcome> {
        if self.closed {
            return Some(WriteOutcome::InfrastructureError("store is closed".into()));
        }
        if let Some(message) = self.failures.get(&record.apply_link) {
            return Some(WriteOutcome::InfrastructureError(message.clone()));
        }
        if record.position_title.trim().is_empty() || record.company.trim().is_empty() {
            return Some(WriteOutcome::ValidationError(
                "null value violates not-null constraint".into(),
            ));
        }
        None
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn load_apply_index(&mut self) -> Result<ApplyIndex, StoreError> {
        if let Some(message) = &self.index_failure {
            return Err(StoreError::Backend(message.clone()));
        }
        self.batch_open = true;
        Ok(self
            .listings
            .iter()
            .filter(|l| !l.apply_link.is_empty())
            .map(|l| {
                (
                    l.apply_link.clone(),
                    IndexedListing {
                        id: l.id,
                        content_hash: Some(l.content_hash.clone()),
                    },
                )
            })
            .collect())
    }

    async fn insert_listing(
        &mut self,
        record: &ListingRecord,
        fingerprint: &ContentFingerprint,
    ) -> WriteOutcome {
        if let Some(outcome) = self.check_writable(record) {
            return outcome;
        }
        if self.conflicts.contains(&record.apply_link) || self.link_taken(&record.apply_link) {
            return WriteOutcome::DuplicateKey;
        }

        self.batch_open = true;
        self.next_id += 1;
        let id = self.next_id;
        let mut listing = PersistedListing::from_record(id, record, Utc::now().naive_utc());
        listing.content_hash = fingerprint.to_string();
        self.pending.push(PendingWrite::Insert(listing));
        WriteOutcome::Inserted { id }
    }

    async fn update_listing(
        &mut self,
        id: i64,
        record: &ListingRecord,
        fingerprint: &ContentFingerprint,
    ) -> WriteOutcome {
        if let Some(outcome) = self.check_writable(record) {
            return outcome;
        }
        let Some(existing) = self.find_listing(id) else {
            return WriteOutcome::ValidationError(format!("listing {id} no longer exists"));
        };

        let now = Utc::now().naive_utc();
        let mut listing = PersistedListing::from_record(id, record, now);
        listing.apply_link = existing.apply_link.clone();
        listing.content_hash = fingerprint.to_string();
        listing.created_at = existing.created_at;
        listing.is_active = existing.is_active;
        self.batch_open = true;
        self.pending.push(PendingWrite::Update(listing));
        WriteOutcome::Updated { id }
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Backend("store is closed".into()));
        }
        if !self.batch_open {
            return Ok(());
        }
        // Applied in write order, so an update of a row inserted earlier in
        // the batch lands on that row.
        for write in self.pending.drain(..) {
            match write {
                PendingWrite::Insert(listing) => self.listings.push(listing),
                PendingWrite::Update(listing) => {
                    if let Some(slot) = self.listings.iter_mut().find(|l| l.id == listing.id) {
                        *slot = listing;
                    }
                }
            }
        }
        self.batch_open = false;
        self.commits += 1;
        Ok(())
    }

    async fn record_run(&mut self, run: &ProcessingRun) -> Result<(), StoreError> {
        self.commit().await?;
        if let Some(message) = &self.history_failure {
            return Err(StoreError::Backend(message.clone()));
        }
        self.runs.push(run.clone());
        self.commits += 1;
        Ok(())
    }

    async fn audit(&mut self, stale_cutoff: NaiveDateTime) -> Result<IntegrityReport, StoreError> {
        self.batch_open = true;
        let mut groups: BTreeMap<(Option<String>, Option<String>, Option<NaiveDateTime>), i64> =
            BTreeMap::new();
        for listing in &self.listings {
            let key = (
                listing.position_title.clone(),
                listing.company.clone(),
                listing.posting_date,
            );
            *groups.entry(key).or_default() += 1;
        }
        let duplicate_groups = groups
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|((position_title, company, posting_date), count)| DuplicateGroup {
                position_title,
                company,
                posting_date,
                count,
            })
            .collect();

        let missing_required = self
            .listings
            .iter()
            .filter(|l| l.position_title.is_none() || l.company.is_none() || l.posting_date.is_none())
            .map(|l| l.id)
            .collect();

        let stale_active = self
            .listings
            .iter()
            .filter(|l| l.is_active && l.last_seen_at < stale_cutoff)
            .count() as i64;

        Ok(IntegrityReport {
            duplicate_groups,
            missing_required,
            stale_active,
        })
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        self.pending.clear();
        self.batch_open = false;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};
    use trek_core::JobCategory;

    fn record(apply_link: &str) -> ListingRecord {
        ListingRecord {
            source_row: 1,
            position_title: "Data Analyst".into(),
            posting_date: NaiveDate::from_ymd_opt(2025, 4, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            apply_link: apply_link.into(),
            work_model: None,
            location: None,
            company: "Initech".into(),
            company_size: None,
            company_industry: None,
            salary: None,
            qualifications: None,
            h1b_sponsored: false,
            is_new_grad: true,
            job_category: JobCategory::DataAnalyst,
        }
    }

    #[tokio::test]
    async fn writes_are_invisible_until_commit() {
        let mut store = MemoryListingStore::new();
        let r = record("https://jobs/1");
        let outcome = store.insert_listing(&r, &r.fingerprint()).await;
        assert_eq!(outcome, WriteOutcome::Inserted { id: 1 });
        assert!(store.listings().is_empty());
        assert_eq!(store.pending_count(), 1);

        store.commit().await.unwrap();
        assert_eq!(store.listings().len(), 1);
        assert!(store.listings()[0].is_active);
    }

    #[tokio::test]
    async fn uncommitted_insert_still_holds_the_unique_key() {
        let mut store = MemoryListingStore::new();
        let r = record("https://jobs/1");
        store.insert_listing(&r, &r.fingerprint()).await;
        let second = store.insert_listing(&r, &r.fingerprint()).await;
        assert_eq!(second, WriteOutcome::DuplicateKey);
    }

    #[tokio::test]
    async fn close_discards_pending_writes() {
        let mut store = MemoryListingStore::new();
        let r = record("https://jobs/1");
        store.insert_listing(&r, &r.fingerprint()).await;
        store.close().await.unwrap();
        assert!(store.is_closed());
        assert!(store.listings().is_empty());
        assert!(store.commit().await.is_err());
    }

    #[tokio::test]
    async fn update_resolves_a_row_inserted_earlier_in_the_batch() {
        let mut store = MemoryListingStore::new();
        let first = record("https://jobs/1");
        let WriteOutcome::Inserted { id } = store.insert_listing(&first, &first.fingerprint()).await else {
            panic!("insert failed");
        };

        let mut revised = first.clone();
        revised.salary = Some("$90k".into());
        let outcome = store.update_listing(id, &revised, &revised.fingerprint()).await;
        assert_eq!(outcome, WriteOutcome::Updated { id });

        store.commit().await.unwrap();
        assert_eq!(store.listings().len(), 1);
        assert_eq!(store.listings()[0].salary.as_deref(), Some("$90k"));
        assert_eq!(store.listings()[0].content_hash, revised.fingerprint().to_string());
    }

    #[tokio::test]
    async fn record_run_commits_the_batch_before_writing_history() {
        let mut store = MemoryListingStore::new();
        let r = record("https://jobs/1");
        store.load_apply_index().await.unwrap();
        store.insert_listing(&r, &r.fingerprint()).await;
        store.fail_history("relation is read-only");

        let run = ProcessingRun::from_stats("x.csv", &Default::default(), Utc::now().naive_utc());
        assert!(store.record_run(&run).await.is_err());
        assert_eq!(store.listings().len(), 1);
        assert_eq!(store.commit_count(), 1);
        assert!(store.runs().is_empty());
    }

    #[tokio::test]
    async fn each_transaction_counts_one_commit() {
        let mut store = MemoryListingStore::new();
        let r = record("https://jobs/1");
        store.load_apply_index().await.unwrap();
        store.insert_listing(&r, &r.fingerprint()).await;
        store.commit().await.unwrap();
        assert_eq!(store.commit_count(), 1);

        let run = ProcessingRun::from_stats("x.csv", &Default::default(), Utc::now().naive_utc());
        store.record_run(&run).await.unwrap();
        assert_eq!(store.commit_count(), 2);
        assert_eq!(store.runs().len(), 1);
    }

    #[tokio::test]
    async fn audit_counts_stale_active_rows() {
        let mut store = MemoryListingStore::new();
        let now = Utc::now().naive_utc();
        let mut fresh = PersistedListing::from_record(1, &record("https://jobs/1"), now);
        fresh.position_title = Some("Fresh".into());
        let mut stale = PersistedListing::from_record(2, &record("https://jobs/2"), now - Duration::hours(72));
        stale.position_title = Some("Stale".into());
        let mut inactive = PersistedListing::from_record(3, &record("https://jobs/3"), now - Duration::hours(72));
        inactive.position_title = Some("Closed".into());
        inactive.is_active = false;
        store.seed(fresh);
        store.seed(stale);
        store.seed(inactive);

        let report = store.audit(now - Duration::hours(48)).await.unwrap();
        assert_eq!(report.stale_active, 1);
        assert!(report.duplicate_groups.is_empty());
        assert!(!report.is_clean());
    }
}
