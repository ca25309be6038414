//! Listing persistence: the store seam, Postgres and in-memory backends, and
//! connection retry.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use trek_core::{ContentFingerprint, ListingRecord, ProcessingRun};

pub mod memory;
pub mod postgres;

pub use memory::MemoryListingStore;
pub use postgres::{connect_with_retry, migrate, PgListingStore};

pub const CRATE_NAME: &str = "trek-storage";

/// Result of a single listing write, as seen by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted { id: i64 },
    Updated { id: i64 },
    /// The apply link already exists in the store. The write was rolled back.
    DuplicateKey,
    /// The row violated a store constraint other than apply-link uniqueness.
    ValidationError(String),
    InfrastructureError(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not connect to the listings database after {attempts} attempts: {source}")]
    Connect {
        attempts: usize,
        #[source]
        source: sqlx::Error,
    },
    #[error("listings database query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("running listings migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("listings store unavailable: {0}")]
    Backend(String),
}

/// Stored identity of a listing, keyed by apply link in [`ApplyIndex`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedListing {
    pub id: i64,
    pub content_hash: Option<String>,
}

/// Apply links known to the current batch, in the order they became known.
///
/// Loaded once from the store, then grown as the batch inserts so that a
/// repeated apply link later in the same batch is seen as a duplicate.
#[derive(Debug, Clone, Default)]
pub struct ApplyIndex {
    order: Vec<String>,
    entries: HashMap<String, IndexedListing>,
}

impl ApplyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `apply_link`. Returns `false` and leaves the index unchanged when
    /// the link was already known.
    pub fn insert(&mut self, apply_link: impl Into<String>, listing: IndexedListing) -> bool {
        let apply_link = apply_link.into();
        if self.entries.contains_key(&apply_link) {
            return false;
        }
        self.order.push(apply_link.clone());
        self.entries.insert(apply_link, listing);
        true
    }

    /// Replaces the stored hash of a known link, e.g. after an in-place update.
    pub fn refresh_hash(&mut self, apply_link: &str, content_hash: &ContentFingerprint) {
        if let Some(entry) = self.entries.get_mut(apply_link) {
            entry.content_hash = Some(content_hash.to_string());
        }
    }

    pub fn get(&self, apply_link: &str) -> Option<&IndexedListing> {
        self.entries.get(apply_link)
    }

    pub fn contains(&self, apply_link: &str) -> bool {
        self.entries.contains_key(apply_link)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl FromIterator<(String, IndexedListing)> for ApplyIndex {
    fn from_iter<I: IntoIterator<Item = (String, IndexedListing)>>(iter: I) -> Self {
        let mut index = ApplyIndex::new();
        for (apply_link, listing) in iter {
            index.insert(apply_link, listing);
        }
        index
    }
}

/// Stored listings sharing one (title, company, posting date) triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub position_title: Option<String>,
    pub company: Option<String>,
    pub posting_date: Option<NaiveDateTime>,
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub duplicate_groups: Vec<DuplicateGroup>,
    /// Ids of listings with a null title, company or posting date.
    pub missing_required: Vec<i64>,
    pub stale_active: i64,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.duplicate_groups.is_empty() && self.missing_required.is_empty() && self.stale_active == 0
    }
}

/// Persistence seam for one batch. Writes are buffered until [`commit`], and a
/// failed write never poisons the writes around it.
///
/// [`commit`]: ListingStore::commit
#[async_trait]
pub trait ListingStore: Send {
    async fn load_apply_index(&mut self) -> Result<ApplyIndex, StoreError>;

    /// Inserts an active listing with created, updated and last-seen set to now.
    async fn insert_listing(
        &mut self,
        record: &ListingRecord,
        fingerprint: &ContentFingerprint,
    ) -> WriteOutcome;

    /// Rewrites the content of an existing listing and bumps updated/last-seen.
    async fn update_listing(
        &mut self,
        id: i64,
        record: &ListingRecord,
        fingerprint: &ContentFingerprint,
    ) -> WriteOutcome;

    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Appends a processing-history row in its own transaction, creating the
    /// history table if it does not exist yet.
    async fn record_run(&mut self, run: &ProcessingRun) -> Result<(), StoreError>;

    /// Read-only integrity queries. Active listings last seen before
    /// `stale_cutoff` count as stale.
    async fn audit(&mut self, stale_cutoff: NaiveDateTime) -> Result<IntegrityReport, StoreError>;

    /// Discards uncommitted work and releases the connection.
    async fn close(&mut self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Linear backoff: the wait after the n-th failed attempt (1-based) is
    /// `n * base_delay`, capped at `max_delay`.
    pub fn delay_after_attempt(&self, attempt: usize) -> Duration {
        let factor = u32::try_from(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Runs `op` until it succeeds or `policy.max_attempts` attempts have failed.
/// Returns the last error together with the number of attempts made.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: BackoffPolicy,
    what: &str,
    mut op: F,
) -> Result<T, (usize, E)>
where
    E: std::fmt::Display,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                let delay = policy.delay_after_attempt(attempt);
                warn!(attempt, max_attempts = attempts, ?delay, error = %err, "{what} failed; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err((attempt, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_is_linear_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
        };

        assert_eq!(policy.delay_after_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_millis(250));
        assert_eq!(policy.delay_after_attempt(9), Duration::from_millis(250));
    }

    #[test]
    fn default_policy_makes_three_attempts() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_after_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_secs(4));
    }

    fn fast_policy(max_attempts: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let result = retry_with_backoff(fast_policy(3), "connect", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(format!("refused #{attempt}"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_with_last_error() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = retry_with_backoff(fast_policy(3), "connect", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("refused #{attempt}")) }
        })
        .await;

        assert_eq!(result, Err((3, "refused #3".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn apply_index_keeps_first_insertion_order() {
        let mut index: ApplyIndex = vec![
            ("https://a".to_string(), IndexedListing { id: 1, content_hash: None }),
            ("https://b".to_string(), IndexedListing { id: 2, content_hash: None }),
        ]
        .into_iter()
        .collect();

        assert!(index.insert("https://c", IndexedListing { id: 3, content_hash: None }));
        assert!(!index.insert("https://a", IndexedListing { id: 99, content_hash: None }));

        assert_eq!(index.len(), 3);
        assert_eq!(index.get("https://a").map(|l| l.id), Some(1));
        assert_eq!(index.keys().collect::<Vec<_>>(), vec!["https://a", "https://b", "https://c"]);
    }

    #[test]
    fn integrity_report_is_clean_only_without_findings() {
        let mut report = IntegrityReport::default();
        assert!(report.is_clean());
        report.stale_active = 1;
        assert!(!report.is_clean());
    }
}
