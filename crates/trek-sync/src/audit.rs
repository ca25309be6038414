use chrono::{Duration, Utc};
use tracing::{info, warn};
use trek_storage::{IntegrityReport, ListingStore, StoreError};

pub const DEFAULT_STALE_AFTER_HOURS: i64 = 48;

/// Read-only consistency checks over the stored listings.
#[derive(Debug, Clone, Copy)]
pub struct IntegrityAuditor {
    stale_after: Duration,
}

impl Default for IntegrityAuditor {
    fn default() -> Self {
        Self::new(Duration::hours(DEFAULT_STALE_AFTER_HOURS))
    }
}

impl IntegrityAuditor {
    pub fn new(stale_after: Duration) -> Self {
        Self { stale_after }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub async fn audit<S>(&self, store: &mut S) -> Result<IntegrityReport, StoreError>
    where
        S: ListingStore + ?Sized,
    {
        let cutoff = Utc::now().naive_utc() - self.stale_after;
        let report = store.audit(cutoff).await?;

        for group in &report.duplicate_groups {
            warn!(
                position_title = group.position_title.as_deref().unwrap_or("<null>"),
                company = group.company.as_deref().unwrap_or("<null>"),
                posting_date = ?group.posting_date,
                count = group.count,
                "duplicate listings share title, company and posting date"
            );
        }
        if !report.missing_required.is_empty() {
            warn!(
                count = report.missing_required.len(),
                ids = ?report.missing_required,
                "listings missing a required field"
            );
        }
        if report.stale_active > 0 {
            warn!(
                count = report.stale_active,
                stale_after_hours = self.stale_after.num_hours(),
                "active listings not seen recently"
            );
        }
        if report.is_clean() {
            info!("integrity audit found no issues");
        }
        Ok(report)
    }
}
