//! Core domain model for Talent Trek job listings.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "trek-core";

/// Job categories published by the listings site. Labels are stored verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobCategory {
    #[serde(rename = "Software Engineering")]
    SoftwareEngineering,
    #[serde(rename = "Data Analyst")]
    DataAnalyst,
    #[serde(rename = "Business Analyst")]
    BusinessAnalyst,
    #[serde(rename = "Machine Learning and AI")]
    MachineLearningAndAi,
    #[serde(rename = "Cybersecurity")]
    Cybersecurity,
    #[serde(rename = "Data Engineer")]
    DataEngineer,
}

impl JobCategory {
    pub const ALL: [JobCategory; 6] = [
        JobCategory::SoftwareEngineering,
        JobCategory::DataAnalyst,
        JobCategory::BusinessAnalyst,
        JobCategory::MachineLearningAndAi,
        JobCategory::Cybersecurity,
        JobCategory::DataEngineer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobCategory::SoftwareEngineering => "Software Engineering",
            JobCategory::DataAnalyst => "Data Analyst",
            JobCategory::BusinessAnalyst => "Business Analyst",
            JobCategory::MachineLearningAndAi => "Machine Learning and AI",
            JobCategory::Cybersecurity => "Cybersecurity",
            JobCategory::DataEngineer => "Data Engineer",
        }
    }

    /// Filename-friendly form, e.g. `machine_learning_and_ai`.
    pub fn slug(&self) -> String {
        self.as_str()
            .to_ascii_lowercase()
            .replace('&', "and")
            .replace(' ', "_")
    }
}

impl fmt::Display for JobCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown job category {input:?}; expected one of: {}", valid_labels())]
pub struct CategoryParseError {
    pub input: String,
}

fn valid_labels() -> String {
    JobCategory::ALL
        .iter()
        .map(JobCategory::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl FromStr for JobCategory {
    type Err = CategoryParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| CategoryParseError {
                input: s.to_string(),
            })
    }
}

/// One normalized row from a listings export. Title, company, posting date and
/// apply link are guaranteed present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub source_row: usize,
    pub position_title: String,
    pub posting_date: NaiveDateTime,
    pub apply_link: String,
    pub work_model: Option<String>,
    pub location: Option<String>,
    pub company: String,
    pub company_size: Option<String>,
    pub company_industry: Option<String>,
    pub salary: Option<String>,
    pub qualifications: Option<String>,
    pub h1b_sponsored: bool,
    pub is_new_grad: bool,
    pub job_category: JobCategory,
}

impl ListingRecord {
    pub fn fingerprint(&self) -> ContentFingerprint {
        ContentFingerprint::of(self)
    }
}

/// SHA-256 over the key-sorted JSON encoding of a listing's content fields.
///
/// The encoding matches the hashes already stored by the legacy Python
/// loader: `", "` and `": "` separators, non-ASCII escaped as `\uXXXX`,
/// missing values as `nan` and flags as `True`/`False`.
///
/// Posting date, apply link and category are not hashed, so two sightings of
/// the same posting with different dates hash equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentFingerprint(String);

impl ContentFingerprint {
    pub fn of(record: &ListingRecord) -> Self {
        let opt = |v: &Option<String>| v.clone().unwrap_or_else(|| "nan".to_string());
        let flag = |b: bool| if b { "True" } else { "False" }.to_string();
        let fields: BTreeMap<&'static str, String> = BTreeMap::from([
            ("company", record.company.clone()),
            ("company_industry", opt(&record.company_industry)),
            ("company_size", opt(&record.company_size)),
            ("h1b_sponsored", flag(record.h1b_sponsored)),
            ("is_new_grad", flag(record.is_new_grad)),
            ("location", opt(&record.location)),
            ("position_title", record.position_title.clone()),
            ("qualifications", opt(&record.qualifications)),
            ("salary", opt(&record.salary)),
            ("work_model", opt(&record.work_model)),
        ]);
        let mut hasher = Sha256::new();
        hasher.update(canonical_json(&fields));
        Self(hex::encode(hasher.finalize()))
    }

    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn canonical_json(fields: &BTreeMap<&'static str, String>) -> Vec<u8> {
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, LegacyFormatter);
    // Writing a string map into a Vec cannot fail.
    let _ = fields.serialize(&mut ser);
    out
}

/// `json.dumps(..., sort_keys=True)` layout; key order comes from the map.
struct LegacyFormatter;

impl serde_json::ser::Formatter for LegacyFormatter {
    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W: ?Sized + io::Write>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()> {
        for ch in fragment.chars() {
            if ch.is_ascii() && ch != '\u{7f}' {
                writer.write_all(&[ch as u8])?;
            } else {
                let mut units = [0u16; 2];
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{unit:04x}")?;
                }
            }
        }
        Ok(())
    }
}

/// Stored listing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedListing {
    pub id: i64,
    pub position_title: Option<String>,
    pub posting_date: Option<NaiveDateTime>,
    pub apply_link: String,
    pub work_model: Option<String>,
    pub location: Option<String>,
    pub company: Option<String>,
    pub company_size: Option<String>,
    pub company_industry: Option<String>,
    pub salary: Option<String>,
    pub qualifications: Option<String>,
    pub h1b_sponsored: bool,
    pub is_new_grad: bool,
    pub job_category: JobCategory,
    pub content_hash: String,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub last_seen_at: NaiveDateTime,
}

impl PersistedListing {
    /// Fresh active row for a first sighting, all timestamps set to `now`.
    pub fn from_record(id: i64, record: &ListingRecord, now: NaiveDateTime) -> Self {
        Self {
            id,
            position_title: Some(record.position_title.clone()),
            posting_date: Some(record.posting_date),
            apply_link: record.apply_link.clone(),
            work_model: record.work_model.clone(),
            location: record.location.clone(),
            company: Some(record.company.clone()),
            company_size: record.company_size.clone(),
            company_industry: record.company_industry.clone(),
            salary: record.salary.clone(),
            qualifications: record.qualifications.clone(),
            h1b_sponsored: record.h1b_sponsored,
            is_new_grad: record.is_new_grad,
            job_category: record.job_category,
            content_hash: record.fingerprint().to_string(),
            is_active: true,
            created_at: now,
            updated_at: now,
            last_seen_at: now,
        }
    }
}

/// Audit row appended once per processed export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingRun {
    pub filename: String,
    pub processed_count: i32,
    pub inserted_count: i32,
    pub updated_count: i32,
    pub processed_at: NaiveDateTime,
}

impl ProcessingRun {
    pub fn from_stats(filename: impl Into<String>, stats: &RunStats, processed_at: NaiveDateTime) -> Self {
        let clamp = |n: usize| i32::try_from(n).unwrap_or(i32::MAX);
        Self {
            filename: filename.into(),
            processed_count: clamp(stats.processed),
            inserted_count: clamp(stats.inserted),
            updated_count: clamp(stats.updated),
            processed_at,
        }
    }
}

/// Per-batch counters. Every row read ends up in exactly one of
/// `inserted`, `updated`, `skipped` or `errors`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub processed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl RunStats {
    /// Batch-level success signal: at least one new listing was stored.
    pub fn succeeded(&self) -> bool {
        self.inserted > 0
    }

    pub fn is_balanced(&self) -> bool {
        self.processed == self.inserted + self.updated + self.skipped + self.errors
    }
}

/// What to do when an incoming apply link is already stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// Count as skipped and leave the stored row untouched.
    #[default]
    SkipDuplicates,
    /// Rewrite the stored row when its content fingerprint differs.
    #[serde(rename = "update-on-change")]
    UpdateOnFingerprintChange,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown duplicate policy {0:?}; expected `skip-duplicates` or `update-on-change`")]
pub struct PolicyParseError(pub String);

impl FromStr for DuplicatePolicy {
    type Err = PolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip-duplicates" | "skip" => Ok(DuplicatePolicy::SkipDuplicates),
            "update-on-change" | "update-on-fingerprint-change" | "update" => {
                Ok(DuplicatePolicy::UpdateOnFingerprintChange)
            }
            _ => Err(PolicyParseError(s.to_string())),
        }
    }
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplicatePolicy::SkipDuplicates => f.write_str("skip-duplicates"),
            DuplicatePolicy::UpdateOnFingerprintChange => f.write_str("update-on-change"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record() -> ListingRecord {
        ListingRecord {
            source_row: 1,
            position_title: "Software Engineer I".into(),
            posting_date: NaiveDate::from_ymd_opt(2025, 3, 14)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            apply_link: "https://example.com/apply/1".into(),
            work_model: Some("Hybrid".into()),
            location: Some("Austin, TX".into()),
            company: "Acme".into(),
            company_size: Some("1001-5000".into()),
            company_industry: Some("Software".into()),
            salary: Some("$120k/yr".into()),
            qualifications: Some("BS in CS".into()),
            h1b_sponsored: true,
            is_new_grad: false,
            job_category: JobCategory::SoftwareEngineering,
        }
    }

    #[test]
    fn category_labels_round_trip_through_from_str() {
        for category in JobCategory::ALL {
            assert_eq!(category.as_str().parse::<JobCategory>().unwrap(), category);
        }
        let err = "software engineering".parse::<JobCategory>().unwrap_err();
        assert!(err.to_string().contains("Data Engineer"));
    }

    #[test]
    fn category_slug_is_filename_safe() {
        assert_eq!(JobCategory::MachineLearningAndAi.slug(), "machine_learning_and_ai");
        assert_eq!(JobCategory::SoftwareEngineering.slug(), "software_engineering");
    }

    #[test]
    fn fingerprint_ignores_fields_outside_the_content_subset() {
        let base = record();
        let mut moved = base.clone();
        moved.posting_date = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        moved.apply_link = "https://example.com/apply/other".into();
        moved.job_category = JobCategory::DataEngineer;
        moved.source_row = 42;
        assert_eq!(base.fingerprint(), moved.fingerprint());
    }

    #[test]
    fn fingerprint_changes_when_any_content_field_changes() {
        let base = record();
        let mutated = |f: &dyn Fn(&mut ListingRecord)| {
            let mut changed = base.clone();
            f(&mut changed);
            changed
        };
        let variants = vec![
            mutated(&|r| r.position_title.push('!')),
            mutated(&|r| r.company.push('!')),
            mutated(&|r| r.location = None),
            mutated(&|r| r.salary = Some("$130k/yr".into())),
            mutated(&|r| r.qualifications = Some("MS in CS".into())),
            mutated(&|r| r.work_model = Some("Remote".into())),
            mutated(&|r| r.company_size = Some("51-200".into())),
            mutated(&|r| r.company_industry = Some("Finance".into())),
            mutated(&|r| r.h1b_sponsored = !r.h1b_sponsored),
            mutated(&|r| r.is_new_grad = !r.is_new_grad),
        ];

        let mut seen = std::collections::HashSet::new();
        seen.insert(base.fingerprint());
        for changed in variants {
            assert!(seen.insert(changed.fingerprint()), "collision for {changed:?}");
        }
    }

    #[test]
    fn fingerprint_matches_legacy_loader_hashes() {
        let mut known = record();
        known.position_title = "Data Analyst I".into();
        known.company = "Initech".into();
        known.location = Some("Denver, CO".into());
        known.salary = Some("$80k".into());
        known.qualifications = None;
        known.work_model = Some("Remote".into());
        known.company_size = Some("51-200".into());
        known.company_industry = None;
        assert_eq!(
            known.fingerprint().as_str(),
            "954073777fe6a9a128583390f85b76761d1b1ebc0b55aea5cc39ccae1ebee5c4"
        );

        let sparse = ListingRecord {
            position_title: "Analista Se\u{f1}or \u{1f4ca}".into(),
            company: "Caf\u{e9} \"Uno\"".into(),
            location: None,
            salary: None,
            qualifications: None,
            work_model: None,
            company_size: None,
            company_industry: None,
            h1b_sponsored: false,
            is_new_grad: true,
            ..record()
        };
        assert_eq!(
            sparse.fingerprint().as_str(),
            "c02b410a00702af5e3d5ed1822c219e4cfe9c096d45b37c6bc9babc49abe68d8"
        );
    }

    #[test]
    fn canonical_json_uses_spaced_separators_and_ascii_escapes() {
        let fields = BTreeMap::from([("b", "caf\u{e9}".to_string()), ("a", "x".to_string())]);
        let json = String::from_utf8(canonical_json(&fields)).unwrap();
        assert_eq!(json, r#"{"a": "x", "b": "caf\u00e9"}"#);
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = record().fingerprint();
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn stats_success_means_at_least_one_insert() {
        let mut stats = RunStats {
            processed: 3,
            errors: 3,
            ..Default::default()
        };
        assert!(!stats.succeeded());
        assert!(stats.is_balanced());
        stats.errors = 2;
        stats.inserted = 1;
        assert!(stats.succeeded());
    }

    #[test]
    fn duplicate_policy_parses_both_spellings() {
        assert_eq!(
            "skip-duplicates".parse::<DuplicatePolicy>().unwrap(),
            DuplicatePolicy::SkipDuplicates
        );
        assert_eq!(
            "Update-On-Change".parse::<DuplicatePolicy>().unwrap(),
            DuplicatePolicy::UpdateOnFingerprintChange
        );
        assert!("sometimes".parse::<DuplicatePolicy>().is_err());
        assert_eq!(DuplicatePolicy::default().to_string(), "skip-duplicates");
    }
}
