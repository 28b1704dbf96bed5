//! Core domain model for the games catalog: ids, fetched records, SCD2 versions.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "gcat-core";

/// Upstream identifier of a catalog entry. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u64")]
pub struct CatalogId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("catalog id must be positive, got {0}")]
pub struct InvalidCatalogId(pub i64);

impl CatalogId {
    pub fn new(raw: u64) -> Option<Self> {
        (raw > 0).then_some(Self(raw))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl TryFrom<i64> for CatalogId {
    type Error = InvalidCatalogId;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        u64::try_from(raw)
            .ok()
            .and_then(Self::new)
            .ok_or(InvalidCatalogId(raw))
    }
}

impl From<CatalogId> for u64 {
    fn from(id: CatalogId) -> Self {
        id.0
    }
}

impl fmt::Display for CatalogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable audit copy of one upstream detail response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(rename = "appid")]
    pub id: CatalogId,
    pub name: Option<String>,
    pub data: JsonValue,
    pub load_date: NaiveDate,
}

/// Every field that takes part in change detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogAttributes {
    pub name: Option<String>,
    pub genre: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub positive: u64,
    pub negative: u64,
    pub developer: String,
    pub publisher: String,
    pub score_rank: String,
    pub owners: Option<String>,
    pub min_owners: u64,
    pub max_owners: u64,
    pub average_forever: u64,
    pub average_2weeks: u64,
    pub median_forever: u64,
    pub median_2weeks: u64,
    pub ccu: u64,
    pub price: f64,
    #[serde(rename = "initialprice")]
    pub initial_price: f64,
    pub discount: f64,
    pub languages: Vec<String>,
}

pub const UNKNOWN_COMPANY: &str = "Unknown";
pub const UNRANKED: &str = "N/A";

impl Default for CatalogAttributes {
    fn default() -> Self {
        Self {
            name: None,
            genre: BTreeSet::new(),
            tags: BTreeSet::new(),
            positive: 0,
            negative: 0,
            developer: UNKNOWN_COMPANY.to_string(),
            publisher: UNKNOWN_COMPANY.to_string(),
            score_rank: UNRANKED.to_string(),
            owners: None,
            min_owners: 0,
            max_owners: 0,
            average_forever: 0,
            average_2weeks: 0,
            median_forever: 0,
            median_2weeks: 0,
            ccu: 0,
            price: 0.0,
            initial_price: 0.0,
            discount: 0.0,
            languages: Vec::new(),
        }
    }
}

impl CatalogAttributes {
    /// Change-detection equality. Array fields compare as sorted, comma-joined text.
    pub fn matches(&self, other: &Self) -> bool {
        self.name == other.name
            && joined(&self.genre) == joined(&other.genre)
            && joined(&self.tags) == joined(&other.tags)
            && self.positive == other.positive
            && self.negative == other.negative
            && self.developer == other.developer
            && self.publisher == other.publisher
            && self.score_rank == other.score_rank
            && self.owners == other.owners
            && self.min_owners == other.min_owners
            && self.max_owners == other.max_owners
            && self.average_forever == other.average_forever
            && self.average_2weeks == other.average_2weeks
            && self.median_forever == other.median_forever
            && self.median_2weeks == other.median_2weeks
            && self.ccu == other.ccu
            && self.price == other.price
            && self.initial_price == other.initial_price
            && self.discount == other.discount
            && joined(&self.languages) == joined(&other.languages)
    }

    /// Names of the fields that differ, for logging.
    pub fn changed_fields(&self, other: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        let mut check = |name: &'static str, same: bool| {
            if !same {
                changed.push(name);
            }
        };
        check("name", self.name == other.name);
        check("genre", joined(&self.genre) == joined(&other.genre));
        check("tags", joined(&self.tags) == joined(&other.tags));
        check("positive", self.positive == other.positive);
        check("negative", self.negative == other.negative);
        check("developer", self.developer == other.developer);
        check("publisher", self.publisher == other.publisher);
        check("score_rank", self.score_rank == other.score_rank);
        check("owners", self.owners == other.owners);
        check("min_owners", self.min_owners == other.min_owners);
        check("max_owners", self.max_owners == other.max_owners);
        check("average_forever", self.average_forever == other.average_forever);
        check("average_2weeks", self.average_2weeks == other.average_2weeks);
        check("median_forever", self.median_forever == other.median_forever);
        check("median_2weeks", self.median_2weeks == other.median_2weeks);
        check("ccu", self.ccu == other.ccu);
        check("price", self.price == other.price);
        check("initialprice", self.initial_price == other.initial_price);
        check("discount", self.discount == other.discount);
        check("languages", joined(&self.languages) == joined(&other.languages));
        changed
    }
}

/// Sorted, comma-joined text of a string set; the comparable form of list fields.
pub fn joined<'a>(items: impl IntoIterator<Item = &'a String>) -> String {
    let mut items: Vec<&str> = items.into_iter().map(String::as_str).collect();
    items.sort_unstable();
    items.join(",")
}

/// Canonical projection of a raw record, as written to staging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedRecord {
    #[serde(rename = "appid")]
    pub id: CatalogId,
    #[serde(flatten)]
    pub attributes: CatalogAttributes,
    pub load_date: NaiveDate,
}

/// One row of an entry's history.
///
/// `valid_to` is `None` exactly when the row is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedEntry {
    #[serde(rename = "appid")]
    pub id: CatalogId,
    #[serde(flatten)]
    pub attributes: CatalogAttributes,
    pub valid_from: NaiveDate,
    pub valid_to: Option<NaiveDate>,
    pub is_active: bool,
}

impl VersionedEntry {
    pub fn open(record: &CleanedRecord, valid_from: NaiveDate) -> Self {
        Self {
            id: record.id,
            attributes: record.attributes.clone(),
            valid_from,
            valid_to: None,
            is_active: true,
        }
    }

    pub fn close(&mut self, valid_to: NaiveDate) {
        self.valid_to = Some(valid_to);
        self.is_active = false;
    }

    pub fn is_consistent(&self) -> bool {
        self.is_active == self.valid_to.is_none()
    }
}

/// Ids with more than one active version, or with rows whose `valid_to` and
/// `is_active` disagree.
pub fn invariant_violations<'a>(
    entries: impl IntoIterator<Item = &'a VersionedEntry>,
) -> Vec<CatalogId> {
    let mut active_counts: BTreeMap<CatalogId, usize> = BTreeMap::new();
    let mut broken: BTreeSet<CatalogId> = BTreeSet::new();
    for entry in entries {
        if !entry.is_consistent() {
            broken.insert(entry.id);
        }
        if entry.is_active {
            *active_counts.entry(entry.id).or_default() += 1;
        }
    }
    broken.extend(
        active_counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(id, _)| id),
    );
    broken.into_iter().collect()
}

/// Cleaned records staged for one run date, consumed by a single merge.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StagingBatch {
    pub records: Vec<CleanedRecord>,
}

impl StagingBatch {
    pub fn new(records: Vec<CleanedRecord>) -> Self {
        Self { records }
    }

    /// Assemble a batch from flushed sequences. A later sequence replaces an
    /// earlier record for the same id; first-seen position is kept.
    pub fn from_sequences(mut sequences: Vec<(u32, Vec<CleanedRecord>)>) -> Self {
        sequences.sort_by_key(|(seq, _)| *seq);
        let mut positions: BTreeMap<CatalogId, usize> = BTreeMap::new();
        let mut records: Vec<CleanedRecord> = Vec::new();
        for (_, batch) in sequences {
            for record in batch {
                match positions.get(&record.id) {
                    Some(&pos) => records[pos] = record,
                    None => {
                        positions.insert(record.id, records.len());
                        records.push(record);
                    }
                }
            }
        }
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> Vec<CatalogId> {
        self.records.iter().map(|r| r.id).collect()
    }

    pub fn duplicate_ids(&self) -> Vec<CatalogId> {
        let mut seen = HashSet::new();
        let mut dupes = BTreeSet::new();
        for record in &self.records {
            if !seen.insert(record.id) {
                dupes.insert(record.id);
            }
        }
        dupes.into_iter().collect()
    }
}

/// A single step of an SCD2 merge plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScdChange {
    Insert(VersionedEntry),
    Supersede {
        id: CatalogId,
        closed_valid_from: NaiveDate,
        valid_to: NaiveDate,
        replacement: VersionedEntry,
    },
}

impl ScdChange {
    pub fn id(&self) -> CatalogId {
        match self {
            ScdChange::Insert(entry) => entry.id,
            ScdChange::Supersede { id, .. } => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> CatalogId {
        CatalogId::new(raw).unwrap()
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, d).unwrap()
    }

    fn record(raw: u64, price: f64) -> CleanedRecord {
        CleanedRecord {
            id: id(raw),
            attributes: CatalogAttributes {
                name: Some(format!("game {raw}")),
                price,
                ..Default::default()
            },
            load_date: date(20),
        }
    }

    #[test]
    fn list_fields_join_in_sorted_order() {
        let tags: Vec<String> = vec!["rpg".into(), "action".into(), "indie".into()];
        assert_eq!(joined(&tags), "action,indie,rpg");
        assert_eq!(joined(&Vec::<String>::new()), "");
    }

    #[test]
    fn catalog_ids_reject_non_positive_values() {
        assert!(CatalogId::new(0).is_none());
        assert_eq!(CatalogId::try_from(-4), Err(InvalidCatalogId(-4)));
        assert_eq!(CatalogId::try_from(730).unwrap().get(), 730);
        assert!(serde_json::from_str::<CatalogId>("0").is_err());
    }

    #[test]
    fn array_fields_compare_order_insensitively() {
        let a = CatalogAttributes {
            languages: vec!["English".into(), "French".into()],
            ..Default::default()
        };
        let b = CatalogAttributes {
            languages: vec!["French".into(), "English".into()],
            ..Default::default()
        };
        assert!(a.matches(&b));
        assert!(a.changed_fields(&b).is_empty());
    }

    #[test]
    fn price_difference_is_reported() {
        let a = record(10, 9.99);
        let b = record(10, 7.99);
        assert!(!a.attributes.matches(&b.attributes));
        assert_eq!(a.attributes.changed_fields(&b.attributes), vec!["price"]);
    }

    #[test]
    fn cleaned_record_serializes_flat_with_wire_names() {
        let value = serde_json::to_value(record(570, 0.0)).unwrap();
        assert_eq!(value["appid"], 570);
        assert_eq!(value["developer"], "Unknown");
        assert_eq!(value["initialprice"], 0.0);
        assert_eq!(value["load_date"], "2025-07-20");
    }

    #[test]
    fn cleaned_record_tolerates_unknown_and_missing_fields() {
        let line = r#"{"appid":5,"name":"x","load_date":"2025-07-21","brand_new_field":true}"#;
        let parsed: CleanedRecord = serde_json::from_str(line).unwrap();
        assert_eq!(parsed.id, id(5));
        assert_eq!(parsed.attributes.score_rank, "N/A");
    }

    #[test]
    fn later_sequences_replace_duplicate_ids() {
        let batch = StagingBatch::from_sequences(vec![
            (2, vec![record(1, 5.0)]),
            (1, vec![record(1, 1.0), record(2, 2.0)]),
        ]);
        assert_eq!(batch.ids(), vec![id(1), id(2)]);
        assert_eq!(batch.records[0].attributes.price, 5.0);
        assert!(batch.duplicate_ids().is_empty());
    }

    #[test]
    fn duplicate_ids_are_detected() {
        let batch = StagingBatch::new(vec![record(3, 1.0), record(3, 2.0), record(4, 1.0)]);
        assert_eq!(batch.duplicate_ids(), vec![id(3)]);
    }

    #[test]
    fn invariant_violations_flag_double_active_and_inconsistent_rows() {
        let mut closed = VersionedEntry::open(&record(1, 1.0), date(1));
        closed.close(date(2));
        let active = VersionedEntry::open(&record(1, 2.0), date(2));
        assert!(invariant_violations([&closed, &active]).is_empty());

        let second_active = VersionedEntry::open(&record(1, 3.0), date(3));
        assert_eq!(invariant_violations([&active, &second_active]), vec![id(1)]);

        let mut broken = VersionedEntry::open(&record(2, 1.0), date(1));
        broken.is_active = false;
        assert_eq!(invariant_violations([&broken]), vec![id(2)]);
    }
}
