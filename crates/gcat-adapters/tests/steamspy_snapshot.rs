use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use gcat_adapters::{is_usable_payload, transform};
use gcat_core::{CatalogId, CleanedRecord};
use serde_json::Value as JsonValue;

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/steamspy")
        .canonicalize()
        .expect("fixtures dir")
}

fn read_json(name: &str) -> JsonValue {
    let path = fixtures_dir().join(name);
    let text = std::fs::read_to_string(&path).expect("read fixture");
    serde_json::from_str(&text).expect("parse fixture")
}

#[test]
fn golden_snapshot_for_steamspy_fixtures() {
    let load_date = NaiveDate::from_ymd_opt(2025, 7, 20).unwrap();
    let actual: Vec<CleanedRecord> = [(730, "730.json"), (620, "620.json")]
        .into_iter()
        .map(|(raw_id, file)| {
            let payload = read_json(file);
            assert!(is_usable_payload(&payload), "{file} should be usable");
            let out = transform(CatalogId::new(raw_id).unwrap(), &payload, load_date);
            assert!(out.warnings.is_empty(), "{file}: {:?}", out.warnings);
            assert_eq!(out.raw.data, payload);
            out.cleaned
        })
        .collect();

    let expected: Vec<CleanedRecord> =
        serde_json::from_value(read_json("snapshot.json")).expect("snapshot shape");
    assert_eq!(actual, expected);
}

#[test]
fn unknown_app_fixture_is_rejected() {
    assert!(!is_usable_payload(&read_json("unknown.json")));
}
