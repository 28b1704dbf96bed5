//! Parquet snapshot of the versioned store plus a hashed manifest.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    ArrayRef, BooleanArray, Date32Array, Float64Array, RecordBatch, StringArray, UInt64Array,
};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{Datelike, NaiveDate};
use gcat_core::{joined, VersionedEntry};
use gcat_storage::sha256_hex;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};

pub const VERSIONS_FILE: &str = "versions.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";

/// `num_days_from_ce` of 1970-01-01.
const EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub files: Vec<ExportedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

fn date32(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - EPOCH_DAYS_FROM_CE
}

fn counts(entries: &[VersionedEntry], f: impl Fn(&VersionedEntry) -> u64) -> ArrayRef {
    Arc::new(UInt64Array::from(entries.iter().map(f).collect::<Vec<_>>()))
}

fn floats(entries: &[VersionedEntry], f: impl Fn(&VersionedEntry) -> f64) -> ArrayRef {
    Arc::new(Float64Array::from(entries.iter().map(f).collect::<Vec<_>>()))
}

fn texts(entries: &[VersionedEntry], f: impl Fn(&VersionedEntry) -> String) -> ArrayRef {
    Arc::new(StringArray::from(entries.iter().map(f).collect::<Vec<_>>()))
}

fn versions_batch(entries: &[VersionedEntry]) -> Result<RecordBatch> {
    let u64_field = |name: &str| ArrowField::new(name, DataType::UInt64, false);
    let text_field = |name: &str, nullable: bool| ArrowField::new(name, DataType::Utf8, nullable);
    let schema = Arc::new(Schema::new(vec![
        u64_field("app_id"),
        text_field("name", true),
        text_field("genre", false),
        text_field("tags", false),
        text_field("developer", false),
        text_field("publisher", false),
        text_field("score_rank", false),
        text_field("owners", true),
        u64_field("min_owners"),
        u64_field("max_owners"),
        u64_field("positive"),
        u64_field("negative"),
        u64_field("average_forever"),
        u64_field("average_2weeks"),
        u64_field("median_forever"),
        u64_field("median_2weeks"),
        u64_field("ccu"),
        ArrowField::new("price", DataType::Float64, false),
        ArrowField::new("initial_price", DataType::Float64, false),
        ArrowField::new("discount", DataType::Float64, false),
        text_field("languages", false),
        ArrowField::new("valid_from", DataType::Date32, false),
        ArrowField::new("valid_to", DataType::Date32, true),
        ArrowField::new("is_active", DataType::Boolean, false),
    ]));

    let names = StringArray::from(
        entries
            .iter()
            .map(|e| e.attributes.name.as_deref())
            .collect::<Vec<_>>(),
    );
    let owners = StringArray::from(
        entries
            .iter()
            .map(|e| e.attributes.owners.as_deref())
            .collect::<Vec<_>>(),
    );
    let valid_from = Date32Array::from(entries.iter().map(|e| date32(e.valid_from)).collect::<Vec<_>>());
    let valid_to = Date32Array::from(
        entries
            .iter()
            .map(|e| e.valid_to.map(date32))
            .collect::<Vec<_>>(),
    );
    let active = BooleanArray::from(entries.iter().map(|e| e.is_active).collect::<Vec<_>>());

    RecordBatch::try_new(
        schema,
        vec![
            counts(entries, |e| e.id.get()),
            Arc::new(names),
            texts(entries, |e| joined(&e.attributes.genre)),
            texts(entries, |e| joined(&e.attributes.tags)),
            texts(entries, |e| e.attributes.developer.clone()),
            texts(entries, |e| e.attributes.publisher.clone()),
            texts(entries, |e| e.attributes.score_rank.clone()),
            Arc::new(owners),
            counts(entries, |e| e.attributes.min_owners),
            counts(entries, |e| e.attributes.max_owners),
            counts(entries, |e| e.attributes.positive),
            counts(entries, |e| e.attributes.negative),
            counts(entries, |e| e.attributes.average_forever),
            counts(entries, |e| e.attributes.average_2weeks),
            counts(entries, |e| e.attributes.median_forever),
            counts(entries, |e| e.attributes.median_2weeks),
            counts(entries, |e| e.attributes.ccu),
            floats(entries, |e| e.attributes.price),
            floats(entries, |e| e.attributes.initial_price),
            floats(entries, |e| e.attributes.discount),
            texts(entries, |e| joined(&e.attributes.languages)),
            Arc::new(valid_from),
            Arc::new(valid_to),
            Arc::new(active),
        ],
    )
    .context("building versions record batch")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, out_dir: &Path, path: &Path, rows: usize) -> Result<ExportedFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(out_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ExportedFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

/// Write `versions.parquet` and `manifest.json` under `out_dir`.
pub fn export_versions_parquet(entries: &[VersionedEntry], out_dir: &Path) -> Result<ExportManifest> {
    std::fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
    let versions_path = out_dir.join(VERSIONS_FILE);
    write_parquet(&versions_path, versions_batch(entries)?)?;

    let manifest = ExportManifest {
        schema_version: 1,
        files: vec![manifest_entry("catalog_versions", out_dir, &versions_path, entries.len())?],
    };
    let manifest_path = out_dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcat_core::{CatalogAttributes, CatalogId, CleanedRecord};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use tempfile::tempdir;

    fn entry(raw: u64, from: u32, to: Option<u32>) -> VersionedEntry {
        let record = CleanedRecord {
            id: CatalogId::new(raw).unwrap(),
            attributes: CatalogAttributes {
                name: Some(format!("game {raw}")),
                languages: vec!["French".into(), "English".into()],
                ..Default::default()
            },
            load_date: NaiveDate::from_ymd_opt(2025, 7, from).unwrap(),
        };
        let mut entry = VersionedEntry::open(&record, record.load_date);
        if let Some(to) = to {
            entry.close(NaiveDate::from_ymd_opt(2025, 7, to).unwrap());
        }
        entry
    }

    #[test]
    fn unix_epoch_maps_to_day_zero() {
        assert_eq!(date32(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()), 0);
        assert_eq!(date32(NaiveDate::from_ymd_opt(1970, 1, 2).unwrap()), 1);
    }

    #[test]
    fn export_writes_parquet_and_a_hashed_manifest() {
        let dir = tempdir().expect("tempdir");
        let entries = vec![entry(1, 1, Some(5)), entry(1, 5, None), entry(2, 3, None)];
        let manifest = export_versions_parquet(&entries, dir.path()).unwrap();

        let file = &manifest.files[0];
        assert_eq!(file.path, VERSIONS_FILE);
        assert_eq!(file.rows, 3);
        let bytes = std::fs::read(dir.path().join(VERSIONS_FILE)).unwrap();
        assert_eq!(file.sha256, sha256_hex(&bytes));
        assert_eq!(file.bytes, bytes.len() as u64);

        let written: ExportManifest =
            serde_json::from_slice(&std::fs::read(dir.path().join(MANIFEST_FILE)).unwrap()).unwrap();
        assert_eq!(written, manifest);

        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(dir.path().join(VERSIONS_FILE)).unwrap())
            .unwrap()
            .build()
            .unwrap();
        let rows: usize = reader.map(|batch| batch.unwrap().num_rows()).sum();
        assert_eq!(rows, 3);
    }
}
