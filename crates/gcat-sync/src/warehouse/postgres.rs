use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use gcat_core::{CatalogAttributes, CatalogId, CleanedRecord, ScdChange, StagingBatch, VersionedEntry};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info};

use super::{StagingStore, VersionedStore};
use crate::error::PipelineError;

/// Key of the transaction-scoped advisory lock taken by every merge.
const MERGE_LOCK_KEY: i64 = 0x6763_6174_5f73_6364;

/// Postgres-backed warehouse. Schema lives in `migrations/`.
#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

fn db_err(err: sqlx::Error) -> PipelineError {
    PipelineError::warehouse(err)
}

fn db_id(id: CatalogId) -> Result<i64, PipelineError> {
    i64::try_from(id.get())
        .map_err(|_| PipelineError::Warehouse(format!("app id {id} exceeds BIGINT").into()))
}

fn entry_from_row(row: &PgRow) -> Result<VersionedEntry, PipelineError> {
    let app_id: i64 = row.try_get("app_id").map_err(db_err)?;
    let Json(attributes): Json<CatalogAttributes> = row.try_get("attributes").map_err(db_err)?;
    Ok(VersionedEntry {
        id: CatalogId::try_from(app_id).map_err(PipelineError::warehouse)?,
        attributes,
        valid_from: row.try_get("valid_from").map_err(db_err)?,
        valid_to: row.try_get("valid_to").map_err(db_err)?,
        is_active: row.try_get("is_active").map_err(db_err)?,
    })
}

impl PgWarehouse {
    pub async fn connect(database_url: &str) -> Result<Self, PipelineError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(db_err)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), PipelineError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(PipelineError::warehouse)?;
        info!("warehouse migrations applied");
        Ok(())
    }

    async fn insert_version(
        tx: &mut Transaction<'_, Postgres>,
        entry: &VersionedEntry,
    ) -> Result<(), PipelineError> {
        let result = sqlx::query(
            r#"
            INSERT INTO catalog_versions (app_id, attributes, valid_from, valid_to, is_active)
            VALUES ($1, $2, $3, NULL, TRUE)
            "#,
        )
        .bind(db_id(entry.id)?)
        .bind(Json(&entry.attributes))
        .bind(entry.valid_from)
        .execute(&mut **tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err)
                if err
                    .as_database_error()
                    .is_some_and(|db| db.is_unique_violation()) =>
            {
                Err(PipelineError::conflict(entry.id, "an active version already exists"))
            }
            Err(err) => Err(db_err(err)),
        }
    }
}

#[async_trait]
impl StagingStore for PgWarehouse {
    async fn load_blob(
        &self,
        load_date: NaiveDate,
        seq: u32,
        path: &str,
        records: &[CleanedRecord],
    ) -> Result<usize, PipelineError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM catalog_staging WHERE source_path = $1")
            .bind(path)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        for (row_no, record) in records.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO catalog_staging (source_path, row_no, load_date, batch_seq, app_id, record)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (source_path, app_id) DO UPDATE
                   SET record = EXCLUDED.record,
                       row_no = EXCLUDED.row_no
                "#,
            )
            .bind(path)
            .bind(row_no as i64)
            .bind(load_date)
            .bind(i64::from(seq))
            .bind(db_id(record.id)?)
            .bind(Json(record))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        debug!(path, rows = records.len(), "staging blob loaded");
        Ok(records.len())
    }

    async fn staged_batch(&self, load_date: NaiveDate) -> Result<StagingBatch, PipelineError> {
        let rows = sqlx::query(
            r#"
            SELECT batch_seq, record
              FROM catalog_staging
             WHERE load_date = $1
             ORDER BY batch_seq, row_no
            "#,
        )
        .bind(load_date)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut sequences: Vec<(u32, Vec<CleanedRecord>)> = Vec::new();
        for row in rows {
            let seq: i64 = row.try_get("batch_seq").map_err(db_err)?;
            let seq = u32::try_from(seq).map_err(PipelineError::warehouse)?;
            let Json(record): Json<CleanedRecord> = row.try_get("record").map_err(db_err)?;
            match sequences.last_mut() {
                Some((last, records)) if *last == seq => records.push(record),
                _ => sequences.push((seq, vec![record])),
            }
        }
        Ok(StagingBatch::from_sequences(sequences))
    }

    async fn prune_before(&self, load_date: NaiveDate) -> Result<usize, PipelineError> {
        let removed = sqlx::query("DELETE FROM catalog_staging WHERE load_date < $1")
            .bind(load_date)
            .execute(&self.pool)
            .await
            .map_err(db_err)?
            .rows_affected();
        debug!(%load_date, removed, "staging pruned");
        Ok(removed as usize)
    }
}

#[async_trait]
impl VersionedStore for PgWarehouse {
    async fn seen_ids(&self) -> Result<HashSet<CatalogId>, PipelineError> {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT DISTINCT app_id FROM catalog_versions")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        ids.into_iter()
            .map(|raw| CatalogId::try_from(raw).map_err(PipelineError::warehouse))
            .collect()
    }

    async fn active_entries(
        &self,
        ids: &[CatalogId],
    ) -> Result<HashMap<CatalogId, VersionedEntry>, PipelineError> {
        let raw_ids = ids.iter().map(|id| db_id(*id)).collect::<Result<Vec<_>, _>>()?;
        let rows = sqlx::query(
            r#"
            SELECT app_id, attributes, valid_from, valid_to, is_active
              FROM catalog_versions
             WHERE is_active
               AND app_id = ANY($1)
            "#,
        )
        .bind(&raw_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| entry_from_row(row).map(|entry| (entry.id, entry)))
            .collect()
    }

    async fn apply(&self, changes: &[ScdChange]) -> Result<(), PipelineError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MERGE_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        for change in changes {
            match change {
                ScdChange::Insert(entry) => Self::insert_version(&mut tx, entry).await?,
                ScdChange::Supersede {
                    id,
                    closed_valid_from,
                    valid_to,
                    replacement,
                } => {
                    let closed = sqlx::query(
                        r#"
                        UPDATE catalog_versions
                           SET valid_to = $1,
                               is_active = FALSE
                         WHERE app_id = $2
                           AND is_active
                           AND valid_from = $3
                        "#,
                    )
                    .bind(*valid_to)
                    .bind(db_id(*id)?)
                    .bind(*closed_valid_from)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                    if closed.rows_affected() != 1 {
                        return Err(PipelineError::conflict(
                            *id,
                            "superseded version is no longer active",
                        ));
                    }
                    Self::insert_version(&mut tx, replacement).await?;
                }
            }
        }

        tx.commit().await.map_err(db_err)?;
        debug!(changes = changes.len(), "merge plan committed");
        Ok(())
    }

    async fn history(&self, id: CatalogId) -> Result<Vec<VersionedEntry>, PipelineError> {
        let rows = sqlx::query(
            r#"
            SELECT app_id, attributes, valid_from, valid_to, is_active
              FROM catalog_versions
             WHERE app_id = $1
             ORDER BY valid_from, is_active, version_id
            "#,
        )
        .bind(db_id(id)?)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn all_entries(&self) -> Result<Vec<VersionedEntry>, PipelineError> {
        let rows = sqlx::query(
            r#"
            SELECT app_id, attributes, valid_from, valid_to, is_active
              FROM catalog_versions
             ORDER BY app_id, valid_from, is_active, version_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(entry_from_row).collect()
    }
}
