//! Postgres-backed [`Store`]. Schema lives in `migrations/`.
use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use crate::database_ops::store::{Location, StagedRecord, Store, StoreTx, StoredGame};
use crate::error::StoreError;
use crate::model::{
    FailureReason, GamePayload, GameRecord, LifecycleState, Price, RecordKey, ReviewSummary,
    Source, Tag,
};
use crate::sync::staleness::StalenessPredicate;

const RECORD_COLUMNS: &str = "source, external_id, state, payload, release_date, last_checked";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_tags(&self, key: &RecordKey) -> Result<Vec<Tag>, StoreError> {
        let tags: Vec<String> = sqlx::query_scalar(
            "SELECT tag FROM sync_game_tags WHERE source = $1 AND external_id = $2 ORDER BY tag",
        )
        .persistent(false)
        .bind(key.source.as_str())
        .bind(&key.external_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tags.into_iter().map(Tag).collect())
    }

    async fn load_reviews(&self, key: &RecordKey) -> Result<Option<ReviewSummary>, StoreError> {
        let row = sqlx::query(
            "SELECT review_score, review_score_desc, total_positive, total_negative, total_reviews
             FROM sync_game_reviews WHERE source = $1 AND external_id = $2",
        )
        .persistent(false)
        .bind(key.source.as_str())
        .bind(&key.external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| -> Result<ReviewSummary, StoreError> {
            Ok(ReviewSummary {
                review_score: r.try_get("review_score")?,
                review_score_desc: r.try_get("review_score_desc")?,
                total_positive: r.try_get("total_positive")?,
                total_negative: r.try_get("total_negative")?,
                total_reviews: r.try_get("total_reviews")?,
            })
        })
        .transpose()
    }
}

fn decode_err(msg: String) -> StoreError {
    StoreError::Decode(msg)
}

fn record_from_row(row: &PgRow) -> Result<GameRecord, StoreError> {
    let source: String = row.try_get("source")?;
    let state: String = row.try_get("state")?;
    let Json(payload): Json<GamePayload> = row.try_get("payload")?;
    Ok(GameRecord {
        key: RecordKey::new(
            source.parse::<Source>().map_err(decode_err)?,
            row.try_get::<String, _>("external_id")?,
        ),
        state: state.parse::<LifecycleState>().map_err(decode_err)?,
        payload,
        release_date: row.try_get::<Option<NaiveDate>, _>("release_date")?,
        last_checked: row.try_get::<DateTime<Utc>, _>("last_checked")?,
    })
}

fn key_from_row(row: &PgRow) -> Result<RecordKey, StoreError> {
    let source: String = row.try_get("source")?;
    Ok(RecordKey::new(
        source.parse::<Source>().map_err(decode_err)?,
        row.try_get::<String, _>("external_id")?,
    ))
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }

    #[instrument(skip(self, key), fields(key = %key))]
    async fn locate(&self, key: &RecordKey) -> Result<Location, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM sync_games WHERE source = $1 AND external_id = $2"
        );
        let row = sqlx::query(&sql)
            .persistent(false)
            .bind(key.source.as_str())
            .bind(&key.external_id)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = row {
            let record = record_from_row(&row)?;
            let tags = self.load_tags(key).await?;
            let reviews = self.load_reviews(key).await?;
            return Ok(Location::Main(Box::new(StoredGame {
                record,
                tags,
                reviews,
            })));
        }
        let staged: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM sync_games_staging WHERE source = $1 AND external_id = $2)",
        )
        .persistent(false)
        .bind(key.source.as_str())
        .bind(&key.external_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(if staged {
            Location::Staging
        } else {
            Location::Absent
        })
    }

    #[instrument(skip(self, staleness))]
    async fn select_by_state(
        &self,
        source: Source,
        state: LifecycleState,
        staleness: &StalenessPredicate,
        limit: usize,
    ) -> Result<Vec<RecordKey>, StoreError> {
        let rows = sqlx::query(
            "SELECT source, external_id FROM sync_games
             WHERE source = $1 AND state = $2 AND last_checked < $3
             ORDER BY last_checked, external_id
             LIMIT $4",
        )
        .persistent(false)
        .bind(source.as_str())
        .bind(state.as_str())
        .bind(staleness.cutoff())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(key_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn select_recent_releases(
        &self,
        source: Source,
        since: NaiveDate,
        limit: usize,
    ) -> Result<Vec<RecordKey>, StoreError> {
        let rows = sqlx::query(
            "SELECT source, external_id FROM sync_games
             WHERE source = $1 AND state = 'active' AND release_date >= $2
             ORDER BY release_date DESC, external_id
             LIMIT $3",
        )
        .persistent(false)
        .bind(source.as_str())
        .bind(since)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(key_from_row).collect()
    }

    async fn staged_records(&self, source: Source) -> Result<Vec<StagedRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS}, previous_state, staged_at, failure_reason
             FROM sync_games_staging WHERE source = $1
             ORDER BY staged_at, external_id"
        );
        let rows = sqlx::query(&sql)
            .persistent(false)
            .bind(source.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<StagedRecord, StoreError> {
                let previous: String = row.try_get("previous_state")?;
                Ok(StagedRecord {
                    record: record_from_row(row)?,
                    previous_state: previous.parse::<LifecycleState>().map_err(decode_err)?,
                    staged_at: row.try_get("staged_at")?,
                    failure_reason: row.try_get("failure_reason")?,
                })
            })
            .collect()
    }

    async fn staging_is_empty(&self) -> Result<bool, StoreError> {
        let any: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM sync_games_staging)")
            .persistent(false)
            .fetch_one(&self.pool)
            .await?;
        Ok(!any)
    }

    async fn mark_staging_failed(
        &self,
        key: &RecordKey,
        reason: &FailureReason,
    ) -> Result<(), StoreError> {
        let res = sqlx::query(
            "UPDATE sync_games_staging SET failure_reason = $3 WHERE source = $1 AND external_id = $2",
        )
        .persistent(false)
        .bind(key.source.as_str())
        .bind(&key.external_id)
        .bind(reason.to_string())
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::Transaction(format!("{key} is not staged")));
        }
        Ok(())
    }

    async fn max_external_id(&self, source: Source) -> Result<Option<String>, StoreError> {
        let id: Option<String> = sqlx::query_scalar(
            "SELECT external_id FROM (
                 SELECT external_id FROM sync_games WHERE source = $1
                 UNION ALL
                 SELECT external_id FROM sync_games_staging WHERE source = $1
             ) ids
             ORDER BY (external_id !~ '^[0-9]+$') DESC,
                      length(ltrim(external_id, '0')) DESC,
                      ltrim(external_id, '0') DESC
             LIMIT 1",
        )
        .persistent(false)
        .bind(source.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

fn key_columns(keys: &[&RecordKey]) -> (Vec<String>, Vec<String>) {
    keys.iter()
        .map(|k| (k.source.as_str().to_string(), k.external_id.clone()))
        .unzip()
}

#[async_trait]
impl StoreTx for PgTx {
    async fn move_to_staging(&mut self, keys: &[RecordKey]) -> Result<usize, StoreError> {
        let unique: Vec<&RecordKey> = keys.iter().collect::<BTreeSet<_>>().into_iter().collect();
        if unique.is_empty() {
            return Ok(0);
        }
        let (sources, ids) = key_columns(&unique);
        let res = sqlx::query(
            "WITH moved AS (
                 DELETE FROM sync_games g
                 USING unnest($1::text[], $2::text[]) AS k(source, external_id)
                 WHERE g.source = k.source AND g.external_id = k.external_id
                 RETURNING g.source, g.external_id, g.state, g.name, g.payload,
                           g.release_date, g.last_checked
             )
             INSERT INTO sync_games_staging
                 (source, external_id, state, previous_state, name, payload,
                  release_date, last_checked, staged_at)
             SELECT source, external_id, 'staged', state, name, payload,
                    release_date, last_checked, now()
             FROM moved",
        )
        .persistent(false)
        .bind(&sources)
        .bind(&ids)
        .execute(&mut *self.tx)
        .await?;
        let moved = res.rows_affected() as usize;
        if moved != unique.len() {
            return Err(StoreError::Transaction(format!(
                "expected to stage {} rows, staged {}",
                unique.len(),
                moved
            )));
        }
        debug!(moved, "moved rows to staging");
        Ok(moved)
    }

    async fn upsert_record(&mut self, record: &GameRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_games
                 (source, external_id, state, name, payload, release_date, last_checked)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (source, external_id) DO UPDATE SET
                 state = EXCLUDED.state,
                 name = EXCLUDED.name,
                 payload = EXCLUDED.payload,
                 release_date = EXCLUDED.release_date,
                 last_checked = EXCLUDED.last_checked,
                 updated_at = CASE
                     WHEN sync_games.payload IS DISTINCT FROM EXCLUDED.payload
                       OR sync_games.state IS DISTINCT FROM EXCLUDED.state
                     THEN now() ELSE sync_games.updated_at END",
        )
        .persistent(false)
        .bind(record.key.source.as_str())
        .bind(&record.key.external_id)
        .bind(record.state.as_str())
        .bind(&record.payload.name)
        .bind(Json(&record.payload))
        .bind(record.release_date)
        .bind(record.last_checked)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn replace_nested(&mut self, key: &RecordKey, tags: &[Tag]) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sync_game_tags WHERE source = $1 AND external_id = $2")
            .persistent(false)
            .bind(key.source.as_str())
            .bind(&key.external_id)
            .execute(&mut *self.tx)
            .await?;
        if tags.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = tags.iter().map(Tag::as_str).collect();
        sqlx::query(
            "INSERT INTO sync_game_tags (source, external_id, tag)
             SELECT $1, $2, t FROM unnest($3::text[]) AS t
             ON CONFLICT DO NOTHING",
        )
        .persistent(false)
        .bind(key.source.as_str())
        .bind(&key.external_id)
        .bind(&names)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn replace_reviews(
        &mut self,
        key: &RecordKey,
        reviews: &ReviewSummary,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_game_reviews
                 (source, external_id, review_score, review_score_desc,
                  total_positive, total_negative, total_reviews, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, now())
             ON CONFLICT (source, external_id) DO UPDATE SET
                 review_score = EXCLUDED.review_score,
                 review_score_desc = EXCLUDED.review_score_desc,
                 total_positive = EXCLUDED.total_positive,
                 total_negative = EXCLUDED.total_negative,
                 total_reviews = EXCLUDED.total_reviews,
                 updated_at = now()",
        )
        .persistent(false)
        .bind(key.source.as_str())
        .bind(&key.external_id)
        .bind(reviews.review_score)
        .bind(&reviews.review_score_desc)
        .bind(reviews.total_positive)
        .bind(reviews.total_negative)
        .bind(reviews.total_reviews)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn append_price(
        &mut self,
        key: &RecordKey,
        price: &Price,
        recorded_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_price_history
                 (source, external_id, currency, initial_minor, final_minor,
                  discount_percent, recorded_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .persistent(false)
        .bind(key.source.as_str())
        .bind(&key.external_id)
        .bind(&price.currency)
        .bind(price.initial_minor)
        .bind(price.final_minor)
        .bind(price.discount_percent)
        .bind(recorded_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_from_staging(&mut self, key: &RecordKey) -> Result<bool, StoreError> {
        let res =
            sqlx::query("DELETE FROM sync_games_staging WHERE source = $1 AND external_id = $2")
                .persistent(false)
                .bind(key.source.as_str())
                .bind(&key.external_id)
                .execute(&mut *self.tx)
                .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
