//! Durable tier on a single Postgres `entries` table with optimistic merges.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Postgres, QueryBuilder};

use super::{Filter, PersistenceBackend, StoredEntry};
use crate::db::connection::DbPool;
use crate::error::{ConflictKind, StoreError};

#[derive(Debug, FromRow)]
struct EntryRow {
    partition: String,
    kind: String,
    key: String,
    deleted: bool,
    expires_at: Option<DateTime<Utc>>,
    attributes: serde_json::Value,
    version: i64,
}

impl From<EntryRow> for StoredEntry {
    fn from(row: EntryRow) -> Self {
        StoredEntry {
            partition: row.partition,
            kind: row.kind,
            key: row.key,
            deleted: row.deleted,
            expires_at: row.expires_at,
            attributes: row.attributes,
            version: row.version,
        }
    }
}

const SELECT_COLUMNS: &str =
    "SELECT partition, kind, key, deleted, expires_at, attributes, version FROM entries";

pub struct PgPersistence {
    pool: DbPool,
}

impl PgPersistence {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
    match filter {
        Filter::Equals { attribute, value } => {
            builder
                .push("attributes ->> ")
                .push_bind(attribute.clone())
                .push(" = ")
                .push_bind(value.clone());
        }
        Filter::Deleted(flag) => {
            builder.push("deleted = ").push_bind(*flag);
        }
        Filter::ExpiresAtOrBefore(at) => {
            builder.push("expires_at <= ").push_bind(*at);
        }
        Filter::And(filters) if filters.is_empty() => {
            builder.push("TRUE");
        }
        Filter::And(filters) => {
            builder.push("(");
            for (index, inner) in filters.iter().enumerate() {
                if index > 0 {
                    builder.push(" AND ");
                }
                push_filter(builder, inner);
            }
            builder.push(")");
        }
    }
}

fn map_write_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(ConflictKind::AttributeOrValueExists)
        }
        _ => StoreError::Database(err),
    }
}

#[async_trait]
impl PersistenceBackend for PgPersistence {
    async fn find(&self, partition: &str, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        let row = sqlx::query_as::<_, EntryRow>(&format!(
            "{} WHERE partition = $1 AND key = $2",
            SELECT_COLUMNS
        ))
        .bind(partition)
        .bind(key)
        .fetch_optional(&*self.pool)
        .await?;
        Ok(row.map(StoredEntry::from))
    }

    async fn find_entries(
        &self,
        partition: &str,
        kind: &str,
        filter: &Filter,
    ) -> Result<Vec<StoredEntry>, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new(SELECT_COLUMNS);
        builder
            .push(" WHERE partition = ")
            .push_bind(partition.to_string())
            .push(" AND kind = ")
            .push_bind(kind.to_string())
            .push(" AND ");
        push_filter(&mut builder, filter);
        builder.push(" ORDER BY key");

        let rows = builder
            .build_query_as::<EntryRow>()
            .fetch_all(&*self.pool)
            .await?;
        Ok(rows.into_iter().map(StoredEntry::from).collect())
    }

    async fn persist(&self, entry: &StoredEntry) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO entries (partition, kind, key, deleted, expires_at, attributes, version) \
             VALUES ($1, $2, $3, $4, $5, $6, 1) RETURNING version",
        )
        .bind(&entry.partition)
        .bind(&entry.kind)
        .bind(&entry.key)
        .bind(entry.deleted)
        .bind(entry.expires_at)
        .bind(&entry.attributes)
        .fetch_one(&*self.pool)
        .await
        .map_err(map_write_error)
    }

    async fn merge(&self, entry: &StoredEntry) -> Result<i64, StoreError> {
        let version = sqlx::query_scalar::<_, i64>(
            "UPDATE entries SET kind = $3, deleted = $4, expires_at = $5, attributes = $6, \
             version = version + 1 \
             WHERE partition = $1 AND key = $2 AND version = $7 RETURNING version",
        )
        .bind(&entry.partition)
        .bind(&entry.key)
        .bind(&entry.kind)
        .bind(entry.deleted)
        .bind(entry.expires_at)
        .bind(&entry.attributes)
        .bind(entry.version)
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_write_error)?;

        if let Some(version) = version {
            return Ok(version);
        }

        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM entries WHERE partition = $1 AND key = $2)",
        )
        .bind(&entry.partition)
        .bind(&entry.key)
        .fetch_one(&*self.pool)
        .await?;
        if exists {
            Err(StoreError::Conflict(ConflictKind::NoSuchAttribute))
        } else {
            Err(StoreError::NotFound(entry.cache_key()))
        }
    }

    async fn remove(&self, partition: &str, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM entries WHERE partition = $1 AND key = $2")
            .bind(partition)
            .bind(key)
            .execute(&*self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_by_filter(
        &self,
        partition: &str,
        kind: &str,
        filter: &Filter,
        limit: usize,
    ) -> Result<u64, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "DELETE FROM entries WHERE ctid IN (SELECT ctid FROM entries WHERE partition = ",
        );
        builder
            .push_bind(partition.to_string())
            .push(" AND kind = ")
            .push_bind(kind.to_string())
            .push(" AND ");
        push_filter(&mut builder, filter);
        builder
            .push(" LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .push(")");

        let result = builder.build().execute(&*self.pool).await?;
        Ok(result.rows_affected())
    }

    fn has_native_expiration_support(&self, _partition: &str) -> bool {
        false
    }
}
