//! PostgreSQL document store
//!
//! All documents share the `documents` table created by
//! [`crate::db::run_migrations`].

use async_trait::async_trait;
use sqlx::PgPool;

use super::{DocumentStore, Kind, Record, StoreError};

#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn create(&self, kind: Kind, key: &str, data: serde_json::Value) -> Result<(), StoreError> {
        let now = chrono::Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO documents (kind, key, data, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (kind, key) DO NOTHING
            "#,
        )
        .bind(kind.as_str())
        .bind(key)
        .bind(data)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                kind,
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn update(&self, kind: Kind, key: &str, data: serde_json::Value) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET data = $3, updated_at = $4
            WHERE kind = $1 AND key = $2
            "#,
        )
        .bind(kind.as_str())
        .bind(key)
        .bind(data)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind,
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn delete(&self, kind: Kind, key: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM documents WHERE kind = $1 AND key = $2")
            .bind(kind.as_str())
            .bind(key)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind,
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn get(&self, kind: Kind, key: &str) -> Result<Option<Record>, StoreError> {
        let row = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT key, data
            FROM documents
            WHERE kind = $1 AND key = $2
            "#,
        )
        .bind(kind.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into_record(kind)))
    }

    async fn list(&self, kind: Kind) -> Result<Vec<Record>, StoreError> {
        let rows = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT key, data
            FROM documents
            WHERE kind = $1
            ORDER BY key ASC
            "#,
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into_record(kind)).collect())
    }
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    key: String,
    data: serde_json::Value,
}

impl DocumentRow {
    fn into_record(self, kind: Kind) -> Record {
        Record {
            kind,
            key: self.key,
            data: self.data,
        }
    }
}
