use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, SqlitePool, query, sqlite::SqlitePoolOptions};
use std::path::Path;

use crate::model::{ContextEntityType, DeleteMode, EntityRecord};

/// Catalog provides access to the local context entity tables (PostgreSQL or SQLite).
#[derive(Clone)]
pub enum Catalog {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Catalog::Postgres(_) => f.write_str("Catalog::Postgres"),
            Catalog::Sqlite(_) => f.write_str("Catalog::Sqlite"),
        }
    }
}

impl Catalog {
    /// Create a new Catalog client and initialize schema.
    pub async fn new(dsn: &str) -> Result<Self, sqlx::Error> {
        log::info!("Connecting to catalog database with DSN: {dsn}");

        let catalog = if dsn.starts_with("sqlite:") {
            ensure_data_directory(dsn)?;

            // Add mode=rwc to create database file if it doesn't exist
            let dsn_with_create = if dsn.contains('?') {
                if dsn.contains("mode=") {
                    dsn.to_string()
                } else {
                    format!("{dsn}&mode=rwc")
                }
            } else {
                format!("{dsn}?mode=rwc")
            };

            // A single connection keeps an in-memory database visible to every query
            let max_connections = if dsn.contains(":memory:") { 1 } else { 8 };
            let pool = SqlitePoolOptions::new()
                .max_connections(max_connections)
                .connect(&dsn_with_create)
                .await
                .map_err(|e| {
                    log::error!(
                        "Failed to connect to SQLite database with DSN '{dsn_with_create}': {e}"
                    );
                    e
                })?;
            Catalog::Sqlite(pool)
        } else {
            let pool = PgPool::connect(dsn).await.map_err(|e| {
                log::error!("Failed to connect to PostgreSQL database with DSN '{dsn}': {e}");
                e
            })?;
            Catalog::Postgres(pool)
        };

        log::info!("Database connection established successfully");
        catalog.init().await.map_err(|e| {
            log::error!("Failed to initialize catalog schema: {e}");
            e
        })?;
        log::info!("Catalog schema initialized successfully");
        Ok(catalog)
    }

    /// Initialize one table per context entity type if it does not exist.
    async fn init(&self) -> Result<(), sqlx::Error> {
        for entity_type in ContextEntityType::ALL {
            let table = entity_type.table();
            let column = entity_type.display_column();
            match self {
                Catalog::Sqlite(pool) => {
                    let create = format!(
                        r#"
                        CREATE TABLE IF NOT EXISTS {table} (
                            id INTEGER PRIMARY KEY,
                            {column} TEXT NOT NULL,
                            is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
                            updated_at TEXT NOT NULL
                        )"#
                    );
                    query(&create).execute(pool).await?;
                }
                Catalog::Postgres(pool) => {
                    let create = format!(
                        r#"
                        CREATE TABLE IF NOT EXISTS {table} (
                            id BIGINT PRIMARY KEY,
                            {column} TEXT NOT NULL,
                            is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
                            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                        )"#
                    );
                    query(&create).execute(pool).await?;
                }
            }
        }

        Ok(())
    }

    /// Insert a live context entity.
    pub async fn insert_entity(
        &self,
        entity_type: ContextEntityType,
        id: i64,
        display: &str,
    ) -> Result<(), sqlx::Error> {
        let table = entity_type.table();
        let column = entity_type.display_column();
        match self {
            Catalog::Sqlite(pool) => {
                let stmt = format!(
                    "INSERT INTO {table} (id, {column}, is_deleted, updated_at) VALUES (?, ?, FALSE, ?)"
                );
                query(&stmt)
                    .bind(id)
                    .bind(display)
                    .bind(Utc::now().to_rfc3339())
                    .execute(pool)
                    .await?;
            }
            Catalog::Postgres(pool) => {
                let stmt = format!(
                    "INSERT INTO {table} (id, {column}, is_deleted, updated_at) VALUES ($1, $2, FALSE, NOW())"
                );
                query(&stmt).bind(id).bind(display).execute(pool).await?;
            }
        }
        Ok(())
    }

    /// Get a live entity by id. Soft-deleted rows are not returned.
    pub async fn get_entity(
        &self,
        entity_type: ContextEntityType,
        id: i64,
    ) -> Result<Option<EntityRecord>, sqlx::Error> {
        let mut records = self.fetch_existing(entity_type, &[id]).await?;
        Ok(records.pop())
    }

    /// Fetch the live rows among `ids` in a single query.
    pub async fn fetch_existing(
        &self,
        entity_type: ContextEntityType,
        ids: &[i64],
    ) -> Result<Vec<EntityRecord>, sqlx::Error> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let table = entity_type.table();
        let column = entity_type.display_column();
        match self {
            Catalog::Sqlite(pool) => {
                let stmt = format!(
                    "SELECT id, {column} AS display, updated_at FROM {table} \
                     WHERE is_deleted = FALSE AND id IN ({})",
                    sqlite_placeholders(ids.len())
                );
                let mut q = query(&stmt);
                for id in ids {
                    q = q.bind(*id);
                }
                let rows = q.fetch_all(pool).await?;

                let mut records = Vec::with_capacity(rows.len());
                for row in rows {
                    let updated_at_str: String = row.get("updated_at");
                    let updated_at = DateTime::parse_from_rfc3339(&updated_at_str)
                        .map_err(|_| sqlx::Error::Decode("Invalid timestamp format".into()))?
                        .with_timezone(&Utc);
                    records.push(EntityRecord {
                        id: row.get("id"),
                        display: row.get("display"),
                        updated_at,
                    });
                }
                Ok(records)
            }
            Catalog::Postgres(pool) => {
                let stmt = format!(
                    "SELECT id, {column} AS display, updated_at FROM {table} \
                     WHERE is_deleted = FALSE AND id IN ({})",
                    pg_placeholders(ids.len(), 0)
                );
                let mut q = query(&stmt);
                for id in ids {
                    q = q.bind(*id);
                }
                let rows = q.fetch_all(pool).await?;

                let mut records = Vec::with_capacity(rows.len());
                for row in rows {
                    records.push(EntityRecord {
                        id: row.get("id"),
                        display: row.get("display"),
                        updated_at: row.get("updated_at"),
                    });
                }
                Ok(records)
            }
        }
    }

    /// Mark `ids` as deleted in one transaction. Returns the number of rows changed.
    pub async fn soft_delete_batch(
        &self,
        entity_type: ContextEntityType,
        ids: &[i64],
    ) -> Result<u64, sqlx::Error> {
        if ids.is_empty() {
            return Ok(0);
        }

        let table = entity_type.table();
        match self {
            Catalog::Sqlite(pool) => {
                let stmt = format!(
                    "UPDATE {table} SET is_deleted = TRUE, updated_at = ? \
                     WHERE is_deleted = FALSE AND id IN ({})",
                    sqlite_placeholders(ids.len())
                );
                let mut tx = pool.begin().await?;
                let mut q = query(&stmt).bind(Utc::now().to_rfc3339());
                for id in ids {
                    q = q.bind(*id);
                }
                let result = q.execute(&mut *tx).await?;
                tx.commit().await?;
                Ok(result.rows_affected())
            }
            Catalog::Postgres(pool) => {
                let stmt = format!(
                    "UPDATE {table} SET is_deleted = TRUE, updated_at = NOW() \
                     WHERE is_deleted = FALSE AND id IN ({})",
                    pg_placeholders(ids.len(), 0)
                );
                let mut tx = pool.begin().await?;
                let mut q = query(&stmt);
                for id in ids {
                    q = q.bind(*id);
                }
                let result = q.execute(&mut *tx).await?;
                tx.commit().await?;
                Ok(result.rows_affected())
            }
        }
    }

    /// Physically remove `ids` in one transaction. Returns the number of rows removed.
    pub async fn hard_delete_batch(
        &self,
        entity_type: ContextEntityType,
        ids: &[i64],
    ) -> Result<u64, sqlx::Error> {
        if ids.is_empty() {
            return Ok(0);
        }

        let table = entity_type.table();
        match self {
            Catalog::Sqlite(pool) => {
                let stmt = format!(
                    "DELETE FROM {table} WHERE id IN ({})",
                    sqlite_placeholders(ids.len())
                );
                let mut tx = pool.begin().await?;
                let mut q = query(&stmt);
                for id in ids {
                    q = q.bind(*id);
                }
                let result = q.execute(&mut *tx).await?;
                tx.commit().await?;
                Ok(result.rows_affected())
            }
            Catalog::Postgres(pool) => {
                let stmt = format!(
                    "DELETE FROM {table} WHERE id IN ({})",
                    pg_placeholders(ids.len(), 0)
                );
                let mut tx = pool.begin().await?;
                let mut q = query(&stmt);
                for id in ids {
                    q = q.bind(*id);
                }
                let result = q.execute(&mut *tx).await?;
                tx.commit().await?;
                Ok(result.rows_affected())
            }
        }
    }

    /// Raw row state regardless of the soft-delete marker:
    /// `None` when no row exists, otherwise the value of `is_deleted`.
    pub async fn deletion_state(
        &self,
        entity_type: ContextEntityType,
        id: i64,
    ) -> Result<Option<bool>, sqlx::Error> {
        let table = entity_type.table();
        let row = match self {
            Catalog::Sqlite(pool) => {
                let stmt = format!("SELECT is_deleted FROM {table} WHERE id = ?");
                query(&stmt)
                    .bind(id)
                    .fetch_optional(pool)
                    .await?
                    .map(|row| row.get::<bool, _>("is_deleted"))
            }
            Catalog::Postgres(pool) => {
                let stmt = format!("SELECT is_deleted FROM {table} WHERE id = $1");
                query(&stmt)
                    .bind(id)
                    .fetch_optional(pool)
                    .await?
                    .map(|row| row.get::<bool, _>("is_deleted"))
            }
        };
        Ok(row)
    }
}

/// Storage seam used by the bulk delete coordinator.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Live records among `ids`; ids without a live row are simply absent.
    async fn fetch_existing(
        &self,
        entity_type: ContextEntityType,
        ids: &[i64],
    ) -> Result<Vec<EntityRecord>, sqlx::Error>;

    /// Delete `ids` atomically: all rows change or none do.
    async fn delete_batch(
        &self,
        entity_type: ContextEntityType,
        ids: &[i64],
        mode: DeleteMode,
    ) -> Result<u64, sqlx::Error>;
}

#[async_trait]
impl EntityStore for Catalog {
    async fn fetch_existing(
        &self,
        entity_type: ContextEntityType,
        ids: &[i64],
    ) -> Result<Vec<EntityRecord>, sqlx::Error> {
        Catalog::fetch_existing(self, entity_type, ids).await
    }

    async fn delete_batch(
        &self,
        entity_type: ContextEntityType,
        ids: &[i64],
        mode: DeleteMode,
    ) -> Result<u64, sqlx::Error> {
        match mode {
            DeleteMode::Soft => self.soft_delete_batch(entity_type, ids).await,
            DeleteMode::Hard => self.hard_delete_batch(entity_type, ids).await,
        }
    }
}

/// Create the parent directory of a file-backed SQLite DSN.
fn ensure_data_directory(dsn: &str) -> std::io::Result<()> {
    let path = dsn
        .strip_prefix("sqlite://")
        .or_else(|| dsn.strip_prefix("sqlite:"))
        .unwrap_or(dsn);
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path.contains(":memory:") {
        return Ok(());
    }

    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            log::info!("Created data directory: {}", parent.display());
        }
    }
    Ok(())
}

fn sqlite_placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn pg_placeholders(count: usize, offset: usize) -> String {
    (1..=count)
        .map(|i| format!("${}", i + offset))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_catalog() -> Catalog {
        let catalog = Catalog::new("sqlite::memory:").await.unwrap();
        catalog
            .insert_entity(ContextEntityType::Category, 103, "Laptops")
            .await
            .unwrap();
        catalog
            .insert_entity(ContextEntityType::Category, 104, "Monitors")
            .await
            .unwrap();
        catalog
            .insert_entity(ContextEntityType::Location, 7, "Lisbon")
            .await
            .unwrap();
        catalog
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(sqlite_placeholders(3), "?, ?, ?");
        assert_eq!(pg_placeholders(3, 0), "$1, $2, $3");
        assert_eq!(pg_placeholders(2, 1), "$2, $3");
    }

    #[tokio::test]
    async fn test_fetch_existing_returns_only_known_ids() {
        let catalog = seeded_catalog().await;

        let mut records = catalog
            .fetch_existing(ContextEntityType::Category, &[103, 104, 999])
            .await
            .unwrap();
        records.sort_by_key(|r| r.id);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, 103);
        assert_eq!(records[0].display, "Laptops");
        assert_eq!(records[1].display, "Monitors");
    }

    #[tokio::test]
    async fn test_display_column_per_type() {
        let catalog = seeded_catalog().await;
        let location = catalog
            .get_entity(ContextEntityType::Location, 7)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(location.display, "Lisbon");

        // Same id in a different table is a different entity
        assert!(
            catalog
                .get_entity(ContextEntityType::Status, 7)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_soft_delete_hides_rows() {
        let catalog = seeded_catalog().await;

        let changed = catalog
            .soft_delete_batch(ContextEntityType::Category, &[103])
            .await
            .unwrap();
        assert_eq!(changed, 1);

        assert!(
            catalog
                .get_entity(ContextEntityType::Category, 103)
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(
            catalog
                .deletion_state(ContextEntityType::Category, 103)
                .await
                .unwrap(),
            Some(true)
        );

        // Deleting again changes nothing
        let changed = catalog
            .soft_delete_batch(ContextEntityType::Category, &[103])
            .await
            .unwrap();
        assert_eq!(changed, 0);
    }

    #[tokio::test]
    async fn test_hard_delete_removes_rows() {
        let catalog = seeded_catalog().await;

        let removed = catalog
            .delete_batch(ContextEntityType::Category, &[103, 104], DeleteMode::Hard)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(
            catalog
                .deletion_state(ContextEntityType::Category, 104)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_empty_batches_are_noops() {
        let catalog = seeded_catalog().await;
        assert!(
            catalog
                .fetch_existing(ContextEntityType::Category, &[])
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            catalog
                .soft_delete_batch(ContextEntityType::Category, &[])
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_duplicate_insert_fails() {
        let catalog = seeded_catalog().await;
        let result = catalog
            .insert_entity(ContextEntityType::Category, 103, "Again")
            .await;
        assert!(result.is_err());
    }
}
