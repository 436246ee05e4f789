use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::Row;
use tokio::sync::Mutex;

use crate::connection::DbPool;
use crate::record::{
    Collection, DocWatcher, Filter, OrderBy, QueryWatcher, RecordStore, StoreError, VersionedDoc,
};
use crate::watchers::WatcherRegistry;

/// SQLite-backed store: one `documents` table keyed by (collection, id),
/// bodies stored as JSON text, filters compiled to `json_extract` clauses.
///
/// Change notification is process-local: the `write_gate` spans every
/// commit-plus-notify pair so per-document deliveries stay in commit order.
pub struct SqliteStore {
    pool: DbPool,
    watchers: WatcherRegistry,
    write_gate: Mutex<()>,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool, watchers: WatcherRegistry::default(), write_gate: Mutex::new(()) }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn fetch_doc(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<VersionedDoc>, StoreError> {
        let row = sqlx::query("SELECT id, version, body FROM documents WHERE collection = ? AND id = ?")
            .bind(collection.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_doc).transpose()
    }

    async fn run_query(
        &self,
        collection: Collection,
        filters: &[Filter],
        order_by: Option<&OrderBy>,
        limit: Option<u32>,
    ) -> Result<Vec<VersionedDoc>, StoreError> {
        let mut sql = String::from("SELECT id, version, body FROM documents WHERE collection = ?");
        for filter in filters {
            sql.push_str(match filter {
                Filter::Eq { .. } => " AND json_extract(body, ?) = ?",
                Filter::Gte { .. } => " AND json_extract(body, ?) >= ?",
                Filter::Lte { .. } => " AND json_extract(body, ?) <= ?",
            });
        }
        if let Some(order) = order_by {
            sql.push_str(" ORDER BY json_extract(body, ?)");
            sql.push_str(if order.descending { " DESC" } else { " ASC" });
        }
        if limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql).bind(collection.as_str());
        for filter in filters {
            query = query.bind(json_path(filter.field()));
            query = bind_value(query, filter.value())?;
        }
        if let Some(order) = order_by {
            query = query.bind(json_path(&order.field));
        }
        if let Some(limit) = limit {
            query = query.bind(i64::from(limit));
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_doc).collect()
    }

    /// Must run while the write gate is held.
    async fn notify(&self, collection: Collection, id: &str) -> Result<(), StoreError> {
        if let Some(doc) = self.fetch_doc(collection, id).await? {
            self.watchers.notify_doc(collection, id, &doc);
        }

        for (watch_id, filters) in self.watchers.query_watches(collection) {
            let results = self.run_query(collection, &filters, None, None).await?;
            self.watchers.push_query(watch_id, results);
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn get(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<VersionedDoc>, StoreError> {
        self.fetch_doc(collection, id).await
    }

    async fn put(
        &self,
        collection: Collection,
        id: &str,
        body: Value,
    ) -> Result<u64, StoreError> {
        let _gate = self.write_gate.lock().await;
        let version: i64 = sqlx::query(
            "INSERT INTO documents (collection, id, version, body, updated_at)
             VALUES (?, ?, 1, ?, ?)
             ON CONFLICT (collection, id) DO UPDATE
             SET body = excluded.body,
                 version = documents.version + 1,
                 updated_at = excluded.updated_at
             RETURNING version",
        )
        .bind(collection.as_str())
        .bind(id)
        .bind(body.to_string())
        .bind(Utc::now().timestamp_millis())
        .fetch_one(&self.pool)
        .await?
        .get(0);

        self.notify(collection, id).await?;
        Ok(version as u64)
    }

    async fn put_checked(
        &self,
        collection: Collection,
        id: &str,
        body: Value,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let _gate = self.write_gate.lock().await;
        let updated = sqlx::query(
            "UPDATE documents
             SET body = ?, version = version + 1, updated_at = ?
             WHERE collection = ? AND id = ? AND version = ?
             RETURNING version",
        )
        .bind(body.to_string())
        .bind(Utc::now().timestamp_millis())
        .bind(collection.as_str())
        .bind(id)
        .bind(expected_version as i64)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = updated else {
            return match self.fetch_doc(collection, id).await? {
                Some(_) => Err(StoreError::VersionConflict { collection, id: id.to_string() }),
                None => Err(StoreError::Missing { collection, id: id.to_string() }),
            };
        };

        self.notify(collection, id).await?;
        Ok(row.get::<i64, _>(0) as u64)
    }

    async fn update_fields(
        &self,
        collection: Collection,
        id: &str,
        fields: serde_json::Map<String, Value>,
    ) -> Result<u64, StoreError> {
        let _gate = self.write_gate.lock().await;
        let Some(doc) = self.fetch_doc(collection, id).await? else {
            return Err(StoreError::Missing { collection, id: id.to_string() });
        };

        let mut body = doc.body;
        if let Value::Object(map) = &mut body {
            for (key, value) in fields {
                map.insert(key, value);
            }
        }

        let version: i64 = sqlx::query(
            "UPDATE documents
             SET body = ?, version = version + 1, updated_at = ?
             WHERE collection = ? AND id = ?
             RETURNING version",
        )
        .bind(body.to_string())
        .bind(Utc::now().timestamp_millis())
        .bind(collection.as_str())
        .bind(id)
        .fetch_one(&self.pool)
        .await?
        .get(0);

        self.notify(collection, id).await?;
        Ok(version as u64)
    }

    async fn query(
        &self,
        collection: Collection,
        filters: &[Filter],
        order_by: Option<&OrderBy>,
        limit: Option<u32>,
    ) -> Result<Vec<VersionedDoc>, StoreError> {
        self.run_query(collection, filters, order_by, limit).await
    }

    async fn count(&self, collection: Collection, filters: &[Filter]) -> Result<u64, StoreError> {
        let mut sql = String::from("SELECT COUNT(*) FROM documents WHERE collection = ?");
        for filter in filters {
            sql.push_str(match filter {
                Filter::Eq { .. } => " AND json_extract(body, ?) = ?",
                Filter::Gte { .. } => " AND json_extract(body, ?) >= ?",
                Filter::Lte { .. } => " AND json_extract(body, ?) <= ?",
            });
        }

        let mut query = sqlx::query(&sql).bind(collection.as_str());
        for filter in filters {
            query = query.bind(json_path(filter.field()));
            query = bind_value(query, filter.value())?;
        }

        let count: i64 = query.fetch_one(&self.pool).await?.get(0);
        Ok(count as u64)
    }

    async fn watch_doc(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<DocWatcher, StoreError> {
        // The gate keeps the snapshot and the registration atomic with
        // respect to concurrent writers.
        let _gate = self.write_gate.lock().await;
        let snapshot = self.fetch_doc(collection, id).await?;
        Ok(self.watchers.register_doc(collection, id, snapshot))
    }

    async fn watch_query(
        &self,
        collection: Collection,
        filters: Vec<Filter>,
    ) -> Result<QueryWatcher, StoreError> {
        let _gate = self.write_gate.lock().await;
        let snapshot = self.run_query(collection, &filters, None, None).await?;
        Ok(self.watchers.register_query(collection, filters, snapshot))
    }
}

fn row_to_doc(row: SqliteRow) -> Result<VersionedDoc, StoreError> {
    let body: String = row.get("body");
    Ok(VersionedDoc {
        id: row.get("id"),
        version: row.get::<i64, _>("version") as u64,
        body: serde_json::from_str(&body)?,
    })
}

fn json_path(field: &str) -> String {
    format!("$.{field}")
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Result<Query<'q, Sqlite, SqliteArguments<'q>>, StoreError> {
    Ok(match value {
        Value::String(text) => query.bind(text.clone()),
        Value::Number(number) if number.is_i64() || number.is_u64() => {
            query.bind(number.as_i64().unwrap_or(i64::MAX))
        }
        Value::Number(number) => query.bind(number.as_f64().unwrap_or_default()),
        Value::Bool(flag) => query.bind(i64::from(*flag)),
        other => {
            return Err(StoreError::Unavailable(format!("unsupported filter value: {other}")))
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::SqliteStore;
    use crate::connection::connect_with_settings;
    use crate::migrations::run_pending;
    use crate::record::{Collection, Filter, OrderBy, RecordStore, StoreError};

    async fn store() -> SqliteStore {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("migrate");
        SqliteStore::new(pool)
    }

    #[tokio::test]
    async fn put_get_and_versioning_match_the_memory_backend() {
        let store = store().await;

        assert_eq!(
            store.put(Collection::Quotes, "q-1", json!({"total": "122.00"})).await.expect("put"),
            1
        );
        assert_eq!(
            store.put(Collection::Quotes, "q-1", json!({"total": "130.00"})).await.expect("put"),
            2
        );

        let doc = store.get(Collection::Quotes, "q-1").await.expect("get").expect("present");
        assert_eq!(doc.version, 2);
        assert_eq!(doc.body["total"], json!("130.00"));
        assert!(store.get(Collection::Quotes, "q-9").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn put_checked_detects_stale_versions() {
        let store = store().await;
        store.put(Collection::BookingRequests, "b-1", json!({"n": 0})).await.expect("seed");

        store
            .put_checked(Collection::BookingRequests, "b-1", json!({"n": 1}), 1)
            .await
            .expect("fresh CAS");

        let stale = store
            .put_checked(Collection::BookingRequests, "b-1", json!({"n": 2}), 1)
            .await
            .expect_err("stale CAS");
        assert!(matches!(stale, StoreError::VersionConflict { .. }));

        let missing = store
            .put_checked(Collection::BookingRequests, "b-9", json!({}), 1)
            .await
            .expect_err("missing doc");
        assert!(matches!(missing, StoreError::Missing { .. }));
    }

    #[tokio::test]
    async fn json_extract_filters_order_and_limit() {
        let store = store().await;
        for (id, workshop, created) in
            [("b-1", "w-1", 100), ("b-2", "w-1", 300), ("b-3", "w-2", 200)]
        {
            store
                .put(
                    Collection::BookingRequests,
                    id,
                    json!({"workshop": {"id": workshop}, "created_at": created}),
                )
                .await
                .expect("seed");
        }

        let results = store
            .query(
                Collection::BookingRequests,
                &[Filter::eq("workshop.id", "w-1")],
                Some(&OrderBy::desc("created_at")),
                None,
            )
            .await
            .expect("query");
        let ids: Vec<&str> = results.iter().map(|doc| doc.id.as_str()).collect();
        assert_eq!(ids, ["b-2", "b-1"]);

        let limited = store
            .query(Collection::BookingRequests, &[], Some(&OrderBy::asc("created_at")), Some(1))
            .await
            .expect("query");
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, "b-1");

        let count = store
            .count(
                Collection::BookingRequests,
                &[Filter::gte("created_at", 150), Filter::lte("created_at", 250)],
            )
            .await
            .expect("count");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn update_fields_preserves_unrelated_keys() {
        let store = store().await;
        store
            .put(Collection::BookingRequests, "b-1", json!({"status": "pending", "n": 7}))
            .await
            .expect("seed");

        let mut fields = serde_json::Map::new();
        fields.insert("status".to_string(), json!("cancelled"));
        store.update_fields(Collection::BookingRequests, "b-1", fields).await.expect("update");

        let doc =
            store.get(Collection::BookingRequests, "b-1").await.expect("get").expect("present");
        assert_eq!(doc.body["status"], json!("cancelled"));
        assert_eq!(doc.body["n"], json!(7));
        assert_eq!(doc.version, 2);
    }

    #[tokio::test]
    async fn watchers_receive_snapshot_and_changes() {
        let store = store().await;
        store.put(Collection::Quotes, "q-1", json!({"rev": 0})).await.expect("seed");

        let mut watcher = store.watch_doc(Collection::Quotes, "q-1").await.expect("watch");
        assert_eq!(watcher.next().await.expect("snapshot").body["rev"], json!(0));

        store.put(Collection::Quotes, "q-1", json!({"rev": 1})).await.expect("write");
        assert_eq!(watcher.next().await.expect("change").body["rev"], json!(1));
    }
}
