use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::record::{
    compare_values, field_value, matches_filters, Collection, DocWatcher, Filter, OrderBy,
    QueryWatcher, RecordStore, StoreError, VersionedDoc,
};
use crate::watchers::WatcherRegistry;

#[derive(Default)]
struct Entry {
    version: u64,
    body: Value,
}

type Table = BTreeMap<String, Entry>;

/// Reference store backend: a per-collection map guarded by one lock.
/// Mutations notify watchers while still holding the write guard, so each
/// document's change feed is delivered strictly in commit order.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<Collection, Table>>,
    watchers: WatcherRegistry,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn run_query(
        tables: &HashMap<Collection, Table>,
        collection: Collection,
        filters: &[Filter],
        order_by: Option<&OrderBy>,
        limit: Option<u32>,
    ) -> Vec<VersionedDoc> {
        let mut results: Vec<VersionedDoc> = tables
            .get(&collection)
            .into_iter()
            .flat_map(|table| table.iter())
            .filter(|(_, entry)| matches_filters(&entry.body, filters))
            .map(|(id, entry)| VersionedDoc {
                id: id.clone(),
                version: entry.version,
                body: entry.body.clone(),
            })
            .collect();

        if let Some(order) = order_by {
            results.sort_by(|a, b| {
                let left = field_value(&a.body, &order.field);
                let right = field_value(&b.body, &order.field);
                let ordering = match (left, right) {
                    (Some(left), Some(right)) => {
                        compare_values(left, right).unwrap_or(std::cmp::Ordering::Equal)
                    }
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                if order.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }

        if let Some(limit) = limit {
            results.truncate(limit as usize);
        }

        results
    }

    /// Must be called with the write guard still held so deliveries stay in
    /// commit order.
    fn notify(&self, tables: &HashMap<Collection, Table>, collection: Collection, id: &str) {
        if let Some(entry) = tables.get(&collection).and_then(|table| table.get(id)) {
            let doc =
                VersionedDoc { id: id.to_string(), version: entry.version, body: entry.body.clone() };
            self.watchers.notify_doc(collection, id, &doc);
        }

        for (watch_id, filters) in self.watchers.query_watches(collection) {
            let results = Self::run_query(tables, collection, &filters, None, None);
            self.watchers.push_query(watch_id, results);
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<VersionedDoc>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.get(&collection).and_then(|table| table.get(id)).map(|entry| VersionedDoc {
            id: id.to_string(),
            version: entry.version,
            body: entry.body.clone(),
        }))
    }

    async fn put(
        &self,
        collection: Collection,
        id: &str,
        body: Value,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let entry = tables.entry(collection).or_default().entry(id.to_string()).or_default();
        entry.version += 1;
        entry.body = body;
        let version = entry.version;
        self.notify(&tables, collection, id);
        Ok(version)
    }

    async fn put_checked(
        &self,
        collection: Collection,
        id: &str,
        body: Value,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let Some(entry) = tables.get_mut(&collection).and_then(|table| table.get_mut(id)) else {
            return Err(StoreError::Missing { collection, id: id.to_string() });
        };
        if entry.version != expected_version {
            return Err(StoreError::VersionConflict { collection, id: id.to_string() });
        }
        entry.version += 1;
        entry.body = body;
        let version = entry.version;
        self.notify(&tables, collection, id);
        Ok(version)
    }

    async fn update_fields(
        &self,
        collection: Collection,
        id: &str,
        fields: serde_json::Map<String, Value>,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let Some(entry) = tables.get_mut(&collection).and_then(|table| table.get_mut(id)) else {
            return Err(StoreError::Missing { collection, id: id.to_string() });
        };
        if let Value::Object(body) = &mut entry.body {
            for (key, value) in fields {
                body.insert(key, value);
            }
        }
        entry.version += 1;
        let version = entry.version;
        self.notify(&tables, collection, id);
        Ok(version)
    }

    async fn query(
        &self,
        collection: Collection,
        filters: &[Filter],
        order_by: Option<&OrderBy>,
        limit: Option<u32>,
    ) -> Result<Vec<VersionedDoc>, StoreError> {
        let tables = self.tables.read().await;
        Ok(Self::run_query(&tables, collection, filters, order_by, limit))
    }

    async fn count(&self, collection: Collection, filters: &[Filter]) -> Result<u64, StoreError> {
        let tables = self.tables.read().await;
        Ok(Self::run_query(&tables, collection, filters, None, None).len() as u64)
    }

    async fn watch_doc(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<DocWatcher, StoreError> {
        // The read guard keeps writers out between snapshot and registration.
        let tables = self.tables.read().await;
        let snapshot = tables.get(&collection).and_then(|table| table.get(id)).map(|entry| {
            VersionedDoc { id: id.to_string(), version: entry.version, body: entry.body.clone() }
        });
        Ok(self.watchers.register_doc(collection, id, snapshot))
    }

    async fn watch_query(
        &self,
        collection: Collection,
        filters: Vec<Filter>,
    ) -> Result<QueryWatcher, StoreError> {
        let tables = self.tables.read().await;
        let snapshot = Self::run_query(&tables, collection, &filters, None, None);
        Ok(self.watchers.register_query(collection, filters, snapshot))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::MemoryStore;
    use crate::record::{Collection, Filter, OrderBy, RecordStore, StoreError};

    #[tokio::test]
    async fn put_then_get_round_trips_with_versions() {
        let store = MemoryStore::new();

        let v1 = store
            .put(Collection::Quotes, "q-1", json!({"total": "122.00"}))
            .await
            .expect("first put");
        let v2 = store
            .put(Collection::Quotes, "q-1", json!({"total": "130.00"}))
            .await
            .expect("second put");

        assert_eq!(v1, 1);
        assert_eq!(v2, 2);

        let doc = store.get(Collection::Quotes, "q-1").await.expect("get").expect("present");
        assert_eq!(doc.version, 2);
        assert_eq!(doc.body["total"], json!("130.00"));

        assert_eq!(store.get(Collection::Quotes, "q-2").await.expect("get"), None);
    }

    #[tokio::test]
    async fn put_checked_rejects_stale_writers() {
        let store = MemoryStore::new();
        store.put(Collection::BookingRequests, "b-1", json!({"n": 0})).await.expect("seed");

        let winner = store
            .put_checked(Collection::BookingRequests, "b-1", json!({"n": 1}), 1)
            .await
            .expect("first CAS");
        assert_eq!(winner, 2);

        let error = store
            .put_checked(Collection::BookingRequests, "b-1", json!({"n": 99}), 1)
            .await
            .expect_err("stale CAS");
        assert!(matches!(error, StoreError::VersionConflict { .. }));

        let doc =
            store.get(Collection::BookingRequests, "b-1").await.expect("get").expect("present");
        assert_eq!(doc.body["n"], json!(1));
    }

    #[tokio::test]
    async fn update_fields_merges_top_level_keys() {
        let store = MemoryStore::new();
        store
            .put(Collection::BookingRequests, "b-1", json!({"status": "pending", "n": 1}))
            .await
            .expect("seed");

        let mut fields = serde_json::Map::new();
        fields.insert("status".to_string(), json!("confirmed"));
        store
            .update_fields(Collection::BookingRequests, "b-1", fields)
            .await
            .expect("update fields");

        let doc =
            store.get(Collection::BookingRequests, "b-1").await.expect("get").expect("present");
        assert_eq!(doc.body["status"], json!("confirmed"));
        assert_eq!(doc.body["n"], json!(1));

        let error = store
            .update_fields(Collection::BookingRequests, "b-2", serde_json::Map::new())
            .await
            .expect_err("missing doc");
        assert!(matches!(error, StoreError::Missing { .. }));
    }

    #[tokio::test]
    async fn query_filters_orders_and_limits() {
        let store = MemoryStore::new();
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
            .query(
                Collection::BookingRequests,
                &[],
                Some(&OrderBy::asc("created_at")),
                Some(2),
            )
            .await
            .expect("query");
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].id, "b-1");

        let count = store
            .count(Collection::BookingRequests, &[Filter::gte("created_at", 200)])
            .await
            .expect("count");
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn doc_watcher_sees_snapshot_then_commits_in_order() {
        let store = MemoryStore::new();
        store.put(Collection::Quotes, "q-1", json!({"rev": 0})).await.expect("seed");

        let mut watcher = store.watch_doc(Collection::Quotes, "q-1").await.expect("watch");

        let snapshot = watcher.next().await.expect("snapshot");
        assert_eq!(snapshot.body["rev"], json!(0));

        store.put(Collection::Quotes, "q-1", json!({"rev": 1})).await.expect("write");
        store.put(Collection::Quotes, "q-1", json!({"rev": 2})).await.expect("write");

        assert_eq!(watcher.next().await.expect("first change").body["rev"], json!(1));
        assert_eq!(watcher.next().await.expect("second change").body["rev"], json!(2));
    }

    #[tokio::test]
    async fn dropped_watcher_stops_receiving() {
        let store = MemoryStore::new();
        store.put(Collection::Quotes, "q-1", json!({"rev": 0})).await.expect("seed");

        let watcher = store.watch_doc(Collection::Quotes, "q-1").await.expect("watch");
        drop(watcher);

        // The pruned sender must not block or panic later writes.
        store.put(Collection::Quotes, "q-1", json!({"rev": 1})).await.expect("write");
    }

    #[tokio::test]
    async fn query_watcher_tracks_the_matching_set() {
        let store = MemoryStore::new();
        store
            .put(Collection::BookingRequests, "b-1", json!({"customer": {"id": "u-1"}}))
            .await
            .expect("seed");

        let mut watcher = store
            .watch_query(
                Collection::BookingRequests,
                vec![Filter::eq("customer.id", "u-1")],
            )
            .await
            .expect("watch");

        assert_eq!(watcher.next().await.expect("snapshot").len(), 1);

        store
            .put(Collection::BookingRequests, "b-2", json!({"customer": {"id": "u-1"}}))
            .await
            .expect("write");
        assert_eq!(watcher.next().await.expect("after second insert").len(), 2);

        store
            .put(Collection::BookingRequests, "b-3", json!({"customer": {"id": "u-2"}}))
            .await
            .expect("write");
        // A write for another customer still triggers a delivery with the
        // unchanged matching set.
        assert_eq!(watcher.next().await.expect("after unrelated insert").len(), 2);
    }
}
