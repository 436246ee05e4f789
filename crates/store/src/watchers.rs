use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::record::{Collection, DocWatcher, Filter, QueryWatcher, VersionedDoc};

/// In-process subscription registry shared by the store backends. Senders
/// whose receiving side has been dropped are pruned on the next delivery,
/// so cancellation (dropping a watcher) takes effect before any further
/// callback.
#[derive(Default)]
pub(crate) struct WatcherRegistry {
    next_id: AtomicU64,
    docs: Mutex<Vec<DocWatch>>,
    queries: Mutex<Vec<QueryWatch>>,
}

struct DocWatch {
    collection: Collection,
    id: String,
    tx: mpsc::UnboundedSender<VersionedDoc>,
}

struct QueryWatch {
    watch_id: u64,
    collection: Collection,
    filters: Vec<Filter>,
    tx: mpsc::UnboundedSender<Vec<VersionedDoc>>,
}

impl WatcherRegistry {
    pub(crate) fn register_doc(
        &self,
        collection: Collection,
        id: &str,
        snapshot: Option<VersionedDoc>,
    ) -> DocWatcher {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(doc) = snapshot {
            let _ = tx.send(doc);
        }
        self.docs
            .lock()
            .expect("watcher registry poisoned")
            .push(DocWatch { collection, id: id.to_string(), tx });
        DocWatcher { rx }
    }

    pub(crate) fn register_query(
        &self,
        collection: Collection,
        filters: Vec<Filter>,
        snapshot: Vec<VersionedDoc>,
    ) -> QueryWatcher {
        let watch_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(snapshot);
        self.queries
            .lock()
            .expect("watcher registry poisoned")
            .push(QueryWatch { watch_id, collection, filters, tx });
        QueryWatcher { rx }
    }

    pub(crate) fn notify_doc(&self, collection: Collection, id: &str, doc: &VersionedDoc) {
        let mut watchers = self.docs.lock().expect("watcher registry poisoned");
        watchers.retain(|watch| {
            if watch.collection != collection || watch.id != id {
                return true;
            }
            watch.tx.send(doc.clone()).is_ok()
        });
    }

    /// The filter sets currently watching `collection`; the store re-runs
    /// each query after a write and pushes the result via `push_query`.
    pub(crate) fn query_watches(&self, collection: Collection) -> Vec<(u64, Vec<Filter>)> {
        self.queries
            .lock()
            .expect("watcher registry poisoned")
            .iter()
            .filter(|watch| watch.collection == collection)
            .map(|watch| (watch.watch_id, watch.filters.clone()))
            .collect()
    }

    pub(crate) fn push_query(&self, watch_id: u64, results: Vec<VersionedDoc>) {
        let mut watchers = self.queries.lock().expect("watcher registry poisoned");
        watchers.retain(|watch| {
            if watch.watch_id != watch_id {
                return true;
            }
            watch.tx.send(results.clone()).is_ok()
        });
    }
}
