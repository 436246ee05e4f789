use std::cmp::Ordering;
use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// The two top-level record collections. `BookingRequest.quote_id` is the
/// only cross-collection reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Collection {
    BookingRequests,
    Quotes,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BookingRequests => "booking_requests",
            Self::Quotes => "quotes",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("document decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("document {collection}/{id} does not exist")]
    Missing { collection: Collection, id: String },
    #[error("stale write rejected for {collection}/{id}")]
    VersionConflict { collection: Collection, id: String },
    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

/// A document plus the monotonic version used for compare-and-set writes.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionedDoc {
    pub id: String,
    pub version: u64,
    pub body: Value,
}

/// Field filters address top-level or dotted JSON paths ("customer.id").
/// Range filters compare numbers numerically and strings lexicographically.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Eq { field: String, value: Value },
    Gte { field: String, value: Value },
    Lte { field: String, value: Value },
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq { field: field.into(), value: value.into() }
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gte { field: field.into(), value: value.into() }
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lte { field: field.into(), value: value.into() }
    }

    pub fn field(&self) -> &str {
        match self {
            Self::Eq { field, .. } | Self::Gte { field, .. } | Self::Lte { field, .. } => field,
        }
    }

    pub fn value(&self) -> &Value {
        match self {
            Self::Eq { value, .. } | Self::Gte { value, .. } | Self::Lte { value, .. } => value,
        }
    }
}

#[derive(Clone, Debug)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self { field: field.into(), descending: false }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self { field: field.into(), descending: true }
    }
}

/// Change feed for a single document: yields the full current state after
/// every committed write, in commit order. Dropping the watcher cancels it.
pub struct DocWatcher {
    pub(crate) rx: mpsc::UnboundedReceiver<VersionedDoc>,
}

impl DocWatcher {
    pub async fn next(&mut self) -> Option<VersionedDoc> {
        self.rx.recv().await
    }
}

/// Change feed for a filtered collection view: yields the full current
/// matching set after every write to the collection.
pub struct QueryWatcher {
    pub(crate) rx: mpsc::UnboundedReceiver<Vec<VersionedDoc>>,
}

impl QueryWatcher {
    pub async fn next(&mut self) -> Option<Vec<VersionedDoc>> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, collection: Collection, id: &str)
        -> Result<Option<VersionedDoc>, StoreError>;

    /// Creates or overwrites unconditionally; returns the new version.
    async fn put(&self, collection: Collection, id: &str, body: Value)
        -> Result<u64, StoreError>;

    /// Compare-and-set write: succeeds only when the stored version still
    /// equals `expected_version`, otherwise `VersionConflict`.
    async fn put_checked(
        &self,
        collection: Collection,
        id: &str,
        body: Value,
        expected_version: u64,
    ) -> Result<u64, StoreError>;

    /// Merges the given top-level fields into an existing document.
    async fn update_fields(
        &self,
        collection: Collection,
        id: &str,
        fields: serde_json::Map<String, Value>,
    ) -> Result<u64, StoreError>;

    async fn query(
        &self,
        collection: Collection,
        filters: &[Filter],
        order_by: Option<&OrderBy>,
        limit: Option<u32>,
    ) -> Result<Vec<VersionedDoc>, StoreError>;

    async fn count(&self, collection: Collection, filters: &[Filter])
        -> Result<u64, StoreError>;

    async fn watch_doc(&self, collection: Collection, id: &str)
        -> Result<DocWatcher, StoreError>;

    async fn watch_query(
        &self,
        collection: Collection,
        filters: Vec<Filter>,
    ) -> Result<QueryWatcher, StoreError>;
}

pub fn encode_doc<T: Serialize>(value: &T) -> Result<Value, StoreError> {
    Ok(serde_json::to_value(value)?)
}

pub fn decode_doc<T: DeserializeOwned>(doc: &VersionedDoc) -> Result<T, StoreError> {
    Ok(serde_json::from_value(doc.body.clone())?)
}

pub(crate) fn field_value<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = body;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

pub(crate) fn matches_filters(body: &Value, filters: &[Filter]) -> bool {
    filters.iter().all(|filter| {
        let Some(actual) = field_value(body, filter.field()) else {
            return false;
        };
        match filter {
            Filter::Eq { value, .. } => actual == value,
            Filter::Gte { value, .. } => {
                compare_values(actual, value).is_some_and(|ordering| ordering != Ordering::Less)
            }
            Filter::Lte { value, .. } => {
                compare_values(actual, value).is_some_and(|ordering| ordering != Ordering::Greater)
            }
        }
    })
}

pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().partial_cmp(&b.as_f64()),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{field_value, matches_filters, Filter};

    #[test]
    fn dotted_paths_reach_nested_fields() {
        let body = json!({"customer": {"id": "u-1"}, "created_at": 1_000});

        assert_eq!(field_value(&body, "customer.id"), Some(&json!("u-1")));
        assert_eq!(field_value(&body, "created_at"), Some(&json!(1_000)));
        assert_eq!(field_value(&body, "customer.missing"), None);
    }

    #[test]
    fn filters_combine_with_and_semantics() {
        let body = json!({"workshop_id": "w-1", "created_at": 1_500});

        assert!(matches_filters(
            &body,
            &[Filter::eq("workshop_id", "w-1"), Filter::gte("created_at", 1_000)],
        ));
        assert!(!matches_filters(
            &body,
            &[Filter::eq("workshop_id", "w-1"), Filter::gte("created_at", 2_000)],
        ));
        assert!(!matches_filters(&body, &[Filter::eq("missing", "x")]));
    }

    #[test]
    fn range_filters_are_inclusive() {
        let body = json!({"created_at": 1_000});

        assert!(matches_filters(&body, &[Filter::gte("created_at", 1_000)]));
        assert!(matches_filters(&body, &[Filter::lte("created_at", 1_000)]));
    }
}
