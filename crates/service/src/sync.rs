use serde::Serialize;

use officina_core::BookingRequest;
use officina_store::{decode_doc, DocWatcher, QueryWatcher};

use crate::error::ServiceError;

/// Typed change feed for one booking: yields the full decoded state after
/// every committed write, in commit order. Dropping it cancels the
/// subscription before any further delivery.
pub struct BookingWatcher {
    inner: DocWatcher,
}

impl BookingWatcher {
    pub(crate) fn new(inner: DocWatcher) -> Self {
        Self { inner }
    }

    pub async fn next(&mut self) -> Option<Result<BookingRequest, ServiceError>> {
        let doc = self.inner.next().await?;
        Some(decode_doc(&doc).map_err(Into::into))
    }
}

/// Typed change feed for a filtered set of bookings (one customer's, or one
/// workshop's). Each delivery is the full current matching set.
pub struct BookingSetWatcher {
    inner: QueryWatcher,
}

impl BookingSetWatcher {
    pub(crate) fn new(inner: QueryWatcher) -> Self {
        Self { inner }
    }

    pub async fn next(&mut self) -> Option<Result<Vec<BookingRequest>, ServiceError>> {
        let docs = self.inner.next().await?;
        Some(docs.iter().map(|doc| decode_doc(doc).map_err(Into::into)).collect())
    }
}

/// One booking as a party sees it in their list.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BookingView {
    pub booking: BookingRequest,
    pub unread_messages: usize,
}

/// Per-party synchronization view: converts raw store deliveries into a
/// consistent, ordered rendering model: most recently updated first, with
/// the viewer's unread counter attached to each entry.
pub struct NegotiationFeed {
    watcher: BookingSetWatcher,
    reader_id: String,
}

impl NegotiationFeed {
    pub(crate) fn new(watcher: BookingSetWatcher, reader_id: impl Into<String>) -> Self {
        Self { watcher, reader_id: reader_id.into() }
    }

    pub async fn next(&mut self) -> Option<Result<Vec<BookingView>, ServiceError>> {
        let bookings = match self.watcher.next().await? {
            Ok(bookings) => bookings,
            Err(error) => return Some(Err(error)),
        };

        let mut views: Vec<BookingView> = bookings
            .into_iter()
            .map(|booking| {
                let unread_messages = booking.unread_message_count(&self.reader_id);
                BookingView { booking, unread_messages }
            })
            .collect();
        views.sort_by(|a, b| b.booking.updated_at.cmp(&a.booking.updated_at));

        Some(Ok(views))
    }
}
