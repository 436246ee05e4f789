use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use officina_core::{
    BookingId, BookingRequest, BookingStatus, DomainError, ExtraCost, PartyRole, ProposalId,
    Quote, QuoteId, ServiceLine,
};
use officina_service::{
    BookingWatcher, NegotiationFeed, NewBookingRequest, NewMessage, NewProposal, PartDraft,
    QuoteChanges, QuoteDraft, ServiceError,
};

use crate::bootstrap::AppState;

/// Every operation of the negotiation manager and the quote engine maps to
/// exactly one endpoint; the three subscriptions map to SSE channels.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/bookings", post(create_booking))
        .route("/bookings/{id}", get(get_booking))
        .route("/bookings/{id}/events", get(booking_events))
        .route("/bookings/{id}/proposals", post(add_proposal))
        .route("/bookings/{id}/proposals/{proposal_id}/accept", post(accept_proposal))
        .route("/bookings/{id}/proposals/{proposal_id}/counter", post(counter_propose))
        .route("/bookings/{id}/messages", post(add_message))
        .route("/bookings/{id}/messages/read", post(mark_messages_read))
        .route("/bookings/{id}/status", axum::routing::patch(update_status))
        .route("/bookings/{id}/notifications", post(mark_notified))
        .route("/bookings/{id}/quotes", get(booking_quotes))
        .route("/bookings/{id}/quote/request", post(request_quote))
        .route("/bookings/{id}/quote", post(issue_quote))
        .route("/bookings/{id}/quote/send", post(send_booking_quote))
        .route("/bookings/{id}/quote/approve", post(approve_booking_quote))
        .route("/bookings/{id}/quote/reject", post(reject_booking_quote))
        .route("/bookings/{id}/quote/revise", post(revise_booking_quote))
        .route("/customers/{id}/bookings", get(customer_bookings))
        .route("/customers/{id}/bookings/events", get(customer_feed_events))
        .route("/workshops/{id}/bookings", get(workshop_bookings))
        .route("/workshops/{id}/bookings/events", get(workshop_feed_events))
        .route("/quotes", post(create_quote))
        .route("/quotes/{id}", get(get_quote).patch(update_quote))
        .route("/quotes/{id}/send", post(send_quote))
        .route("/quotes/{id}/approve", post(approve_quote))
        .route("/quotes/{id}/reject", post(reject_quote))
        .route("/quotes/{id}/revisions", post(create_revision))
        .with_state(state)
}

pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            ServiceError::NotFound { .. } => (StatusCode::NOT_FOUND, self.0.to_string()),
            ServiceError::Domain(DomainError::Validation(_)) => {
                (StatusCode::BAD_REQUEST, self.0.to_string())
            }
            // Transition refusals are conflicts with the current state, not
            // malformed requests.
            ServiceError::Domain(_) => (StatusCode::CONFLICT, self.0.to_string()),
            ServiceError::Store(store_error) => {
                error!(error = %store_error, "record store failure");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "the record store is temporarily unavailable".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct MarkReadRequest {
    reader_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusChangeRequest {
    status: BookingStatus,
}

#[derive(Debug, Deserialize)]
struct NotifiedRequest {
    party: PartyRole,
}

#[derive(Debug, Default, Deserialize)]
struct SendQuoteRequest {
    validity_days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RejectQuoteRequest {
    reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApproveQuoteRequest {
    #[serde(default, with = "officina_core::domain::timestamps::ts_milliseconds_option")]
    agreed_date: Option<DateTime<Utc>>,
}

/// Quote identity is taken from the booking; the caller only supplies line
/// items and terms.
#[derive(Debug, Deserialize)]
struct IssueQuoteRequest {
    #[serde(default)]
    services: Vec<ServiceLine>,
    #[serde(default)]
    parts: Vec<PartDraft>,
    #[serde(default)]
    additional_costs: Vec<ExtraCost>,
    vat_rate: Option<Decimal>,
    validity_days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct FeedQuery {
    reader_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct EngagementResponse {
    booking: BookingRequest,
    quote: Quote,
}

async fn create_booking(
    State(state): State<AppState>,
    Json(input): Json<NewBookingRequest>,
) -> Result<(StatusCode, Json<BookingRequest>), ApiError> {
    let booking = state.negotiation.create_booking_request(input).await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

async fn get_booking(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BookingRequest>, ApiError> {
    Ok(Json(state.negotiation.booking(&BookingId(id)).await?))
}

async fn customer_bookings(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<BookingRequest>>, ApiError> {
    Ok(Json(state.negotiation.bookings_for_customer(&id).await?))
}

async fn workshop_bookings(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<BookingRequest>>, ApiError> {
    Ok(Json(state.negotiation.bookings_for_workshop(&id).await?))
}

async fn add_proposal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<NewProposal>,
) -> Result<Json<BookingRequest>, ApiError> {
    Ok(Json(state.negotiation.add_proposal(&BookingId(id), input).await?))
}

async fn accept_proposal(
    State(state): State<AppState>,
    Path((id, proposal_id)): Path<(String, String)>,
) -> Result<Json<BookingRequest>, ApiError> {
    Ok(Json(
        state.negotiation.accept_proposal(&BookingId(id), &ProposalId(proposal_id)).await?,
    ))
}

async fn counter_propose(
    State(state): State<AppState>,
    Path((id, proposal_id)): Path<(String, String)>,
    Json(input): Json<NewProposal>,
) -> Result<Json<BookingRequest>, ApiError> {
    Ok(Json(
        state
            .negotiation
            .counter_propose(&BookingId(id), &ProposalId(proposal_id), input)
            .await?,
    ))
}

async fn add_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<NewMessage>,
) -> Result<Json<BookingRequest>, ApiError> {
    Ok(Json(state.negotiation.add_message(&BookingId(id), input).await?))
}

async fn mark_messages_read(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<MarkReadRequest>,
) -> Result<Json<BookingRequest>, ApiError> {
    Ok(Json(state.negotiation.mark_messages_read(&BookingId(id), &input.reader_id).await?))
}

async fn update_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<StatusChangeRequest>,
) -> Result<Json<BookingRequest>, ApiError> {
    Ok(Json(state.negotiation.update_status(&BookingId(id), input.status).await?))
}

async fn mark_notified(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<NotifiedRequest>,
) -> Result<StatusCode, ApiError> {
    state.negotiation.mark_notified(&BookingId(id), input.party).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn booking_quotes(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Quote>>, ApiError> {
    Ok(Json(state.quotes.quotes_for_booking(&BookingId(id)).await?))
}

async fn request_quote(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BookingRequest>, ApiError> {
    Ok(Json(state.workflow.request_quote(&BookingId(id)).await?))
}

async fn issue_quote(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<IssueQuoteRequest>,
) -> Result<(StatusCode, Json<EngagementResponse>), ApiError> {
    let booking_id = BookingId(id);
    let draft = QuoteDraft {
        booking_request_id: booking_id.clone(),
        workshop_id: String::new(),
        customer_id: String::new(),
        services: input.services,
        parts: input.parts,
        additional_costs: input.additional_costs,
        vat_rate: input.vat_rate,
        revision_number: None,
        previous_quote_id: None,
    };

    let (booking, quote) =
        state.workflow.issue_quote(&booking_id, draft, input.validity_days).await?;
    Ok((StatusCode::CREATED, Json(EngagementResponse { booking, quote })))
}

async fn send_booking_quote(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<SendQuoteRequest>,
) -> Result<Json<EngagementResponse>, ApiError> {
    let (booking, quote) =
        state.workflow.send_quote(&BookingId(id), input.validity_days).await?;
    Ok(Json(EngagementResponse { booking, quote }))
}

async fn approve_booking_quote(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ApproveQuoteRequest>,
) -> Result<Json<EngagementResponse>, ApiError> {
    let (booking, quote) =
        state.workflow.approve_quote(&BookingId(id), input.agreed_date).await?;
    Ok(Json(EngagementResponse { booking, quote }))
}

async fn reject_booking_quote(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<RejectQuoteRequest>,
) -> Result<Json<Quote>, ApiError> {
    Ok(Json(state.workflow.reject_quote(&BookingId(id), input.reason).await?))
}

async fn revise_booking_quote(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(changes): Json<QuoteChanges>,
) -> Result<(StatusCode, Json<EngagementResponse>), ApiError> {
    let (booking, quote) = state.workflow.revise_quote(&BookingId(id), changes).await?;
    Ok((StatusCode::CREATED, Json(EngagementResponse { booking, quote })))
}

async fn create_quote(
    State(state): State<AppState>,
    Json(draft): Json<QuoteDraft>,
) -> Result<(StatusCode, Json<Quote>), ApiError> {
    let quote = state.quotes.create_quote(draft).await?;
    Ok((StatusCode::CREATED, Json(quote)))
}

async fn get_quote(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Quote>, ApiError> {
    Ok(Json(state.quotes.quote(&QuoteId(id)).await?))
}

async fn update_quote(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(changes): Json<QuoteChanges>,
) -> Result<Json<Quote>, ApiError> {
    Ok(Json(state.quotes.update_quote(&QuoteId(id), changes).await?))
}

async fn send_quote(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<SendQuoteRequest>,
) -> Result<Json<Quote>, ApiError> {
    Ok(Json(state.quotes.send_quote(&QuoteId(id), input.validity_days).await?))
}

async fn approve_quote(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Quote>, ApiError> {
    Ok(Json(state.quotes.approve_quote(&QuoteId(id)).await?))
}

async fn reject_quote(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<RejectQuoteRequest>,
) -> Result<Json<Quote>, ApiError> {
    Ok(Json(state.quotes.reject_quote(&QuoteId(id), input.reason).await?))
}

async fn create_revision(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(changes): Json<QuoteChanges>,
) -> Result<(StatusCode, Json<Quote>), ApiError> {
    let quote = state.quotes.create_revision(&QuoteId(id), changes).await?;
    Ok((StatusCode::CREATED, Json(quote)))
}

async fn booking_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let watcher = state.negotiation.watch_booking(&BookingId(id)).await?;
    Ok(Sse::new(booking_stream(watcher)).keep_alive(KeepAlive::default()))
}

async fn customer_feed_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let feed = state.negotiation.customer_feed(&id).await?;
    Ok(Sse::new(feed_stream(feed)).keep_alive(KeepAlive::default()))
}

async fn workshop_feed_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<FeedQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let reader_id = query.reader_id.unwrap_or_else(|| id.clone());
    let feed = state.negotiation.workshop_feed(&id, &reader_id).await?;
    Ok(Sse::new(feed_stream(feed)).keep_alive(KeepAlive::default()))
}

fn booking_stream(watcher: BookingWatcher) -> impl Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold(watcher, |mut watcher| async move {
        loop {
            match watcher.next().await {
                Some(Ok(booking)) => match Event::default().json_data(&booking) {
                    Ok(event) => return Some((Ok(event), watcher)),
                    Err(encode_error) => {
                        error!(error = %encode_error, "failed to encode booking event");
                        return None;
                    }
                },
                Some(Err(watch_error)) => {
                    error!(error = %watch_error, "booking change decode failed");
                    continue;
                }
                None => return None,
            }
        }
    })
}

fn feed_stream(feed: NegotiationFeed) -> impl Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold(feed, |mut feed| async move {
        loop {
            match feed.next().await {
                Some(Ok(views)) => match Event::default().json_data(&views) {
                    Ok(event) => return Some((Ok(event), feed)),
                    Err(encode_error) => {
                        error!(error = %encode_error, "failed to encode feed event");
                        return None;
                    }
                },
                Some(Err(watch_error)) => {
                    error!(error = %watch_error, "feed delivery decode failed");
                    continue;
                }
                None => return None,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tower::util::ServiceExt;

    use officina_core::config::AppConfig;

    use crate::bootstrap::bootstrap_with_config;

    async fn test_router() -> axum::Router {
        let mut config = AppConfig::default();
        config.database.url = "sqlite::memory:".to_string();
        config.database.max_connections = 1;
        let app = bootstrap_with_config(config).await.expect("bootstrap");
        super::router(app.state.clone()).merge(crate::health::router(app.db_pool.clone()))
    }

    fn booking_payload() -> serde_json::Value {
        serde_json::json!({
            "customer": {"id": "u-1", "name": "Anna", "email": "anna@example.com", "phone": null},
            "workshop": {"id": "w-1", "name": "Officina Rossi", "mechanic_id": null},
            "vehicle": {
                "make": "Fiat",
                "model": "Panda",
                "year": 2019,
                "plate": "AB123CD",
                "odometer_km": null
            },
            "kind": "routine",
            "service": {"catalog_id": null, "name": "Oil change", "category": null},
            "problem_description": "Oil change due",
            "urgency": "low",
            "preferred_dates": []
        })
    }

    #[tokio::test]
    async fn booking_round_trip_over_http() {
        let router = test_router().await;

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/bookings")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(booking_payload().to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let booking: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(booking["status"], "pending");
        let id = booking["id"].as_str().expect("id").to_string();

        let response = router
            .oneshot(
                Request::builder()
                    .uri(format!("/bookings/{id}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_booking_returns_not_found() {
        let router = test_router().await;

        let response = router
            .oneshot(Request::builder().uri("/bookings/nope").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_booking_payload_returns_bad_request() {
        let router = test_router().await;

        let mut payload = booking_payload();
        payload["problem_description"] = serde_json::json!("");
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/bookings")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(payload.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_endpoint_reports_ready() {
        let router = test_router().await;

        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
    }
}
