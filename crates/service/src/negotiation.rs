use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use officina_core::{
    Attachment, BookingId, BookingKind, BookingRequest, BookingStatus, CustomerRef, Message,
    MessageId, NotificationFlags, PartyRole, Proposal, ProposalId, ProposalStatus, Quote,
    ServiceRef, Urgency, VehicleRef, WorkshopRef,
};
use officina_store::{decode_doc, encode_doc, Collection, Filter, OrderBy, RecordStore, StoreError};

use crate::directory::WorkshopDirectory;
use crate::error::ServiceError;
use crate::sync::{BookingSetWatcher, BookingWatcher, NegotiationFeed};

const BOOKING: &str = "booking request";
const PROPOSAL: &str = "proposal";
const MAX_PREFERRED_DATES: usize = 3;

/// How many times a stale compare-and-set write is retried before the
/// conflict is surfaced. Each retry re-reads the document, so concurrent
/// appends to proposals or messages commute instead of overwriting each
/// other.
const WRITE_ATTEMPTS: usize = 5;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewBookingRequest {
    pub customer: CustomerRef,
    pub workshop: WorkshopRef,
    pub vehicle: VehicleRef,
    pub kind: BookingKind,
    pub service: ServiceRef,
    pub problem_description: String,
    pub urgency: Urgency,
    #[serde(default, with = "officina_core::domain::timestamps::ts_milliseconds_vec")]
    pub preferred_dates: Vec<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewProposal {
    pub proposed_by: PartyRole,
    #[serde(with = "officina_core::domain::timestamps::ts_milliseconds")]
    pub proposed_date: DateTime<Utc>,
    pub message: Option<String>,
    pub estimated_cost: Option<Decimal>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender_id: String,
    pub sender_name: String,
    pub sender_role: PartyRole,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Stateless request handler for the booking negotiation: every operation is
/// a read-modify-write over the record store, committed with a versioned
/// write. One instance per process, injected where needed.
pub struct NegotiationService<S> {
    store: Arc<S>,
    directory: Arc<dyn WorkshopDirectory>,
}

impl<S> Clone for NegotiationService<S> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store), directory: Arc::clone(&self.directory) }
    }
}

impl<S: RecordStore> NegotiationService<S> {
    pub fn new(store: Arc<S>, directory: Arc<dyn WorkshopDirectory>) -> Self {
        Self { store, directory }
    }

    pub async fn create_booking_request(
        &self,
        input: NewBookingRequest,
    ) -> Result<BookingRequest, ServiceError> {
        validate_new_booking(&input)?;

        let now = Utc::now();
        let booking = BookingRequest {
            id: BookingId(Uuid::new_v4().to_string()),
            customer: input.customer,
            workshop: input.workshop,
            vehicle: input.vehicle,
            kind: input.kind,
            service: input.service,
            problem_description: input.problem_description,
            urgency: input.urgency,
            preferred_dates: input.preferred_dates,
            proposals: Vec::new(),
            messages: Vec::new(),
            status: BookingStatus::Pending,
            selected_date: None,
            quote_id: None,
            quoted_price: None,
            notifications: NotificationFlags::default(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        self.store
            .put(Collection::BookingRequests, &booking.id.0, encode_doc(&booking)?)
            .await?;

        // Counter bump on the workshop directory is fire-and-forget.
        if let Err(error) = self.directory.increment_booking_count(&booking.workshop.id).await {
            warn!(
                workshop_id = %booking.workshop.id,
                error = %error,
                "workshop booking counter bump failed"
            );
        }

        info!(
            booking_id = %booking.id.0,
            customer_id = %booking.customer.id,
            workshop_id = %booking.workshop.id,
            "booking request created"
        );
        Ok(booking)
    }

    pub async fn booking(&self, id: &BookingId) -> Result<BookingRequest, ServiceError> {
        let doc = self
            .store
            .get(Collection::BookingRequests, &id.0)
            .await?
            .ok_or_else(|| ServiceError::not_found(BOOKING, &id.0))?;
        Ok(decode_doc(&doc)?)
    }

    pub async fn bookings_for_customer(
        &self,
        customer_id: &str,
    ) -> Result<Vec<BookingRequest>, ServiceError> {
        self.query_bookings(Filter::eq("customer.id", customer_id)).await
    }

    pub async fn bookings_for_workshop(
        &self,
        workshop_id: &str,
    ) -> Result<Vec<BookingRequest>, ServiceError> {
        self.query_bookings(Filter::eq("workshop.id", workshop_id)).await
    }

    /// Appends a pending proposal and pulls the booking (back) into
    /// `date_proposed`. The transition table decides whether the current
    /// status allows it, so a booking whose work already started stays put.
    pub async fn add_proposal(
        &self,
        booking_id: &BookingId,
        input: NewProposal,
    ) -> Result<BookingRequest, ServiceError> {
        let booking = self
            .mutate_booking(booking_id, |booking| {
                booking.transition_to(BookingStatus::DateProposed)?;
                booking.proposals.push(Proposal {
                    id: ProposalId(Uuid::new_v4().to_string()),
                    proposed_by: input.proposed_by,
                    proposed_date: input.proposed_date,
                    message: input.message.clone(),
                    estimated_cost: input.estimated_cost,
                    status: ProposalStatus::Pending,
                    created_at: Utc::now(),
                });
                Ok(true)
            })
            .await?;

        info!(booking_id = %booking_id.0, "date proposal added");
        Ok(booking)
    }

    /// The accepted proposal wins outright: every other proposal is rejected
    /// whatever its current status, and the booking is confirmed on the
    /// accepted date.
    pub async fn accept_proposal(
        &self,
        booking_id: &BookingId,
        proposal_id: &ProposalId,
    ) -> Result<BookingRequest, ServiceError> {
        let booking = self
            .mutate_booking(booking_id, |booking| {
                if booking.proposal(proposal_id).is_none() {
                    return Err(ServiceError::not_found(PROPOSAL, &proposal_id.0));
                }

                let mut selected_date = None;
                for proposal in &mut booking.proposals {
                    if &proposal.id == proposal_id {
                        proposal.status = ProposalStatus::Accepted;
                        selected_date = Some(proposal.proposed_date);
                    } else {
                        proposal.status = ProposalStatus::Rejected;
                    }
                }

                booking.selected_date = selected_date;
                booking.transition_to(BookingStatus::Confirmed)?;
                Ok(true)
            })
            .await?;

        info!(booking_id = %booking_id.0, proposal_id = %proposal_id.0, "proposal accepted");
        Ok(booking)
    }

    /// Marks an existing proposal as countered (it stays in the list) and
    /// appends the replacement as a fresh pending proposal. The top-level
    /// status is left alone.
    pub async fn counter_propose(
        &self,
        booking_id: &BookingId,
        countered_id: &ProposalId,
        input: NewProposal,
    ) -> Result<BookingRequest, ServiceError> {
        let booking = self
            .mutate_booking(booking_id, |booking| {
                let Some(countered) = booking.proposal_mut(countered_id) else {
                    return Err(ServiceError::not_found(PROPOSAL, &countered_id.0));
                };
                countered.status = ProposalStatus::CounterProposed;

                booking.proposals.push(Proposal {
                    id: ProposalId(Uuid::new_v4().to_string()),
                    proposed_by: input.proposed_by,
                    proposed_date: input.proposed_date,
                    message: input.message.clone(),
                    estimated_cost: input.estimated_cost,
                    status: ProposalStatus::Pending,
                    created_at: Utc::now(),
                });
                Ok(true)
            })
            .await?;

        info!(
            booking_id = %booking_id.0,
            countered_proposal_id = %countered_id.0,
            "counter proposal added"
        );
        Ok(booking)
    }

    pub async fn add_message(
        &self,
        booking_id: &BookingId,
        input: NewMessage,
    ) -> Result<BookingRequest, ServiceError> {
        if input.body.trim().is_empty() {
            return Err(ServiceError::validation("message body must not be empty"));
        }
        if input.sender_id.trim().is_empty() {
            return Err(ServiceError::validation("message sender id is required"));
        }

        self.mutate_booking(booking_id, |booking| {
            booking.messages.push(Message {
                id: MessageId(Uuid::new_v4().to_string()),
                sender_id: input.sender_id.clone(),
                sender_name: input.sender_name.clone(),
                sender_role: input.sender_role,
                body: input.body.clone(),
                attachments: input.attachments.clone(),
                is_read: false,
                created_at: Utc::now(),
            });
            Ok(true)
        })
        .await
    }

    /// Flips the read flag on every message the reader did not send.
    /// Idempotent; a call with nothing to flip writes nothing.
    pub async fn mark_messages_read(
        &self,
        booking_id: &BookingId,
        reader_id: &str,
    ) -> Result<BookingRequest, ServiceError> {
        self.mutate_booking(booking_id, |booking| Ok(booking.mark_messages_read(reader_id) > 0))
            .await
    }

    /// Workflow-driven status move (`in_progress`, `completed`, `cancelled`,
    /// `rejected`, ...). The transition table is enforced here; a completed
    /// booking is stamped with its completion time.
    pub async fn update_status(
        &self,
        booking_id: &BookingId,
        new_status: BookingStatus,
    ) -> Result<BookingRequest, ServiceError> {
        let booking = self
            .mutate_booking(booking_id, |booking| {
                booking.transition_to(new_status)?;
                if new_status == BookingStatus::Completed {
                    booking.completed_at = Some(Utc::now());
                }
                Ok(true)
            })
            .await?;

        info!(booking_id = %booking_id.0, status = ?new_status, "booking status updated");
        Ok(booking)
    }

    /// Records that a party has been pushed a notification for the current
    /// status, so outer delivery workflows do not notify twice.
    pub async fn mark_notified(
        &self,
        booking_id: &BookingId,
        party: PartyRole,
    ) -> Result<(), ServiceError> {
        let booking = self.booking(booking_id).await?;
        let mut notifications = booking.notifications;
        match party {
            PartyRole::User => notifications.customer_notified = true,
            PartyRole::Mechanic => notifications.workshop_notified = true,
        }

        let mut fields = serde_json::Map::new();
        fields.insert("notifications".to_string(), encode_doc(&notifications)?);
        match self.store.update_fields(Collection::BookingRequests, &booking_id.0, fields).await {
            Ok(_) => Ok(()),
            Err(StoreError::Missing { .. }) => Err(ServiceError::not_found(BOOKING, &booking_id.0)),
            Err(error) => Err(error.into()),
        }
    }

    /// Points the booking at a quote and records the quoted price cache,
    /// moving the status to `quote_sent`.
    pub async fn link_quote(
        &self,
        booking_id: &BookingId,
        quote: &Quote,
    ) -> Result<BookingRequest, ServiceError> {
        if &quote.booking_request_id != booking_id {
            return Err(ServiceError::validation("quote belongs to a different booking"));
        }
        self.mutate_booking(booking_id, |booking| {
            booking.transition_to(BookingStatus::QuoteSent)?;
            booking.quote_id = Some(quote.id.clone());
            booking.quoted_price = Some(quote.total_cost);
            Ok(true)
        })
        .await
    }

    /// Updates the denormalized quote cache without touching the status;
    /// used when a draft revision supersedes the linked quote.
    pub async fn cache_quote(
        &self,
        booking_id: &BookingId,
        quote: &Quote,
    ) -> Result<BookingRequest, ServiceError> {
        if &quote.booking_request_id != booking_id {
            return Err(ServiceError::validation("quote belongs to a different booking"));
        }
        self.mutate_booking(booking_id, |booking| {
            booking.quote_id = Some(quote.id.clone());
            booking.quoted_price = Some(quote.total_cost);
            Ok(true)
        })
        .await
    }

    /// Confirms the booking with an agreed date. Only called by the owning
    /// workflow after a quote approval; proposal acceptance confirms through
    /// `accept_proposal`.
    pub async fn confirm_with_date(
        &self,
        booking_id: &BookingId,
        date: DateTime<Utc>,
    ) -> Result<BookingRequest, ServiceError> {
        self.mutate_booking(booking_id, |booking| {
            // Already confirmed through proposal acceptance: keep the status
            // and just (re)pin the date.
            if booking.status != BookingStatus::Confirmed {
                booking.transition_to(BookingStatus::Confirmed)?;
            }
            booking.selected_date = Some(date);
            Ok(true)
        })
        .await
    }

    pub async fn watch_booking(&self, id: &BookingId) -> Result<BookingWatcher, ServiceError> {
        let inner = self.store.watch_doc(Collection::BookingRequests, &id.0).await?;
        Ok(BookingWatcher::new(inner))
    }

    pub async fn watch_customer_bookings(
        &self,
        customer_id: &str,
    ) -> Result<BookingSetWatcher, ServiceError> {
        let inner = self
            .store
            .watch_query(Collection::BookingRequests, vec![Filter::eq("customer.id", customer_id)])
            .await?;
        Ok(BookingSetWatcher::new(inner))
    }

    pub async fn watch_workshop_bookings(
        &self,
        workshop_id: &str,
    ) -> Result<BookingSetWatcher, ServiceError> {
        let inner = self
            .store
            .watch_query(Collection::BookingRequests, vec![Filter::eq("workshop.id", workshop_id)])
            .await?;
        Ok(BookingSetWatcher::new(inner))
    }

    /// Ordered per-party view stream for client rendering.
    pub async fn customer_feed(&self, customer_id: &str) -> Result<NegotiationFeed, ServiceError> {
        let watcher = self.watch_customer_bookings(customer_id).await?;
        Ok(NegotiationFeed::new(watcher, customer_id))
    }

    /// `reader_id` is the account whose unread counters the feed reports,
    /// usually the assigned mechanic.
    pub async fn workshop_feed(
        &self,
        workshop_id: &str,
        reader_id: &str,
    ) -> Result<NegotiationFeed, ServiceError> {
        let watcher = self.watch_workshop_bookings(workshop_id).await?;
        Ok(NegotiationFeed::new(watcher, reader_id))
    }

    async fn query_bookings(&self, filter: Filter) -> Result<Vec<BookingRequest>, ServiceError> {
        let docs = self
            .store
            .query(
                Collection::BookingRequests,
                &[filter],
                Some(&OrderBy::desc("created_at")),
                None,
            )
            .await?;
        docs.iter().map(|doc| decode_doc(doc).map_err(Into::into)).collect()
    }

    /// Read-modify-write with optimistic concurrency: the closure edits a
    /// decoded copy and reports whether anything changed; the write is a
    /// compare-and-set against the version that was read. Stale writes are
    /// retried from a fresh read.
    async fn mutate_booking<F>(
        &self,
        booking_id: &BookingId,
        mut apply: F,
    ) -> Result<BookingRequest, ServiceError>
    where
        F: FnMut(&mut BookingRequest) -> Result<bool, ServiceError>,
    {
        for _ in 0..WRITE_ATTEMPTS {
            let doc = self
                .store
                .get(Collection::BookingRequests, &booking_id.0)
                .await?
                .ok_or_else(|| ServiceError::not_found(BOOKING, &booking_id.0))?;
            let mut booking: BookingRequest = decode_doc(&doc)?;

            if !apply(&mut booking)? {
                return Ok(booking);
            }
            booking.updated_at = Utc::now();

            match self
                .store
                .put_checked(
                    Collection::BookingRequests,
                    &booking_id.0,
                    encode_doc(&booking)?,
                    doc.version,
                )
                .await
            {
                Ok(_) => return Ok(booking),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(StoreError::Missing { .. }) => {
                    return Err(ServiceError::not_found(BOOKING, &booking_id.0))
                }
                Err(error) => return Err(error.into()),
            }
        }

        Err(ServiceError::Store(StoreError::VersionConflict {
            collection: Collection::BookingRequests,
            id: booking_id.0.clone(),
        }))
    }
}

fn validate_new_booking(input: &NewBookingRequest) -> Result<(), ServiceError> {
    if input.customer.id.trim().is_empty() {
        return Err(ServiceError::validation("customer id is required"));
    }
    if input.workshop.id.trim().is_empty() {
        return Err(ServiceError::validation("workshop id is required"));
    }
    if input.vehicle.make.trim().is_empty() || input.vehicle.plate.trim().is_empty() {
        return Err(ServiceError::validation("vehicle make and plate are required"));
    }
    if input.service.catalog_id.is_none() && input.problem_description.trim().is_empty() {
        return Err(ServiceError::validation(
            "either a catalog service or a problem description is required",
        ));
    }
    if input.preferred_dates.len() > MAX_PREFERRED_DATES {
        return Err(ServiceError::validation("at most 3 preferred dates are allowed"));
    }
    Ok(())
}
