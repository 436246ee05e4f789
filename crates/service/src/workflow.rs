use chrono::{DateTime, Utc};

use officina_core::{BookingId, BookingRequest, BookingStatus, ProposalStatus, Quote};
use officina_store::RecordStore;

use crate::error::ServiceError;
use crate::negotiation::NegotiationService;
use crate::quotes::{QuoteChanges, QuoteDraft, QuoteService};

/// Composes the negotiation manager with the quote engine. This is the only
/// place where a quote lifecycle event drives the booking's top-level
/// status; the two services never call each other directly.
pub struct EngagementWorkflow<S> {
    negotiation: NegotiationService<S>,
    quotes: QuoteService<S>,
}

impl<S: RecordStore> EngagementWorkflow<S> {
    pub fn new(negotiation: NegotiationService<S>, quotes: QuoteService<S>) -> Self {
        Self { negotiation, quotes }
    }

    pub async fn request_quote(&self, booking_id: &BookingId) -> Result<BookingRequest, ServiceError> {
        self.negotiation.update_status(booking_id, BookingStatus::QuoteRequested).await
    }

    /// Creates a quote against the booking, sends it, and links it as the
    /// booking's current quote. The draft's identity fields are taken from
    /// the booking itself, not from the caller.
    pub async fn issue_quote(
        &self,
        booking_id: &BookingId,
        mut draft: QuoteDraft,
        validity_days: Option<u32>,
    ) -> Result<(BookingRequest, Quote), ServiceError> {
        let booking = self.negotiation.booking(booking_id).await?;
        draft.booking_request_id = booking.id.clone();
        draft.workshop_id = booking.workshop.id.clone();
        draft.customer_id = booking.customer.id.clone();

        let quote = self.quotes.create_quote(draft).await?;
        let quote = self.quotes.send_quote(&quote.id, validity_days).await?;
        let booking = self.negotiation.link_quote(booking_id, &quote).await?;
        Ok((booking, quote))
    }

    /// (Re-)sends the booking's linked quote, e.g. after a revision.
    pub async fn send_quote(
        &self,
        booking_id: &BookingId,
        validity_days: Option<u32>,
    ) -> Result<(BookingRequest, Quote), ServiceError> {
        let booking = self.negotiation.booking(booking_id).await?;
        let quote_id = booking
            .quote_id
            .ok_or_else(|| ServiceError::validation("booking has no quote to send"))?;

        let quote = self.quotes.send_quote(&quote_id, validity_days).await?;
        let booking = self.negotiation.link_quote(booking_id, &quote).await?;
        Ok((booking, quote))
    }

    /// Customer approval confirms the booking. The confirmed date comes from
    /// the accepted proposal when the parties already agreed on one, or from
    /// `agreed_date`; without either the approval is rejected so a confirmed
    /// booking always carries its date.
    pub async fn approve_quote(
        &self,
        booking_id: &BookingId,
        agreed_date: Option<DateTime<Utc>>,
    ) -> Result<(BookingRequest, Quote), ServiceError> {
        let booking = self.negotiation.booking(booking_id).await?;
        let quote_id = booking
            .quote_id
            .clone()
            .ok_or_else(|| ServiceError::validation("booking has no quote to approve"))?;

        let date = booking
            .proposals
            .iter()
            .find(|proposal| proposal.status == ProposalStatus::Accepted)
            .map(|proposal| proposal.proposed_date)
            .or(agreed_date)
            .ok_or_else(|| {
                ServiceError::validation("an agreed appointment date is required to confirm")
            })?;

        let quote = self.quotes.approve_quote(&quote_id).await?;
        let booking = self.negotiation.confirm_with_date(booking_id, date).await?;
        Ok((booking, quote))
    }

    /// Customer rejection of the quote leaves the booking where it is: the
    /// workshop may still revise and re-send.
    pub async fn reject_quote(
        &self,
        booking_id: &BookingId,
        reason: Option<String>,
    ) -> Result<Quote, ServiceError> {
        let booking = self.negotiation.booking(booking_id).await?;
        let quote_id = booking
            .quote_id
            .ok_or_else(|| ServiceError::validation("booking has no quote to reject"))?;

        self.quotes.reject_quote(&quote_id, reason).await
    }

    /// Revises the booking's current quote and re-points the cache at the
    /// new draft. The revision still needs `send_quote` to go out.
    pub async fn revise_quote(
        &self,
        booking_id: &BookingId,
        changes: QuoteChanges,
    ) -> Result<(BookingRequest, Quote), ServiceError> {
        let booking = self.negotiation.booking(booking_id).await?;
        let quote_id = booking
            .quote_id
            .ok_or_else(|| ServiceError::validation("booking has no quote to revise"))?;

        let revision = self.quotes.create_revision(&quote_id, changes).await?;
        let booking = self.negotiation.cache_quote(booking_id, &revision).await?;
        Ok((booking, revision))
    }
}
