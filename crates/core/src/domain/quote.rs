use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::booking::BookingId;
use crate::domain::timestamps;
use crate::errors::DomainError;
use crate::pricing;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuoteId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteStatus {
    Draft,
    Sent,
    Approved,
    Rejected,
}

impl QuoteStatus {
    /// Sending is allowed from any status (a re-send refreshes the validity
    /// window); approval and rejection only ever follow a send.
    pub fn can_transition_to(&self, next: QuoteStatus) -> bool {
        matches!(
            (self, next),
            (_, QuoteStatus::Sent) | (QuoteStatus::Sent, QuoteStatus::Approved | QuoteStatus::Rejected)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLine {
    pub name: String,
    pub labor_cost: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartLine {
    pub name: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    /// Always `quantity * unit_price`, recomputed on every cost mutation.
    pub line_total: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraCost {
    pub name: String,
    pub amount: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub id: QuoteId,
    pub booking_request_id: BookingId,
    pub workshop_id: String,
    pub customer_id: String,
    pub quote_number: Option<String>,
    pub services: Vec<ServiceLine>,
    pub parts: Vec<PartLine>,
    pub additional_costs: Vec<ExtraCost>,
    pub labor_cost: Decimal,
    pub parts_cost: Decimal,
    pub subtotal: Decimal,
    /// Percent, e.g. 22 for the default Italian rate.
    pub vat_rate: Decimal,
    pub vat_amount: Decimal,
    pub total_cost: Decimal,
    pub status: QuoteStatus,
    pub revision_number: u32,
    pub previous_quote_id: Option<QuoteId>,
    #[serde(default, with = "timestamps::ts_milliseconds_option")]
    pub valid_until: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    #[serde(with = "timestamps::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "timestamps::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, with = "timestamps::ts_milliseconds_option")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamps::ts_milliseconds_option")]
    pub rejected_at: Option<DateTime<Utc>>,
}

impl Quote {
    pub fn transition_to(&mut self, next: QuoteStatus) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidQuoteTransition { from: self.status, to: next });
        }
        self.status = next;
        Ok(())
    }

    /// Recomputes part line totals and every aggregate from the line items.
    /// Aggregates are never taken from callers.
    pub fn recompute_totals(&mut self) {
        for part in &mut self.parts {
            part.line_total = pricing::line_total(part.quantity, part.unit_price);
        }
        let breakdown = pricing::breakdown(
            &self.services,
            &self.parts,
            &self.additional_costs,
            self.vat_rate,
        );
        self.labor_cost = breakdown.labor_cost;
        self.parts_cost = breakdown.parts_cost;
        self.subtotal = breakdown.subtotal;
        self.vat_amount = breakdown.vat_amount;
        self.total_cost = breakdown.total_cost;
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.is_some_and(|valid_until| now > valid_until)
    }

    /// Clones this quote into the next revision: fresh identity, lineage
    /// pointer back to `self`, draft status, approval metadata cleared.
    /// `self` stays untouched so the chain is a full audit trail.
    pub fn new_revision(&self, id: QuoteId, now: DateTime<Utc>) -> Quote {
        Quote {
            id,
            booking_request_id: self.booking_request_id.clone(),
            workshop_id: self.workshop_id.clone(),
            customer_id: self.customer_id.clone(),
            quote_number: None,
            services: self.services.clone(),
            parts: self.parts.clone(),
            additional_costs: self.additional_costs.clone(),
            labor_cost: self.labor_cost,
            parts_cost: self.parts_cost,
            subtotal: self.subtotal,
            vat_rate: self.vat_rate,
            vat_amount: self.vat_amount,
            total_cost: self.total_cost,
            status: QuoteStatus::Draft,
            revision_number: self.revision_number + 1,
            previous_quote_id: Some(self.id.clone()),
            valid_until: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
            approved_at: None,
            rejected_at: None,
        }
    }
}
