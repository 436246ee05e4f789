use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use officina_core::{
    BookingId, ExtraCost, PartLine, Quote, QuoteId, QuoteStatus, ServiceLine, DEFAULT_VAT_RATE,
};
use officina_store::{decode_doc, encode_doc, Collection, Filter, OrderBy, RecordStore, StoreError};

use crate::error::ServiceError;

const QUOTE: &str = "quote";
const WRITE_ATTEMPTS: usize = 5;

pub const DEFAULT_VALIDITY_DAYS: u32 = 30;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartDraft {
    pub name: String,
    pub quantity: u32,
    pub unit_price: Decimal,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuoteDraft {
    pub booking_request_id: BookingId,
    pub workshop_id: String,
    pub customer_id: String,
    #[serde(default)]
    pub services: Vec<ServiceLine>,
    #[serde(default)]
    pub parts: Vec<PartDraft>,
    #[serde(default)]
    pub additional_costs: Vec<ExtraCost>,
    pub vat_rate: Option<Decimal>,
    pub revision_number: Option<u32>,
    pub previous_quote_id: Option<QuoteId>,
}

/// Partial update. Aggregate fields are not part of the payload; they are
/// always recomputed from the line items.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QuoteChanges {
    pub services: Option<Vec<ServiceLine>>,
    pub parts: Option<Vec<PartDraft>>,
    pub additional_costs: Option<Vec<ExtraCost>>,
    pub vat_rate: Option<Decimal>,
    #[serde(default, with = "officina_core::domain::timestamps::ts_milliseconds_option")]
    pub valid_until: Option<DateTime<Utc>>,
}

impl QuoteChanges {
    fn touches_cost(&self) -> bool {
        self.services.is_some()
            || self.parts.is_some()
            || self.additional_costs.is_some()
            || self.vat_rate.is_some()
    }
}

/// Owns the lifecycle and cost arithmetic of quotes and their revision
/// chains. Stateless over the record store, like the negotiation manager.
pub struct QuoteService<S> {
    store: Arc<S>,
}

impl<S> Clone for QuoteService<S> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store) }
    }
}

impl<S: RecordStore> QuoteService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn create_quote(&self, draft: QuoteDraft) -> Result<Quote, ServiceError> {
        if draft.workshop_id.trim().is_empty() {
            return Err(ServiceError::validation("quote workshop id is required"));
        }

        let now = Utc::now();
        let quote_number = self.generate_quote_number(&draft.workshop_id).await;
        let mut quote = Quote {
            id: QuoteId(Uuid::new_v4().to_string()),
            booking_request_id: draft.booking_request_id,
            workshop_id: draft.workshop_id,
            customer_id: draft.customer_id,
            quote_number: Some(quote_number),
            services: draft.services,
            parts: draft.parts.into_iter().map(part_from_draft).collect(),
            additional_costs: draft.additional_costs,
            labor_cost: Decimal::ZERO,
            parts_cost: Decimal::ZERO,
            subtotal: Decimal::ZERO,
            vat_rate: draft.vat_rate.unwrap_or(DEFAULT_VAT_RATE),
            vat_amount: Decimal::ZERO,
            total_cost: Decimal::ZERO,
            status: QuoteStatus::Draft,
            revision_number: draft.revision_number.unwrap_or(0),
            previous_quote_id: draft.previous_quote_id,
            valid_until: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
            approved_at: None,
            rejected_at: None,
        };
        quote.recompute_totals();

        self.store.put(Collection::Quotes, &quote.id.0, encode_doc(&quote)?).await?;

        info!(
            quote_id = %quote.id.0,
            booking_id = %quote.booking_request_id.0,
            total = %quote.total_cost,
            "quote created"
        );
        Ok(quote)
    }

    pub async fn quote(&self, id: &QuoteId) -> Result<Quote, ServiceError> {
        let doc = self
            .store
            .get(Collection::Quotes, &id.0)
            .await?
            .ok_or_else(|| ServiceError::not_found(QUOTE, &id.0))?;
        Ok(decode_doc(&doc)?)
    }

    /// Every quote ever issued for the booking, oldest first, so the revision
    /// chain reads top to bottom.
    pub async fn quotes_for_booking(
        &self,
        booking_id: &BookingId,
    ) -> Result<Vec<Quote>, ServiceError> {
        let docs = self
            .store
            .query(
                Collection::Quotes,
                &[Filter::eq("booking_request_id", booking_id.0.clone())],
                Some(&OrderBy::asc("created_at")),
                None,
            )
            .await?;
        docs.iter().map(|doc| decode_doc(doc).map_err(Into::into)).collect()
    }

    pub async fn send_quote(
        &self,
        quote_id: &QuoteId,
        validity_days: Option<u32>,
    ) -> Result<Quote, ServiceError> {
        let days = validity_days.unwrap_or(DEFAULT_VALIDITY_DAYS);
        let quote = self
            .mutate_quote(quote_id, |quote| {
                quote.transition_to(QuoteStatus::Sent)?;
                quote.valid_until = Some(Utc::now() + Duration::days(i64::from(days)));
                Ok(())
            })
            .await?;

        info!(quote_id = %quote_id.0, validity_days = days, "quote sent");
        Ok(quote)
    }

    pub async fn approve_quote(&self, quote_id: &QuoteId) -> Result<Quote, ServiceError> {
        let quote = self
            .mutate_quote(quote_id, |quote| {
                quote.transition_to(QuoteStatus::Approved)?;
                quote.approved_at = Some(Utc::now());
                Ok(())
            })
            .await?;

        info!(quote_id = %quote_id.0, "quote approved");
        Ok(quote)
    }

    pub async fn reject_quote(
        &self,
        quote_id: &QuoteId,
        reason: Option<String>,
    ) -> Result<Quote, ServiceError> {
        let quote = self
            .mutate_quote(quote_id, |quote| {
                quote.transition_to(QuoteStatus::Rejected)?;
                quote.rejected_at = Some(Utc::now());
                quote.rejection_reason = reason.clone();
                Ok(())
            })
            .await?;

        info!(quote_id = %quote_id.0, "quote rejected");
        Ok(quote)
    }

    /// Merges the changed fields into the freshly-read quote and recomputes
    /// the aggregates whenever a cost input changed.
    pub async fn update_quote(
        &self,
        quote_id: &QuoteId,
        changes: QuoteChanges,
    ) -> Result<Quote, ServiceError> {
        self.mutate_quote(quote_id, |quote| {
            apply_changes(quote, &changes);
            Ok(())
        })
        .await
    }

    /// Supersedes a quote with a fresh draft revision. The original entity
    /// is left untouched so the chain stays a full audit trail.
    pub async fn create_revision(
        &self,
        original_id: &QuoteId,
        changes: QuoteChanges,
    ) -> Result<Quote, ServiceError> {
        let original = self.quote(original_id).await?;

        let now = Utc::now();
        let mut revision = original.new_revision(QuoteId(Uuid::new_v4().to_string()), now);
        revision.quote_number = Some(self.generate_quote_number(&revision.workshop_id).await);
        apply_changes(&mut revision, &changes);
        revision.recompute_totals();

        self.store.put(Collection::Quotes, &revision.id.0, encode_doc(&revision)?).await?;

        info!(
            quote_id = %revision.id.0,
            previous_quote_id = %original_id.0,
            revision_number = revision.revision_number,
            "quote revision created"
        );
        Ok(revision)
    }

    /// Human-readable sequence number scoped to the workshop and calendar
    /// year. Best-effort only: when the count query fails the number falls
    /// back to a timestamp suffix instead of failing the quote. The number is
    /// cosmetic, not a primary key.
    pub async fn generate_quote_number(&self, workshop_id: &str) -> String {
        let now = Utc::now();
        let year = now.year();

        let window = Utc
            .with_ymd_and_hms(year, 1, 1, 0, 0, 0)
            .single()
            .zip(Utc.with_ymd_and_hms(year + 1, 1, 1, 0, 0, 0).single());
        let counted = match window {
            Some((start, end)) => {
                self.store
                    .count(
                        Collection::Quotes,
                        &[
                            Filter::eq("workshop_id", workshop_id),
                            Filter::gte("created_at", start.timestamp_millis()),
                            Filter::lte("created_at", end.timestamp_millis() - 1),
                        ],
                    )
                    .await
            }
            None => Err(StoreError::Unavailable("calendar year window".to_string())),
        };

        match counted {
            Ok(count) => format!("Q-{year}-{:04}", count + 1),
            Err(error) => {
                warn!(workshop_id, error = %error, "quote number count failed, using fallback");
                format!("Q-{year}-{}", now.timestamp_millis() % 1_000_000)
            }
        }
    }

    async fn mutate_quote<F>(&self, quote_id: &QuoteId, mut apply: F) -> Result<Quote, ServiceError>
    where
        F: FnMut(&mut Quote) -> Result<(), ServiceError>,
    {
        for _ in 0..WRITE_ATTEMPTS {
            let doc = self
                .store
                .get(Collection::Quotes, &quote_id.0)
                .await?
                .ok_or_else(|| ServiceError::not_found(QUOTE, &quote_id.0))?;
            let mut quote: Quote = decode_doc(&doc)?;

            apply(&mut quote)?;
            quote.updated_at = Utc::now();

            match self
                .store
                .put_checked(Collection::Quotes, &quote_id.0, encode_doc(&quote)?, doc.version)
                .await
            {
                Ok(_) => return Ok(quote),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(StoreError::Missing { .. }) => {
                    return Err(ServiceError::not_found(QUOTE, &quote_id.0))
                }
                Err(error) => return Err(error.into()),
            }
        }

        Err(ServiceError::Store(StoreError::VersionConflict {
            collection: Collection::Quotes,
            id: quote_id.0.clone(),
        }))
    }
}

fn part_from_draft(draft: PartDraft) -> PartLine {
    PartLine {
        name: draft.name,
        quantity: draft.quantity,
        unit_price: draft.unit_price,
        line_total: Decimal::ZERO,
    }
}

fn apply_changes(quote: &mut Quote, changes: &QuoteChanges) {
    if let Some(services) = &changes.services {
        quote.services = services.clone();
    }
    if let Some(parts) = &changes.parts {
        quote.parts = parts.iter().cloned().map(part_from_draft).collect();
    }
    if let Some(additional_costs) = &changes.additional_costs {
        quote.additional_costs = additional_costs.clone();
    }
    if let Some(vat_rate) = changes.vat_rate {
        quote.vat_rate = vat_rate;
    }
    if let Some(valid_until) = changes.valid_until {
        quote.valid_until = Some(valid_until);
    }
    if changes.touches_cost() {
        quote.recompute_totals();
    }
}
