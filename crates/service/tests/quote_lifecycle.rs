use std::sync::Arc;

use chrono::{Datelike, Duration, Utc};
use rust_decimal::Decimal;

use officina_core::{BookingId, DomainError, ExtraCost, QuoteStatus, ServiceLine};
use officina_service::{PartDraft, QuoteChanges, QuoteDraft, QuoteService, ServiceError};
use officina_store::MemoryStore;

fn service() -> QuoteService<MemoryStore> {
    QuoteService::new(Arc::new(MemoryStore::new()))
}

fn draft() -> QuoteDraft {
    QuoteDraft {
        booking_request_id: BookingId("b-1".to_string()),
        workshop_id: "w-1".to_string(),
        customer_id: "u-1".to_string(),
        services: vec![ServiceLine {
            name: "Labor".to_string(),
            labor_cost: Decimal::new(5000, 2),
        }],
        parts: vec![PartDraft {
            name: "Front pads".to_string(),
            quantity: 1,
            unit_price: Decimal::new(3000, 2),
        }],
        additional_costs: vec![ExtraCost {
            name: "Disposal".to_string(),
            amount: Decimal::new(2000, 2),
        }],
        vat_rate: Some(Decimal::new(22, 0)),
        revision_number: None,
        previous_quote_id: None,
    }
}

#[tokio::test]
async fn created_quotes_carry_computed_totals() {
    let service = service();

    let quote = service.create_quote(draft()).await.expect("create quote");

    assert_eq!(quote.status, QuoteStatus::Draft);
    assert_eq!(quote.revision_number, 0);
    assert_eq!(quote.subtotal, Decimal::new(10000, 2));
    assert_eq!(quote.vat_amount, Decimal::new(2200, 2));
    assert_eq!(quote.total_cost, Decimal::new(12200, 2));
    assert!(quote.valid_until.is_none());

    let year = Utc::now().year();
    assert_eq!(quote.quote_number.as_deref(), Some(format!("Q-{year}-0001").as_str()));
}

#[tokio::test]
async fn quote_numbers_count_up_per_workshop_and_year() {
    let service = service();
    let year = Utc::now().year();

    let first = service.create_quote(draft()).await.expect("first quote");
    let second = service.create_quote(draft()).await.expect("second quote");
    let mut other = draft();
    other.workshop_id = "w-2".to_string();
    let other = service.create_quote(other).await.expect("other workshop");

    assert_eq!(first.quote_number.as_deref(), Some(format!("Q-{year}-0001").as_str()));
    assert_eq!(second.quote_number.as_deref(), Some(format!("Q-{year}-0002").as_str()));
    assert_eq!(other.quote_number.as_deref(), Some(format!("Q-{year}-0001").as_str()));
}

#[tokio::test]
async fn sending_sets_the_validity_window() {
    let service = service();
    let quote = service.create_quote(draft()).await.expect("create quote");

    let sent = service.send_quote(&quote.id, None).await.expect("send");
    assert_eq!(sent.status, QuoteStatus::Sent);

    let valid_until = sent.valid_until.expect("validity set");
    let window = valid_until - Utc::now();
    assert!(window > Duration::days(29) && window <= Duration::days(30));

    // An explicit validity overrides the 30-day default.
    let resent = service.send_quote(&quote.id, Some(7)).await.expect("re-send");
    let window = resent.valid_until.expect("validity set") - Utc::now();
    assert!(window > Duration::days(6) && window <= Duration::days(7));
}

#[tokio::test]
async fn approval_and_rejection_require_a_sent_quote() {
    let service = service();
    let quote = service.create_quote(draft()).await.expect("create quote");

    let error = service.approve_quote(&quote.id).await.expect_err("draft cannot be approved");
    assert!(matches!(
        error,
        ServiceError::Domain(DomainError::InvalidQuoteTransition {
            from: QuoteStatus::Draft,
            to: QuoteStatus::Approved
        })
    ));

    service.send_quote(&quote.id, None).await.expect("send");
    let approved = service.approve_quote(&quote.id).await.expect("approve");
    assert_eq!(approved.status, QuoteStatus::Approved);
    assert!(approved.approved_at.is_some());

    let error = service.reject_quote(&quote.id, None).await.expect_err("already approved");
    assert!(matches!(error, ServiceError::Domain(DomainError::InvalidQuoteTransition { .. })));
}

#[tokio::test]
async fn rejection_records_the_reason() {
    let service = service();
    let quote = service.create_quote(draft()).await.expect("create quote");
    service.send_quote(&quote.id, None).await.expect("send");

    let rejected = service
        .reject_quote(&quote.id, Some("too expensive".to_string()))
        .await
        .expect("reject");

    assert_eq!(rejected.status, QuoteStatus::Rejected);
    assert_eq!(rejected.rejection_reason.as_deref(), Some("too expensive"));
    assert!(rejected.rejected_at.is_some());
}

#[tokio::test]
async fn cost_updates_recompute_every_aggregate() {
    let service = service();
    let quote = service.create_quote(draft()).await.expect("create quote");

    let updated = service
        .update_quote(
            &quote.id,
            QuoteChanges {
                parts: Some(vec![PartDraft {
                    name: "Front pads".to_string(),
                    quantity: 2,
                    unit_price: Decimal::new(3000, 2),
                }]),
                ..QuoteChanges::default()
            },
        )
        .await
        .expect("update");

    assert_eq!(updated.parts_cost, Decimal::new(6000, 2));
    assert_eq!(updated.parts[0].line_total, Decimal::new(6000, 2));
    assert_eq!(updated.subtotal, Decimal::new(13000, 2));
    assert_eq!(updated.vat_amount, Decimal::new(2860, 2));
    assert_eq!(updated.total_cost, Decimal::new(15860, 2));
}

#[tokio::test]
async fn non_cost_updates_leave_totals_alone() {
    let service = service();
    let quote = service.create_quote(draft()).await.expect("create quote");

    let valid_until = Utc::now() + Duration::days(10);
    let updated = service
        .update_quote(
            &quote.id,
            QuoteChanges { valid_until: Some(valid_until), ..QuoteChanges::default() },
        )
        .await
        .expect("update");

    assert_eq!(updated.total_cost, quote.total_cost);
    assert!(updated.valid_until.is_some());
}

#[tokio::test]
async fn revisions_supersede_without_touching_history() {
    let service = service();
    let quote = service.create_quote(draft()).await.expect("create quote");
    service.send_quote(&quote.id, None).await.expect("send");
    service
        .reject_quote(&quote.id, Some("parts too dear".to_string()))
        .await
        .expect("reject");

    let revision = service
        .create_revision(
            &quote.id,
            QuoteChanges {
                services: Some(vec![ServiceLine {
                    name: "Labor".to_string(),
                    labor_cost: Decimal::new(4000, 2),
                }]),
                ..QuoteChanges::default()
            },
        )
        .await
        .expect("revise");

    assert_eq!(revision.revision_number, quote.revision_number + 1);
    assert_eq!(revision.previous_quote_id, Some(quote.id.clone()));
    assert_eq!(revision.status, QuoteStatus::Draft);
    assert_eq!(revision.rejection_reason, None);
    assert_eq!(revision.rejected_at, None);
    assert_eq!(revision.valid_until, None);
    assert_eq!(revision.subtotal, Decimal::new(9000, 2));

    // The rejected original still reads exactly as rejected.
    let original = service.quote(&quote.id).await.expect("reload original");
    assert_eq!(original.status, QuoteStatus::Rejected);
    assert_eq!(original.rejection_reason.as_deref(), Some("parts too dear"));
    assert_eq!(original.revision_number, 0);

    let chain = service.quotes_for_booking(&quote.booking_request_id).await.expect("chain");
    assert_eq!(chain.len(), 2);
    assert!(chain.iter().any(|entry| entry.id == quote.id));
    assert!(chain.iter().any(|entry| entry.id == revision.id));
}

#[tokio::test]
async fn unknown_quotes_surface_not_found() {
    let service = service();

    let missing = officina_core::QuoteId("nope".to_string());
    let error = service.send_quote(&missing, None).await.expect_err("unknown quote");
    assert!(matches!(error, ServiceError::NotFound { .. }));
}
