pub mod config;
pub mod domain;
pub mod errors;
pub mod pricing;

pub use domain::booking::{
    Attachment, BookingId, BookingKind, BookingRequest, BookingStatus, CustomerRef, Message,
    MessageId, NotificationFlags, PartyRole, Proposal, ProposalId, ProposalStatus, ServiceRef,
    Urgency, VehicleRef, WorkshopRef,
};
pub use domain::quote::{ExtraCost, PartLine, Quote, QuoteId, QuoteStatus, ServiceLine};
pub use errors::DomainError;
pub use pricing::{CostBreakdown, DEFAULT_VAT_RATE};
