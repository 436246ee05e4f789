pub mod directory;
pub mod error;
pub mod negotiation;
pub mod quotes;
pub mod sync;
pub mod workflow;

pub use directory::{DirectoryError, HttpWorkshopDirectory, NoopDirectory, WorkshopDirectory};
pub use error::ServiceError;
pub use negotiation::{NegotiationService, NewBookingRequest, NewMessage, NewProposal};
pub use quotes::{PartDraft, QuoteChanges, QuoteDraft, QuoteService, DEFAULT_VALIDITY_DAYS};
pub use sync::{BookingSetWatcher, BookingView, BookingWatcher, NegotiationFeed};
pub use workflow::EngagementWorkflow;
