use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::quote::QuoteId;
use crate::domain::timestamps;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BookingId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProposalId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

/// The two negotiating parties. `User` is the customer side, `Mechanic` the
/// workshop side; the wire names match the stored documents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyRole {
    User,
    Mechanic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingKind {
    Routine,
    Custom,
    Emergency,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Emergency,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerRef {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkshopRef {
    pub id: String,
    pub name: String,
    pub mechanic_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleRef {
    pub make: String,
    pub model: String,
    pub year: i32,
    pub plate: String,
    pub odometer_km: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub catalog_id: Option<String>,
    pub name: String,
    pub category: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Rejected,
    CounterProposed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub proposed_by: PartyRole,
    #[serde(with = "timestamps::ts_milliseconds")]
    pub proposed_date: DateTime<Utc>,
    pub message: Option<String>,
    pub estimated_cost: Option<Decimal>,
    pub status: ProposalStatus,
    #[serde(with = "timestamps::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_role: PartyRole,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub is_read: bool,
    #[serde(with = "timestamps::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// Per-party dedup record for push delivery: outer workflows check the flag
/// before notifying and set it afterwards. Every status change re-zeroes both.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationFlags {
    pub customer_notified: bool,
    pub workshop_notified: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    QuoteRequested,
    QuoteSent,
    DateProposed,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    Rejected,
}

impl BookingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Rejected)
    }

    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::{
            Cancelled, Confirmed, DateProposed, InProgress, Pending, QuoteRequested, QuoteSent,
            Rejected,
        };

        matches!(
            (self, next),
            (Pending, QuoteRequested | QuoteSent | DateProposed)
                | (QuoteRequested, QuoteSent | DateProposed)
                | (QuoteSent, QuoteRequested | QuoteSent | DateProposed | Confirmed)
                | (DateProposed, DateProposed | QuoteRequested | QuoteSent | Confirmed)
                // A confirmed date can be reopened for negotiation until work starts.
                | (Confirmed, InProgress | DateProposed)
                | (InProgress, BookingStatus::Completed)
                | (
                    Pending | QuoteRequested | QuoteSent | DateProposed | Confirmed | InProgress,
                    Cancelled
                )
                | (Pending | QuoteRequested | QuoteSent | DateProposed, Rejected)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub id: BookingId,
    pub customer: CustomerRef,
    pub workshop: WorkshopRef,
    pub vehicle: VehicleRef,
    pub kind: BookingKind,
    pub service: ServiceRef,
    pub problem_description: String,
    pub urgency: Urgency,
    #[serde(with = "timestamps::ts_milliseconds_vec")]
    pub preferred_dates: Vec<DateTime<Utc>>,
    pub proposals: Vec<Proposal>,
    pub messages: Vec<Message>,
    pub status: BookingStatus,
    #[serde(default, with = "timestamps::ts_milliseconds_option")]
    pub selected_date: Option<DateTime<Utc>>,
    pub quote_id: Option<QuoteId>,
    pub quoted_price: Option<Decimal>,
    pub notifications: NotificationFlags,
    #[serde(with = "timestamps::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "timestamps::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, with = "timestamps::ts_milliseconds_option")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl BookingRequest {
    /// Moves the booking through the status table. Any accepted move resets
    /// the notification flags so the new status can be pushed exactly once.
    pub fn transition_to(&mut self, next: BookingStatus) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidBookingTransition { from: self.status, to: next });
        }
        self.status = next;
        self.notifications = NotificationFlags::default();
        Ok(())
    }

    pub fn proposal(&self, id: &ProposalId) -> Option<&Proposal> {
        self.proposals.iter().find(|proposal| &proposal.id == id)
    }

    pub fn proposal_mut(&mut self, id: &ProposalId) -> Option<&mut Proposal> {
        self.proposals.iter_mut().find(|proposal| &proposal.id == id)
    }

    pub fn unread_message_count(&self, reader_id: &str) -> usize {
        self.messages
            .iter()
            .filter(|message| message.sender_id != reader_id && !message.is_read)
            .count()
    }

    /// Marks every message from the other party as read. Returns how many
    /// flags were flipped; calling it again is a no-op.
    pub fn mark_messages_read(&mut self, reader_id: &str) -> usize {
        let mut flipped = 0;
        for message in &mut self.messages {
            if message.sender_id != reader_id && !message.is_read {
                message.is_read = true;
                flipped += 1;
            }
        }
        flipped
    }
}
