use thiserror::Error;

use crate::domain::booking::BookingStatus;
use crate::domain::quote::QuoteStatus;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid booking transition from {from:?} to {to:?}")]
    InvalidBookingTransition { from: BookingStatus, to: BookingStatus },
    #[error("invalid quote transition from {from:?} to {to:?}")]
    InvalidQuoteTransition { from: QuoteStatus, to: QuoteStatus },
    #[error("validation failed: {0}")]
    Validation(String),
}

impl DomainError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}
