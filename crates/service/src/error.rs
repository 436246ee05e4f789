use officina_core::DomainError;
use officina_store::StoreError;
use thiserror::Error;

/// Service-level failure kinds: `NotFound` and `Domain` are user-correctable,
/// `Store` is a transient retry condition for clients. No operation partially
/// applies a mutation and reports success; the versioned write is the single
/// commit point.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{kind} `{id}` was not found")]
    NotFound { kind: &'static str, id: String },
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ServiceError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Domain(DomainError::validation(message))
    }
}
