use thiserror::Error;

/// Errors returned by facilitator operations.
///
/// Edge-visible failures are coerced to the enumerated reason strings in
/// [`crate::payment::reason`] before they cross the HTTP boundary; these
/// variants carry the internal detail for logs.
#[derive(Debug, Error)]
pub enum FacilitatorError {
    #[error("signature error: {0}")]
    Signature(String),

    #[error("chain error: {0}")]
    Chain(String),

    #[error("invalid payment: {0}")]
    InvalidPayment(String),

    #[error("bond error: {0}")]
    Bond(String),

    #[error("escrow error: {0}")]
    Escrow(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
