use herald_store::{StoreError, CAMPAIGN_UNAVAILABLE};
use thiserror::Error;

/// Why a single mail was not delivered.
///
/// Reported per unit through [`Sendable::report_failure`](crate::Sendable::report_failure),
/// never to the scan loop. `Clone` so one cause can be fanned out to a whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Temporary transport problem; the mail is retried with backoff.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The transport refused the message for good.
    #[error("Rejected by transport: {0}")]
    Rejected(String),

    /// The owning campaign could not be resolved.
    #[error("{prefix}: {0}", prefix = CAMPAIGN_UNAVAILABLE)]
    Campaign(String),

    #[error("Max send attempts exceeded ({attempts})")]
    MaxSendAttempts { attempts: u32 },

    /// The unit was dropped without anyone reporting an outcome.
    #[error("Mail dropped without a delivery report")]
    Abandoned,

    #[error("Mail queue closed")]
    QueueClosed,

    #[error("Delivery cancelled by shutdown")]
    Cancelled,
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transport(_))
    }
}

/// Errors surfaced by the on-demand entry points of the engine.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
