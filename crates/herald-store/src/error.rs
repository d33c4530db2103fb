use thiserror::Error;

/// Errors raised by a [`MailStore`](crate::MailStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failure reported by a non-SQLite backend.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// No campaign with this id exists. `user_id` is the owner the lookup was
    /// scoped to, if any.
    #[error("Campaign not found: {campaign_id}")]
    CampaignNotFound {
        campaign_id: i64,
        user_id: Option<i64>,
    },

    /// Another caller already holds the lock on some of the requested rows.
    #[error("Lock contention: claimed {locked} of {requested} mail logs")]
    LockContention { requested: usize, locked: usize },

    /// A persisted status, outcome or timestamp could not be parsed.
    #[error("Invalid persisted value: {0}")]
    InvalidValue(String),

    /// A previous holder of the connection panicked.
    #[error("Connection mutex poisoned")]
    Poisoned,
}

impl StoreError {
    /// Permanent for the affected batch; everything else may succeed on a later tick.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::CampaignNotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
