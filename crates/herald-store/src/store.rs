use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::{Campaign, CampaignStatus, MailLog};

use crate::error::Result;

/// Error-detail prefix of mail that failed because its campaign could not be
/// resolved. Such mail is recoverable through [`MailStore::requeue_campaign`].
pub const CAMPAIGN_UNAVAILABLE: &str = "Campaign unavailable";

/// Which locked mail [`MailStore::requeue_campaign`] hands back to the scan loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueScope {
    /// Only mail errored with a [`CAMPAIGN_UNAVAILABLE`] cause. Safe while a
    /// dispatcher is running.
    Unresolved,
    /// Also unlock pending mail that is still locked. Such mail may be sitting
    /// in a live mailer queue, so this is only safe with no dispatcher running.
    IncludeInFlight,
}

/// Data-access contract consumed by the dispatch core.
///
/// Implementations must be `Send + Sync`: one store handle is shared by the
/// scan loop and every per-campaign task it spawns.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Unlocked, still-pending mail logs scheduled at or before `at`.
    async fn fetch_due_units(&self, at: DateTime<Utc>) -> Result<Vec<MailLog>>;

    /// Set the lock flag on every unit, all or nothing.
    ///
    /// Atomic with respect to concurrent callers: if any row is already
    /// locked nothing is changed and [`StoreError::LockContention`] is
    /// returned, so no unit is left locked without an owner.
    ///
    /// [`StoreError::LockContention`]: crate::StoreError::LockContention
    async fn lock_units(&self, units: &[MailLog]) -> Result<()>;

    /// Clear the lock flag, handing the units back to the scan loop.
    async fn unlock_units(&self, units: &[MailLog]) -> Result<()>;

    /// Every mail log of the campaign, whatever its lock state.
    async fn fetch_units_by_campaign(&self, campaign_id: i64) -> Result<Vec<MailLog>>;

    /// Campaign owned by `user_id`; `CampaignNotFound` otherwise.
    async fn fetch_campaign(&self, campaign_id: i64, user_id: i64) -> Result<Campaign>;

    /// Advance the campaign to `status`.
    ///
    /// Forward-only and idempotent: returns `Ok(false)` without writing when
    /// the campaign is already at or past `status`.
    async fn update_campaign_status(&self, campaign_id: i64, status: CampaignStatus)
        -> Result<bool>;

    /// Record a successful delivery and release the lock.
    async fn mark_sent(&self, unit_id: i64) -> Result<()>;

    /// Record a terminal delivery failure. The lock is kept.
    async fn mark_errored(&self, unit_id: i64, detail: &str) -> Result<()>;

    /// Count one more attempt, reschedule to `next_send_date` and release the lock.
    async fn backoff_unit(
        &self,
        unit_id: i64,
        reason: &str,
        next_send_date: DateTime<Utc>,
    ) -> Result<()>;

    /// Operator recovery of locked mail, limited to `scope`.
    ///
    /// Mail that was sent, rejected by the transport or ran out of attempts
    /// is never touched, and `send_attempt` is kept. Returns how many units
    /// were released.
    async fn requeue_campaign(&self, campaign_id: i64, scope: RequeueScope) -> Result<usize>;
}
