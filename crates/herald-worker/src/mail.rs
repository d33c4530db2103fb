//! Things the mailer can send: persisted campaign mail and one-off test mail.

use std::sync::Arc;

use chrono::Duration;
use herald_core::MailLog;
use herald_store::MailStore;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::DeliveryError;

/// Longest backoff step, in minutes (2^12 ≈ 68 hours).
const MAX_BACKOFF_EXPONENT: u32 = 12;

/// Delay before retry number `attempt` (1-based): 2, 4, 8 … minutes.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::minutes(1i64 << attempt.min(MAX_BACKOFF_EXPONENT))
}

/// A unit handed to the mailer.
///
/// Only scheduled mail carries a campaign key; test mail is always sent as a
/// batch of one and never takes part in campaign grouping.
pub enum Sendable {
    Scheduled(ScheduledMail),
    Test(TestMail),
}

impl Sendable {
    /// Grouping key; `None` means "never grouped".
    pub fn campaign_key(&self) -> Option<i64> {
        match self {
            Sendable::Scheduled(m) => Some(m.log.campaign_id),
            Sendable::Test(_) => None,
        }
    }

    pub fn recipient(&self) -> &str {
        match self {
            Sendable::Scheduled(m) => &m.log.recipient,
            Sendable::Test(m) => &m.request.to,
        }
    }

    /// Record a delivery failure against this unit.
    pub async fn report_failure(self, cause: DeliveryError) {
        match self {
            Sendable::Scheduled(m) => m.report_failure(cause).await,
            Sendable::Test(mut m) => m.reply(Err(cause)),
        }
    }

    pub async fn report_success(self) {
        match self {
            Sendable::Scheduled(m) => {
                if let Err(e) = m.store.mark_sent(m.log.id).await {
                    error!(mail_log_id = m.log.id, error = %e, "failed to record sent mail");
                }
            }
            Sendable::Test(mut m) => m.reply(Ok(())),
        }
    }

    /// Reschedule after a transient failure, or error out once `max_attempts`
    /// retries are used up. Test mail is never retried.
    pub async fn backoff(self, cause: DeliveryError, max_attempts: u32) {
        match self {
            Sendable::Scheduled(m) => {
                if m.log.send_attempt >= max_attempts {
                    warn!(
                        mail_log_id = m.log.id,
                        attempts = m.log.send_attempt,
                        "giving up on mail after repeated failures"
                    );
                    let attempts = m.log.send_attempt;
                    m.report_failure(DeliveryError::MaxSendAttempts { attempts })
                        .await;
                    return;
                }
                let attempt = m.log.send_attempt + 1;
                let next = m.log.send_date + backoff_delay(attempt);
                debug!(mail_log_id = m.log.id, attempt, next = %next, "backing off mail");
                if let Err(e) = m
                    .store
                    .backoff_unit(m.log.id, &cause.to_string(), next)
                    .await
                {
                    error!(mail_log_id = m.log.id, error = %e, "failed to reschedule mail");
                }
            }
            Sendable::Test(mut m) => m.reply(Err(cause)),
        }
    }

    /// Give the unit back without an outcome: scheduled mail is unlocked so a
    /// later scan can claim it, test mail is told it was cancelled.
    pub async fn release(self) {
        match self {
            Sendable::Scheduled(m) => {
                if let Err(e) = m.store.unlock_units(std::slice::from_ref(&m.log)).await {
                    error!(mail_log_id = m.log.id, error = %e, "failed to unlock mail");
                }
            }
            Sendable::Test(mut m) => m.reply(Err(DeliveryError::Cancelled)),
        }
    }
}

/// A locked `mail_logs` row plus the store that owns it.
pub struct ScheduledMail {
    log: MailLog,
    store: Arc<dyn MailStore>,
}

impl ScheduledMail {
    pub fn new(log: MailLog, store: Arc<dyn MailStore>) -> Self {
        Self { log, store }
    }

    pub fn log(&self) -> &MailLog {
        &self.log
    }

    async fn report_failure(self, cause: DeliveryError) {
        if let Err(e) = self
            .store
            .mark_errored(self.log.id, &cause.to_string())
            .await
        {
            error!(mail_log_id = self.log.id, error = %e, "failed to record mail error");
        }
    }
}

/// Ad-hoc message for a test send.
#[derive(Debug, Clone)]
pub struct TestRequest {
    /// Correlates log lines of one test send.
    pub id: Uuid,
    pub to: String,
    pub from: String,
    pub subject: String,
    pub body: String,
}

impl TestRequest {
    pub fn new(to: &str, from: &str, subject: &str, body: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            to: to.to_string(),
            from: from.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        }
    }
}

/// Caller-owned, non-persisted unit with a single-slot reply channel.
///
/// The sender is consumed on first use, and dropping an unanswered unit
/// reports [`DeliveryError::Abandoned`], so the caller always receives
/// exactly one value.
pub struct TestMail {
    request: TestRequest,
    reply: Option<oneshot::Sender<Result<(), DeliveryError>>>,
}

/// Receiving half of a [`TestMail`] reply channel.
pub struct TestReply(oneshot::Receiver<Result<(), DeliveryError>>);

impl TestReply {
    /// Wait for the delivery outcome.
    pub async fn wait(self) -> Result<(), DeliveryError> {
        self.0.await.unwrap_or(Err(DeliveryError::Abandoned))
    }
}

impl TestMail {
    pub fn new(request: TestRequest) -> (Self, TestReply) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                request,
                reply: Some(tx),
            },
            TestReply(rx),
        )
    }

    pub fn request(&self) -> &TestRequest {
        &self.request
    }

    fn reply(&mut self, result: Result<(), DeliveryError>) {
        if let Some(tx) = self.reply.take() {
            if tx.send(result).is_err() {
                debug!(test_id = %self.request.id, "test mail caller went away");
            }
        }
    }
}

impl Drop for TestMail {
    fn drop(&mut self) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(Err(DeliveryError::Abandoned));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{log_at, MockStore};
    use chrono::Utc;
    use herald_core::CampaignStatus;

    fn test_mail() -> (TestMail, TestReply) {
        TestMail::new(TestRequest::new(
            "target@example.com",
            "ops@example.com",
            "ping",
            "hello",
        ))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::minutes(2));
        assert_eq!(backoff_delay(3), Duration::minutes(8));
        assert_eq!(backoff_delay(40), backoff_delay(MAX_BACKOFF_EXPONENT));
    }

    #[tokio::test]
    async fn test_mail_replies_once_on_success() {
        let (mail, reply) = test_mail();
        let sendable = Sendable::Test(mail);
        assert_eq!(sendable.campaign_key(), None);
        sendable.report_success().await;
        assert_eq!(reply.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn dropped_test_mail_reports_abandoned() {
        let (mail, reply) = test_mail();
        drop(mail);
        assert_eq!(reply.wait().await, Err(DeliveryError::Abandoned));
    }

    #[tokio::test]
    async fn test_mail_is_not_retried() {
        let (mail, reply) = test_mail();
        Sendable::Test(mail)
            .backoff(DeliveryError::Transport("timeout".into()), 8)
            .await;
        assert_eq!(
            reply.wait().await,
            Err(DeliveryError::Transport("timeout".into()))
        );
    }

    #[tokio::test]
    async fn scheduled_mail_backs_off_then_errors_out() {
        let store = Arc::new(MockStore::new());
        store.add_campaign(1, 10, CampaignStatus::InProgress);
        let mut log = log_at(5, 1, 10, Utc::now());

        let mail = Sendable::Scheduled(ScheduledMail::new(log.clone(), store.clone()));
        assert_eq!(mail.campaign_key(), Some(1));
        mail.backoff(DeliveryError::Transport("451".into()), 2).await;
        assert_eq!(store.backoffs(), vec![5]);
        assert!(store.errored().is_empty());

        log.send_attempt = 2;
        let mail = Sendable::Scheduled(ScheduledMail::new(log, store.clone()));
        mail.backoff(DeliveryError::Transport("451".into()), 2).await;
        assert_eq!(
            store.errored(),
            vec![(5, "Max send attempts exceeded (2)".to_string())]
        );
    }
}
