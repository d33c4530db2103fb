use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{error::DeliveryError, mail::Sendable};

/// Delivery subsystem as seen by the dispatch core.
///
/// `queue` must hand the batch off and return; it may wait for buffer space
/// but never for the actual delivery.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Consume queued batches until `cancel` fires. Called once at startup.
    async fn start(&self, cancel: CancellationToken);

    /// Accept a batch for asynchronous delivery.
    ///
    /// On error the mailer has already released every unit of the batch.
    async fn queue(&self, batch: Vec<Sendable>) -> Result<(), DeliveryError>;
}

/// Wire-level sender behind [`QueueMailer`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable lowercase identifier used in logs.
    fn name(&self) -> &str;

    /// Deliver one message. [`DeliveryError::Transport`] marks the failure as
    /// temporary; any other error is final.
    async fn deliver(&self, mail: &Sendable) -> Result<(), DeliveryError>;
}

/// Transport that only logs what would have been sent.
pub struct DryRunTransport;

#[async_trait]
impl Transport for DryRunTransport {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn deliver(&self, mail: &Sendable) -> Result<(), DeliveryError> {
        match mail {
            Sendable::Scheduled(m) => info!(
                mail_log_id = m.log().id,
                campaign_id = m.log().campaign_id,
                recipient = %m.log().recipient,
                "dry-run delivery"
            ),
            Sendable::Test(m) => info!(
                test_id = %m.request().id,
                recipient = %m.request().to,
                subject = %m.request().subject,
                "dry-run test delivery"
            ),
        }
        Ok(())
    }
}

/// In-process [`Mailer`]: a bounded queue drained by a single consumer.
///
/// Batches are delivered one unit at a time so a transport can reuse its
/// connection across the mail of one campaign.
pub struct QueueMailer {
    tx: mpsc::Sender<Vec<Sendable>>,
    rx: Mutex<Option<mpsc::Receiver<Vec<Sendable>>>>,
    transport: Arc<dyn Transport>,
    max_send_attempts: u32,
    // Batches accepted by `queue` and not yet delivered or released.
    outstanding: AtomicUsize,
    drained: Notify,
}

impl QueueMailer {
    pub fn new(transport: Arc<dyn Transport>, capacity: usize, max_send_attempts: u32) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            transport,
            max_send_attempts,
            outstanding: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Wait until every batch accepted so far has been delivered or released.
    pub async fn flush(&self) {
        loop {
            let drained = self.drained.notified();
            if self.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }

    fn batch_done(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn deliver_batch(&self, batch: Vec<Sendable>, cancel: &CancellationToken) {
        let mut pending = batch.into_iter();
        for mail in pending.by_ref() {
            if cancel.is_cancelled() {
                mail.release().await;
                break;
            }
            match self.transport.deliver(&mail).await {
                Ok(()) => mail.report_success().await,
                Err(e) if e.is_transient() => {
                    debug!(recipient = %mail.recipient(), error = %e, "transient delivery failure");
                    mail.backoff(e, self.max_send_attempts).await
                }
                Err(e) => {
                    warn!(recipient = %mail.recipient(), error = %e, "delivery failed");
                    mail.report_failure(e).await
                }
            }
        }
        for mail in pending {
            mail.release().await;
        }
    }
}

#[async_trait]
impl Mailer for QueueMailer {
    async fn start(&self, cancel: CancellationToken) {
        let Some(mut rx) = self.rx.lock().await.take() else {
            warn!("mailer already started");
            return;
        };
        info!(transport = %self.transport.name(), "mailer started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                batch = rx.recv() => match batch {
                    Some(batch) => {
                        self.deliver_batch(batch, &cancel).await;
                        self.batch_done();
                    }
                    None => break,
                },
            }
        }

        // Hand back whatever was still buffered.
        rx.close();
        let mut released = 0usize;
        while let Ok(batch) = rx.try_recv() {
            for mail in batch {
                mail.release().await;
                released += 1;
            }
            self.batch_done();
        }
        info!(released, "mailer stopped");
    }

    async fn queue(&self, batch: Vec<Sendable>) -> Result<(), DeliveryError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(batch)) = self.tx.send(batch).await {
            self.batch_done();
            for mail in batch {
                mail.release().await;
            }
            return Err(DeliveryError::QueueClosed);
        }
        Ok(())
    }
}
