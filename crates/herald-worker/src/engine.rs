use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use herald_core::{
    config::{DispatchConfig, MAX_TICK_SECS},
    CampaignStatus, MailLog, MailOutcome,
};
use herald_store::{MailStore, StoreError};
use tokio::sync::Semaphore;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    mail::{ScheduledMail, Sendable, TestMail, TestReply, TestRequest},
    mailer::Mailer,
};

/// Runtime knobs of the [`DispatchEngine`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub tick: Duration,
    pub align_to_wall_clock: bool,
    pub max_concurrent_campaigns: usize,
    pub shutdown_grace: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

impl From<&DispatchConfig> for EngineOptions {
    fn from(cfg: &DispatchConfig) -> Self {
        Self {
            tick: Duration::from_secs(cfg.tick_secs.clamp(1, MAX_TICK_SECS)),
            align_to_wall_clock: cfg.align_to_wall_clock,
            max_concurrent_campaigns: cfg.max_concurrent_campaigns.max(1),
            shutdown_grace: Duration::from_secs(cfg.shutdown_grace_secs),
        }
    }
}

/// What one scan did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Mail logs locked by this tick.
    pub claimed: usize,
    /// Per-campaign tasks spawned.
    pub partitions: usize,
}

/// Outcome of an on-demand campaign launch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaunchReport {
    /// Due now and handed to the mailer.
    pub forwarded: usize,
    /// Scheduled later and unlocked again for the scan loop.
    pub deferred: usize,
}

/// Group locked mail logs by campaign. Every input lands in exactly one group.
pub fn partition_by_campaign(units: Vec<MailLog>) -> HashMap<i64, Vec<MailLog>> {
    let mut groups: HashMap<i64, Vec<MailLog>> = HashMap::new();
    for unit in units {
        groups.entry(unit.campaign_id).or_default().push(unit);
    }
    groups
}

/// Time from `now` until the next multiple of `period` since the Unix epoch.
pub fn delay_until_aligned(now: DateTime<Utc>, period: Duration) -> Duration {
    let period_ms = period.as_millis().max(1) as i64;
    let rem = now.timestamp_millis().rem_euclid(period_ms);
    Duration::from_millis((period_ms - rem) as u64)
}

/// The scheduling, locking and dispatch core.
///
/// One long-lived scan loop ([`run`](Self::run)) claims due mail logs every
/// tick and fans them out to one task per campaign. Those tasks are tracked
/// and bounded by a semaphore, so shutdown can wait for them and a burst of
/// due campaigns cannot pile up unbounded work.
pub struct DispatchEngine {
    store: Arc<dyn MailStore>,
    mailer: Arc<dyn Mailer>,
    options: EngineOptions,
    tracker: TaskTracker,
    limiter: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl DispatchEngine {
    pub fn new(
        store: Arc<dyn MailStore>,
        mailer: Arc<dyn Mailer>,
        options: EngineOptions,
        cancel: CancellationToken,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(options.max_concurrent_campaigns));
        Self {
            store,
            mailer,
            options,
            tracker: TaskTracker::new(),
            limiter,
            cancel,
        }
    }

    /// Partition tasks spawned and not finished yet.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Scan loop. Returns once the cancellation token fires and in-flight
    /// partition tasks finished or the grace period ran out.
    pub async fn run(&self) {
        let period = self.options.tick;
        let first = if self.options.align_to_wall_clock {
            delay_until_aligned(Utc::now(), period)
        } else {
            period
        };
        info!(
            tick_secs = period.as_secs(),
            first_tick_in_ms = first.as_millis() as u64,
            "dispatch engine started, waiting for campaigns"
        );

        let mut interval = tokio::time::interval_at(Instant::now() + first, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("dispatch engine shutting down");
                    break;
                }
                _ = interval.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) if report.claimed > 0 => {
                            info!(claimed = report.claimed, partitions = report.partitions, "tick dispatched");
                        }
                        Ok(_) => debug!("tick found no due mail"),
                        Err(e) => error!(error = %e, "dispatch tick skipped"),
                    }
                }
            }
        }

        self.drain().await;
    }

    /// One scan: fetch due mail, lock it, and spawn a task per campaign.
    ///
    /// A fetch or lock failure aborts the whole tick before anything is
    /// dispatched; the same mail is picked up again on a later tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> std::result::Result<TickReport, StoreError> {
        let units = self.store.fetch_due_units(now).await?;
        if units.is_empty() {
            return Ok(TickReport::default());
        }

        self.store.lock_units(&units).await?;

        let claimed = units.len();
        let groups = partition_by_campaign(units);
        let partitions = groups.len();
        for (campaign_id, units) in groups {
            self.spawn_partition(campaign_id, units);
        }
        Ok(TickReport {
            claimed,
            partitions,
        })
    }

    fn spawn_partition(&self, campaign_id: i64, units: Vec<MailLog>) {
        let store = self.store.clone();
        let mailer = self.mailer.clone();
        let limiter = self.limiter.clone();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = limiter.acquire_owned() => permit.ok(),
            };
            let Some(_permit) = permit else {
                // Shutting down before any work started: hand the locks back.
                debug!(campaign_id, units = units.len(), "releasing partition on shutdown");
                if let Err(e) = store.unlock_units(&units).await {
                    error!(campaign_id, error = %e, "failed to release partition");
                }
                return;
            };
            dispatch_partition(&store, mailer.as_ref(), campaign_id, units).await;
        });
    }

    /// Close the tracker and wait for in-flight partition tasks, bounded by
    /// the shutdown grace period.
    pub async fn drain(&self) {
        self.tracker.close();
        match tokio::time::timeout(self.options.shutdown_grace, self.tracker.wait()).await {
            Ok(()) => info!("dispatch engine stopped"),
            Err(_) => warn!(
                in_flight = self.tracker.len(),
                "shutdown grace period elapsed with partitions still running"
            ),
        }
    }

    /// Wait until every spawned partition task finished, then accept new ones.
    ///
    /// Meant for one-shot callers and tests, not for use next to [`run`](Self::run).
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Dispatch a campaign right away, outside the scan loop.
    ///
    /// Assumes the caller has exclusive control of the campaign (typically
    /// right after it was scheduled) and that its status is already correct.
    /// Mail not yet due is unlocked again for the scan loop.
    pub async fn launch_campaign(&self, campaign_id: i64) -> Result<LaunchReport> {
        let units = match self.store.fetch_units_by_campaign(campaign_id).await {
            Ok(units) => units,
            Err(e) => {
                error!(campaign_id, error = %e, "failed to fetch campaign mail");
                return Err(e.into());
            }
        };
        let units: Vec<MailLog> = units
            .into_iter()
            .filter(|u| u.outcome == MailOutcome::Pending)
            .collect();

        if let Err(e) = self.store.lock_units(&units).await {
            error!(campaign_id, error = %e, "failed to lock campaign mail");
            return Err(e.into());
        }

        let now = Utc::now();
        let (due, later): (Vec<MailLog>, Vec<MailLog>) =
            units.into_iter().partition(|u| u.is_due(now));

        if let Err(e) = self.store.unlock_units(&later).await {
            error!(campaign_id, error = %e, "failed to release mail scheduled later");
        }

        let report = LaunchReport {
            forwarded: due.len(),
            deferred: later.len(),
        };
        info!(
            campaign_id,
            num_emails = report.forwarded,
            deferred = report.deferred,
            "launching campaign"
        );
        let batch = self.scheduled_batch(due);
        self.mailer.queue(batch).await?;
        Ok(report)
    }

    /// Send one test mail and block until the mailer reports its outcome.
    pub async fn send_test_mail(
        &self,
        mail: TestMail,
        reply: TestReply,
    ) -> std::result::Result<(), DeliveryError> {
        let mailer = self.mailer.clone();
        let test_id = mail.request().id;
        self.tracker.spawn(async move {
            if let Err(e) = mailer.queue(vec![Sendable::Test(mail)]).await {
                warn!(%test_id, error = %e, "test mail not queued");
            }
        });
        reply.wait().await
    }

    /// Convenience over [`send_test_mail`](Self::send_test_mail).
    pub async fn send_test(&self, request: TestRequest) -> std::result::Result<(), DeliveryError> {
        let (mail, reply) = TestMail::new(request);
        self.send_test_mail(mail, reply).await
    }

    fn scheduled_batch(&self, units: Vec<MailLog>) -> Vec<Sendable> {
        to_batch(&self.store, units)
    }
}

fn to_batch(store: &Arc<dyn MailStore>, units: Vec<MailLog>) -> Vec<Sendable> {
    units
        .into_iter()
        .map(|log| Sendable::Scheduled(ScheduledMail::new(log, store.clone())))
        .collect()
}

/// Resolve the campaign, advance it out of `Queued` once, and forward the
/// partition to the mailer.
///
/// A failed lookup errors out every unit and is not retried. A failed status
/// write aborts without forwarding; the units stay locked until an operator
/// requeues them.
async fn dispatch_partition(
    store: &Arc<dyn MailStore>,
    mailer: &dyn Mailer,
    campaign_id: i64,
    units: Vec<MailLog>,
) {
    // All mail of one campaign shares one owner.
    let Some(user_id) = units.first().map(|u| u.user_id) else {
        return;
    };

    let campaign = match store.fetch_campaign(campaign_id, user_id).await {
        Ok(c) => c,
        Err(e) => {
            if e.is_not_found() {
                warn!(campaign_id, user_id, "campaign missing, erroring out mail");
            } else {
                error!(campaign_id, user_id, error = %e, "campaign lookup failed, erroring out mail");
            }
            let cause = DeliveryError::Campaign(e.to_string());
            for mail in to_batch(store, units) {
                mail.report_failure(cause.clone()).await;
            }
            return;
        }
    };

    if campaign.status == CampaignStatus::Queued {
        if let Err(e) = store
            .update_campaign_status(campaign_id, CampaignStatus::InProgress)
            .await
        {
            error!(campaign_id, error = %e, "failed to mark campaign in progress");
            return;
        }
    }

    info!(campaign_id, num_emails = units.len(), "sending emails to mailer for processing");
    if let Err(e) = mailer.queue(to_batch(store, units)).await {
        error!(campaign_id, error = %e, "mailer refused batch");
    }
}
