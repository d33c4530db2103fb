//! In-memory doubles shared by the unit tests of this crate.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::{Campaign, CampaignStatus, MailLog, MailOutcome};
use herald_store::{MailStore, RequeueScope, Result, StoreError, CAMPAIGN_UNAVAILABLE};

pub fn log_at(id: i64, campaign_id: i64, user_id: i64, send_date: DateTime<Utc>) -> MailLog {
    MailLog {
        id,
        campaign_id,
        user_id,
        recipient: format!("rcpt-{id}@example.com"),
        send_date,
        send_attempt: 0,
        processing: false,
        outcome: MailOutcome::Pending,
        error: None,
    }
}

#[derive(Default)]
struct State {
    units: BTreeMap<i64, MailLog>,
    campaigns: HashMap<i64, Campaign>,
    // Snapshot returned by fetch_campaign when `stale_reads` is on.
    snapshots: HashMap<i64, Campaign>,
    stale_reads: bool,
    fail_fetch: bool,
    fail_lock: bool,
    fail_status: bool,
    lock_calls: usize,
    status_calls: usize,
    transitions: usize,
    sent: Vec<i64>,
    errored: Vec<(i64, String)>,
    unlocked: Vec<i64>,
    backoffs: Vec<i64>,
}

/// [`MailStore`] double with failure switches and call recording.
#[derive(Default)]
pub struct MockStore {
    state: Mutex<State>,
}

fn injected() -> StoreError {
    StoreError::Backend("injected failure".into())
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_campaign(&self, id: i64, user_id: i64, status: CampaignStatus) {
        let campaign = Campaign {
            id,
            user_id,
            name: format!("campaign-{id}"),
            status,
            launch_date: Utc::now(),
            send_by_date: None,
            created_at: Utc::now(),
        };
        let mut state = self.state.lock().unwrap();
        state.snapshots.insert(id, campaign.clone());
        state.campaigns.insert(id, campaign);
    }

    pub fn add_unit(&self, log: MailLog) {
        self.state.lock().unwrap().units.insert(log.id, log);
    }

    pub fn set_stale_reads(&self) {
        self.state.lock().unwrap().stale_reads = true;
    }
    pub fn set_fail_fetch(&self) {
        self.state.lock().unwrap().fail_fetch = true;
    }
    pub fn set_fail_lock(&self) {
        self.state.lock().unwrap().fail_lock = true;
    }
    pub fn set_fail_status(&self) {
        self.state.lock().unwrap().fail_status = true;
    }

    pub fn unit(&self, id: i64) -> MailLog {
        self.state.lock().unwrap().units[&id].clone()
    }
    pub fn campaign_status(&self, id: i64) -> CampaignStatus {
        self.state.lock().unwrap().campaigns[&id].status
    }
    pub fn lock_calls(&self) -> usize {
        self.state.lock().unwrap().lock_calls
    }
    pub fn status_calls(&self) -> usize {
        self.state.lock().unwrap().status_calls
    }
    pub fn transitions(&self) -> usize {
        self.state.lock().unwrap().transitions
    }
    pub fn sent(&self) -> Vec<i64> {
        self.state.lock().unwrap().sent.clone()
    }
    pub fn errored(&self) -> Vec<(i64, String)> {
        let mut errored = self.state.lock().unwrap().errored.clone();
        errored.sort();
        errored
    }
    pub fn unlocked(&self) -> Vec<i64> {
        let mut unlocked = self.state.lock().unwrap().unlocked.clone();
        unlocked.sort();
        unlocked
    }
    pub fn backoffs(&self) -> Vec<i64> {
        self.state.lock().unwrap().backoffs.clone()
    }
}

#[async_trait]
impl MailStore for MockStore {
    async fn fetch_due_units(&self, at: DateTime<Utc>) -> Result<Vec<MailLog>> {
        let state = self.state.lock().unwrap();
        if state.fail_fetch {
            return Err(injected());
        }
        Ok(state
            .units
            .values()
            .filter(|u| !u.processing && u.outcome == MailOutcome::Pending && u.is_due(at))
            .cloned()
            .collect())
    }

    async fn lock_units(&self, units: &[MailLog]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.lock_calls += 1;
        if state.fail_lock {
            return Err(injected());
        }
        let free = units
            .iter()
            .filter(|u| state.units.get(&u.id).is_some_and(|s| !s.processing))
            .count();
        if free != units.len() {
            return Err(StoreError::LockContention {
                requested: units.len(),
                locked: free,
            });
        }
        for u in units {
            if let Some(stored) = state.units.get_mut(&u.id) {
                stored.processing = true;
            }
        }
        Ok(())
    }

    async fn unlock_units(&self, units: &[MailLog]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for u in units {
            if let Some(stored) = state.units.get_mut(&u.id) {
                stored.processing = false;
            }
            state.unlocked.push(u.id);
        }
        Ok(())
    }

    async fn fetch_units_by_campaign(&self, campaign_id: i64) -> Result<Vec<MailLog>> {
        let state = self.state.lock().unwrap();
        if state.fail_fetch {
            return Err(injected());
        }
        Ok(state
            .units
            .values()
            .filter(|u| u.campaign_id == campaign_id)
            .cloned()
            .collect())
    }

    async fn fetch_campaign(&self, campaign_id: i64, user_id: i64) -> Result<Campaign> {
        let state = self.state.lock().unwrap();
        let source = if state.stale_reads {
            &state.snapshots
        } else {
            &state.campaigns
        };
        source
            .get(&campaign_id)
            .filter(|c| c.user_id == user_id)
            .cloned()
            .ok_or(StoreError::CampaignNotFound {
                campaign_id,
                user_id: Some(user_id),
            })
    }

    async fn update_campaign_status(
        &self,
        campaign_id: i64,
        status: CampaignStatus,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.status_calls += 1;
        if state.fail_status {
            return Err(injected());
        }
        let campaign = state
            .campaigns
            .get_mut(&campaign_id)
            .ok_or(StoreError::CampaignNotFound {
                campaign_id,
                user_id: None,
            })?;
        if !campaign.status.can_advance_to(status) {
            return Ok(false);
        }
        campaign.status = status;
        state.transitions += 1;
        Ok(true)
    }

    async fn mark_sent(&self, unit_id: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(stored) = state.units.get_mut(&unit_id) {
            stored.outcome = MailOutcome::Sent;
            stored.processing = false;
        }
        state.sent.push(unit_id);
        Ok(())
    }

    async fn mark_errored(&self, unit_id: i64, detail: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(stored) = state.units.get_mut(&unit_id) {
            stored.outcome = MailOutcome::Errored;
            stored.error = Some(detail.to_string());
        }
        state.errored.push((unit_id, detail.to_string()));
        Ok(())
    }

    async fn backoff_unit(
        &self,
        unit_id: i64,
        reason: &str,
        next_send_date: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(stored) = state.units.get_mut(&unit_id) {
            stored.send_attempt += 1;
            stored.send_date = next_send_date;
            stored.error = Some(reason.to_string());
            stored.processing = false;
        }
        state.backoffs.push(unit_id);
        Ok(())
    }

    async fn requeue_campaign(&self, campaign_id: i64, scope: RequeueScope) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        let mut n = 0;
        for stored in state.units.values_mut() {
            if stored.campaign_id != campaign_id || !stored.processing {
                continue;
            }
            let unresolved = stored.outcome == MailOutcome::Errored
                && stored
                    .error
                    .as_deref()
                    .is_some_and(|e| e.starts_with(&format!("{CAMPAIGN_UNAVAILABLE}:")));
            let in_flight =
                scope == RequeueScope::IncludeInFlight && stored.outcome == MailOutcome::Pending;
            if unresolved || in_flight {
                stored.processing = false;
                stored.outcome = MailOutcome::Pending;
                stored.error = None;
                n += 1;
            }
        }
        Ok(n)
    }
}
