use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HeraldError;

/// Lifecycle of a campaign. Status only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    /// Authored but not scheduled yet.
    Created,
    /// Mail logs exist; no dispatch group has picked the campaign up.
    Queued,
    /// At least one dispatch group forwarded mail for this campaign.
    InProgress,
    Completed,
    Error,
}

impl CampaignStatus {
    /// Position in the lifecycle. Both terminal states share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            CampaignStatus::Created => 0,
            CampaignStatus::Queued => 1,
            CampaignStatus::InProgress => 2,
            CampaignStatus::Completed | CampaignStatus::Error => 3,
        }
    }

    /// True when moving to `next` is a strict forward step.
    pub fn can_advance_to(&self, next: CampaignStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CampaignStatus::Created => "created",
            CampaignStatus::Queued => "queued",
            CampaignStatus::InProgress => "in_progress",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = HeraldError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "created" => Ok(CampaignStatus::Created),
            "queued" => Ok(CampaignStatus::Queued),
            "in_progress" => Ok(CampaignStatus::InProgress),
            "completed" => Ok(CampaignStatus::Completed),
            "error" => Ok(CampaignStatus::Error),
            other => Err(HeraldError::InvalidStatus(other.to_string())),
        }
    }
}

/// A campaign as seen by the dispatch core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: i64,
    /// Owner; campaign lookups are always scoped to it.
    pub user_id: i64,
    pub name: String,
    pub status: CampaignStatus,
    /// First send slot of the campaign.
    pub launch_date: DateTime<Utc>,
    /// When set, mail logs are spread evenly up to this instant.
    pub send_by_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Terminal outcome of one scheduled mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailOutcome {
    Pending,
    Sent,
    Errored,
}

impl std::fmt::Display for MailOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MailOutcome::Pending => "pending",
            MailOutcome::Sent => "sent",
            MailOutcome::Errored => "errored",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MailOutcome {
    type Err = HeraldError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MailOutcome::Pending),
            "sent" => Ok(MailOutcome::Sent),
            "errored" => Ok(MailOutcome::Errored),
            other => Err(HeraldError::InvalidStatus(other.to_string())),
        }
    }
}

/// One email to one recipient for one campaign, persisted in `mail_logs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailLog {
    pub id: i64,
    pub campaign_id: i64,
    pub user_id: i64,
    pub recipient: String,
    pub send_date: DateTime<Utc>,
    /// Transient failures so far; drives the backoff delay.
    pub send_attempt: u32,
    /// Lock flag. Set while exactly one dispatch attempt owns the row.
    pub processing: bool,
    pub outcome: MailOutcome,
    pub error: Option<String>,
}

impl MailLog {
    /// Scheduled at or before `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.send_date <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn status_roundtrips_through_strings() {
        for status in [
            CampaignStatus::Created,
            CampaignStatus::Queued,
            CampaignStatus::InProgress,
            CampaignStatus::Completed,
            CampaignStatus::Error,
        ] {
            let parsed: CampaignStatus = status.to_string().parse().expect("parse failed");
            assert_eq!(parsed, status);
        }
        assert!("launched".parse::<CampaignStatus>().is_err());
    }

    #[test]
    fn status_only_moves_forward() {
        assert!(CampaignStatus::Queued.can_advance_to(CampaignStatus::InProgress));
        assert!(!CampaignStatus::InProgress.can_advance_to(CampaignStatus::InProgress));
        assert!(!CampaignStatus::InProgress.can_advance_to(CampaignStatus::Queued));
        assert!(!CampaignStatus::Completed.can_advance_to(CampaignStatus::Error));
    }

    #[test]
    fn due_includes_the_exact_instant() {
        let now = Utc::now();
        let mut log = MailLog {
            id: 1,
            campaign_id: 1,
            user_id: 1,
            recipient: "a@example.com".into(),
            send_date: now,
            send_attempt: 0,
            processing: false,
            outcome: MailOutcome::Pending,
            error: None,
        };
        assert!(log.is_due(now));
        log.send_date = now + Duration::seconds(1);
        assert!(!log.is_due(now));
    }
}
