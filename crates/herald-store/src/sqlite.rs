use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use herald_core::{Campaign, CampaignStatus, MailLog, MailOutcome};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use crate::{
    db::init_db,
    error::{Result, StoreError},
    store::{MailStore, RequeueScope, CAMPAIGN_UNAVAILABLE},
};

const MAIL_LOG_COLUMNS: &str =
    "id, campaign_id, user_id, recipient, send_date, send_attempt, processing, outcome, error";

/// Fixed-width UTC timestamps so that `send_date <= ?` compares correctly as text.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidValue(format!("bad timestamp {s:?}: {e}")))
}

// Columns: id, campaign_id, user_id, recipient, send_date, send_attempt, processing, outcome, error
type MailLogRow = (i64, i64, i64, String, String, u32, bool, String, Option<String>);

fn read_mail_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<MailLogRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get::<_, i64>(6)? != 0,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn into_mail_log(raw: MailLogRow) -> Result<MailLog> {
    let (id, campaign_id, user_id, recipient, send_date, send_attempt, processing, outcome, error) =
        raw;
    let outcome: MailOutcome = outcome
        .parse()
        .map_err(|_| StoreError::InvalidValue(format!("bad outcome {outcome:?}")))?;
    Ok(MailLog {
        id,
        campaign_id,
        user_id,
        recipient,
        send_date: parse_ts(&send_date)?,
        send_attempt,
        processing,
        outcome,
        error,
    })
}

fn parse_status(s: &str) -> Result<CampaignStatus> {
    s.parse()
        .map_err(|_| StoreError::InvalidValue(format!("bad campaign status {s:?}")))
}

/// SQLite-backed [`MailStore`].
///
/// All access goes through one connection behind a mutex; every multi-row
/// mutation runs inside a single transaction.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Wrap `conn`, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Private in-memory database, mostly for tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Insert a campaign row and return the stored record.
    pub fn insert_campaign(
        &self,
        user_id: i64,
        name: &str,
        status: CampaignStatus,
        launch_date: DateTime<Utc>,
        send_by_date: Option<DateTime<Utc>>,
    ) -> Result<Campaign> {
        let conn = self.conn()?;
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO campaigns (user_id, name, status, launch_date, send_by_date, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                user_id,
                name,
                status.to_string(),
                ts(launch_date),
                send_by_date.map(ts),
                ts(created_at)
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!(campaign_id = id, %name, %status, "campaign inserted");
        Ok(Campaign {
            id,
            user_id,
            name: name.to_string(),
            status,
            launch_date,
            send_by_date,
            created_at,
        })
    }

    /// Insert one pending, unlocked mail log for `campaign`.
    pub fn insert_mail_log(
        &self,
        campaign: &Campaign,
        recipient: &str,
        send_date: DateTime<Utc>,
    ) -> Result<MailLog> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO mail_logs (campaign_id, user_id, recipient, send_date)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![campaign.id, campaign.user_id, recipient, ts(send_date)],
        )?;
        Ok(MailLog {
            id: conn.last_insert_rowid(),
            campaign_id: campaign.id,
            user_id: campaign.user_id,
            recipient: recipient.to_string(),
            send_date,
            send_attempt: 0,
            processing: false,
            outcome: MailOutcome::Pending,
            error: None,
        })
    }

    /// Re-read one mail log; `None` if it does not exist.
    pub fn get_mail_log(&self, unit_id: i64) -> Result<Option<MailLog>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {MAIL_LOG_COLUMNS} FROM mail_logs WHERE id = ?1"),
                [unit_id],
                read_mail_log,
            )
            .optional()?;
        raw.map(into_mail_log).transpose()
    }

    fn query_logs(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<MailLog>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let rows: Vec<MailLogRow> = stmt
            .query_map(params, read_mail_log)?
            .collect::<rusqlite::Result<_>>()?;
        rows.into_iter().map(into_mail_log).collect()
    }
}

#[async_trait]
impl MailStore for SqliteStore {
    async fn fetch_due_units(&self, at: DateTime<Utc>) -> Result<Vec<MailLog>> {
        self.query_logs(
            &format!(
                "SELECT {MAIL_LOG_COLUMNS} FROM mail_logs
                 WHERE processing = 0 AND outcome = 'pending' AND send_date <= ?1
                 ORDER BY send_date, id"
            ),
            [ts(at)],
        )
    }

    async fn lock_units(&self, units: &[MailLog]) -> Result<()> {
        let ids: BTreeSet<i64> = units.iter().map(|u| u.id).collect();
        if ids.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut locked = 0;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE mail_logs SET processing = 1
                 WHERE id = ?1 AND processing = 0 AND outcome = 'pending'",
            )?;
            for id in &ids {
                locked += stmt.execute([id])?;
            }
        }

        if locked != ids.len() {
            tx.rollback()?;
            return Err(StoreError::LockContention {
                requested: ids.len(),
                locked,
            });
        }
        tx.commit()?;
        debug!(count = locked, "mail logs locked");
        Ok(())
    }

    async fn unlock_units(&self, units: &[MailLog]) -> Result<()> {
        if units.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare_cached("UPDATE mail_logs SET processing = 0 WHERE id = ?1")?;
            for unit in units {
                stmt.execute([unit.id])?;
            }
        }
        tx.commit()?;
        debug!(count = units.len(), "mail logs unlocked");
        Ok(())
    }

    async fn fetch_units_by_campaign(&self, campaign_id: i64) -> Result<Vec<MailLog>> {
        self.query_logs(
            &format!(
                "SELECT {MAIL_LOG_COLUMNS} FROM mail_logs
                 WHERE campaign_id = ?1 ORDER BY send_date, id"
            ),
            [campaign_id],
        )
    }

    async fn fetch_campaign(&self, campaign_id: i64, user_id: i64) -> Result<Campaign> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                "SELECT id, user_id, name, status, launch_date, send_by_date, created_at
                 FROM campaigns WHERE id = ?1 AND user_id = ?2",
                [campaign_id, user_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        let (id, user_id, name, status, launch_date, send_by_date, created_at) =
            raw.ok_or(StoreError::CampaignNotFound {
                campaign_id,
                user_id: Some(user_id),
            })?;
        Ok(Campaign {
            id,
            user_id,
            name,
            status: parse_status(&status)?,
            launch_date: parse_ts(&launch_date)?,
            send_by_date: send_by_date.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&created_at)?,
        })
    }

    async fn update_campaign_status(
        &self,
        campaign_id: i64,
        status: CampaignStatus,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM campaigns WHERE id = ?1",
                [campaign_id],
                |row| row.get(0),
            )
            .optional()?;
        let current = parse_status(&current.ok_or(StoreError::CampaignNotFound {
            campaign_id,
            user_id: None,
        })?)?;

        if !current.can_advance_to(status) {
            debug!(campaign_id, %current, target = %status, "status already reached, skipping");
            return Ok(false);
        }

        // Compare-and-set on the value read above.
        let n = tx.execute(
            "UPDATE campaigns SET status = ?1 WHERE id = ?2 AND status = ?3",
            rusqlite::params![status.to_string(), campaign_id, current.to_string()],
        )?;
        tx.commit()?;
        if n > 0 {
            info!(campaign_id, from = %current, to = %status, "campaign status advanced");
        }
        Ok(n > 0)
    }

    async fn mark_sent(&self, unit_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE mail_logs SET outcome = 'sent', processing = 0, error = NULL WHERE id = ?1",
            [unit_id],
        )?;
        Ok(())
    }

    async fn mark_errored(&self, unit_id: i64, detail: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE mail_logs SET outcome = 'errored', error = ?1 WHERE id = ?2",
            rusqlite::params![detail, unit_id],
        )?;
        Ok(())
    }

    async fn backoff_unit(
        &self,
        unit_id: i64,
        reason: &str,
        next_send_date: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE mail_logs
             SET send_attempt = send_attempt + 1, send_date = ?1, error = ?2, processing = 0
             WHERE id = ?3",
            rusqlite::params![ts(next_send_date), reason, unit_id],
        )?;
        Ok(())
    }

    async fn requeue_campaign(&self, campaign_id: i64, scope: RequeueScope) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let unresolved = tx.execute(
            "UPDATE mail_logs SET processing = 0, outcome = 'pending', error = NULL
             WHERE campaign_id = ?1 AND processing = 1 AND outcome = 'errored'
               AND substr(error, 1, length(?2)) = ?2",
            rusqlite::params![campaign_id, format!("{CAMPAIGN_UNAVAILABLE}:")],
        )?;
        let in_flight = match scope {
            RequeueScope::Unresolved => 0,
            RequeueScope::IncludeInFlight => tx.execute(
                "UPDATE mail_logs SET processing = 0
                 WHERE campaign_id = ?1 AND processing = 1 AND outcome = 'pending'",
                [campaign_id],
            )?,
        };
        tx.commit()?;
        info!(campaign_id, unresolved, in_flight, ?scope, "stuck mail logs requeued");
        Ok(unresolved + in_flight)
    }
}
