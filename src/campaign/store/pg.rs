use chrono::{DateTime, Utc};
use postgres::error::SqlState;
use postgres::Row;
use postgres_native_tls::MakeTlsConnector;
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use tracing::error;
use uuid::Uuid;

use crate::campaign::lifecycle::LifecycleError;
use crate::campaign::types::{
    normalize_email, Campaign, CampaignStatus, Job, JobStatus, Lead, LeadStatus, Template, User,
};

use super::schema::ensure_schema;
use super::{
    BounceRecord, CampaignStats, ClaimedJob, EmailHistoryEntry, NextStep, ReplyRecord,
    StepSummary, Store, StoreError,
};

type PgConn = PooledConnection<PostgresConnectionManager<MakeTlsConnector>>;

const USER_COLS: &str = "id, email, signature_html, profile_completed, created_at, updated_at";
const CAMPAIGN_COLS: &str =
    "id, user_id, name, pitch, tone, status, start_time, created_at, updated_at";
const LEAD_COLS: &str =
    "id, campaign_id, email, first_name, company, status, created_at, updated_at";
const TEMPLATE_COLS: &str =
    "id, campaign_id, step_number, subject, body_html, delay_minutes, created_at, updated_at";
const JOB_COLS: &str = "id, campaign_id, lead_id, step_number, status, scheduled_at, sent_at, \
                        attempts, last_error, message_id, created_at, updated_at";

#[derive(Debug)]
struct LoggingErrorHandler;

impl r2d2::HandleError<postgres::Error> for LoggingErrorHandler {
    fn handle_error(&self, err: postgres::Error) {
        error!("postgres connection pool error: {:?}", err);
    }
}

/// Production store backed by PostgreSQL. Claims take a real row lock
/// (`FOR UPDATE SKIP LOCKED`) that is held across the transport call, so
/// reply cancellation and job execution serialize on the job row.
pub struct PgStore {
    pool: Pool<PostgresConnectionManager<MakeTlsConnector>>,
}

impl PgStore {
    pub fn connect(database_url: &str) -> Result<Self, StoreError> {
        let config: postgres::Config = database_url.parse().map_err(StoreError::Postgres)?;
        let tls_connector = native_tls::TlsConnector::builder()
            .build()
            .map_err(|err| StoreError::Config(err.to_string()))?;
        let tls = MakeTlsConnector::new(tls_connector);

        let manager = PostgresConnectionManager::new(config, tls);
        let pool = Pool::builder()
            .max_size(8)
            .idle_timeout(Some(std::time::Duration::from_secs(300)))
            .error_handler(Box::new(LoggingErrorHandler))
            .build(manager)?;

        let store = Self { pool };
        let mut conn = store.connection()?;
        ensure_schema(&mut conn)?;
        Ok(store)
    }

    fn connection(&self) -> Result<PgConn, StoreError> {
        Ok(self.pool.get()?)
    }
}

fn user_from_row(row: &Row) -> Result<User, StoreError> {
    Ok(User {
        id: row.try_get(0)?,
        email: row.try_get(1)?,
        signature_html: row.try_get(2)?,
        profile_completed: row.try_get(3)?,
        created_at: row.try_get(4)?,
        updated_at: row.try_get(5)?,
    })
}

fn campaign_from_row(row: &Row, tags: Vec<String>) -> Result<Campaign, StoreError> {
    let status_raw: String = row.try_get(5)?;
    let status = CampaignStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Storage(format!("unknown campaign status {}", status_raw)))?;
    Ok(Campaign {
        id: row.try_get(0)?,
        user_id: row.try_get(1)?,
        name: row.try_get(2)?,
        pitch: row.try_get(3)?,
        tone: row.try_get(4)?,
        status,
        start_time: row.try_get(6)?,
        tags,
        created_at: row.try_get(7)?,
        updated_at: row.try_get(8)?,
    })
}

fn lead_from_row(row: &Row) -> Result<Lead, StoreError> {
    let status_raw: String = row.try_get(5)?;
    let status = LeadStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Storage(format!("unknown lead status {}", status_raw)))?;
    Ok(Lead {
        id: row.try_get(0)?,
        campaign_id: row.try_get(1)?,
        email: row.try_get(2)?,
        first_name: row.try_get(3)?,
        company: row.try_get(4)?,
        status,
        created_at: row.try_get(6)?,
        updated_at: row.try_get(7)?,
    })
}

fn template_from_row(row: &Row) -> Result<Template, StoreError> {
    Ok(Template {
        id: row.try_get(0)?,
        campaign_id: row.try_get(1)?,
        step_number: row.try_get(2)?,
        subject: row.try_get(3)?,
        body_html: row.try_get(4)?,
        delay_minutes: row.try_get(5)?,
        created_at: row.try_get(6)?,
        updated_at: row.try_get(7)?,
    })
}

fn job_from_row(row: &Row) -> Result<Job, StoreError> {
    let status_raw: String = row.try_get(4)?;
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Storage(format!("unknown job status {}", status_raw)))?;
    Ok(Job {
        id: row.try_get(0)?,
        campaign_id: row.try_get(1)?,
        lead_id: row.try_get(2)?,
        step_number: row.try_get(3)?,
        status,
        scheduled_at: row.try_get(5)?,
        sent_at: row.try_get(6)?,
        attempts: row.try_get(7)?,
        last_error: row.try_get(8)?,
        message_id: row.try_get(9)?,
        created_at: row.try_get(10)?,
        updated_at: row.try_get(11)?,
    })
}

fn is_unique_violation(err: &postgres::Error) -> bool {
    err.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

fn validate_email(value: &str) -> bool {
    let trimmed = value.trim();
    match trimmed.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
        }
        None => false,
    }
}

/// A claimed job row with its transaction held open. The transaction is
/// driven with explicit BEGIN/COMMIT/ROLLBACK on the pooled connection so
/// the claim can own the connection while the lock outlives individual
/// statements; Drop rolls back anything uncommitted before the connection
/// returns to the pool.
pub struct PgClaim {
    conn: PgConn,
    job: Job,
    open: bool,
}

impl PgClaim {
    fn commit(mut self) -> Result<(), StoreError> {
        self.conn.batch_execute("COMMIT")?;
        self.open = false;
        Ok(())
    }
}

impl Drop for PgClaim {
    fn drop(&mut self) {
        if self.open {
            if let Err(err) = self.conn.batch_execute("ROLLBACK") {
                error!("failed to roll back job claim {}: {}", self.job.id, err);
            }
        }
    }
}

impl ClaimedJob for PgClaim {
    fn job(&self) -> &Job {
        &self.job
    }

    fn campaign(&mut self) -> Result<Option<Campaign>, StoreError> {
        let row = self.conn.query_opt(
            &format!("SELECT {CAMPAIGN_COLS} FROM campaigns WHERE id = $1"),
            &[&self.job.campaign_id],
        )?;
        row.map(|row| campaign_from_row(&row, Vec::new())).transpose()
    }

    fn lead(&mut self) -> Result<Option<Lead>, StoreError> {
        let row = self.conn.query_opt(
            &format!("SELECT {LEAD_COLS} FROM leads WHERE id = $1"),
            &[&self.job.lead_id],
        )?;
        row.map(|row| lead_from_row(&row)).transpose()
    }

    fn owner(&mut self) -> Result<Option<User>, StoreError> {
        let row = self.conn.query_opt(
            &format!(
                "SELECT {USER_COLS} FROM users
                 WHERE id = (SELECT user_id FROM campaigns WHERE id = $1)"
            ),
            &[&self.job.campaign_id],
        )?;
        row.map(|row| user_from_row(&row)).transpose()
    }

    fn template_for_step(&mut self, step_number: i32) -> Result<Option<Template>, StoreError> {
        let row = self.conn.query_opt(
            &format!(
                "SELECT {TEMPLATE_COLS} FROM templates
                 WHERE campaign_id = $1 AND step_number = $2"
            ),
            &[&self.job.campaign_id, &step_number],
        )?;
        row.map(|row| template_from_row(&row)).transpose()
    }

    fn release(mut self) -> Result<(), StoreError> {
        self.conn.batch_execute("ROLLBACK")?;
        self.open = false;
        Ok(())
    }

    fn commit_skipped(mut self, reason: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE jobs SET status = 'skipped', last_error = $2, updated_at = now()
             WHERE id = $1",
            &[&self.job.id, &reason],
        )?;
        self.commit()
    }

    fn commit_sent(
        mut self,
        sent_at: DateTime<Utc>,
        message_id: &str,
        next: Option<NextStep>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE jobs
             SET status = 'sent',
                 sent_at = $2,
                 message_id = $3,
                 attempts = attempts + 1,
                 last_error = NULL,
                 updated_at = $2
             WHERE id = $1",
            &[&self.job.id, &sent_at, &message_id],
        )?;
        self.conn.execute(
            "UPDATE leads SET status = 'contacted', updated_at = $2
             WHERE id = $1 AND status = 'pending'",
            &[&self.job.lead_id, &sent_at],
        )?;
        if let Some(next) = next {
            self.conn.execute(
                "INSERT INTO jobs
                     (id, campaign_id, lead_id, step_number, status, scheduled_at,
                      created_at, updated_at)
                 VALUES ($1, $2, $3, $4, 'pending', $5, $6, $6)
                 ON CONFLICT (lead_id, step_number) WHERE status <> 'failed' DO NOTHING",
                &[
                    &Uuid::new_v4(),
                    &self.job.campaign_id,
                    &self.job.lead_id,
                    &next.step_number,
                    &next.scheduled_at,
                    &sent_at,
                ],
            )?;
        }
        self.commit()
    }

    fn commit_retry(mut self, next_at: DateTime<Utc>, error: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE jobs
             SET attempts = attempts + 1,
                 scheduled_at = $2,
                 last_error = $3,
                 updated_at = now()
             WHERE id = $1",
            &[&self.job.id, &next_at, &error],
        )?;
        self.commit()
    }

    fn commit_failed(mut self, error: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE jobs
             SET status = 'failed',
                 attempts = attempts + 1,
                 last_error = $2,
                 updated_at = now()
             WHERE id = $1",
            &[&self.job.id, &error],
        )?;
        let lead_failed = self.conn.execute(
            "UPDATE leads SET status = 'failed', updated_at = now()
             WHERE id = $1
               AND status IN ('pending', 'contacted')
               AND NOT EXISTS (
                   SELECT 1 FROM jobs
                   WHERE lead_id = $1 AND status = 'sent' AND id <> $2
               )",
            &[&self.job.lead_id, &self.job.id],
        )?;
        if lead_failed > 0 {
            self.conn.execute(
                "UPDATE jobs SET status = 'skipped', last_error = 'lead terminal',
                        updated_at = now()
                 WHERE lead_id = $1 AND status = 'pending' AND id <> $2",
                &[&self.job.lead_id, &self.job.id],
            )?;
        }
        self.commit()
    }
}

impl Store for PgStore {
    type Claim = PgClaim;

    fn due_job_ids(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, StoreError> {
        let mut conn = self.connection()?;
        let rows = conn.query(
            "SELECT id FROM jobs
             WHERE status = 'pending' AND scheduled_at <= $1
             ORDER BY scheduled_at, campaign_id, lead_id, step_number
             LIMIT $2",
            &[&now, &limit],
        )?;
        rows.iter().map(|row| Ok(row.try_get(0)?)).collect()
    }

    fn claim_job(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<PgClaim>, StoreError> {
        let mut conn = self.connection()?;
        conn.batch_execute("BEGIN")?;
        let result = conn.query_opt(
            &format!(
                "SELECT {JOB_COLS} FROM jobs
                 WHERE id = $1 AND status = 'pending' AND scheduled_at <= $2
                 FOR UPDATE SKIP LOCKED"
            ),
            &[&job_id, &now],
        );
        let row = match result {
            Ok(row) => row,
            Err(err) => {
                let _ = conn.batch_execute("ROLLBACK");
                return Err(err.into());
            }
        };
        let Some(row) = row else {
            conn.batch_execute("ROLLBACK")?;
            return Ok(None);
        };
        match job_from_row(&row) {
            Ok(job) => Ok(Some(PgClaim {
                conn,
                job,
                open: true,
            })),
            Err(err) => {
                let _ = conn.batch_execute("ROLLBACK");
                Err(err)
            }
        }
    }

    fn create_job(
        &self,
        campaign_id: Uuid,
        lead_id: Uuid,
        step_number: i32,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut conn = self.connection()?;
        conn.execute(
            "INSERT INTO jobs
                 (id, campaign_id, lead_id, step_number, status, scheduled_at,
                  created_at, updated_at)
             VALUES ($1, $2, $3, $4, 'pending', $5, now(), now())
             ON CONFLICT (lead_id, step_number) WHERE status <> 'failed' DO NOTHING",
            &[&Uuid::new_v4(), &campaign_id, &lead_id, &step_number, &scheduled_at],
        )?;
        let row = conn.query_opt(
            &format!(
                "SELECT {JOB_COLS} FROM jobs
                 WHERE lead_id = $1 AND step_number = $2 AND status <> 'failed'"
            ),
            &[&lead_id, &step_number],
        )?;
        let row = row.ok_or_else(|| {
            StoreError::Storage(format!(
                "job for lead {} step {} missing after insert",
                lead_id, step_number
            ))
        })?;
        job_from_row(&row)
    }

    fn cancel_pending_jobs_for_lead(
        &self,
        lead_id: Uuid,
        reason: &str,
    ) -> Result<u64, StoreError> {
        let mut conn = self.connection()?;
        let count = conn.execute(
            "UPDATE jobs SET status = 'skipped', last_error = $2, updated_at = now()
             WHERE lead_id = $1 AND status = 'pending'",
            &[&lead_id, &reason],
        )?;
        Ok(count)
    }

    fn load_campaign(&self, id: Uuid) -> Result<Option<Campaign>, StoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            &format!("SELECT {CAMPAIGN_COLS} FROM campaigns WHERE id = $1"),
            &[&id],
        )?;
        let Some(row) = row else {
            return Ok(None);
        };
        let tags = conn
            .query(
                "SELECT tag FROM campaign_tags WHERE campaign_id = $1 ORDER BY tag",
                &[&id],
            )?
            .iter()
            .map(|row| row.try_get(0))
            .collect::<Result<Vec<String>, _>>()?;
        Ok(Some(campaign_from_row(&row, tags)?))
    }

    fn load_lead(&self, id: Uuid) -> Result<Option<Lead>, StoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            &format!("SELECT {LEAD_COLS} FROM leads WHERE id = $1"),
            &[&id],
        )?;
        row.map(|row| lead_from_row(&row)).transpose()
    }

    fn load_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            &format!("SELECT {USER_COLS} FROM users WHERE id = $1"),
            &[&id],
        )?;
        row.map(|row| user_from_row(&row)).transpose()
    }

    fn load_template(
        &self,
        campaign_id: Uuid,
        step_number: i32,
    ) -> Result<Option<Template>, StoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            &format!(
                "SELECT {TEMPLATE_COLS} FROM templates
                 WHERE campaign_id = $1 AND step_number = $2"
            ),
            &[&campaign_id, &step_number],
        )?;
        row.map(|row| template_from_row(&row)).transpose()
    }

    fn load_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            &format!("SELECT {JOB_COLS} FROM jobs WHERE id = $1"),
            &[&id],
        )?;
        row.map(|row| job_from_row(&row)).transpose()
    }

    fn templates_for_campaign(&self, campaign_id: Uuid) -> Result<Vec<Template>, StoreError> {
        let mut conn = self.connection()?;
        let rows = conn.query(
            &format!(
                "SELECT {TEMPLATE_COLS} FROM templates
                 WHERE campaign_id = $1 ORDER BY step_number"
            ),
            &[&campaign_id],
        )?;
        rows.iter().map(template_from_row).collect()
    }

    fn leads_for_campaign(
        &self,
        campaign_id: Uuid,
        status: Option<LeadStatus>,
    ) -> Result<Vec<Lead>, StoreError> {
        let mut conn = self.connection()?;
        let rows = match status {
            Some(status) => conn.query(
                &format!(
                    "SELECT {LEAD_COLS} FROM leads
                     WHERE campaign_id = $1 AND status = $2 ORDER BY created_at"
                ),
                &[&campaign_id, &status.as_str()],
            )?,
            None => conn.query(
                &format!(
                    "SELECT {LEAD_COLS} FROM leads
                     WHERE campaign_id = $1 ORDER BY created_at"
                ),
                &[&campaign_id],
            )?,
        };
        rows.iter().map(lead_from_row).collect()
    }

    fn jobs_for_lead(&self, lead_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.connection()?;
        let rows = conn.query(
            &format!(
                "SELECT {JOB_COLS} FROM jobs WHERE lead_id = $1 ORDER BY step_number"
            ),
            &[&lead_id],
        )?;
        rows.iter().map(job_from_row).collect()
    }

    fn email_history(&self, lead_id: Uuid) -> Result<Vec<EmailHistoryEntry>, StoreError> {
        let mut conn = self.connection()?;
        let rows = conn.query(
            "SELECT j.step_number, j.status, j.scheduled_at, j.sent_at, t.subject,
                    j.attempts, j.last_error
             FROM jobs j
             LEFT JOIN templates t
               ON t.campaign_id = j.campaign_id AND t.step_number = j.step_number
             WHERE j.lead_id = $1
             ORDER BY j.step_number",
            &[&lead_id],
        )?;
        rows.iter()
            .map(|row| {
                let status_raw: String = row.try_get(1)?;
                let status = JobStatus::parse(&status_raw).ok_or_else(|| {
                    StoreError::Storage(format!("unknown job status {}", status_raw))
                })?;
                Ok(EmailHistoryEntry {
                    step_number: row.try_get(0)?,
                    status,
                    scheduled_at: row.try_get(2)?,
                    sent_at: row.try_get(3)?,
                    subject: row.try_get(4)?,
                    attempts: row.try_get(5)?,
                    last_error: row.try_get(6)?,
                })
            })
            .collect()
    }

    fn failed_jobs(&self, campaign_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.connection()?;
        let rows = conn.query(
            &format!(
                "SELECT {JOB_COLS} FROM jobs
                 WHERE campaign_id = $1 AND status = 'failed'
                 ORDER BY scheduled_at"
            ),
            &[&campaign_id],
        )?;
        rows.iter().map(job_from_row).collect()
    }

    fn retry_job(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let mut txn = conn.transaction()?;
        let reset = txn.execute(
            "UPDATE jobs
             SET status = 'pending', scheduled_at = $2, attempts = 0,
                 last_error = NULL, sent_at = NULL, message_id = NULL, updated_at = $2
             WHERE id = $1 AND status = 'failed'",
            &[&job_id, &now],
        )?;
        if reset == 0 {
            return Ok(false);
        }
        // A lead failed by exhausted retries gets another chance; REPLIED
        // stays terminal.
        txn.execute(
            "UPDATE leads
             SET status = CASE
                     WHEN EXISTS (SELECT 1 FROM jobs
                                  WHERE lead_id = leads.id AND status = 'sent')
                     THEN 'contacted' ELSE 'pending'
                 END,
                 updated_at = $2
             WHERE id = (SELECT lead_id FROM jobs WHERE id = $1)
               AND status = 'failed'",
            &[&job_id, &now],
        )?;
        txn.commit()?;
        Ok(true)
    }

    fn retry_all_failed(&self, campaign_id: Uuid, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut conn = self.connection()?;
        let mut txn = conn.transaction()?;
        let rows = txn.query(
            "SELECT id FROM jobs WHERE campaign_id = $1 AND status = 'failed'",
            &[&campaign_id],
        )?;
        let mut count = 0u64;
        for row in rows {
            let job_id: Uuid = row.try_get(0)?;
            txn.execute(
                "UPDATE jobs
                 SET status = 'pending', scheduled_at = $2, attempts = 0,
                     last_error = NULL, sent_at = NULL, message_id = NULL, updated_at = $2
                 WHERE id = $1",
                &[&job_id, &now],
            )?;
            txn.execute(
                "UPDATE leads
                 SET status = CASE
                         WHEN EXISTS (SELECT 1 FROM jobs
                                      WHERE lead_id = leads.id AND status = 'sent')
                         THEN 'contacted' ELSE 'pending'
                     END,
                     updated_at = $2
                 WHERE id = (SELECT lead_id FROM jobs WHERE id = $1)
                   AND status = 'failed'",
                &[&job_id, &now],
            )?;
            count += 1;
        }
        txn.commit()?;
        Ok(count)
    }

    fn next_pending_job(&self, campaign_id: Uuid) -> Result<Option<Job>, StoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            &format!(
                "SELECT {JOB_COLS} FROM jobs
                 WHERE campaign_id = $1 AND status = 'pending'
                 ORDER BY scheduled_at, lead_id, step_number
                 LIMIT 1"
            ),
            &[&campaign_id],
        )?;
        row.map(|row| job_from_row(&row)).transpose()
    }

    fn send_now(&self, campaign_id: Uuid, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            &format!(
                "UPDATE jobs SET scheduled_at = $2, updated_at = $2
                 WHERE id = (SELECT id FROM jobs
                             WHERE campaign_id = $1 AND status = 'pending'
                             ORDER BY scheduled_at, lead_id, step_number
                             LIMIT 1)
                 RETURNING {JOB_COLS}"
            ),
            &[&campaign_id, &now],
        )?;
        row.map(|row| job_from_row(&row)).transpose()
    }

    fn step_summary(&self, campaign_id: Uuid) -> Result<Vec<StepSummary>, StoreError> {
        let mut conn = self.connection()?;
        let rows = conn.query(
            "SELECT j.step_number,
                    COUNT(*) FILTER (WHERE j.status = 'sent'),
                    COUNT(*) FILTER (WHERE j.status = 'pending'
                                       AND l.status NOT IN ('replied', 'failed')),
                    COUNT(*) FILTER (WHERE j.status = 'failed'),
                    COUNT(*) FILTER (WHERE j.status = 'skipped'),
                    MIN(j.scheduled_at) FILTER (WHERE j.status = 'pending'
                                                  AND l.status NOT IN ('replied', 'failed'))
             FROM jobs j
             JOIN leads l ON l.id = j.lead_id
             WHERE j.campaign_id = $1
             GROUP BY j.step_number
             ORDER BY j.step_number",
            &[&campaign_id],
        )?;
        rows.iter()
            .map(|row| {
                Ok(StepSummary {
                    step_number: row.try_get(0)?,
                    sent: row.try_get(1)?,
                    pending: row.try_get(2)?,
                    failed: row.try_get(3)?,
                    skipped: row.try_get(4)?,
                    next_scheduled_at: row.try_get(5)?,
                })
            })
            .collect()
    }

    fn campaign_stats(&self, campaign_id: Uuid) -> Result<Option<CampaignStats>, StoreError> {
        let Some(campaign) = self.load_campaign(campaign_id)? else {
            return Ok(None);
        };
        let mut conn = self.connection()?;
        let mut stats = CampaignStats {
            campaign,
            total_leads: 0,
            pending_leads: 0,
            contacted_leads: 0,
            replied_leads: 0,
            failed_leads: 0,
            pending_jobs: 0,
        };
        let rows = conn.query(
            "SELECT status, COUNT(*) FROM leads WHERE campaign_id = $1 GROUP BY status",
            &[&campaign_id],
        )?;
        for row in rows {
            let status_raw: String = row.try_get(0)?;
            let count: i64 = row.try_get(1)?;
            stats.total_leads += count;
            match LeadStatus::parse(&status_raw) {
                Some(LeadStatus::Pending) => stats.pending_leads = count,
                Some(LeadStatus::Contacted) => stats.contacted_leads = count,
                Some(LeadStatus::Replied) => stats.replied_leads = count,
                Some(LeadStatus::Failed) => stats.failed_leads = count,
                None => {
                    return Err(StoreError::Storage(format!(
                        "unknown lead status {}",
                        status_raw
                    )))
                }
            }
        }
        let row = conn.query_one(
            "SELECT COUNT(*) FROM jobs WHERE campaign_id = $1 AND status = 'pending'",
            &[&campaign_id],
        )?;
        stats.pending_jobs = row.try_get(0)?;
        Ok(Some(stats))
    }

    fn lead_by_message_id(&self, message_id: &str) -> Result<Option<Lead>, StoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            "SELECT l.id, l.campaign_id, l.email, l.first_name, l.company, l.status,
                    l.created_at, l.updated_at
             FROM leads l
             JOIN jobs j ON j.lead_id = l.id
             WHERE j.message_id IS NOT NULL
               AND lower(btrim(j.message_id, '<>')) = lower(btrim($1, '<>'))
             LIMIT 1",
            &[&message_id],
        )?;
        row.map(|row| lead_from_row(&row)).transpose()
    }

    fn launch_campaign(
        &self,
        campaign_id: Uuid,
        step_one_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Campaign, LifecycleError> {
        let mut conn = self.connection().map_err(LifecycleError::Store)?;
        let mut txn = conn.transaction().map_err(StoreError::Postgres)?;

        let row = txn
            .query_opt(
                &format!("SELECT {CAMPAIGN_COLS} FROM campaigns WHERE id = $1 FOR UPDATE"),
                &[&campaign_id],
            )
            .map_err(StoreError::Postgres)?;
        let row = row.ok_or_else(|| LifecycleError::NotFound("campaign not found".to_string()))?;
        let mut campaign = campaign_from_row(&row, Vec::new())?;

        if campaign.status != CampaignStatus::Draft {
            return Err(LifecycleError::InvalidTransition(
                "campaign must be in draft status to launch".to_string(),
            ));
        }

        let step_one = txn
            .query_opt(
                "SELECT 1 FROM templates WHERE campaign_id = $1 AND step_number = 1",
                &[&campaign_id],
            )
            .map_err(StoreError::Postgres)?;
        if step_one.is_none() {
            return Err(LifecycleError::Validation(
                "campaign must have a step 1 template".to_string(),
            ));
        }

        let leads = txn
            .query(
                "SELECT id FROM leads
                 WHERE campaign_id = $1 AND status IN ('pending', 'contacted')",
                &[&campaign_id],
            )
            .map_err(StoreError::Postgres)?;
        if leads.is_empty() {
            return Err(LifecycleError::Validation(
                "campaign must have at least one lead".to_string(),
            ));
        }

        for row in &leads {
            let lead_id: Uuid = row.try_get(0).map_err(StoreError::Postgres)?;
            txn.execute(
                "INSERT INTO jobs
                     (id, campaign_id, lead_id, step_number, status, scheduled_at,
                      created_at, updated_at)
                 VALUES ($1, $2, $3, 1, 'pending', $4, $5, $5)
                 ON CONFLICT (lead_id, step_number) WHERE status <> 'failed' DO NOTHING",
                &[&Uuid::new_v4(), &campaign_id, &lead_id, &step_one_at, &now],
            )
            .map_err(StoreError::Postgres)?;
        }

        txn.execute(
            "UPDATE campaigns SET status = 'active', start_time = $2, updated_at = $3
             WHERE id = $1",
            &[&campaign_id, &step_one_at, &now],
        )
        .map_err(StoreError::Postgres)?;
        txn.commit().map_err(StoreError::Postgres)?;

        campaign.status = CampaignStatus::Active;
        campaign.start_time = Some(step_one_at);
        campaign.updated_at = now;
        Ok(campaign)
    }

    fn transition_campaign(
        &self,
        campaign_id: Uuid,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> Result<Campaign, LifecycleError> {
        let mut conn = self.connection().map_err(LifecycleError::Store)?;
        let mut txn = conn.transaction().map_err(StoreError::Postgres)?;

        let row = txn
            .query_opt(
                &format!("SELECT {CAMPAIGN_COLS} FROM campaigns WHERE id = $1 FOR UPDATE"),
                &[&campaign_id],
            )
            .map_err(StoreError::Postgres)?;
        let row = row.ok_or_else(|| LifecycleError::NotFound("campaign not found".to_string()))?;
        let mut campaign = campaign_from_row(&row, Vec::new())?;

        if campaign.status != from || !CampaignStatus::can_transition(from, to) {
            return Err(LifecycleError::InvalidTransition(format!(
                "cannot transition campaign from {} to {}",
                campaign.status.as_str(),
                to.as_str()
            )));
        }

        let now = Utc::now();
        txn.execute(
            "UPDATE campaigns SET status = $2, updated_at = $3 WHERE id = $1",
            &[&campaign_id, &to.as_str(), &now],
        )
        .map_err(StoreError::Postgres)?;
        txn.commit().map_err(StoreError::Postgres)?;

        campaign.status = to;
        campaign.updated_at = now;
        Ok(campaign)
    }

    fn delete_campaign(&self, campaign_id: Uuid) -> Result<(), LifecycleError> {
        let mut conn = self.connection().map_err(LifecycleError::Store)?;
        let mut txn = conn.transaction().map_err(StoreError::Postgres)?;
        let row = txn
            .query_opt(
                "SELECT status FROM campaigns WHERE id = $1 FOR UPDATE",
                &[&campaign_id],
            )
            .map_err(StoreError::Postgres)?;
        let row = row.ok_or_else(|| LifecycleError::NotFound("campaign not found".to_string()))?;
        let status_raw: String = row.try_get(0).map_err(StoreError::Postgres)?;
        if CampaignStatus::parse(&status_raw) != Some(CampaignStatus::Draft) {
            return Err(LifecycleError::InvalidTransition(
                "only draft campaigns can be deleted".to_string(),
            ));
        }
        txn.execute("DELETE FROM campaigns WHERE id = $1", &[&campaign_id])
            .map_err(StoreError::Postgres)?;
        txn.commit().map_err(StoreError::Postgres)?;
        Ok(())
    }

    fn duplicate_campaign(
        &self,
        campaign_id: Uuid,
        name: Option<&str>,
    ) -> Result<Campaign, LifecycleError> {
        let mut conn = self.connection().map_err(LifecycleError::Store)?;
        let mut txn = conn.transaction().map_err(StoreError::Postgres)?;

        let row = txn
            .query_opt(
                &format!("SELECT {CAMPAIGN_COLS} FROM campaigns WHERE id = $1"),
                &[&campaign_id],
            )
            .map_err(StoreError::Postgres)?;
        let row = row.ok_or_else(|| LifecycleError::NotFound("campaign not found".to_string()))?;
        let original = campaign_from_row(&row, Vec::new())?;

        let new_id = Uuid::new_v4();
        let now = Utc::now();
        let new_name = match name {
            Some(name) => name.to_string(),
            None => format!("{} (Copy)", original.name),
        };
        txn.execute(
            "INSERT INTO campaigns (id, user_id, name, pitch, tone, status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, 'draft', $6, $6)",
            &[&new_id, &original.user_id, &new_name, &original.pitch, &original.tone, &now],
        )
        .map_err(StoreError::Postgres)?;
        txn.execute(
            "INSERT INTO templates
                 (id, campaign_id, step_number, subject, body_html, delay_minutes,
                  created_at, updated_at)
             SELECT gen_random_uuid(), $2, step_number, subject, body_html, delay_minutes, $3, $3
             FROM templates WHERE campaign_id = $1",
            &[&campaign_id, &new_id, &now],
        )
        .map_err(StoreError::Postgres)?;
        txn.commit().map_err(StoreError::Postgres)?;

        Ok(Campaign {
            id: new_id,
            user_id: original.user_id,
            name: new_name,
            pitch: original.pitch,
            tone: original.tone,
            status: CampaignStatus::Draft,
            start_time: None,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    fn try_complete_campaign(&self, campaign_id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let mut txn = conn.transaction()?;

        let row = txn.query_opt(
            "SELECT status FROM campaigns WHERE id = $1 FOR UPDATE",
            &[&campaign_id],
        )?;
        let Some(row) = row else {
            return Ok(false);
        };
        let status_raw: String = row.try_get(0)?;
        if CampaignStatus::parse(&status_raw) != Some(CampaignStatus::Active) {
            return Ok(false);
        }

        let pending: i64 = txn
            .query_one(
                "SELECT COUNT(*) FROM jobs WHERE campaign_id = $1 AND status = 'pending'",
                &[&campaign_id],
            )?
            .try_get(0)?;
        if pending > 0 {
            return Ok(false);
        }

        let max_step: Option<i32> = txn
            .query_one(
                "SELECT MAX(step_number) FROM templates WHERE campaign_id = $1",
                &[&campaign_id],
            )?
            .try_get(0)?;
        let unfinished: i64 = match max_step {
            Some(max_step) => txn
                .query_one(
                    "SELECT COUNT(*) FROM leads l
                     WHERE l.campaign_id = $1
                       AND l.status IN ('pending', 'contacted')
                       AND NOT EXISTS (
                           SELECT 1 FROM jobs j
                           WHERE j.lead_id = l.id AND j.status = 'sent'
                             AND j.step_number = $2
                       )",
                    &[&campaign_id, &max_step],
                )?
                .try_get(0)?,
            None => txn
                .query_one(
                    "SELECT COUNT(*) FROM leads
                     WHERE campaign_id = $1 AND status IN ('pending', 'contacted')",
                    &[&campaign_id],
                )?
                .try_get(0)?,
        };
        if unfinished > 0 {
            return Ok(false);
        }

        txn.execute(
            "UPDATE campaigns SET status = 'completed', updated_at = now() WHERE id = $1",
            &[&campaign_id],
        )?;
        txn.commit()?;
        Ok(true)
    }

    fn mark_lead_replied(&self, lead_id: Uuid) -> Result<ReplyRecord, StoreError> {
        let mut conn = self.connection()?;
        let mut txn = conn.transaction()?;

        let row = txn.query_opt(
            &format!("SELECT {LEAD_COLS} FROM leads WHERE id = $1"),
            &[&lead_id],
        )?;
        let Some(row) = row else {
            return Ok(ReplyRecord::NotFound);
        };
        let mut lead = lead_from_row(&row)?;
        if lead.status.is_terminal() {
            return Ok(ReplyRecord::AlreadyTerminal(lead));
        }

        // Job rows first: this contends on any claim the dispatcher holds,
        // and keeps the job -> lead lock order uniform across both paths.
        let canceled = txn.execute(
            "UPDATE jobs SET status = 'skipped', last_error = 'lead terminal',
                    updated_at = now()
             WHERE lead_id = $1 AND status = 'pending'",
            &[&lead_id],
        )?;
        let now = Utc::now();
        let updated = txn.execute(
            "UPDATE leads SET status = 'replied', updated_at = $2
             WHERE id = $1 AND status IN ('pending', 'contacted')",
            &[&lead_id, &now],
        )?;
        if updated == 0 {
            return Ok(ReplyRecord::AlreadyTerminal(lead));
        }
        txn.commit()?;

        lead.status = LeadStatus::Replied;
        lead.updated_at = now;
        Ok(ReplyRecord::Replied {
            lead,
            canceled_jobs: canceled,
        })
    }

    fn record_bounce(
        &self,
        message_id: &str,
        description: &str,
    ) -> Result<BounceRecord, StoreError> {
        let mut conn = self.connection()?;
        let mut txn = conn.transaction()?;

        let row = txn.query_opt(
            &format!(
                "SELECT {JOB_COLS} FROM jobs
                 WHERE message_id IS NOT NULL
                   AND lower(btrim(message_id, '<>')) = lower(btrim($1, '<>'))
                 LIMIT 1"
            ),
            &[&message_id],
        )?;
        let Some(row) = row else {
            return Ok(BounceRecord::NoMatch);
        };
        let mut job = job_from_row(&row)?;

        txn.execute(
            "UPDATE jobs SET status = 'failed', last_error = $2, updated_at = now()
             WHERE id = $1",
            &[&job.id, &description],
        )?;
        let lead_failed = txn.execute(
            "UPDATE leads SET status = 'failed', updated_at = now()
             WHERE id = $1
               AND status IN ('pending', 'contacted')
               AND NOT EXISTS (
                   SELECT 1 FROM jobs
                   WHERE lead_id = $1 AND status = 'sent' AND id <> $2
               )",
            &[&job.lead_id, &job.id],
        )?;
        if lead_failed > 0 {
            txn.execute(
                "UPDATE jobs SET status = 'skipped', last_error = 'lead terminal',
                        updated_at = now()
                 WHERE lead_id = $1 AND status = 'pending' AND id <> $2",
                &[&job.lead_id, &job.id],
            )?;
        }
        txn.commit()?;

        job.status = JobStatus::Failed;
        job.last_error = Some(description.to_string());
        Ok(BounceRecord::Recorded {
            job,
            lead_failed: lead_failed > 0,
        })
    }

    fn create_user(&self, email: &str, signature_html: Option<&str>) -> Result<User, StoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_one(
            &format!(
                "INSERT INTO users (id, email, signature_html, created_at, updated_at)
                 VALUES ($1, $2, $3, now(), now())
                 ON CONFLICT (email) DO UPDATE
                 SET signature_html = EXCLUDED.signature_html,
                     updated_at = now()
                 RETURNING {USER_COLS}"
            ),
            &[&Uuid::new_v4(), &normalize_email(email), &signature_html],
        )?;
        user_from_row(&row)
    }

    fn create_campaign(
        &self,
        user_id: Uuid,
        name: &str,
        pitch: Option<&str>,
        tone: Option<&str>,
    ) -> Result<Campaign, LifecycleError> {
        let mut conn = self.connection().map_err(LifecycleError::Store)?;
        let user = conn
            .query_opt("SELECT 1 FROM users WHERE id = $1", &[&user_id])
            .map_err(StoreError::Postgres)?;
        if user.is_none() {
            return Err(LifecycleError::NotFound("user not found".to_string()));
        }
        let row = conn
            .query_one(
                &format!(
                    "INSERT INTO campaigns
                         (id, user_id, name, pitch, tone, status, created_at, updated_at)
                     VALUES ($1, $2, $3, $4, $5, 'draft', now(), now())
                     RETURNING {CAMPAIGN_COLS}"
                ),
                &[&Uuid::new_v4(), &user_id, &name, &pitch, &tone],
            )
            .map_err(StoreError::Postgres)?;
        Ok(campaign_from_row(&row, Vec::new())?)
    }

    fn create_lead(
        &self,
        campaign_id: Uuid,
        email: &str,
        first_name: Option<&str>,
        company: Option<&str>,
    ) -> Result<Lead, LifecycleError> {
        if !validate_email(email) {
            return Err(LifecycleError::Validation(format!(
                "invalid email format: {}",
                email
            )));
        }
        let mut conn = self.connection().map_err(LifecycleError::Store)?;
        let row = conn
            .query_opt(
                "SELECT status FROM campaigns WHERE id = $1",
                &[&campaign_id],
            )
            .map_err(StoreError::Postgres)?;
        let row = row.ok_or_else(|| LifecycleError::NotFound("campaign not found".to_string()))?;
        let status_raw: String = row.try_get(0).map_err(StoreError::Postgres)?;
        if CampaignStatus::parse(&status_raw) != Some(CampaignStatus::Draft) {
            return Err(LifecycleError::InvalidTransition(
                "can only add leads to campaigns in draft status".to_string(),
            ));
        }
        let result = conn.query_one(
            &format!(
                "INSERT INTO leads
                     (id, campaign_id, email, first_name, company, status,
                      created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, 'pending', now(), now())
                 RETURNING {LEAD_COLS}"
            ),
            &[
                &Uuid::new_v4(),
                &campaign_id,
                &normalize_email(email),
                &first_name,
                &company,
            ],
        );
        match result {
            Ok(row) => Ok(lead_from_row(&row)?),
            Err(err) if is_unique_violation(&err) => Err(LifecycleError::Validation(format!(
                "email {} already exists in this campaign",
                normalize_email(email)
            ))),
            Err(err) => Err(LifecycleError::Store(err.into())),
        }
    }

    fn upsert_template(
        &self,
        campaign_id: Uuid,
        step_number: i32,
        subject: &str,
        body_html: &str,
        delay_minutes: i64,
    ) -> Result<Template, LifecycleError> {
        if step_number < 1 {
            return Err(LifecycleError::Validation(
                "step_number must be at least 1".to_string(),
            ));
        }
        let mut conn = self.connection().map_err(LifecycleError::Store)?;
        let exists = conn
            .query_opt("SELECT 1 FROM campaigns WHERE id = $1", &[&campaign_id])
            .map_err(StoreError::Postgres)?;
        if exists.is_none() {
            return Err(LifecycleError::NotFound("campaign not found".to_string()));
        }
        let row = conn
            .query_one(
                &format!(
                    "INSERT INTO templates
                         (id, campaign_id, step_number, subject, body_html, delay_minutes,
                          created_at, updated_at)
                     VALUES ($1, $2, $3, $4, $5, $6, now(), now())
                     ON CONFLICT (campaign_id, step_number) DO UPDATE
                     SET subject = EXCLUDED.subject,
                         body_html = EXCLUDED.body_html,
                         delay_minutes = EXCLUDED.delay_minutes,
                         updated_at = now()
                     RETURNING {TEMPLATE_COLS}"
                ),
                &[
                    &Uuid::new_v4(),
                    &campaign_id,
                    &step_number,
                    &subject,
                    &body_html,
                    &delay_minutes,
                ],
            )
            .map_err(StoreError::Postgres)?;
        Ok(template_from_row(&row)?)
    }

    fn add_tag(&self, campaign_id: Uuid, tag: &str) -> Result<(), LifecycleError> {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(LifecycleError::Validation("tag cannot be empty".to_string()));
        }
        let mut conn = self.connection().map_err(LifecycleError::Store)?;
        let exists = conn
            .query_opt("SELECT 1 FROM campaigns WHERE id = $1", &[&campaign_id])
            .map_err(StoreError::Postgres)?;
        if exists.is_none() {
            return Err(LifecycleError::NotFound("campaign not found".to_string()));
        }
        let inserted = conn
            .execute(
                "INSERT INTO campaign_tags (campaign_id, tag) VALUES ($1, $2)
                 ON CONFLICT DO NOTHING",
                &[&campaign_id, &tag],
            )
            .map_err(StoreError::Postgres)?;
        if inserted == 0 {
            return Err(LifecycleError::Validation(
                "tag already exists for this campaign".to_string(),
            ));
        }
        Ok(())
    }

    fn remove_tag(&self, campaign_id: Uuid, tag: &str) -> Result<bool, LifecycleError> {
        let mut conn = self.connection().map_err(LifecycleError::Store)?;
        let removed = conn
            .execute(
                "DELETE FROM campaign_tags WHERE campaign_id = $1 AND tag = $2",
                &[&campaign_id, &tag.trim()],
            )
            .map_err(StoreError::Postgres)?;
        Ok(removed > 0)
    }
}
