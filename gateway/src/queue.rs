//! Durable at-least-once job queue over SQLite.
//!
//! Jobs are partitioned by channel key (`platform:actor`), claimed by
//! exactly one consumer at a time through a single atomic
//! `UPDATE ... RETURNING`, and redelivered when a claim outlives the
//! visibility timeout without an ack. FIFO holds per channel (claim order
//! follows insertion order); consumers must treat execution as idempotent
//! or deduplicate by job id, since an unacked job can be delivered again.
//!
//! Terminal outcomes are recorded in a results table alongside the queue.
//! The consumer that executes a job may live in a different process than
//! the one holding the client connection, so [`JobQueue::complete`] leaves
//! the outcome readable until the connection-holding process takes it with
//! [`JobQueue::take_result`].

use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;

use shared_types::Job;

#[derive(Debug, Error)]
#[error("queue: {0}")]
pub struct QueueError(pub String);

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        QueueError(e.to_string())
    }
}

/// Durable record of one job's terminal outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success(Value),
    Failure(String),
}

pub struct JobQueue {
    conn: Mutex<Connection>,
    visibility: Duration,
}

impl JobQueue {
    pub fn open(path: &str, visibility: Duration) -> Result<Self, QueueError> {
        if path != ":memory:" {
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            visibility,
        })
    }

    pub fn in_memory(visibility: Duration) -> Result<Self, QueueError> {
        Self::open(":memory:", visibility)
    }

    fn run_migrations(conn: &Connection) -> Result<(), QueueError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL UNIQUE,
                channel TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                claimed_at INTEGER,
                enqueued_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            (),
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_jobs_channel ON jobs(channel, claimed_at)",
            (),
        )?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS results (
                job_id TEXT PRIMARY KEY,
                ok INTEGER NOT NULL,
                payload TEXT NOT NULL,
                completed_at INTEGER NOT NULL
            )
            "#,
            (),
        )?;
        Ok(())
    }

    /// Enqueue a job onto its channel. Re-submitting an id already in the
    /// queue is a no-op.
    pub fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let payload =
            serde_json::to_string(job).map_err(|e| QueueError(format!("serialize job: {e}")))?;
        let conn = self.conn.lock().expect("queue mutex poisoned");
        conn.execute(
            r#"
            INSERT OR IGNORE INTO jobs (job_id, channel, payload)
            VALUES (?1, ?2, ?3)
            "#,
            params![job.id, job.channel(), payload],
        )?;
        Ok(())
    }

    /// Atomically claim the oldest unclaimed job on a channel. The claim is
    /// exclusive until acked, nacked, or expired past the visibility
    /// timeout. Returns the job with its delivery attempt count.
    pub fn claim(&self, channel: &str) -> Result<Option<Job>, QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let conn = self.conn.lock().expect("queue mutex poisoned");
        let row: Option<(String, u32)> = conn
            .query_row(
                r#"
                UPDATE jobs
                SET claimed_at = ?1, attempt = attempt + 1
                WHERE seq = (
                    SELECT seq FROM jobs
                    WHERE channel = ?2 AND claimed_at IS NULL
                    ORDER BY seq
                    LIMIT 1
                )
                RETURNING payload, attempt
                "#,
                params![now_ms, channel],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((payload, attempt)) => {
                let mut job: Job = serde_json::from_str(&payload)
                    .map_err(|e| QueueError(format!("corrupt job record: {e}")))?;
                job.attempt = attempt;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Acknowledge completion; the job leaves the queue for good.
    pub fn ack(&self, job_id: &str) -> Result<(), QueueError> {
        let conn = self.conn.lock().expect("queue mutex poisoned");
        conn.execute("DELETE FROM jobs WHERE job_id = ?1", params![job_id])?;
        Ok(())
    }

    /// Record a job's terminal outcome and remove it from the queue in one
    /// transaction. The first recorded outcome for an id wins; a redelivered
    /// duplicate completing later is a no-op on the record.
    pub fn complete(&self, job_id: &str, outcome: &JobOutcome) -> Result<(), QueueError> {
        let (ok, payload) = match outcome {
            JobOutcome::Success(value) => (1, value.to_string()),
            JobOutcome::Failure(reason) => (0, reason.clone()),
        };
        let now_ms = Utc::now().timestamp_millis();
        let mut conn = self.conn.lock().expect("queue mutex poisoned");
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM jobs WHERE job_id = ?1", params![job_id])?;
        tx.execute(
            r#"
            INSERT INTO results (job_id, ok, payload, completed_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(job_id) DO NOTHING
            "#,
            params![job_id, ok, payload, now_ms],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Consume the recorded outcome for a job id, if one exists. The row is
    /// deleted on read, so at most one caller ever observes it.
    pub fn take_result(&self, job_id: &str) -> Result<Option<JobOutcome>, QueueError> {
        let conn = self.conn.lock().expect("queue mutex poisoned");
        let row: Option<(i64, String)> = conn
            .query_row(
                "DELETE FROM results WHERE job_id = ?1 RETURNING ok, payload",
                params![job_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((1, payload)) => {
                let value = serde_json::from_str(&payload)
                    .map_err(|e| QueueError(format!("corrupt result record: {e}")))?;
                Ok(Some(JobOutcome::Success(value)))
            }
            Some((_, payload)) => Ok(Some(JobOutcome::Failure(payload))),
            None => Ok(None),
        }
    }

    /// Drop recorded outcomes older than `max_age` that nobody took, e.g.
    /// when the client disconnected before its reply could be delivered.
    pub fn purge_results(&self, max_age: Duration) -> Result<usize, QueueError> {
        let cutoff = Utc::now().timestamp_millis() - max_age.as_millis() as i64;
        let conn = self.conn.lock().expect("queue mutex poisoned");
        let changed = conn.execute(
            "DELETE FROM results WHERE completed_at < ?1",
            params![cutoff],
        )?;
        Ok(changed)
    }

    /// Return a claimed job to its channel for immediate redelivery.
    pub fn nack(&self, job_id: &str) -> Result<(), QueueError> {
        let conn = self.conn.lock().expect("queue mutex poisoned");
        conn.execute(
            "UPDATE jobs SET claimed_at = NULL WHERE job_id = ?1",
            params![job_id],
        )?;
        Ok(())
    }

    /// Release claims older than the visibility timeout. Run periodically;
    /// returns the number of jobs made available again.
    pub fn requeue_expired(&self) -> Result<usize, QueueError> {
        let cutoff = Utc::now().timestamp_millis() - self.visibility.as_millis() as i64;
        let conn = self.conn.lock().expect("queue mutex poisoned");
        let changed = conn.execute(
            "UPDATE jobs SET claimed_at = NULL WHERE claimed_at IS NOT NULL AND claimed_at < ?1",
            params![cutoff],
        )?;
        Ok(changed)
    }

    /// Jobs currently on a channel (claimed or not).
    pub fn depth(&self, channel: &str) -> Result<usize, QueueError> {
        let conn = self.conn.lock().expect("queue mutex poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE channel = ?1",
            params![channel],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
