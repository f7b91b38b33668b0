use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use flate2::{write::GzEncoder, Compression};
use rusqlite::backup::Backup;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use crate::sqlite::configure_connection;

use super::error::{RequestError, RequestResult};
use super::models::{
    parse_timestamp, AuditRecord, Channel, NewRequest, RequestEntry, RequestFilter, RequestMetrics,
    RequestStatus, ScheduleCandidate, StuckFinding, StuckKind,
};

const REQUEST_SCHEMA: &str = include_str!("../../../sql/requests.sql");

#[derive(Debug, Clone)]
pub struct SqliteRequestStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteRequestStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteRequestStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> RequestResult<SqliteRequestStore> {
        let path = self.path.ok_or(RequestError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteRequestStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteRequestStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteRequestStore {
    pub fn builder() -> SqliteRequestStoreBuilder {
        SqliteRequestStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> RequestResult<Self> {
        SqliteRequestStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> RequestResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            RequestError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| RequestError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> RequestResult<()> {
        let conn = self.open()?;
        conn.execute_batch(REQUEST_SCHEMA)?;
        Ok(())
    }

    pub fn insert(&self, request: &NewRequest) -> RequestResult<RequestEntry> {
        let request_id = format!("req-{}", Uuid::new_v4().simple());
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO requests (
                request_id, user_id, channel_id, prompt, category_hint, base_priority, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'submitted')",
            params![
                &request_id,
                &request.user_id,
                &request.channel_id,
                &request.prompt,
                &request.category_hint,
                request.base_priority,
            ],
        )?;
        self.fetch(&request_id)?
            .ok_or(RequestError::NotFound(request_id))
    }

    pub fn fetch(&self, request_id: &str) -> RequestResult<Option<RequestEntry>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM requests WHERE request_id = ?1")?;
        let entry = stmt
            .query_row([request_id], |row| RequestEntry::from_row(row))
            .optional()?;
        Ok(entry)
    }

    /// Validated status change. The read and the write share one IMMEDIATE
    /// transaction so concurrent writers cannot interleave between them.
    pub fn transition(
        &self,
        request_id: &str,
        to: RequestStatus,
        reason: Option<&str>,
    ) -> RequestResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        transition_in_tx(&tx, request_id, to, reason)?;
        tx.commit()?;
        Ok(())
    }

    pub fn record_moderation(
        &self,
        request_id: &str,
        to: RequestStatus,
        verdict: &str,
        reason: Option<&str>,
    ) -> RequestResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        transition_in_tx(&tx, request_id, to, reason)?;
        tx.execute(
            "UPDATE requests SET verdict = ?2, moderated_at = CURRENT_TIMESTAMP
             WHERE request_id = ?1",
            params![request_id, verdict],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Atomic claim used by the scheduler's pop. Succeeds for exactly one
    /// caller when several race on the same entry: the guard on the current
    /// status makes the update a compare-and-swap.
    pub fn claim(&self, request_id: &str) -> RequestResult<bool> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE requests
             SET status = 'generating', generation_started_at = CURRENT_TIMESTAMP
             WHERE request_id = ?1 AND status = 'queued'",
            [request_id],
        )?;
        Ok(affected == 1)
    }

    pub fn fetch_candidates(&self, channel_id: &str) -> RequestResult<Vec<ScheduleCandidate>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT r.*,
                    COALESCE(u.reputation, 0) AS sched_reputation,
                    COALESCE(u.premium, 0) AS sched_premium,
                    COALESCE(u.completed_plays, 0) AS sched_completed_plays
             FROM requests r
             LEFT JOIN users u ON u.user_id = r.user_id
             WHERE r.channel_id = ?1 AND r.status = 'queued'",
        )?;
        let rows = stmt
            .query_map([channel_id], |row| {
                Ok(ScheduleCandidate {
                    entry: RequestEntry::from_row(row)?,
                    reputation: row.get("sched_reputation")?,
                    premium: row.get::<_, i64>("sched_premium")? != 0,
                    completed_plays: row.get("sched_completed_plays")?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_priorities(&self, scores: &[(String, f64)]) -> RequestResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        for (request_id, score) in scores {
            tx.execute(
                "UPDATE requests SET computed_priority = ?2
                 WHERE request_id = ?1 AND status = 'queued'",
                params![request_id, score],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list(&self, filter: &RequestFilter) -> RequestResult<Vec<RequestEntry>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM requests
             WHERE (?1 IS NULL OR channel_id = ?1)
               AND (?2 IS NULL OR status = ?2)
               AND (?3 IS NULL OR user_id = ?3)
             ORDER BY submitted_at DESC
             LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(
                params![
                    filter.channel_id,
                    filter.status.as_ref().map(RequestStatus::as_str),
                    filter.user_id,
                    filter.limit.unwrap_or(100) as i64,
                ],
                |row| RequestEntry::from_row(row),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn snapshot(&self, channel_id: &str) -> RequestResult<Vec<RequestEntry>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM requests
             WHERE channel_id = ?1 AND status = 'queued'
             ORDER BY computed_priority DESC, submitted_at ASC",
        )?;
        let rows = stmt
            .query_map([channel_id], |row| RequestEntry::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_flagged(&self, channel_id: Option<&str>) -> RequestResult<Vec<RequestEntry>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM requests
             WHERE status = 'flagged' AND (?1 IS NULL OR channel_id = ?1)
             ORDER BY submitted_at ASC",
        )?;
        let rows = stmt
            .query_map([channel_id], |row| RequestEntry::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn record_vote(&self, request_id: &str, upvote: bool) -> RequestResult<()> {
        let conn = self.open()?;
        let column = if upvote { "upvotes" } else { "downvotes" };
        let affected = conn.execute(
            &format!("UPDATE requests SET {column} = {column} + 1 WHERE request_id = ?1"),
            [request_id],
        )?;
        if affected == 0 {
            return Err(RequestError::NotFound(request_id.to_string()));
        }
        Ok(())
    }

    /// Generation callback. A failed attempt re-enters the queue until the
    /// bounded retry count is spent, then the entry goes terminal.
    pub fn report_generation(
        &self,
        request_id: &str,
        success: bool,
        artifact_ref: Option<&str>,
        error_detail: Option<&str>,
        max_retries: i64,
    ) -> RequestResult<RequestStatus> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let entry = fetch_in_tx(&tx, request_id)?;
        let resulting = if success {
            transition_in_tx(&tx, request_id, RequestStatus::Completed, None)?;
            tx.execute(
                "UPDATE requests SET artifact_ref = ?2, generation_finished_at = CURRENT_TIMESTAMP
                 WHERE request_id = ?1",
                params![request_id, artifact_ref],
            )?;
            RequestStatus::Completed
        } else if entry.retry_count < max_retries {
            transition_in_tx(&tx, request_id, RequestStatus::Queued, None)?;
            tx.execute(
                "UPDATE requests SET retry_count = retry_count + 1, failure_detail = ?2
                 WHERE request_id = ?1",
                params![request_id, error_detail],
            )?;
            RequestStatus::Queued
        } else {
            transition_in_tx(&tx, request_id, RequestStatus::GenerationFailed, error_detail)?;
            tx.execute(
                "UPDATE requests
                 SET failure_detail = ?2, generation_finished_at = CURRENT_TIMESTAMP
                 WHERE request_id = ?1",
                params![request_id, error_detail],
            )?;
            RequestStatus::GenerationFailed
        };
        tx.commit()?;
        Ok(resulting)
    }

    pub fn mark_playing(&self, request_id: &str) -> RequestResult<()> {
        self.transition(request_id, RequestStatus::Playing, None)
    }

    pub fn mark_played(
        &self,
        request_id: &str,
        final_upvotes: i64,
        final_downvotes: i64,
    ) -> RequestResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        transition_in_tx(&tx, request_id, RequestStatus::Played, None)?;
        tx.execute(
            "UPDATE requests SET upvotes = ?2, downvotes = ?3 WHERE request_id = ?1",
            params![request_id, final_upvotes, final_downvotes],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn skip(&self, request_id: &str, reason: Option<&str>) -> RequestResult<()> {
        self.transition(request_id, RequestStatus::Skipped, reason)
    }

    /// Rejects still-pending duplicates of a resubmitted prompt. The
    /// rate-limit increments those attempts already paid are untouched.
    pub fn supersede_pending(
        &self,
        user_id: &str,
        channel_id: &str,
        prompt: &str,
    ) -> RequestResult<usize> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE requests
             SET status = 'rejected', verdict_reason = 'superseded',
                 moderated_at = CURRENT_TIMESTAMP
             WHERE user_id = ?1 AND channel_id = ?2 AND prompt = ?3
               AND status = 'moderation_pending'",
            params![user_id, channel_id, prompt],
        )?;
        Ok(affected)
    }

    pub fn upsert_channel(&self, channel: &Channel) -> RequestResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO channels (channel_id, name, strictness, allow_explicit, active)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(channel_id) DO UPDATE SET
                name = excluded.name,
                strictness = excluded.strictness,
                allow_explicit = excluded.allow_explicit,
                active = excluded.active",
            params![
                &channel.channel_id,
                &channel.name,
                channel.strictness.as_str(),
                channel.allow_explicit as i64,
                channel.active as i64,
            ],
        )?;
        Ok(())
    }

    pub fn fetch_channel(&self, channel_id: &str) -> RequestResult<Option<Channel>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM channels WHERE channel_id = ?1")?;
        let channel = stmt
            .query_row([channel_id], |row| Channel::from_row(row))
            .optional()?;
        Ok(channel)
    }

    pub fn list_channels(&self) -> RequestResult<Vec<Channel>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM channels ORDER BY channel_id")?;
        let rows = stmt
            .query_map([], |row| Channel::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn append_audit(&self, record: &AuditRecord) -> RequestResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO moderation_audit (
                request_id, user_id, channel_id, stage, verdict, matched_rule, scores
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &record.request_id,
                &record.user_id,
                &record.channel_id,
                &record.stage,
                &record.verdict,
                &record.matched_rule,
                &record.scores,
            ],
        )?;
        Ok(())
    }

    pub fn list_audit(&self, request_id: &str) -> RequestResult<Vec<AuditRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT request_id, user_id, channel_id, stage, verdict, matched_rule, scores,
                    created_at
             FROM moderation_audit WHERE request_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([request_id], |row| {
                Ok(AuditRecord {
                    request_id: row.get(0)?,
                    user_id: row.get(1)?,
                    channel_id: row.get(2)?,
                    stage: row.get(3)?,
                    verdict: row.get(4)?,
                    matched_rule: row.get(5)?,
                    scores: row.get(6)?,
                    created_at: parse_timestamp(row.get(7)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn metrics(&self, channel_id: Option<&str>) -> RequestResult<RequestMetrics> {
        let conn = self.open()?;
        let mut metrics = RequestMetrics::default();
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM requests
             WHERE (?1 IS NULL OR channel_id = ?1)
             GROUP BY status",
        )?;
        let mut rows = stmt.query([channel_id])?;
        while let Some(row) = rows.next()? {
            metrics.counts.insert(row.get(0)?, row.get(1)?);
        }
        let cutoff = (Utc::now() - Duration::hours(1)).naive_utc();
        metrics.played_last_hour = conn.query_row(
            "SELECT COUNT(*) FROM requests
             WHERE status = 'played' AND play_finished_at >= ?1
               AND (?2 IS NULL OR channel_id = ?2)",
            params![cutoff, channel_id],
            |row| row.get(0),
        )?;
        metrics.failed_last_hour = conn.query_row(
            "SELECT COUNT(*) FROM requests
             WHERE status = 'generation_failed' AND generation_finished_at >= ?1
               AND (?2 IS NULL OR channel_id = ?2)",
            params![cutoff, channel_id],
            |row| row.get(0),
        )?;
        let oldest: Option<chrono::NaiveDateTime> = conn.query_row(
            "SELECT MIN(submitted_at) FROM requests
             WHERE status = 'queued' AND (?1 IS NULL OR channel_id = ?1)",
            [channel_id],
            |row| row.get(0),
        )?;
        metrics.oldest_waiting_minutes = parse_timestamp(oldest)
            .map(|submitted| (Utc::now() - submitted).num_seconds().max(0) as f64 / 60.0);
        Ok(metrics)
    }

    pub fn purge_terminal(&self, older_than: Duration) -> RequestResult<usize> {
        let conn = self.open()?;
        let cutoff = (Utc::now() - older_than).naive_utc();
        let affected = conn.execute(
            "DELETE FROM requests
             WHERE status IN ('rate_limited', 'rejected', 'generation_failed', 'played', 'skipped')
               AND COALESCE(play_finished_at, generation_finished_at, moderated_at, submitted_at) < ?1",
            [cutoff],
        )?;
        Ok(affected as usize)
    }

    pub fn audit_stuck(
        &self,
        now: DateTime<Utc>,
        generating_stale: Duration,
        review_stale: Duration,
    ) -> RequestResult<Vec<StuckFinding>> {
        let conn = self.open()?;
        let mut findings = Vec::new();
        let mut stmt = conn.prepare(
            "SELECT request_id, channel_id, status, generation_started_at, moderated_at,
                    submitted_at
             FROM requests WHERE status IN ('generating', 'flagged')",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<chrono::NaiveDateTime>>(3)?,
                row.get::<_, Option<chrono::NaiveDateTime>>(4)?,
                row.get::<_, Option<chrono::NaiveDateTime>>(5)?,
            ))
        })?;
        for row in rows {
            let (request_id, channel_id, status, started, moderated, submitted) = row?;
            let (kind, reference, threshold) = if status == "generating" {
                (StuckKind::GenerationStale, started.or(submitted), generating_stale)
            } else {
                (StuckKind::ReviewStale, moderated.or(submitted), review_stale)
            };
            let Some(reference) = parse_timestamp(reference) else {
                continue;
            };
            let age = now - reference;
            if age > threshold {
                findings.push(StuckFinding {
                    request_id,
                    channel_id,
                    kind,
                    age_minutes: age.num_seconds() as f64 / 60.0,
                });
            }
        }
        Ok(findings)
    }

    pub fn export_audit(&self, output: impl AsRef<Path>) -> RequestResult<()> {
        let output = output.as_ref();
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT request_id, user_id, channel_id, stage, verdict, matched_rule, scores,
                    created_at
             FROM moderation_audit ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(AuditRecord {
                request_id: row.get(0)?,
                user_id: row.get(1)?,
                channel_id: row.get(2)?,
                stage: row.get(3)?,
                verdict: row.get(4)?,
                matched_rule: row.get(5)?,
                scores: row.get(6)?,
                created_at: parse_timestamp(row.get(7)?),
            })
        })?;
        let file = File::create(output)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        for record in rows {
            let record = record?;
            let line = serde_json::to_string(&record).map_err(|err| {
                RequestError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
            })?;
            encoder.write_all(line.as_bytes())?;
            encoder.write_all(b"\n")?;
        }
        encoder.finish()?;
        Ok(())
    }

    pub fn backup_to(&self, destination: impl AsRef<Path>) -> RequestResult<()> {
        let destination_path = destination.as_ref();
        let source = self.open()?;
        let mut dest = Connection::open(destination_path)?;
        configure_connection(&dest).map_err(|source| RequestError::Open {
            source,
            path: destination_path.to_path_buf(),
        })?;
        let backup = Backup::new(&source, &mut dest)?;
        backup.run_to_completion(10, StdDuration::from_millis(50), None)?;
        Ok(())
    }
}

fn fetch_in_tx(conn: &Connection, request_id: &str) -> RequestResult<RequestEntry> {
    let mut stmt = conn.prepare("SELECT * FROM requests WHERE request_id = ?1")?;
    stmt.query_row([request_id], |row| RequestEntry::from_row(row))
        .optional()?
        .ok_or_else(|| RequestError::NotFound(request_id.to_string()))
}

fn transition_in_tx(
    conn: &Connection,
    request_id: &str,
    to: RequestStatus,
    reason: Option<&str>,
) -> RequestResult<()> {
    let entry = fetch_in_tx(conn, request_id)?;
    if !entry.status.can_transition(to) {
        return Err(RequestError::TransitionRejected {
            request_id: request_id.to_string(),
            from: entry.status,
            to,
        });
    }
    let timestamp_column = match to {
        RequestStatus::Rejected | RequestStatus::Flagged => Some("moderated_at"),
        RequestStatus::Queued => Some("queued_at"),
        RequestStatus::Generating => Some("generation_started_at"),
        RequestStatus::Completed | RequestStatus::GenerationFailed => {
            Some("generation_finished_at")
        }
        RequestStatus::Playing => Some("play_started_at"),
        RequestStatus::Played | RequestStatus::Skipped => Some("play_finished_at"),
        _ => None,
    };
    let set_timestamp = timestamp_column
        .map(|column| format!(", {column} = CURRENT_TIMESTAMP"))
        .unwrap_or_default();
    conn.execute(
        &format!(
            "UPDATE requests SET status = ?2,
                verdict_reason = COALESCE(?3, verdict_reason){set_timestamp}
             WHERE request_id = ?1"
        ),
        params![request_id, to.as_str(), reason],
    )?;
    Ok(())
}
