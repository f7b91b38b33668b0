use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::config::ReputationSection;
use crate::request::models::parse_timestamp;
use crate::sqlite::configure_connection;

const USER_SCHEMA: &str = include_str!("../../sql/users.sql");

#[derive(Debug, Error)]
pub enum ReputationError {
    #[error("failed to open station database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on station database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("user not found: {0}")]
    UserNotFound(String),
    #[error("stored reputation for {user_id} is out of range: {score}")]
    ScoreOutOfRange { user_id: String, score: i64 },
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
}

pub type ReputationResult<T> = Result<T, ReputationError>;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BanState {
    None,
    Timed,
    Permanent,
}

impl BanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BanState::None => "none",
            BanState::Timed => "timed",
            BanState::Permanent => "permanent",
        }
    }
}

impl fmt::Display for BanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BanState {
    type Err = ReputationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(BanState::None),
            "timed" => Ok(BanState::Timed),
            "permanent" => Ok(BanState::Permanent),
            other => Err(ReputationError::InvalidValue(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ViolationSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationSeverity::Low => "low",
            ViolationSeverity::Medium => "medium",
            ViolationSeverity::High => "high",
            ViolationSeverity::Critical => "critical",
        }
    }

    /// Weight toward the rolling strike count. Low-severity records are
    /// kept for the audit trail but never escalate a ban on their own.
    pub fn strike_weight(&self) -> i64 {
        match self {
            ViolationSeverity::Low => 0,
            ViolationSeverity::Medium | ViolationSeverity::High => 1,
            ViolationSeverity::Critical => 2,
        }
    }
}

impl fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViolationSeverity {
    type Err = ReputationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(ViolationSeverity::Low),
            "medium" => Ok(ViolationSeverity::Medium),
            "high" => Ok(ViolationSeverity::High),
            "critical" => Ok(ViolationSeverity::Critical),
            other => Err(ReputationError::InvalidValue(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReputationEventKind {
    CompletedPlay,
    UpvoteReceived,
    DownvoteReceived,
    Violation,
    ManualAdjust,
}

impl ReputationEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReputationEventKind::CompletedPlay => "completed_play",
            ReputationEventKind::UpvoteReceived => "upvote_received",
            ReputationEventKind::DownvoteReceived => "downvote_received",
            ReputationEventKind::Violation => "violation",
            ReputationEventKind::ManualAdjust => "manual_adjust",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    pub user_id: String,
    pub platform: Option<String>,
    pub reputation: i64,
    pub premium: bool,
    pub ban_state: BanState,
    pub ban_until: Option<DateTime<Utc>>,
    pub total_requests: i64,
    pub completed_plays: i64,
    pub upvotes_received: i64,
    pub downvotes_received: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl UserRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get("user_id")?,
            platform: row.get("platform")?,
            reputation: row.get("reputation")?,
            premium: row.get::<_, i64>("premium")? != 0,
            ban_state: row
                .get::<_, String>("ban_state")?
                .parse()
                .unwrap_or(BanState::None),
            ban_until: parse_timestamp(row.get("ban_until")?),
            total_requests: row.get("total_requests")?,
            completed_plays: row.get("completed_plays")?,
            upvotes_received: row.get("upvotes_received")?,
            downvotes_received: row.get("downvotes_received")?,
            created_at: parse_timestamp(row.get("created_at")?),
            updated_at: parse_timestamp(row.get("updated_at")?),
        })
    }

    pub fn ban_active(&self, now: DateTime<Utc>) -> bool {
        match self.ban_state {
            BanState::Permanent => true,
            BanState::Timed => self.ban_until.map(|until| until > now).unwrap_or(false),
            BanState::None => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ViolationRecord {
    pub id: i64,
    pub user_id: String,
    pub channel_id: Option<String>,
    pub request_id: Option<String>,
    pub severity: ViolationSeverity,
    pub timeout_until: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BanOutcome {
    pub state: BanState,
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserStanding {
    pub user_id: String,
    pub reputation: i64,
    pub ban_state: BanState,
    pub ban_until: Option<DateTime<Utc>>,
    pub strike_weight_in_window: i64,
    pub active_timeout_until: Option<DateTime<Utc>>,
}

/// Bounded per-user trust score plus the violation ledger that drives ban
/// escalation. Score writes run inside an IMMEDIATE transaction so
/// concurrent events on one user cannot lose updates; ban thresholds are
/// checked synchronously when a violation lands, not on a poll.
#[derive(Debug, Clone)]
pub struct ReputationManager {
    path: PathBuf,
    flags: OpenFlags,
    config: ReputationSection,
}

impl ReputationManager {
    pub fn new(path: impl AsRef<Path>, config: &ReputationSection) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
            config: config.clone(),
        }
    }

    fn open(&self) -> ReputationResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            ReputationError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| ReputationError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> ReputationResult<()> {
        let conn = self.open()?;
        conn.execute_batch(USER_SCHEMA)?;
        Ok(())
    }

    /// Fetches the user, creating the row on first contact. An expired
    /// timed ban is cleared here so the next submission sees a clean slate.
    pub fn ensure_user(
        &self,
        user_id: &str,
        platform: Option<&str>,
    ) -> ReputationResult<UserRecord> {
        let conn = self.open()?;
        conn.execute(
            "INSERT OR IGNORE INTO users (user_id, platform, reputation)
             VALUES (?1, ?2, ?3)",
            params![user_id, platform, self.config.initial_score],
        )?;
        let user = self.fetch_user_on(&conn, user_id)?;
        if user.ban_state == BanState::Timed && !user.ban_active(Utc::now()) {
            conn.execute(
                "UPDATE users SET ban_state = 'none', ban_until = NULL,
                     updated_at = CURRENT_TIMESTAMP
                 WHERE user_id = ?1",
                [user_id],
            )?;
            return self.fetch_user_on(&conn, user_id);
        }
        Ok(user)
    }

    pub fn fetch_user(&self, user_id: &str) -> ReputationResult<Option<UserRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM users WHERE user_id = ?1")?;
        let user = stmt
            .query_row([user_id], |row| UserRecord::from_row(row))
            .optional()?;
        Ok(user)
    }

    fn fetch_user_on(&self, conn: &Connection, user_id: &str) -> ReputationResult<UserRecord> {
        let mut stmt = conn.prepare("SELECT * FROM users WHERE user_id = ?1")?;
        stmt.query_row([user_id], |row| UserRecord::from_row(row))
            .optional()?
            .ok_or_else(|| ReputationError::UserNotFound(user_id.to_string()))
    }

    pub fn set_premium(&self, user_id: &str, premium: bool) -> ReputationResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE users SET premium = ?2, updated_at = CURRENT_TIMESTAMP WHERE user_id = ?1",
            params![user_id, premium as i64],
        )?;
        if affected == 0 {
            return Err(ReputationError::UserNotFound(user_id.to_string()));
        }
        Ok(())
    }

    pub fn note_request(&self, user_id: &str) -> ReputationResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE users SET total_requests = total_requests + 1,
                 updated_at = CURRENT_TIMESTAMP
             WHERE user_id = ?1",
            [user_id],
        )?;
        Ok(())
    }

    pub fn note_votes(&self, user_id: &str, upvotes: i64, downvotes: i64) -> ReputationResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE users SET upvotes_received = upvotes_received + ?2,
                 downvotes_received = downvotes_received + ?3,
                 updated_at = CURRENT_TIMESTAMP
             WHERE user_id = ?1",
            params![user_id, upvotes.max(0), downvotes.max(0)],
        )?;
        Ok(())
    }

    /// Applies one scoring event: clamps the new score to the configured
    /// bounds, bumps the matching counter, and appends the delta record.
    /// A stored score already outside the bounds is an invariant breach —
    /// surfaced as an error, never papered over by the clamp.
    pub fn apply(
        &self,
        user_id: &str,
        kind: ReputationEventKind,
        magnitude: i64,
    ) -> ReputationResult<i64> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: i64 = tx
            .query_row(
                "SELECT reputation FROM users WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| ReputationError::UserNotFound(user_id.to_string()))?;
        if current < self.config.min_score || current > self.config.max_score {
            error!(target: "reputation", user = user_id, score = current, "stored score out of range");
            return Err(ReputationError::ScoreOutOfRange {
                user_id: user_id.to_string(),
                score: current,
            });
        }
        let next = (current + magnitude).clamp(self.config.min_score, self.config.max_score);
        let counter_update = match kind {
            ReputationEventKind::CompletedPlay => ", completed_plays = completed_plays + 1",
            _ => "",
        };
        tx.execute(
            &format!(
                "UPDATE users SET reputation = ?2, updated_at = CURRENT_TIMESTAMP{counter_update}
                 WHERE user_id = ?1"
            ),
            params![user_id, next],
        )?;
        tx.execute(
            "INSERT INTO reputation_events (user_id, kind, delta, score_after)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, kind.as_str(), next - current, next],
        )?;
        tx.commit()?;
        Ok(next)
    }

    /// Records an immutable violation and synchronously evaluates the ban
    /// thresholds, so an abusive user is blocked before their next
    /// submission. Returns the resulting ban, if one was imposed.
    pub fn record_violation(
        &self,
        user_id: &str,
        channel_id: Option<&str>,
        request_id: Option<&str>,
        severity: ViolationSeverity,
    ) -> ReputationResult<Option<BanOutcome>> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO violations (user_id, channel_id, request_id, severity)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, channel_id, request_id, severity.as_str()],
        )?;
        drop(conn);
        self.apply(
            user_id,
            ReputationEventKind::Violation,
            self.config.violation_delta,
        )?;
        let outcome = self.check_ban_threshold(user_id)?;
        if let Some(ban) = &outcome {
            warn!(
                target: "reputation",
                user = user_id,
                state = %ban.state,
                "violation threshold crossed"
            );
        }
        Ok(outcome)
    }

    /// Severity-weighted strikes inside the rolling window versus the
    /// configured thresholds. Timed bans double in length for every strike
    /// past the threshold.
    pub fn check_ban_threshold(&self, user_id: &str) -> ReputationResult<Option<BanOutcome>> {
        let now = Utc::now();
        let strikes = self.strike_weight_in_window(user_id, now)?;
        let conn = self.open()?;
        if strikes >= self.config.permanent_ban_strikes {
            conn.execute(
                "UPDATE users SET ban_state = 'permanent', ban_until = NULL,
                     updated_at = CURRENT_TIMESTAMP
                 WHERE user_id = ?1",
                [user_id],
            )?;
            return Ok(Some(BanOutcome {
                state: BanState::Permanent,
                until: None,
            }));
        }
        if strikes >= self.config.timed_ban_strikes {
            let over = (strikes - self.config.timed_ban_strikes).min(16) as u32;
            let minutes = self.config.timed_ban_base_minutes.saturating_mul(1 << over);
            let until = now + Duration::minutes(minutes);
            conn.execute(
                "UPDATE users SET ban_state = 'timed', ban_until = ?2,
                     updated_at = CURRENT_TIMESTAMP
                 WHERE user_id = ?1",
                params![user_id, until.naive_utc()],
            )?;
            conn.execute(
                "UPDATE violations SET timeout_until = ?2
                 WHERE id = (SELECT MAX(id) FROM violations WHERE user_id = ?1)",
                params![user_id, until.naive_utc()],
            )?;
            return Ok(Some(BanOutcome {
                state: BanState::Timed,
                until: Some(until),
            }));
        }
        Ok(None)
    }

    fn strike_weight_in_window(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> ReputationResult<i64> {
        let cutoff = (now - Duration::days(self.config.strike_window_days)).naive_utc();
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT severity FROM violations WHERE user_id = ?1 AND created_at >= ?2",
        )?;
        let mut total = 0;
        let rows = stmt.query_map(params![user_id, cutoff], |row| row.get::<_, String>(0))?;
        for severity in rows {
            let severity: ViolationSeverity = severity?
                .parse()
                .unwrap_or(ViolationSeverity::Medium);
            total += severity.strike_weight();
        }
        Ok(total)
    }

    pub fn list_violations(&self, user_id: &str) -> ReputationResult<Vec<ViolationRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, channel_id, request_id, severity, timeout_until, created_at
             FROM violations WHERE user_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map([user_id], |row| {
                Ok(ViolationRecord {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    channel_id: row.get(2)?,
                    request_id: row.get(3)?,
                    severity: row
                        .get::<_, String>(4)?
                        .parse()
                        .unwrap_or(ViolationSeverity::Medium),
                    timeout_until: parse_timestamp(row.get(5)?),
                    created_at: parse_timestamp(row.get(6)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn standing(&self, user_id: &str) -> ReputationResult<UserStanding> {
        let now = Utc::now();
        let conn = self.open()?;
        let user = self.fetch_user_on(&conn, user_id)?;
        drop(conn);
        let strikes = self.strike_weight_in_window(user_id, now)?;
        let active_timeout = self
            .list_violations(user_id)?
            .into_iter()
            .filter_map(|violation| violation.timeout_until)
            .filter(|until| *until > now)
            .max();
        Ok(UserStanding {
            user_id: user.user_id,
            reputation: user.reputation,
            ban_state: user.ban_state,
            ban_until: user.ban_until,
            strike_weight_in_window: strikes,
            active_timeout_until: active_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &Path) -> ReputationManager {
        let config = ReputationSection {
            min_score: 0,
            max_score: 100,
            initial_score: 50,
            completed_play_delta: 2,
            upvote_delta: 1,
            downvote_delta: -1,
            violation_delta: -10,
            strike_window_days: 7,
            timed_ban_strikes: 3,
            permanent_ban_strikes: 6,
            timed_ban_base_minutes: 60,
        };
        let manager = ReputationManager::new(dir.join("station.sqlite"), &config);
        manager.initialize().expect("initialize reputation store");
        manager
    }

    #[test]
    fn score_stays_inside_bounds() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        manager.ensure_user("user-a", None).unwrap();
        let score = manager
            .apply("user-a", ReputationEventKind::ManualAdjust, 500)
            .unwrap();
        assert_eq!(score, 100);
        let score = manager
            .apply("user-a", ReputationEventKind::ManualAdjust, -500)
            .unwrap();
        assert_eq!(score, 0);
    }

    #[test]
    fn three_high_violations_trigger_a_timed_ban() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        manager.ensure_user("user-b", None).unwrap();
        for _ in 0..2 {
            let outcome = manager
                .record_violation("user-b", Some("main"), None, ViolationSeverity::High)
                .unwrap();
            assert!(outcome.is_none());
        }
        let outcome = manager
            .record_violation("user-b", Some("main"), None, ViolationSeverity::High)
            .unwrap()
            .expect("third high violation should ban");
        assert_eq!(outcome.state, BanState::Timed);
        assert!(outcome.until.is_some());
        let user = manager.fetch_user("user-b").unwrap().unwrap();
        assert!(user.ban_active(Utc::now()));
    }

    #[test]
    fn critical_violations_escalate_twice_as_fast() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        manager.ensure_user("user-c", None).unwrap();
        manager
            .record_violation("user-c", None, None, ViolationSeverity::Critical)
            .unwrap();
        let outcome = manager
            .record_violation("user-c", None, None, ViolationSeverity::Critical)
            .unwrap();
        assert!(outcome.is_some());
    }

    #[test]
    fn low_severity_never_strikes() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        manager.ensure_user("user-d", None).unwrap();
        for _ in 0..10 {
            let outcome = manager
                .record_violation("user-d", None, None, ViolationSeverity::Low)
                .unwrap();
            assert!(outcome.is_none());
        }
    }

    #[test]
    fn repeated_strikes_reach_permanent() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        manager.ensure_user("user-e", None).unwrap();
        let mut last = None;
        for _ in 0..6 {
            last = manager
                .record_violation("user-e", None, None, ViolationSeverity::High)
                .unwrap();
        }
        assert_eq!(last.unwrap().state, BanState::Permanent);
    }

    #[test]
    fn events_append_delta_records() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        manager.ensure_user("user-f", None).unwrap();
        manager
            .apply("user-f", ReputationEventKind::UpvoteReceived, 1)
            .unwrap();
        manager.note_votes("user-f", 1, 0).unwrap();
        let user = manager.fetch_user("user-f").unwrap().unwrap();
        assert_eq!(user.reputation, 51);
        assert_eq!(user.upvotes_received, 1);
    }

    #[test]
    fn completed_play_bumps_the_play_counter() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        manager.ensure_user("user-g", None).unwrap();
        manager
            .apply("user-g", ReputationEventKind::CompletedPlay, 2)
            .unwrap();
        let user = manager.fetch_user("user-g").unwrap().unwrap();
        assert_eq!(user.completed_plays, 1);
        assert_eq!(user.reputation, 52);
    }
}
