use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use thiserror::Error;

use crate::config::RateLimitSection;
use crate::request::models::parse_timestamp;
use crate::sqlite::configure_connection;

const RATE_SCHEMA: &str = include_str!("../../sql/rate_windows.sql");

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("failed to open station database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on station database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("database path not configured")]
    MissingStore,
}

pub type RateLimitResult<T> = Result<T, RateLimitError>;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub current_count: i64,
    pub limit: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateWindow {
    pub user_id: String,
    pub channel_id: String,
    pub window_start: Option<DateTime<Utc>>,
    pub count: i64,
    pub limit_applied: i64,
}

/// Sliding-window admission gate keyed by (user, channel). Every call
/// increments the window counter, allowed or not, so hammering a rejected
/// limit only digs the hole deeper; the count resets when the window rolls
/// over. The read-modify-write runs in an IMMEDIATE transaction, which
/// serializes concurrent attempts on the same key.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    path: PathBuf,
    flags: OpenFlags,
    window: Duration,
    standard_limit: i64,
    premium_limit: i64,
}

impl RateLimiter {
    pub fn new(path: impl AsRef<Path>, config: &RateLimitSection) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
            window: Duration::seconds(config.window_seconds as i64),
            standard_limit: config.standard_limit,
            premium_limit: config.premium_limit,
        }
    }

    fn open(&self) -> RateLimitResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            RateLimitError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| RateLimitError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> RateLimitResult<()> {
        let conn = self.open()?;
        conn.execute_batch(RATE_SCHEMA)?;
        Ok(())
    }

    pub fn limit_for(&self, premium: bool) -> i64 {
        if premium {
            self.premium_limit
        } else {
            self.standard_limit
        }
    }

    pub fn try_acquire(
        &self,
        user_id: &str,
        channel_id: &str,
        premium: bool,
    ) -> RateLimitResult<RateDecision> {
        let limit = self.limit_for(premium);
        let now = Utc::now();
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<(chrono::NaiveDateTime, i64)> = tx
            .query_row(
                "SELECT window_start, count FROM rate_windows
                 WHERE user_id = ?1 AND channel_id = ?2",
                params![user_id, channel_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let count = match existing {
            Some((start, count))
                if now - parse_timestamp(Some(start)).unwrap_or(now) < self.window =>
            {
                let count = count + 1;
                tx.execute(
                    "UPDATE rate_windows SET count = ?3, limit_applied = ?4
                     WHERE user_id = ?1 AND channel_id = ?2",
                    params![user_id, channel_id, count, limit],
                )?;
                count
            }
            Some(_) => {
                tx.execute(
                    "UPDATE rate_windows SET window_start = ?3, count = 1, limit_applied = ?4
                     WHERE user_id = ?1 AND channel_id = ?2",
                    params![user_id, channel_id, now.naive_utc(), limit],
                )?;
                1
            }
            None => {
                tx.execute(
                    "INSERT INTO rate_windows (user_id, channel_id, window_start, count, limit_applied)
                     VALUES (?1, ?2, ?3, 1, ?4)",
                    params![user_id, channel_id, now.naive_utc(), limit],
                )?;
                1
            }
        };
        tx.commit()?;

        Ok(RateDecision {
            allowed: count <= limit,
            current_count: count,
            limit,
        })
    }

    pub fn current_window(
        &self,
        user_id: &str,
        channel_id: &str,
    ) -> RateLimitResult<Option<RateWindow>> {
        let conn = self.open()?;
        let window = conn
            .query_row(
                "SELECT window_start, count, limit_applied FROM rate_windows
                 WHERE user_id = ?1 AND channel_id = ?2",
                params![user_id, channel_id],
                |row| {
                    Ok(RateWindow {
                        user_id: user_id.to_string(),
                        channel_id: channel_id.to_string(),
                        window_start: parse_timestamp(row.get(0)?),
                        count: row.get(1)?,
                        limit_applied: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn limiter(dir: &Path, standard: i64) -> RateLimiter {
        let config = RateLimitSection {
            window_seconds: 3600,
            standard_limit: standard,
            premium_limit: standard * 4,
        };
        let limiter = RateLimiter::new(dir.join("station.sqlite"), &config);
        limiter.initialize().expect("initialize limiter");
        limiter
    }

    #[test]
    fn counts_every_attempt_including_rejected_ones() {
        let dir = TempDir::new().unwrap();
        let limiter = limiter(dir.path(), 3);
        for attempt in 1..=3 {
            let decision = limiter.try_acquire("user-a", "main", false).unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.current_count, attempt);
        }
        for attempt in 4..=6 {
            let decision = limiter.try_acquire("user-a", "main", false).unwrap();
            assert!(!decision.allowed);
            assert_eq!(decision.current_count, attempt);
        }
        let window = limiter.current_window("user-a", "main").unwrap().unwrap();
        assert_eq!(window.count, 6);
    }

    #[test]
    fn premium_gets_the_higher_ceiling() {
        let dir = TempDir::new().unwrap();
        let limiter = limiter(dir.path(), 2);
        for _ in 0..4 {
            let decision = limiter.try_acquire("user-p", "main", true).unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.limit, 8);
        }
        let decision = limiter.try_acquire("user-s", "main", false).unwrap();
        assert_eq!(decision.limit, 2);
    }

    #[test]
    fn windows_are_independent_per_user_and_channel() {
        let dir = TempDir::new().unwrap();
        let limiter = limiter(dir.path(), 1);
        assert!(limiter.try_acquire("user-a", "main", false).unwrap().allowed);
        assert!(!limiter.try_acquire("user-a", "main", false).unwrap().allowed);
        assert!(limiter.try_acquire("user-b", "main", false).unwrap().allowed);
        assert!(limiter.try_acquire("user-a", "late", false).unwrap().allowed);
    }
}
