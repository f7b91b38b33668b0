use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use super::error::RequestError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Submitted,
    RateLimited,
    ModerationPending,
    Rejected,
    Flagged,
    Queued,
    Generating,
    GenerationFailed,
    Completed,
    Playing,
    Played,
    Skipped,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Submitted => "submitted",
            RequestStatus::RateLimited => "rate_limited",
            RequestStatus::ModerationPending => "moderation_pending",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Flagged => "flagged",
            RequestStatus::Queued => "queued",
            RequestStatus::Generating => "generating",
            RequestStatus::GenerationFailed => "generation_failed",
            RequestStatus::Completed => "completed",
            RequestStatus::Playing => "playing",
            RequestStatus::Played => "played",
            RequestStatus::Skipped => "skipped",
        }
    }

    pub fn terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::RateLimited
                | RequestStatus::Rejected
                | RequestStatus::GenerationFailed
                | RequestStatus::Played
                | RequestStatus::Skipped
        )
    }

    /// Enumerated transition table. Every store write that changes a status
    /// is validated against this set; terminal states admit no successor.
    pub fn can_transition(&self, to: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (*self, to),
            (Submitted, RateLimited)
                | (Submitted, ModerationPending)
                | (ModerationPending, Rejected)
                | (ModerationPending, Flagged)
                | (ModerationPending, Queued)
                | (Flagged, Queued)
                | (Flagged, Rejected)
                | (Queued, Generating)
                | (Queued, Skipped)
                | (Generating, Completed)
                | (Generating, Queued)
                | (Generating, GenerationFailed)
                | (Completed, Playing)
                | (Completed, Skipped)
                | (Playing, Played)
                | (Playing, Skipped)
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(RequestStatus::Submitted),
            "rate_limited" => Ok(RequestStatus::RateLimited),
            "moderation_pending" => Ok(RequestStatus::ModerationPending),
            "rejected" => Ok(RequestStatus::Rejected),
            "flagged" => Ok(RequestStatus::Flagged),
            "queued" => Ok(RequestStatus::Queued),
            "generating" => Ok(RequestStatus::Generating),
            "generation_failed" => Ok(RequestStatus::GenerationFailed),
            "completed" => Ok(RequestStatus::Completed),
            "playing" => Ok(RequestStatus::Playing),
            "played" => Ok(RequestStatus::Played),
            "skipped" => Ok(RequestStatus::Skipped),
            other => Err(RequestError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStrictness {
    Relaxed,
    Standard,
    Strict,
}

impl ChannelStrictness {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStrictness::Relaxed => "relaxed",
            ChannelStrictness::Standard => "standard",
            ChannelStrictness::Strict => "strict",
        }
    }
}

impl FromStr for ChannelStrictness {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relaxed" => Ok(ChannelStrictness::Relaxed),
            "standard" => Ok(ChannelStrictness::Standard),
            "strict" => Ok(ChannelStrictness::Strict),
            other => Err(RequestError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub channel_id: String,
    pub name: String,
    pub strictness: ChannelStrictness,
    pub allow_explicit: bool,
    pub active: bool,
}

impl Channel {
    pub fn new(channel_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            name: name.into(),
            strictness: ChannelStrictness::Standard,
            allow_explicit: false,
            active: true,
        }
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            channel_id: row.get("channel_id")?,
            name: row.get("name")?,
            strictness: row
                .get::<_, String>("strictness")?
                .parse()
                .unwrap_or(ChannelStrictness::Standard),
            allow_explicit: row.get::<_, i64>("allow_explicit")? != 0,
            active: row.get::<_, i64>("active")? != 0,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewRequest {
    pub user_id: String,
    pub channel_id: String,
    pub prompt: String,
    pub category_hint: Option<String>,
    pub base_priority: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestEntry {
    pub request_id: String,
    pub user_id: String,
    pub channel_id: String,
    pub prompt: String,
    pub category_hint: Option<String>,
    pub base_priority: i64,
    pub computed_priority: f64,
    pub status: RequestStatus,
    pub verdict: Option<String>,
    pub verdict_reason: Option<String>,
    pub upvotes: i64,
    pub downvotes: i64,
    pub retry_count: i64,
    pub artifact_ref: Option<String>,
    pub failure_detail: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub moderated_at: Option<DateTime<Utc>>,
    pub queued_at: Option<DateTime<Utc>>,
    pub generation_started_at: Option<DateTime<Utc>>,
    pub generation_finished_at: Option<DateTime<Utc>>,
    pub play_started_at: Option<DateTime<Utc>>,
    pub play_finished_at: Option<DateTime<Utc>>,
}

impl RequestEntry {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            request_id: row.get("request_id")?,
            user_id: row.get("user_id")?,
            channel_id: row.get("channel_id")?,
            prompt: row.get("prompt")?,
            category_hint: row.get("category_hint")?,
            base_priority: row.get("base_priority")?,
            computed_priority: row.get("computed_priority")?,
            status: row
                .get::<_, String>("status")?
                .parse()
                .unwrap_or(RequestStatus::Submitted),
            verdict: row.get("verdict")?,
            verdict_reason: row.get("verdict_reason")?,
            upvotes: row.get("upvotes")?,
            downvotes: row.get("downvotes")?,
            retry_count: row.get("retry_count")?,
            artifact_ref: row.get("artifact_ref")?,
            failure_detail: row.get("failure_detail")?,
            submitted_at: parse_timestamp(row.get("submitted_at")?),
            moderated_at: parse_timestamp(row.get("moderated_at")?),
            queued_at: parse_timestamp(row.get("queued_at")?),
            generation_started_at: parse_timestamp(row.get("generation_started_at")?),
            generation_finished_at: parse_timestamp(row.get("generation_finished_at")?),
            play_started_at: parse_timestamp(row.get("play_started_at")?),
            play_finished_at: parse_timestamp(row.get("play_finished_at")?),
        })
    }

    pub fn net_votes(&self) -> i64 {
        self.upvotes - self.downvotes
    }

    pub fn waiting_minutes(&self, now: DateTime<Utc>) -> f64 {
        self.submitted_at
            .map(|submitted| (now - submitted).num_seconds().max(0) as f64 / 60.0)
            .unwrap_or_default()
    }
}

/// A queued entry joined with the submitter fields the scoring formula needs.
#[derive(Debug, Clone)]
pub struct ScheduleCandidate {
    pub entry: RequestEntry,
    pub reputation: i64,
    pub premium: bool,
    pub completed_plays: i64,
}

#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub channel_id: Option<String>,
    pub status: Option<RequestStatus>,
    pub user_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestMetrics {
    pub counts: HashMap<String, i64>,
    pub played_last_hour: i64,
    pub failed_last_hour: i64,
    pub oldest_waiting_minutes: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub request_id: String,
    pub user_id: String,
    pub channel_id: String,
    pub stage: String,
    pub verdict: String,
    pub matched_rule: Option<String>,
    pub scores: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StuckKind {
    GenerationStale,
    ReviewStale,
}

#[derive(Debug, Clone, Serialize)]
pub struct StuckFinding {
    pub request_id: String,
    pub channel_id: String,
    pub kind: StuckKind,
    pub age_minutes: f64,
}

pub(crate) fn parse_timestamp(value: Option<NaiveDateTime>) -> Option<DateTime<Utc>> {
    value.map(|dt| Utc.from_utc_datetime(&dt))
}
