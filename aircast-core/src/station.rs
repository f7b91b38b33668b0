use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::info;

use crate::config::StationConfig;
use crate::moderation::{
    Classifier, HttpClassifier, ModerationError, ModerationPipeline, Verdict,
};
use crate::ratelimit::{RateLimitError, RateLimiter};
use crate::reputation::{
    ReputationError, ReputationEventKind, ReputationManager, UserStanding, ViolationSeverity,
};
use crate::request::{
    AuditRecord, Channel, NewRequest, RequestEntry, RequestError, RequestMetrics, RequestStatus,
    SqliteRequestStore, StuckFinding,
};
use crate::schedule::{Scheduler, ScorePolicy};

/// Input-rejection outcomes of a submission. Every variant carries a
/// human-readable reason so the calling surface can explain the decision
/// without reaching into this crate's internals.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("rate limited: {current_count} of {limit} in the current window")]
    RateLimited { current_count: i64, limit: i64 },
    #[error("user is banned")]
    Banned { until: Option<DateTime<Utc>> },
    #[error("request rejected: {reason}")]
    Rejected { reason: String },
    #[error("request held for moderator review")]
    FlaggedForReview { request_id: String },
}

#[derive(Debug, Error)]
pub enum StationError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
    #[error(transparent)]
    Reputation(#[from] ReputationError),
    #[error(transparent)]
    Moderation(#[from] ModerationError),
    #[error("channel not found: {0}")]
    ChannelUnknown(String),
    #[error("channel is not accepting requests: {0}")]
    ChannelInactive(String),
}

pub type StationResult<T> = Result<T, StationError>;

#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub user_id: String,
    pub channel_id: String,
    pub prompt: String,
    pub base_priority: Option<i64>,
    pub platform: Option<String>,
    pub category_hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagDecision {
    Approve,
    Reject,
}

/// The admission and scheduling core. Wires the rate limiter, the
/// moderation pipeline, the reputation manager and the scheduler around the
/// request lifecycle store, all sharing one station database.
pub struct Station {
    config: StationConfig,
    requests: SqliteRequestStore,
    scheduler: Scheduler,
    limiter: RateLimiter,
    reputation: ReputationManager,
    moderation: ModerationPipeline,
}

impl Station {
    /// Opens the station with the HTTP classifier named in the config.
    pub fn open(config: StationConfig) -> StationResult<Self> {
        let classifier = Arc::new(HttpClassifier::new(&config.moderation.classifier_endpoint));
        Self::with_classifier(config, classifier)
    }

    /// Opens the station with an injected classifier. This is the seam the
    /// tests use to exercise the pipeline without a live dependency.
    pub fn with_classifier(
        config: StationConfig,
        classifier: Arc<dyn Classifier>,
    ) -> StationResult<Self> {
        let db_path = config.database_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(RequestError::Io)?;
        }
        let requests = SqliteRequestStore::new(&db_path)?;
        requests.initialize()?;
        let limiter = RateLimiter::new(&db_path, &config.rate_limit);
        limiter.initialize()?;
        let reputation = ReputationManager::new(&db_path, &config.reputation);
        reputation.initialize()?;
        let moderation = ModerationPipeline::new(&config.moderation, classifier)?;
        let scheduler = Scheduler::new(
            requests.clone(),
            ScorePolicy::from_priority_config(&config.priority),
        );
        Ok(Self {
            config,
            requests,
            scheduler,
            limiter,
            reputation,
            moderation,
        })
    }

    pub fn requests(&self) -> &SqliteRequestStore {
        &self.requests
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn reputation(&self) -> &ReputationManager {
        &self.reputation
    }

    /// Runs one submission through the full admission path: ban check,
    /// rate limit, duplicate supersede, moderation, enqueue. The rate gate
    /// comes first because it is the cheapest check; both gates must pass.
    pub async fn submit_request(&self, submission: Submission) -> StationResult<String> {
        let channel = self
            .requests
            .fetch_channel(&submission.channel_id)?
            .ok_or_else(|| StationError::ChannelUnknown(submission.channel_id.clone()))?;
        if !channel.active {
            return Err(StationError::ChannelInactive(channel.channel_id));
        }

        let user = self
            .reputation
            .ensure_user(&submission.user_id, submission.platform.as_deref())?;
        if user.ban_active(Utc::now()) {
            return Err(AdmissionError::Banned {
                until: user.ban_until,
            }
            .into());
        }

        let decision = self
            .limiter
            .try_acquire(&user.user_id, &channel.channel_id, user.premium)?;

        let base_priority = submission
            .base_priority
            .unwrap_or(0)
            .clamp(0, self.config.priority.max_base_priority);
        let entry = self.requests.insert(&NewRequest {
            user_id: user.user_id.clone(),
            channel_id: channel.channel_id.clone(),
            prompt: submission.prompt.clone(),
            category_hint: submission.category_hint.clone(),
            base_priority,
        })?;
        self.reputation.note_request(&user.user_id)?;

        if !decision.allowed {
            self.requests.transition(
                &entry.request_id,
                RequestStatus::RateLimited,
                Some("rate limit exceeded"),
            )?;
            return Err(AdmissionError::RateLimited {
                current_count: decision.current_count,
                limit: decision.limit,
            }
            .into());
        }

        let superseded = self.requests.supersede_pending(
            &user.user_id,
            &channel.channel_id,
            &submission.prompt,
        )?;
        if superseded > 0 {
            info!(
                target: "station",
                user = %user.user_id,
                count = superseded,
                "superseded duplicate pending submissions"
            );
        }

        self.requests
            .transition(&entry.request_id, RequestStatus::ModerationPending, None)?;
        let outcome = self.moderation.evaluate(&submission.prompt, &channel).await;
        let scores_json = outcome
            .scores
            .as_ref()
            .and_then(|scores| serde_json::to_string(&scores.scores).ok());
        self.requests.append_audit(&AuditRecord {
            request_id: entry.request_id.clone(),
            user_id: user.user_id.clone(),
            channel_id: channel.channel_id.clone(),
            stage: outcome.stage.to_string(),
            verdict: outcome.verdict.as_str().to_string(),
            matched_rule: outcome.matched_rule.clone(),
            scores: scores_json,
            created_at: None,
        })?;

        match outcome.verdict {
            Verdict::Reject => {
                self.requests.record_moderation(
                    &entry.request_id,
                    RequestStatus::Rejected,
                    Verdict::Reject.as_str(),
                    Some(&outcome.reason),
                )?;
                let severity = outcome.severity.unwrap_or(ViolationSeverity::Medium);
                self.reputation.record_violation(
                    &user.user_id,
                    Some(&channel.channel_id),
                    Some(&entry.request_id),
                    severity,
                )?;
                Err(AdmissionError::Rejected {
                    reason: outcome.reason,
                }
                .into())
            }
            Verdict::Flag => {
                self.requests.record_moderation(
                    &entry.request_id,
                    RequestStatus::Flagged,
                    Verdict::Flag.as_str(),
                    Some(&outcome.reason),
                )?;
                Err(AdmissionError::FlaggedForReview {
                    request_id: entry.request_id,
                }
                .into())
            }
            Verdict::Admit => {
                self.requests.record_moderation(
                    &entry.request_id,
                    RequestStatus::Queued,
                    Verdict::Admit.as_str(),
                    None,
                )?;
                self.scheduler.recompute(&channel.channel_id)?;
                info!(
                    target: "station",
                    request = %entry.request_id,
                    channel = %channel.channel_id,
                    "request admitted"
                );
                Ok(entry.request_id)
            }
        }
    }

    /// Pull interface for the generation collaborator.
    pub fn next_ready(&self, channel_id: &str) -> StationResult<Option<RequestEntry>> {
        Ok(self.scheduler.pop_next(channel_id)?)
    }

    pub fn report_completion(
        &self,
        request_id: &str,
        success: bool,
        artifact_ref: Option<&str>,
        error_detail: Option<&str>,
    ) -> StationResult<RequestStatus> {
        let entry = self.fetch_required(request_id)?;
        let resulting = self.requests.report_generation(
            request_id,
            success,
            artifact_ref,
            error_detail,
            self.config.generation.max_retries,
        )?;
        if resulting == RequestStatus::Queued {
            info!(
                target: "station",
                request = request_id,
                retry = entry.retry_count + 1,
                "generation failed, re-queued"
            );
            self.scheduler.recompute(&entry.channel_id)?;
        }
        Ok(resulting)
    }

    pub fn mark_playing(&self, request_id: &str) -> StationResult<()> {
        Ok(self.requests.mark_playing(request_id)?)
    }

    /// The only path that produces positive reputation: a request that
    /// made it to air. Final vote tallies settle both the entry and the
    /// submitter's score.
    pub fn mark_played(
        &self,
        request_id: &str,
        final_upvotes: i64,
        final_downvotes: i64,
    ) -> StationResult<()> {
        let entry = self.fetch_required(request_id)?;
        self.requests
            .mark_played(request_id, final_upvotes, final_downvotes)?;
        let rep = &self.config.reputation;
        self.reputation.apply(
            &entry.user_id,
            ReputationEventKind::CompletedPlay,
            rep.completed_play_delta,
        )?;
        if final_upvotes > 0 {
            self.reputation.apply(
                &entry.user_id,
                ReputationEventKind::UpvoteReceived,
                rep.upvote_delta * final_upvotes,
            )?;
        }
        if final_downvotes > 0 {
            self.reputation.apply(
                &entry.user_id,
                ReputationEventKind::DownvoteReceived,
                rep.downvote_delta * final_downvotes,
            )?;
        }
        self.reputation
            .note_votes(&entry.user_id, final_upvotes, final_downvotes)?;
        Ok(())
    }

    pub fn skip(&self, request_id: &str, reason: Option<&str>) -> StationResult<()> {
        Ok(self.requests.skip(request_id, reason)?)
    }

    pub fn record_vote(&self, request_id: &str, upvote: bool) -> StationResult<()> {
        Ok(self.requests.record_vote(request_id, upvote)?)
    }

    pub fn queue_snapshot(&self, channel_id: &str) -> StationResult<Vec<RequestEntry>> {
        Ok(self.scheduler.snapshot(channel_id)?)
    }

    pub fn user_standing(&self, user_id: &str) -> StationResult<UserStanding> {
        Ok(self.reputation.standing(user_id)?)
    }

    pub fn list_flagged(&self, channel_id: Option<&str>) -> StationResult<Vec<RequestEntry>> {
        Ok(self.requests.list_flagged(channel_id)?)
    }

    /// Human review of a flagged entry: approval queues it, rejection
    /// makes it terminal and files a violation against the submitter.
    pub fn resolve_flag(
        &self,
        request_id: &str,
        decision: FlagDecision,
        reason: &str,
    ) -> StationResult<RequestStatus> {
        let entry = self.fetch_required(request_id)?;
        match decision {
            FlagDecision::Approve => {
                self.requests
                    .transition(request_id, RequestStatus::Queued, Some(reason))?;
                self.scheduler.recompute(&entry.channel_id)?;
                Ok(RequestStatus::Queued)
            }
            FlagDecision::Reject => {
                self.requests
                    .transition(request_id, RequestStatus::Rejected, Some(reason))?;
                self.reputation.record_violation(
                    &entry.user_id,
                    Some(&entry.channel_id),
                    Some(request_id),
                    ViolationSeverity::Medium,
                )?;
                Ok(RequestStatus::Rejected)
            }
        }
    }

    /// Abandons a submission still waiting on moderation, e.g. when the
    /// caller resubmitted. Rate-limit increments already paid stay paid.
    pub fn abandon_request(&self, request_id: &str) -> StationResult<()> {
        self.requests
            .transition(request_id, RequestStatus::Rejected, Some("superseded"))?;
        Ok(())
    }

    pub fn upsert_channel(&self, channel: &Channel) -> StationResult<()> {
        Ok(self.requests.upsert_channel(channel)?)
    }

    pub fn fetch_channel(&self, channel_id: &str) -> StationResult<Option<Channel>> {
        Ok(self.requests.fetch_channel(channel_id)?)
    }

    pub fn metrics(&self, channel_id: Option<&str>) -> StationResult<RequestMetrics> {
        Ok(self.requests.metrics(channel_id)?)
    }

    pub fn purge_terminal(&self) -> StationResult<usize> {
        let retention = Duration::hours(self.config.storage.terminal_retention_hours as i64);
        Ok(self.requests.purge_terminal(retention)?)
    }

    pub fn audit_stuck(
        &self,
        generating_stale: Duration,
        review_stale: Duration,
    ) -> StationResult<Vec<StuckFinding>> {
        Ok(self
            .requests
            .audit_stuck(Utc::now(), generating_stale, review_stale)?)
    }

    pub fn export_audit(&self, output: impl AsRef<Path>) -> StationResult<()> {
        Ok(self.requests.export_audit(output)?)
    }

    pub fn backup_to(&self, destination: impl AsRef<Path>) -> StationResult<()> {
        Ok(self.requests.backup_to(destination)?)
    }

    fn fetch_required(&self, request_id: &str) -> StationResult<RequestEntry> {
        Ok(self
            .requests
            .fetch(request_id)?
            .ok_or_else(|| RequestError::NotFound(request_id.to_string()))?)
    }
}
