use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::config::PrioritySection;
use crate::request::{
    RequestEntry, RequestError, RequestResult, ScheduleCandidate, SqliteRequestStore,
};

/// Scoring weights, lifted from the `[priority]` config section. The exact
/// magnitudes are station policy; the scheduler only relies on every term
/// being monotone in its input.
#[derive(Debug, Clone)]
pub struct ScorePolicy {
    pub base_weight: f64,
    pub reputation_weight: f64,
    pub vote_weight: f64,
    pub premium_bonus: f64,
    pub wait_slope_per_minute: f64,
    pub fairness_bonus: f64,
    pub fairness_decay: f64,
}

impl ScorePolicy {
    pub fn from_priority_config(config: &PrioritySection) -> Self {
        Self {
            base_weight: config.base_weight,
            reputation_weight: config.reputation_weight,
            vote_weight: config.vote_weight,
            premium_bonus: config.premium_bonus,
            wait_slope_per_minute: config.wait_slope_per_minute,
            fairness_bonus: config.fairness_bonus,
            fairness_decay: config.fairness_decay,
        }
    }
}

/// Pure scoring function. Monotone non-decreasing in base priority,
/// reputation, net votes, premium and wait time; the wait term is unbounded
/// so no finite static advantage can starve a waiting entry forever. The
/// fairness term is largest for users with no completed plays and decays
/// toward zero as their play count grows.
pub fn compute_priority(
    policy: &ScorePolicy,
    candidate: &ScheduleCandidate,
    now: DateTime<Utc>,
) -> f64 {
    let entry = &candidate.entry;
    let base = policy.base_weight * entry.base_priority as f64;
    let reputation = policy.reputation_weight * candidate.reputation as f64;
    let votes = policy.vote_weight * entry.net_votes() as f64;
    let premium = if candidate.premium {
        policy.premium_bonus
    } else {
        0.0
    };
    let wait = policy.wait_slope_per_minute * entry.waiting_minutes(now);
    let fairness =
        policy.fairness_bonus / (1.0 + policy.fairness_decay * candidate.completed_plays as f64);
    base + reputation + votes + premium + wait + fairness
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    store: SqliteRequestStore,
    policy: ScorePolicy,
}

impl Scheduler {
    pub fn new(store: SqliteRequestStore, policy: ScorePolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &SqliteRequestStore {
        &self.store
    }

    /// Makes an admitted entry visible to the pop set and scores the whole
    /// channel so the new entry lands in the right place.
    pub fn enqueue(&self, request_id: &str) -> RequestResult<()> {
        let entry = self
            .store
            .fetch(request_id)?
            .ok_or_else(|| RequestError::NotFound(request_id.to_string()))?;
        self.store
            .transition(request_id, crate::request::RequestStatus::Queued, None)?;
        self.recompute(&entry.channel_id)?;
        Ok(())
    }

    /// Re-scores every waiting entry of the channel and persists the
    /// computed priorities. Scores depend on wait time, so this runs before
    /// every peek/pop rather than only at insertion.
    pub fn recompute(&self, channel_id: &str) -> RequestResult<Vec<(String, f64)>> {
        let now = Utc::now();
        let mut candidates = self.store.fetch_candidates(channel_id)?;
        candidates.sort_by(|a, b| compare_candidates(&self.policy, a, b, now));
        let ranked: Vec<(String, f64)> = candidates
            .iter()
            .map(|candidate| {
                (
                    candidate.entry.request_id.clone(),
                    compute_priority(&self.policy, candidate, now),
                )
            })
            .collect();
        self.store.update_priorities(&ranked)?;
        Ok(ranked)
    }

    pub fn peek_next(&self, channel_id: &str) -> RequestResult<Option<RequestEntry>> {
        let ranked = self.recompute(channel_id)?;
        match ranked.first() {
            Some((request_id, _)) => self.store.fetch(request_id),
            None => Ok(None),
        }
    }

    /// Pops the highest-priority ready entry, or `None` for an empty
    /// channel. The claim is a compare-and-swap on the status column, so
    /// concurrent pops never hand out the same entry twice; a caller that
    /// loses a claim race simply moves on to the next candidate.
    pub fn pop_next(&self, channel_id: &str) -> RequestResult<Option<RequestEntry>> {
        let ranked = self.recompute(channel_id)?;
        for (request_id, _) in ranked {
            if self.store.claim(&request_id)? {
                return self.store.fetch(&request_id);
            }
        }
        Ok(None)
    }

    pub fn snapshot(&self, channel_id: &str) -> RequestResult<Vec<RequestEntry>> {
        self.recompute(channel_id)?;
        self.store.snapshot(channel_id)
    }
}

fn compare_candidates(
    policy: &ScorePolicy,
    a: &ScheduleCandidate,
    b: &ScheduleCandidate,
    now: DateTime<Utc>,
) -> Ordering {
    let score_a = compute_priority(policy, a, now);
    let score_b = compute_priority(policy, b, now);
    score_b
        .partial_cmp(&score_a)
        .unwrap_or(Ordering::Equal)
        .then_with(|| match (a.entry.submitted_at, b.entry.submitted_at) {
            (Some(a_ts), Some(b_ts)) => a_ts.cmp(&b_ts),
            _ => Ordering::Equal,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{NewRequest, RequestEntry, RequestStatus};
    use chrono::Duration;

    fn policy() -> ScorePolicy {
        ScorePolicy {
            base_weight: 2.0,
            reputation_weight: 0.5,
            vote_weight: 1.5,
            premium_bonus: 15.0,
            wait_slope_per_minute: 1.0,
            fairness_bonus: 25.0,
            fairness_decay: 0.5,
        }
    }

    fn candidate(reputation: i64, premium: bool, plays: i64) -> ScheduleCandidate {
        let request = NewRequest {
            user_id: "user".into(),
            channel_id: "main".into(),
            prompt: "p".into(),
            category_hint: None,
            base_priority: 3,
        };
        let entry = RequestEntry {
            request_id: "req-test".into(),
            user_id: request.user_id,
            channel_id: request.channel_id,
            prompt: request.prompt,
            category_hint: None,
            base_priority: request.base_priority,
            computed_priority: 0.0,
            status: RequestStatus::Queued,
            verdict: None,
            verdict_reason: None,
            upvotes: 0,
            downvotes: 0,
            retry_count: 0,
            artifact_ref: None,
            failure_detail: None,
            submitted_at: Some(Utc::now()),
            moderated_at: None,
            queued_at: None,
            generation_started_at: None,
            generation_finished_at: None,
            play_started_at: None,
            play_finished_at: None,
        };
        ScheduleCandidate {
            entry,
            reputation,
            premium,
            completed_plays: plays,
        }
    }

    #[test]
    fn priority_is_monotone_in_reputation() {
        let now = Utc::now();
        let low = candidate(10, false, 0);
        let high = candidate(90, false, 0);
        assert!(compute_priority(&policy(), &high, now) >= compute_priority(&policy(), &low, now));
    }

    #[test]
    fn priority_is_monotone_in_wait_time() {
        let now = Utc::now();
        let fresh = candidate(50, false, 0);
        let mut stale = candidate(50, false, 0);
        stale.entry.submitted_at = Some(now - Duration::minutes(30));
        assert!(
            compute_priority(&policy(), &stale, now) > compute_priority(&policy(), &fresh, now)
        );
    }

    #[test]
    fn priority_is_monotone_in_net_votes() {
        let now = Utc::now();
        let neutral = candidate(50, false, 0);
        let mut voted = candidate(50, false, 0);
        voted.entry.upvotes = 4;
        assert!(
            compute_priority(&policy(), &voted, now) > compute_priority(&policy(), &neutral, now)
        );
    }

    #[test]
    fn fairness_bonus_decays_with_play_count() {
        let now = Utc::now();
        let newcomer = candidate(50, false, 0);
        let regular = candidate(50, false, 40);
        assert!(
            compute_priority(&policy(), &newcomer, now)
                > compute_priority(&policy(), &regular, now)
        );
    }

    #[test]
    fn wait_bonus_eventually_beats_static_advantage() {
        let now = Utc::now();
        let privileged = candidate(100, true, 0);
        let mut waiting = candidate(0, false, 40);
        waiting.entry.submitted_at = Some(now - Duration::hours(4));
        assert!(
            compute_priority(&policy(), &waiting, now)
                > compute_priority(&policy(), &privileged, now)
        );
    }

    #[test]
    fn premium_high_reputation_outranks_standard_peer() {
        let now = Utc::now();
        let standard = candidate(50, false, 5);
        let premium = candidate(90, true, 5);
        assert!(
            compute_priority(&policy(), &premium, now)
                > compute_priority(&policy(), &standard, now)
        );
    }
}
