mod classifier;
mod filter;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;
use tracing::warn;

use crate::config::ModerationSection;
use crate::request::{Channel, ChannelStrictness};
use crate::reputation::ViolationSeverity;

pub use classifier::{CategoryScores, Classifier, ClassifierError, ClassifyRequest, HttpClassifier};
pub use filter::{FilterMatch, LocalFilter};

pub const STAGE_LOCAL_FILTER: &str = "local_filter";
pub const STAGE_CLASSIFIER: &str = "classifier";

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("invalid blocklist pattern {pattern}: {source}")]
    Pattern {
        pattern: String,
        source: regex::Error,
    },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Admit,
    Flag,
    Reject,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Admit => "admit",
            Verdict::Flag => "flag",
            Verdict::Reject => "reject",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one `evaluate` call. `stage` names the stage that decided,
/// `matched_rule`/`scores` carry whatever evidence that stage produced.
#[derive(Debug, Clone)]
pub struct ModerationOutcome {
    pub verdict: Verdict,
    pub stage: &'static str,
    pub reason: String,
    pub matched_rule: Option<String>,
    pub severity: Option<ViolationSeverity>,
    pub scores: Option<CategoryScores>,
}

impl ModerationOutcome {
    fn reject_local(hit: FilterMatch) -> Self {
        Self {
            verdict: Verdict::Reject,
            stage: STAGE_LOCAL_FILTER,
            reason: "blocked by station filter".to_string(),
            matched_rule: Some(hit.rule),
            severity: Some(hit.severity),
            scores: None,
        }
    }
}

/// Two-stage content check. Stage one is the deterministic local blocklist;
/// a hit short-circuits to reject without spending the external call. Stage
/// two asks the external classifier and compares category scores against
/// the channel's strictness threshold. An unreachable or slow classifier
/// yields `Flag`, never `Admit` — unmoderated content must not slip through
/// because a dependency is down.
pub struct ModerationPipeline {
    filter: LocalFilter,
    classifier: Arc<dyn Classifier>,
    deadline: Duration,
    flag_margin: f64,
    relaxed_threshold: f64,
    standard_threshold: f64,
    strict_threshold: f64,
}

impl ModerationPipeline {
    pub fn new(
        config: &ModerationSection,
        classifier: Arc<dyn Classifier>,
    ) -> Result<Self, ModerationError> {
        Ok(Self {
            filter: LocalFilter::from_config(config)?,
            classifier,
            deadline: Duration::from_millis(config.classifier_timeout_ms),
            flag_margin: config.flag_margin,
            relaxed_threshold: config.relaxed_threshold,
            standard_threshold: config.standard_threshold,
            strict_threshold: config.strict_threshold,
        })
    }

    pub async fn evaluate(&self, prompt: &str, channel: &Channel) -> ModerationOutcome {
        if let Some(hit) = self.filter.check(prompt) {
            return ModerationOutcome::reject_local(hit);
        }

        let request = ClassifyRequest {
            prompt: prompt.to_string(),
            channel_id: channel.channel_id.clone(),
        };
        let scores = match timeout(self.deadline, self.classifier.classify(request)).await {
            Ok(Ok(scores)) => scores,
            Ok(Err(err)) => {
                warn!(target: "moderation", channel = %channel.channel_id, "classifier error: {err}");
                return self.fail_closed();
            }
            Err(_) => {
                warn!(target: "moderation", channel = %channel.channel_id, "classifier deadline exceeded");
                return self.fail_closed();
            }
        };

        self.judge(scores, channel)
    }

    fn fail_closed(&self) -> ModerationOutcome {
        ModerationOutcome {
            verdict: Verdict::Flag,
            stage: STAGE_CLASSIFIER,
            reason: "classifier_unavailable".to_string(),
            matched_rule: None,
            severity: None,
            scores: None,
        }
    }

    fn judge(&self, scores: CategoryScores, channel: &Channel) -> ModerationOutcome {
        let reject_threshold = self.reject_threshold(channel.strictness);
        let flag_threshold = (reject_threshold - self.flag_margin).max(0.0);

        let mut worst: Option<(&str, f64)> = None;
        for (category, score) in &scores.scores {
            if channel.allow_explicit && category == "explicit" {
                continue;
            }
            if worst.map(|(_, s)| *score > s).unwrap_or(true) {
                worst = Some((category.as_str(), *score));
            }
        }

        match worst {
            Some((category, score)) if score >= reject_threshold => ModerationOutcome {
                verdict: Verdict::Reject,
                stage: STAGE_CLASSIFIER,
                reason: format!("category {category} over channel threshold"),
                matched_rule: Some(category.to_string()),
                severity: Some(ViolationSeverity::Medium),
                scores: Some(scores.clone()),
            },
            Some((category, score)) if score >= flag_threshold => ModerationOutcome {
                verdict: Verdict::Flag,
                stage: STAGE_CLASSIFIER,
                reason: format!("category {category} borderline, held for review"),
                matched_rule: Some(category.to_string()),
                severity: None,
                scores: Some(scores.clone()),
            },
            _ => ModerationOutcome {
                verdict: Verdict::Admit,
                stage: STAGE_CLASSIFIER,
                reason: "clean".to_string(),
                matched_rule: None,
                severity: None,
                scores: Some(scores),
            },
        }
    }

    fn reject_threshold(&self, strictness: ChannelStrictness) -> f64 {
        match strictness {
            ChannelStrictness::Relaxed => self.relaxed_threshold,
            ChannelStrictness::Standard => self.standard_threshold,
            ChannelStrictness::Strict => self.strict_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedClassifier(CategoryScores);

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify(
            &self,
            _request: ClassifyRequest,
        ) -> Result<CategoryScores, ClassifierError> {
            Ok(self.0.clone())
        }
    }

    struct DownClassifier;

    #[async_trait]
    impl Classifier for DownClassifier {
        async fn classify(
            &self,
            _request: ClassifyRequest,
        ) -> Result<CategoryScores, ClassifierError> {
            Err(ClassifierError::Status(503))
        }
    }

    fn section() -> ModerationSection {
        ModerationSection {
            blocked_terms: vec!["doxx".to_string()],
            blocked_patterns: vec![],
            classifier_endpoint: String::new(),
            classifier_timeout_ms: 200,
            flag_margin: 0.15,
            relaxed_threshold: 0.85,
            standard_threshold: 0.70,
            strict_threshold: 0.50,
        }
    }

    fn channel(strictness: ChannelStrictness) -> Channel {
        let mut channel = Channel::new("main", "Main");
        channel.strictness = strictness;
        channel
    }

    #[tokio::test]
    async fn local_hit_short_circuits_before_classifier() {
        let pipeline = ModerationPipeline::new(
            &section(),
            Arc::new(FixedClassifier(CategoryScores::single("hate", 0.99))),
        )
        .unwrap();
        let outcome = pipeline
            .evaluate("doxx them", &channel(ChannelStrictness::Standard))
            .await;
        assert_eq!(outcome.verdict, Verdict::Reject);
        assert_eq!(outcome.stage, STAGE_LOCAL_FILTER);
        assert!(outcome.scores.is_none());
    }

    #[tokio::test]
    async fn strictness_moves_the_reject_threshold() {
        let scores = CategoryScores::single("violence", 0.60);
        let pipeline =
            ModerationPipeline::new(&section(), Arc::new(FixedClassifier(scores))).unwrap();
        let strict = pipeline
            .evaluate("prompt", &channel(ChannelStrictness::Strict))
            .await;
        assert_eq!(strict.verdict, Verdict::Reject);
        let standard = pipeline
            .evaluate("prompt", &channel(ChannelStrictness::Standard))
            .await;
        assert_eq!(standard.verdict, Verdict::Flag);
        let relaxed = pipeline
            .evaluate("prompt", &channel(ChannelStrictness::Relaxed))
            .await;
        assert_eq!(relaxed.verdict, Verdict::Admit);
    }

    #[tokio::test]
    async fn explicit_category_respects_channel_allowance() {
        let scores = CategoryScores::single("explicit", 0.95);
        let pipeline =
            ModerationPipeline::new(&section(), Arc::new(FixedClassifier(scores))).unwrap();
        let mut allowing = channel(ChannelStrictness::Standard);
        allowing.allow_explicit = true;
        let outcome = pipeline.evaluate("prompt", &allowing).await;
        assert_eq!(outcome.verdict, Verdict::Admit);

        let blocking = channel(ChannelStrictness::Standard);
        let outcome = pipeline.evaluate("prompt", &blocking).await;
        assert_eq!(outcome.verdict, Verdict::Reject);
    }

    #[tokio::test]
    async fn unreachable_classifier_fails_closed() {
        let pipeline = ModerationPipeline::new(&section(), Arc::new(DownClassifier)).unwrap();
        let outcome = pipeline
            .evaluate("prompt", &channel(ChannelStrictness::Standard))
            .await;
        assert_eq!(outcome.verdict, Verdict::Flag);
        assert_eq!(outcome.reason, "classifier_unavailable");
    }
}
