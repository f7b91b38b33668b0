use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use aircast_core::{
    AdmissionError, CategoryScores, Channel, Classifier, ClassifierError, ClassifyRequest,
    FlagDecision, GenerationSection, ModerationSection, PrioritySection, RateLimitSection,
    ReputationSection, RequestStatus, Station, StationConfig, StationError, StationSection,
    StorageSection, Submission, ViolationSeverity,
};

fn station_config(dir: &Path) -> StationConfig {
    StationConfig {
        station: StationSection {
            name: "aircast-test".into(),
            environment: "test".into(),
        },
        storage: StorageSection {
            data_dir: dir.to_string_lossy().into_owned(),
            database: "station.sqlite".into(),
            terminal_retention_hours: 168,
        },
        rate_limit: RateLimitSection {
            window_seconds: 3600,
            standard_limit: 10,
            premium_limit: 40,
        },
        priority: PrioritySection {
            base_weight: 2.0,
            reputation_weight: 0.5,
            vote_weight: 1.5,
            premium_bonus: 15.0,
            wait_slope_per_minute: 1.0,
            fairness_bonus: 25.0,
            fairness_decay: 0.5,
            max_base_priority: 10,
        },
        moderation: ModerationSection {
            blocked_terms: vec!["doxx".into()],
            blocked_patterns: vec!["(?i)\\bswat\\b".into()],
            classifier_endpoint: "http://127.0.0.1:1/unused".into(),
            classifier_timeout_ms: 200,
            flag_margin: 0.15,
            relaxed_threshold: 0.85,
            standard_threshold: 0.70,
            strict_threshold: 0.50,
        },
        reputation: ReputationSection {
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
        },
        generation: GenerationSection { max_retries: 2 },
    }
}

struct CleanClassifier;

#[async_trait]
impl Classifier for CleanClassifier {
    async fn classify(&self, _request: ClassifyRequest) -> Result<CategoryScores, ClassifierError> {
        Ok(CategoryScores::single("violence", 0.05))
    }
}

struct DownClassifier;

#[async_trait]
impl Classifier for DownClassifier {
    async fn classify(&self, _request: ClassifyRequest) -> Result<CategoryScores, ClassifierError> {
        Err(ClassifierError::Status(503))
    }
}

struct CountingClassifier {
    calls: AtomicUsize,
}

#[async_trait]
impl Classifier for CountingClassifier {
    async fn classify(&self, _request: ClassifyRequest) -> Result<CategoryScores, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CategoryScores::single("violence", 0.05))
    }
}

fn temp_station(dir: &Path, classifier: Arc<dyn Classifier>) -> Station {
    let station =
        Station::with_classifier(station_config(dir), classifier).expect("open station");
    station
        .upsert_channel(&Channel::new("main", "Main Rotation"))
        .expect("create channel");
    station
}

fn submission(user: &str, prompt: &str) -> Submission {
    Submission {
        user_id: user.into(),
        channel_id: "main".into(),
        prompt: prompt.into(),
        base_priority: None,
        platform: Some("irc".into()),
        category_hint: None,
    }
}

#[tokio::test]
async fn clean_submission_lands_in_the_queue() {
    let dir = tempfile::TempDir::new().unwrap();
    let station = temp_station(dir.path(), Arc::new(CleanClassifier));
    let request_id = station
        .submit_request(submission("user-a", "a slow song about rain"))
        .await
        .expect("admitted");
    let entry = station.requests().fetch(&request_id).unwrap().unwrap();
    assert_eq!(entry.status, RequestStatus::Queued);
    assert_eq!(entry.verdict.as_deref(), Some("admit"));
    assert!(entry.computed_priority > 0.0);
}

#[tokio::test]
async fn over_limit_submissions_are_rejected_but_still_counted() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = station_config(dir.path());
    config.rate_limit.standard_limit = 10;
    let station = Station::with_classifier(config, Arc::new(CleanClassifier)).unwrap();
    station
        .upsert_channel(&Channel::new("main", "Main Rotation"))
        .unwrap();

    for i in 0..15 {
        let result = station
            .submit_request(submission("user-b", &format!("track {i}")))
            .await;
        if i < 10 {
            assert!(result.is_ok(), "submission {i} should pass");
        } else {
            match result {
                Err(StationError::Admission(AdmissionError::RateLimited {
                    current_count,
                    limit,
                })) => {
                    assert_eq!(limit, 10);
                    assert_eq!(current_count, i + 1);
                }
                other => panic!("submission {i} should be rate limited, got {other:?}"),
            }
        }
    }
}

#[tokio::test]
async fn banned_user_is_refused_before_moderation_runs() {
    let dir = tempfile::TempDir::new().unwrap();
    let classifier = Arc::new(CountingClassifier {
        calls: AtomicUsize::new(0),
    });
    let station = temp_station(dir.path(), classifier.clone());

    station.reputation().ensure_user("user-c", None).unwrap();
    for _ in 0..3 {
        station
            .reputation()
            .record_violation("user-c", Some("main"), None, ViolationSeverity::High)
            .unwrap();
    }

    let result = station
        .submit_request(submission("user-c", "anything"))
        .await;
    match result {
        Err(StationError::Admission(AdmissionError::Banned { until })) => {
            assert!(until.is_some());
        }
        other => panic!("expected ban, got {other:?}"),
    }
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unreachable_classifier_flags_instead_of_admitting() {
    let dir = tempfile::TempDir::new().unwrap();
    let station = temp_station(dir.path(), Arc::new(DownClassifier));
    let result = station
        .submit_request(submission("user-d", "a harmless tune"))
        .await;
    let request_id = match result {
        Err(StationError::Admission(AdmissionError::FlaggedForReview { request_id })) => request_id,
        other => panic!("expected flag, got {other:?}"),
    };
    let entry = station.requests().fetch(&request_id).unwrap().unwrap();
    assert_eq!(entry.status, RequestStatus::Flagged);
    assert_eq!(entry.verdict_reason.as_deref(), Some("classifier_unavailable"));
    assert!(station.queue_snapshot("main").unwrap().is_empty());
}

#[tokio::test]
async fn local_filter_reject_files_a_violation_and_audit_row() {
    let dir = tempfile::TempDir::new().unwrap();
    let station = temp_station(dir.path(), Arc::new(CleanClassifier));
    let result = station
        .submit_request(submission("user-e", "please doxx my rival"))
        .await;
    assert!(matches!(
        result,
        Err(StationError::Admission(AdmissionError::Rejected { .. }))
    ));

    let violations = station.reputation().list_violations("user-e").unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].severity, ViolationSeverity::High);

    let standing = station.user_standing("user-e").unwrap();
    assert!(standing.reputation < 50);

    let entries = station
        .requests()
        .list(&aircast_core::RequestFilter {
            user_id: Some("user-e".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(entries.len(), 1);
    let audit = station.requests().list_audit(&entries[0].request_id).unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].stage, "local_filter");
    assert_eq!(audit[0].verdict, "reject");
    assert!(audit[0].matched_rule.as_deref().unwrap().contains("doxx"));
}

#[tokio::test]
async fn flag_resolution_approve_queues_and_reject_files_violation() {
    let dir = tempfile::TempDir::new().unwrap();
    let station = temp_station(dir.path(), Arc::new(DownClassifier));

    let first = match station.submit_request(submission("user-f", "tune one")).await {
        Err(StationError::Admission(AdmissionError::FlaggedForReview { request_id })) => request_id,
        other => panic!("expected flag, got {other:?}"),
    };
    let second = match station.submit_request(submission("user-f", "tune two")).await {
        Err(StationError::Admission(AdmissionError::FlaggedForReview { request_id })) => request_id,
        other => panic!("expected flag, got {other:?}"),
    };

    let flagged = station.list_flagged(Some("main")).unwrap();
    assert_eq!(flagged.len(), 2);

    let status = station
        .resolve_flag(&first, FlagDecision::Approve, "reviewed, fine")
        .unwrap();
    assert_eq!(status, RequestStatus::Queued);
    assert_eq!(station.queue_snapshot("main").unwrap().len(), 1);

    let status = station
        .resolve_flag(&second, FlagDecision::Reject, "reviewed, not fine")
        .unwrap();
    assert_eq!(status, RequestStatus::Rejected);
    let violations = station.reputation().list_violations("user-f").unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].severity, ViolationSeverity::Medium);
}

#[tokio::test]
async fn resubmission_supersedes_a_stalled_pending_duplicate() {
    let dir = tempfile::TempDir::new().unwrap();
    let station = temp_station(dir.path(), Arc::new(CleanClassifier));

    // A pending entry left behind by an interrupted evaluation.
    let stalled = station
        .requests()
        .insert(&aircast_core::NewRequest {
            user_id: "user-g".into(),
            channel_id: "main".into(),
            prompt: "same prompt".into(),
            category_hint: None,
            base_priority: 0,
        })
        .unwrap();
    station
        .requests()
        .transition(&stalled.request_id, RequestStatus::ModerationPending, None)
        .unwrap();

    station
        .submit_request(submission("user-g", "same prompt"))
        .await
        .expect("resubmission admitted");

    let old = station.requests().fetch(&stalled.request_id).unwrap().unwrap();
    assert_eq!(old.status, RequestStatus::Rejected);
    assert_eq!(old.verdict_reason.as_deref(), Some("superseded"));
    assert_eq!(station.queue_snapshot("main").unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_and_inactive_channels_are_refused() {
    let dir = tempfile::TempDir::new().unwrap();
    let station = temp_station(dir.path(), Arc::new(CleanClassifier));
    let result = station
        .submit_request(Submission {
            channel_id: "nope".into(),
            ..submission("user-h", "a song")
        })
        .await;
    assert!(matches!(result, Err(StationError::ChannelUnknown(_))));

    let mut sleepy = Channel::new("sleepy", "Off Air");
    sleepy.active = false;
    station.upsert_channel(&sleepy).unwrap();
    let result = station
        .submit_request(Submission {
            channel_id: "sleepy".into(),
            ..submission("user-h", "a song")
        })
        .await;
    assert!(matches!(result, Err(StationError::ChannelInactive(_))));
}
