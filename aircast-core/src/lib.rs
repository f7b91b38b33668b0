pub mod config;
pub mod error;
pub mod moderation;
pub mod ratelimit;
pub mod reputation;
pub mod request;
pub mod schedule;
mod sqlite;
pub mod station;

pub use config::{
    load_station_config, GenerationSection, ModerationSection, PrioritySection, RateLimitSection,
    ReputationSection, StationConfig, StationSection, StorageSection,
};
pub use error::{ConfigError, Result};
pub use moderation::{
    CategoryScores, Classifier, ClassifierError, ClassifyRequest, HttpClassifier, LocalFilter,
    ModerationError, ModerationOutcome, ModerationPipeline, Verdict,
};
pub use ratelimit::{RateDecision, RateLimitError, RateLimiter, RateWindow};
pub use reputation::{
    BanOutcome, BanState, ReputationError, ReputationEventKind, ReputationManager, UserRecord,
    UserStanding, ViolationRecord, ViolationSeverity,
};
pub use request::{
    AuditRecord, Channel, ChannelStrictness, NewRequest, RequestEntry, RequestError,
    RequestFilter, RequestMetrics, RequestStatus, SqliteRequestStore, StuckFinding, StuckKind,
};
pub use schedule::{compute_priority, ScorePolicy, Scheduler};
pub use station::{AdmissionError, FlagDecision, Station, StationError, StationResult, Submission};
