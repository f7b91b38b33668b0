use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StationConfig {
    pub station: StationSection,
    pub storage: StorageSection,
    pub rate_limit: RateLimitSection,
    pub priority: PrioritySection,
    pub moderation: ModerationSection,
    pub reputation: ReputationSection,
    pub generation: GenerationSection,
}

impl StationConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.storage.data_dir).join(path)
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve_path(&self.storage.database)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reputation.min_score >= self.reputation.max_score {
            return Err(ConfigError::Invalid {
                field: "reputation.min_score".to_string(),
                message: "min_score must be below max_score".to_string(),
            });
        }
        if self.rate_limit.window_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "rate_limit.window_seconds".to_string(),
                message: "window must be at least one second".to_string(),
            });
        }
        if self.priority.wait_slope_per_minute < 0.0 {
            return Err(ConfigError::Invalid {
                field: "priority.wait_slope_per_minute".to_string(),
                message: "wait slope must be non-negative".to_string(),
            });
        }
        if self.reputation.timed_ban_strikes >= self.reputation.permanent_ban_strikes {
            return Err(ConfigError::Invalid {
                field: "reputation.timed_ban_strikes".to_string(),
                message: "timed ban threshold must be below the permanent one".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StationSection {
    pub name: String,
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    pub data_dir: String,
    pub database: String,
    pub terminal_retention_hours: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSection {
    pub window_seconds: u64,
    pub standard_limit: i64,
    pub premium_limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrioritySection {
    pub base_weight: f64,
    pub reputation_weight: f64,
    pub vote_weight: f64,
    pub premium_bonus: f64,
    pub wait_slope_per_minute: f64,
    pub fairness_bonus: f64,
    pub fairness_decay: f64,
    pub max_base_priority: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModerationSection {
    pub blocked_terms: Vec<String>,
    pub blocked_patterns: Vec<String>,
    pub classifier_endpoint: String,
    pub classifier_timeout_ms: u64,
    pub flag_margin: f64,
    pub relaxed_threshold: f64,
    pub standard_threshold: f64,
    pub strict_threshold: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReputationSection {
    pub min_score: i64,
    pub max_score: i64,
    pub initial_score: i64,
    pub completed_play_delta: i64,
    pub upvote_delta: i64,
    pub downvote_delta: i64,
    pub violation_delta: i64,
    pub strike_window_days: i64,
    pub timed_ban_strikes: i64,
    pub permanent_ban_strikes: i64,
    pub timed_ban_base_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationSection {
    pub max_retries: i64,
}

pub fn load_station_config<P: AsRef<Path>>(path: P) -> Result<StationConfig> {
    let config: StationConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
