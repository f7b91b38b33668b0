use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("classifier returned status {0}")]
    Status(u16),
    #[error("classifier call exceeded its deadline")]
    Deadline,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassifyRequest {
    pub prompt: String,
    pub channel_id: String,
}

/// Category scores in `0.0..=1.0`, keyed by category name. The pipeline
/// compares each score against the channel's strictness threshold.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CategoryScores {
    pub scores: HashMap<String, f64>,
}

impl CategoryScores {
    pub fn single(category: impl Into<String>, score: f64) -> Self {
        let mut scores = HashMap::new();
        scores.insert(category.into(), score);
        Self { scores }
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, request: ClassifyRequest) -> Result<CategoryScores, ClassifierError>;
}

pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpClassifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, request: ClassifyRequest) -> Result<CategoryScores, ClassifierError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ClassifierError::Status(response.status().as_u16()));
        }
        Ok(response.json::<CategoryScores>().await?)
    }
}
