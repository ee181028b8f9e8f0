use anyhow::{anyhow, Result};
use icn_types::{ReputationUpdate, WorkerId};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

const DEFAULT_REPUTATION_API_TIMEOUT_SECS: u64 = 5;

/// Score assumed for a worker the reputation service has never seen.
pub const DEFAULT_REPUTATION_SCORE: f64 = 50.0;

/// Read/update contract with the reputation service.
///
/// Scores are on a 0-100 scale.
#[async_trait::async_trait]
pub trait ReputationClient: Send + Sync {
    async fn get_score(&self, worker: &WorkerId) -> Result<f64>;

    async fn update_score(&self, update: &ReputationUpdate) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    computed_score: f64,
}

/// HTTP client for the reputation service.
pub struct DefaultReputationClient {
    client: Client,
    base_url: String,
}

impl DefaultReputationClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_REPUTATION_API_TIMEOUT_SECS))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait::async_trait]
impl ReputationClient for DefaultReputationClient {
    async fn get_score(&self, worker: &WorkerId) -> Result<f64> {
        let base = self.base_url.trim_end_matches('/');
        let url = format!("{}/reputation/profiles/{}", base, worker);

        tracing::debug!(worker_id = %worker, %url, "Querying reputation score");
        let resp = self.client.get(&url).send().await?;

        if resp.status().is_success() {
            let body: ScoreResponse = resp.json().await?;
            Ok(body.computed_score)
        } else if resp.status() == reqwest::StatusCode::NOT_FOUND {
            // no history yet
            Ok(DEFAULT_REPUTATION_SCORE)
        } else {
            let status = resp.status();
            let error_body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read response>".to_string());
            tracing::error!(worker_id = %worker, %status, %error_body, "Reputation query failed");
            Err(anyhow!(
                "Failed to fetch reputation score for {}: HTTP {} - {}",
                worker,
                status,
                error_body
            ))
        }
    }

    async fn update_score(&self, update: &ReputationUpdate) -> Result<()> {
        let base = self.base_url.trim_end_matches('/');
        let url = format!("{}/reputation/records", base);

        tracing::debug!(worker_id = %update.worker_id, delta = update.delta, %url, "Submitting reputation delta");
        let resp = self.client.post(&url).json(update).send().await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status();
            let error_body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read response>".to_string());
            tracing::error!(worker_id = %update.worker_id, %status, %error_body, "Reputation update rejected");
            Err(anyhow!(
                "Failed to submit reputation update for {}: HTTP {} - {}",
                update.worker_id,
                status,
                error_body
            ))
        }
    }
}

/// Keeps scores and the full update history in memory.
#[derive(Default)]
pub struct InMemoryReputationClient {
    scores: RwLock<HashMap<WorkerId, f64>>,
    history: RwLock<Vec<ReputationUpdate>>,
}

impl InMemoryReputationClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_score(&self, worker: impl Into<WorkerId>, score: f64) {
        self.scores.write().await.insert(worker.into(), score);
    }

    /// Every update received, oldest first.
    pub async fn history(&self) -> Vec<ReputationUpdate> {
        self.history.read().await.clone()
    }

    pub async fn updates_for(&self, worker: &str) -> Vec<ReputationUpdate> {
        self.history
            .read()
            .await
            .iter()
            .filter(|u| u.worker_id == worker)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl ReputationClient for InMemoryReputationClient {
    async fn get_score(&self, worker: &WorkerId) -> Result<f64> {
        Ok(self
            .scores
            .read()
            .await
            .get(worker)
            .copied()
            .unwrap_or(DEFAULT_REPUTATION_SCORE))
    }

    async fn update_score(&self, update: &ReputationUpdate) -> Result<()> {
        {
            let mut scores = self.scores.write().await;
            let score = scores
                .entry(update.worker_id.clone())
                .or_insert(DEFAULT_REPUTATION_SCORE);
            *score = (*score + update.delta).clamp(0.0, 100.0);
        }
        self.history.write().await.push(update.clone());
        Ok(())
    }
}
