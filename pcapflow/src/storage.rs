use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Duration;

use crate::config::Config;
use crate::error::StoreError;
use crate::state::{LogBudget, PacketRecord, TrafficState};

/// Terminal result of delivering one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOutcome {
    Success,
    Fail,
}

impl WriteOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            WriteOutcome::Success => "success",
            WriteOutcome::Fail => "fail",
        }
    }
}

/// A searchable document store that accepts one record per request.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn index(&self, record: &PacketRecord) -> Result<(), StoreError>;
}

// ── Elasticsearch ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterInfo {
    #[serde(default)]
    pub cluster_name: String,
    pub version: ClusterVersion,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterVersion {
    pub number: String,
}

/// Elasticsearch-compatible store speaking the plain HTTP document API.
pub struct ElasticStore {
    client: Client,
    base_url: String,
    index: String,
    username: Option<String>,
    password: Option<String>,
}

impl ElasticStore {
    pub fn new(config: &Config) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.elastic_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.elastic_url.trim_end_matches('/').to_string(),
            index: config.elastic_index.clone(),
            username: config.elastic_user.clone(),
            password: config.elastic_password.clone(),
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index
    }

    /// Fetch cluster info. Used once at startup to prove the store is reachable.
    pub async fn ping(&self) -> Result<ClusterInfo, StoreError> {
        let response = self.authorize(self.client.get(&self.base_url)).send().await?;
        let response = check_status(response).await?;
        Ok(response.json::<ClusterInfo>().await?)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_deref()),
            None => request,
        }
    }
}

#[async_trait]
impl DocumentStore for ElasticStore {
    async fn index(&self, record: &PacketRecord) -> Result<(), StoreError> {
        let url = format!("{}/{}/_doc", self.base_url, self.index);
        let response = self
            .authorize(self.client.post(url).json(record))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        body,
    })
}

// ── Retrying writer ───────────────────────────────────────────────────────────

/// Delivers records with a bounded number of attempts and a fixed pause
/// between them. Never fails the caller: a record that cannot be stored is
/// counted as `fail` and dropped.
pub struct ResilientWriter<S> {
    store: S,
    traffic: Arc<TrafficState>,
    max_attempts: u32,
    retry_delay: Duration,
    error_budget: LogBudget,
}

impl<S: DocumentStore> ResilientWriter<S> {
    pub fn new(
        store: S,
        traffic: Arc<TrafficState>,
        max_attempts: u32,
        retry_delay: Duration,
        error_log_limit: usize,
    ) -> Self {
        Self {
            store,
            traffic,
            max_attempts: max_attempts.max(1),
            retry_delay,
            error_budget: LogBudget::new(error_log_limit),
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn write(&self, record: &PacketRecord) -> WriteOutcome {
        let mut attempt = 1;
        let outcome = loop {
            match self.store.index(record).await {
                Ok(()) => break WriteOutcome::Success,
                Err(e) if attempt < self.max_attempts => {
                    tracing::warn!(
                        "store write failed (attempt {}/{}): {}",
                        attempt,
                        self.max_attempts,
                        e
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if self.error_budget.take() {
                        tracing::error!(
                            "dropping record after {} attempts: {}",
                            self.max_attempts,
                            e
                        );
                    }
                    break WriteOutcome::Fail;
                }
            }
        };

        self.traffic.record_write_outcome(outcome);
        outcome
    }
}
