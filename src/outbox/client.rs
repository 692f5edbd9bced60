//! HTTP sender for the broker wire contract.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::models::OrderEnvelope;

/// Ingest acknowledgement envelope (`{"orderId": ..., "status": "Queued"}`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestAck {
    pub order_id: String,
    pub status: String,
}

#[derive(Clone)]
pub struct BridgeClient {
    client: Client,
    base_url: String,
}

impl BridgeClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if !api_key.is_empty() {
            headers.insert(
                "x-api-key",
                api_key.parse().context("invalid API key header value")?,
            );
        }

        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .default_headers(headers)
            .build()
            .context("failed to build bridge HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// POST one envelope to the broker. Any non-2xx, transport error, or
    /// timeout surfaces as an error so the caller can count it against the
    /// circuit breaker.
    pub async fn post_order(&self, envelope: &OrderEnvelope) -> Result<IngestAck> {
        let url = format!("{}/orders", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(envelope)
            .send()
            .await
            .context("POST /orders failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            anyhow::bail!("POST /orders returned {status}");
        }

        resp.json::<IngestAck>()
            .await
            .context("failed to parse ingest acknowledgement")
    }
}
