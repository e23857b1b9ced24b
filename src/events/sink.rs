use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

use crate::models::AttributionEvent;

/// Downstream consumer of attribution events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &AttributionEvent) -> Result<()>;
}

/// Emits each event as a structured log record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn publish(&self, event: &AttributionEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        info!(target: "tether::events", kind = event.kind(), event = %payload, "attribution event");
        Ok(())
    }
}

/// POSTs each event as JSON to a collector endpoint.
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build event sink HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl EventSink for HttpSink {
    async fn publish(&self, event: &AttributionEvent) -> Result<()> {
        self.client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .with_context(|| format!("Failed to send {} event", event.kind()))?
            .error_for_status()
            .with_context(|| format!("Event collector rejected {} event", event.kind()))?;
        Ok(())
    }
}
