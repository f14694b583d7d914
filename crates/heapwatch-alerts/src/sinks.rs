//! Alert delivery sinks
//!
//! The manager routes admitted alerts through these; everything except
//! the console sink performs real I/O and is wrapped by the retry
//! manager at the dispatch layer.

use async_trait::async_trait;
use chrono::Utc;
use heapwatch_common::{Alert, Error, Result};
use tracing::{error, info, warn};

/// One delivery target for admitted and escalated alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, alert: &Alert, escalated: bool) -> Result<()>;
}

/// Logs alerts through the tracing subscriber at the matching level.
pub struct ConsoleSink;

#[async_trait]
impl AlertSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    async fn deliver(&self, alert: &Alert, escalated: bool) -> Result<()> {
        let body = alert.enhanced_message.as_deref().unwrap_or(&alert.message);
        let prefix = if escalated { "[ESCALATED] " } else { "" };
        match alert.level {
            heapwatch_common::AlertLevel::Info => {
                info!(source = %alert.source, "{}{}: {}", prefix, alert.title, body)
            }
            heapwatch_common::AlertLevel::Warning => {
                warn!(source = %alert.source, "{}{}: {}", prefix, alert.title, body)
            }
            heapwatch_common::AlertLevel::Error | heapwatch_common::AlertLevel::Critical => {
                error!(source = %alert.source, "{}{}: {}", prefix, alert.title, body)
            }
        }
        Ok(())
    }
}

/// Appends one JSON object per line to a report file.
pub struct FileSink {
    path: String,
}

impl FileSink {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AlertSink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn deliver(&self, alert: &Alert, escalated: bool) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let record = serde_json::json!({
            "alert": alert,
            "escalated": escalated,
            "writtenAt": Utc::now(),
        });
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::Reporting(format!("open {}: {}", self.path, e)))?;
        file.write_all(&line)
            .await
            .map_err(|e| Error::Reporting(format!("write {}: {}", self.path, e)))?;
        Ok(())
    }
}

/// POSTs the alert payload to a webhook endpoint.
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, alert: &Alert, escalated: bool) -> Result<()> {
        let payload = serde_json::json!({
            "alert": alert,
            "escalated": escalated,
            "sentAt": Utc::now(),
        });
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Network(format!("webhook request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "webhook returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Email delivery is left to an external relay; this sink only logs.
pub struct EmailSink {
    address: String,
}

impl EmailSink {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl AlertSink for EmailSink {
    fn name(&self) -> &str {
        "email"
    }

    async fn deliver(&self, alert: &Alert, escalated: bool) -> Result<()> {
        info!(
            address = %self.address,
            escalated,
            "[EMAIL] {}: {}",
            alert.title,
            alert.message
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapwatch_common::AlertLevel;
    use uuid::Uuid;

    fn alert() -> Alert {
        Alert {
            id: Uuid::new_v4(),
            fingerprint: "f".into(),
            level: AlertLevel::Warning,
            title: "t".into(),
            message: "m".into(),
            enhanced_message: None,
            source: "s".into(),
            category: "c".into(),
            tags: Vec::new(),
            severity: 2,
            metrics: None,
            recommendations: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            resolved: false,
            resolved_at: None,
            escalated: false,
            escalation_count: 0,
        }
    }

    #[tokio::test]
    async fn file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.jsonl");
        let sink = FileSink::new(path.to_string_lossy().to_string());

        sink.deliver(&alert(), false).await.unwrap();
        sink.deliver(&alert(), true).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["escalated"], false);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["escalated"], true);
    }

    #[tokio::test]
    async fn webhook_sink_surfaces_connection_errors() {
        // Nothing listens on this port.
        let sink = WebhookSink::new("http://127.0.0.1:1/hook");
        let result = sink.deliver(&alert(), false).await;
        assert!(matches!(result, Err(Error::Network(_))));
    }
}
