//! Telemetry query client
//!
//! The discovery stage only needs "records for one node in the lookback
//! window". [`SageDataClient`] gets them from the Sage data API, which
//! answers a JSON query with newline-delimited JSON records.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, SyncError};

/// One telemetry event as returned by the query service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    #[serde(default)]
    pub timestamp: Option<String>,
    pub name: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub meta: Value,
}

impl TelemetryRecord {
    /// The record value as text; numbers and other scalars are stringified
    pub fn value_text(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Source of telemetry records for one node
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Records for `node` in the configured window.
    ///
    /// An `Err` means the query itself failed; an empty `Ok` means the node
    /// genuinely reported nothing.
    async fn query(&self, node: &str) -> Result<Vec<TelemetryRecord>>;
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    start: &'a str,
    filter: QueryFilter<'a>,
}

#[derive(Debug, Serialize)]
struct QueryFilter<'a> {
    plugin: &'a str,
    vsn: &'a str,
}

/// HTTP client for the Sage data API
pub struct SageDataClient {
    client: Client,
    endpoint: String,
    start: String,
    plugin: String,
}

impl SageDataClient {
    /// Create a client for `endpoint` scoped to one plugin filter and window
    pub fn new(
        endpoint: impl Into<String>,
        plugin: impl Into<String>,
        start: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cmfproxy/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            start: start.into(),
            plugin: plugin.into(),
        })
    }

    async fn fetch_body(&self, node: &str) -> std::result::Result<String, String> {
        let request = QueryRequest {
            start: &self.start,
            filter: QueryFilter {
                plugin: &self.plugin,
                vsn: node,
            },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP status {}", status));
        }

        response.text().await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl TelemetrySource for SageDataClient {
    async fn query(&self, node: &str) -> Result<Vec<TelemetryRecord>> {
        let body = self.fetch_body(node).await.map_err(|message| SyncError::Query {
            node: node.to_string(),
            message,
        })?;

        let records = parse_records(&body).map_err(|e| SyncError::Query {
            node: node.to_string(),
            message: format!("malformed record: {}", e),
        })?;

        debug!(node, records = records.len(), "Telemetry query returned");
        Ok(records)
    }
}

/// Parse a newline-delimited JSON body into records
pub fn parse_records(body: &str) -> std::result::Result<Vec<TelemetryRecord>, serde_json::Error> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(serde_json::from_str::<TelemetryRecord>)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{
        matchers::{body_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    const BODY: &str = concat!(
        r#"{"timestamp":"2026-01-01T00:00:00Z","name":"upload","value":"https://storage/a.tar.gz","meta":{"vsn":"W0A1"}}"#,
        "\n",
        r#"{"timestamp":"2026-01-01T00:00:01Z","name":"env.temperature","value":21.5,"meta":{"vsn":"W0A1"}}"#,
        "\n"
    );

    #[test]
    fn test_parse_records_and_value_text() {
        let records = parse_records(BODY).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].value_text(), "https://storage/a.tar.gz");
        assert_eq!(records[1].value_text(), "21.5");
    }

    #[test]
    fn test_parse_rejects_garbage_line() {
        assert!(parse_records("{\"name\":\"upload\"}\nnot json\n").is_err());
    }

    #[tokio::test]
    async fn test_query_posts_window_and_filter() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/v1/query"))
            .and(body_json(json!({
                "start": "-1h",
                "filter": { "plugin": "cmf-logger.*", "vsn": "W0A1" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string(BODY))
            .expect(1)
            .mount(&server)
            .await;

        let client = SageDataClient::new(
            format!("{}/api/v1/query", server.uri()),
            "cmf-logger.*",
            "-1h",
            Duration::from_secs(5),
        )
        .unwrap();

        let records = client.query("W0A1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "upload");
    }

    #[tokio::test]
    async fn test_server_error_is_query_error_not_empty() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client =
            SageDataClient::new(server.uri(), "p", "-1h", Duration::from_secs(5)).unwrap();

        let err = client.query("W0A1").await.unwrap_err();
        assert!(matches!(err, SyncError::Query { ref node, .. } if node == "W0A1"));
    }

    #[tokio::test]
    async fn test_empty_body_is_empty_result() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(""))
            .mount(&server)
            .await;

        let client =
            SageDataClient::new(server.uri(), "p", "-1h", Duration::from_secs(5)).unwrap();

        assert!(client.query("W0A1").await.unwrap().is_empty());
    }
}
