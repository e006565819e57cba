//! Remote data source: JSON records fetched per partition (e.g. per year-quarter).
//!
//! A batch fetch never aborts on one bad partition. Records from the partitions that worked are
//! kept and every failure is reported next to its partition key.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::reader::{json_records, RecordSource};

/// Query filters sent with every partition request; empty values are omitted.
pub type Filters = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("remote source returned status {0}")]
    Status(u16),

    #[error("remote source did not return JSON (content type {0:?})")]
    NotJson(String),

    #[error("remote source returned malformed JSON: {0}")]
    Malformed(String),

    #[error("request failed: {0}")]
    Transport(String),
}

/// Something that returns a list of records for (endpoint, partition, filters).
pub trait RemoteSource {
    fn fetch(&self, endpoint: &str, partition: &str, filters: &Filters)
        -> Result<Vec<Value>, RemoteError>;
}

/// Outcome of fetching several partitions.
#[derive(Debug, Default)]
pub struct BatchFetch {
    pub records: Vec<Value>,
    pub errors: Vec<(String, RemoteError)>,
}

impl BatchFetch {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    /// One line per failed partition, for display.
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|(partition, e)| format!("{partition}: {e}"))
            .collect::<Vec<_>>()
            .join(" | ")
    }

    /// Hand the fetched records to a pipeline as a single ingestion source.
    pub fn into_source(self, name: impl Into<String>) -> RecordSource {
        RecordSource {
            name: name.into(),
            records: self.records,
        }
    }
}

/// Split a comma-separated partition list such as `2024Q1, 2024Q2`.
pub fn split_partitions(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn fetch_partitions(
    source: &dyn RemoteSource,
    endpoint: &str,
    partitions: &[String],
    filters: &Filters,
) -> BatchFetch {
    let mut batch = BatchFetch::default();
    for partition in partitions {
        match source.fetch(endpoint, partition, filters) {
            Ok(records) => {
                info!(endpoint, partition = %partition, records = records.len(), "fetched partition");
                batch.records.extend(records);
            }
            Err(e) => {
                warn!(endpoint, partition = %partition, error = %e, "partition fetch failed");
                batch.errors.push((partition.clone(), e));
            }
        }
    }
    batch
}

/// Validate and decode a response. Non-200 status, a non-JSON content type, an empty body and
/// unparseable JSON are each distinct errors.
pub fn decode_response(status: u16, content_type: &str, body: &str) -> Result<Vec<Value>, RemoteError> {
    if status != 200 {
        return Err(RemoteError::Status(status));
    }
    if !content_type.contains("application/json") || body.trim().is_empty() {
        return Err(RemoteError::NotJson(content_type.to_string()));
    }
    let value: Value =
        serde_json::from_str(body).map_err(|e| RemoteError::Malformed(e.to_string()))?;
    Ok(json_records(value))
}

// ── HTTP ────────────────────────────────────────────────────────────

/// Blocking HTTP source: `GET {base_url}/{endpoint}?{filters}&{partition_param}={partition}`.
#[cfg(feature = "remote")]
pub struct HttpSource {
    base_url: String,
    partition_param: String,
    client: reqwest::blocking::Client,
}

#[cfg(feature = "remote")]
impl HttpSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::blocking::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::blocking::Client) -> Self {
        Self {
            base_url: base_url.into(),
            partition_param: "year_quarter".to_string(),
            client,
        }
    }

    pub fn partition_param(mut self, name: impl Into<String>) -> Self {
        self.partition_param = name.into();
        self
    }
}

#[cfg(feature = "remote")]
impl RemoteSource for HttpSource {
    fn fetch(
        &self,
        endpoint: &str,
        partition: &str,
        filters: &Filters,
    ) -> Result<Vec<Value>, RemoteError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), endpoint);
        let mut query: Vec<(&str, &str)> = filters
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        query.push((self.partition_param.as_str(), partition));

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .text()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        decode_response(status, &content_type, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::reader::IngestionSource;

    struct MockSource;

    impl RemoteSource for MockSource {
        fn fetch(
            &self,
            endpoint: &str,
            partition: &str,
            filters: &Filters,
        ) -> Result<Vec<Value>, RemoteError> {
            assert_eq!(endpoint, "uph");
            match partition {
                "2024Q1" => Ok(vec![json!({"bom_no": "A", "plant": filters.get("plant")})]),
                "2024Q2" => Err(RemoteError::Status(503)),
                _ => decode_response(200, "application/json", "[{\"bom_no\": \"B\"}, {}]"),
            }
        }
    }

    #[test]
    fn test_batch_keeps_partial_success() {
        let mut filters = Filters::new();
        filters.insert("plant".to_string(), "P1".to_string());
        let partitions = split_partitions("2024Q1, 2024Q2,,2024Q3");
        assert_eq!(partitions.len(), 3);

        let batch = fetch_partitions(&MockSource, "uph", &partitions, &filters);
        assert_eq!(batch.records.len(), 3);
        assert_eq!(batch.records[0]["plant"], json!("P1"));
        assert!(!batch.is_complete());
        assert_eq!(batch.errors.len(), 1);
        assert_eq!(batch.errors[0].0, "2024Q2");
        assert!(batch.error_summary().contains("503"));

        let table = batch.into_source("uph 2024").read().unwrap();
        assert_eq!(table.len(), 3);
        assert!(table.column_index("bom_no").is_some());
    }

    #[test]
    fn test_decode_response_errors() {
        assert!(matches!(
            decode_response(404, "application/json", "[]"),
            Err(RemoteError::Status(404))
        ));
        assert!(matches!(
            decode_response(200, "text/html", "<html>"),
            Err(RemoteError::NotJson(ct)) if ct == "text/html"
        ));
        assert!(matches!(
            decode_response(200, "application/json", "   "),
            Err(RemoteError::NotJson(_))
        ));
        assert!(matches!(
            decode_response(200, "application/json; charset=utf-8", "{oops"),
            Err(RemoteError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_response_single_object() {
        let records = decode_response(200, "application/json", "{\"uph\": 5}").unwrap();
        assert_eq!(records, vec![json!({"uph": 5})]);
    }
}
