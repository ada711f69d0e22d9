//! Elasticsearch-compatible `_bulk` sink.

use async_trait::async_trait;
use log::{debug, trace};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;

use super::sink::{ItemResult, Sink, SinkError};
use crate::config::SinkConfig;
use crate::error::Result;
use crate::window::WindowRecord;

/// Classify an HTTP status from the sink
pub fn classify_status(status: u16, detail: &str) -> ItemResult {
    match status {
        200..=299 => Ok(()),
        429 | 502 | 503 | 504 => Err(SinkError::Transient(format!("HTTP {}: {}", status, detail))),
        400..=499 => Err(SinkError::Permanent(format!("HTTP {}: {}", status, detail))),
        _ => Err(SinkError::Transient(format!("HTTP {}: {}", status, detail))),
    }
}

/// The JSON document stored for one record
pub fn document(record: &WindowRecord, observer: &str) -> Value {
    let summary = record.summary.as_ref();
    let percentiles: Map<String, Value> = summary
        .map(|s| {
            s.percentiles
                .iter()
                .map(|(p, v)| (format!("p{}", p), json!(v)))
                .collect()
        })
        .unwrap_or_default();

    let mut status = Map::new();
    if record.count > 0 {
        status.insert("success".to_string(), json!(record.count));
    }
    for (reason, n) in &record.failure_reasons {
        status.insert((*reason).to_string(), json!(n));
    }

    json!({
        "@timestamp": record.window.start.to_rfc3339(),
        "target": record.key.target.as_ref(),
        "host": record.host.as_ref(),
        "probe": record.probe.as_str(),
        "metric": record.key.metric.as_str(),
        "window_start": record.window.start.to_rfc3339(),
        "window_end": record.window.end.to_rfc3339(),
        "window_seconds": record.window.duration().num_milliseconds() as f64 / 1000.0,
        "count": record.count,
        "failures": record.failures,
        "status": status,
        "loss": record.loss(),
        "min": summary.map(|s| s.min),
        "max": summary.map(|s| s.max),
        "mean": summary.map(|s| s.mean),
        "stddev": summary.and_then(|s| s.stddev),
        "percentiles": percentiles,
        "partial": record.partial,
        "observer": observer,
    })
}

/// NDJSON body of one bulk request
pub fn bulk_body(records: &[Arc<WindowRecord>], index: &str, observer: &str) -> Result<String> {
    let mut body = String::new();
    for record in records {
        let action = json!({ "index": { "_index": index, "_id": record.id.to_string() } });
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(&document(record, observer))?);
        body.push('\n');
    }
    Ok(body)
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<BulkItem>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(alias = "create", alias = "update")]
    index: Option<BulkItemStatus>,
}

#[derive(Debug, Deserialize)]
struct BulkItemStatus {
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

/// Per-record results from a successful bulk response body
pub fn parse_bulk_response(body: &[u8], expected: usize) -> std::result::Result<Vec<ItemResult>, SinkError> {
    let response: BulkResponse = serde_json::from_slice(body)
        .map_err(|e| SinkError::Transient(format!("unreadable bulk response: {}", e)))?;

    if !response.errors {
        return Ok(vec![Ok(()); expected]);
    }
    if response.items.len() != expected {
        return Err(SinkError::Transient(format!(
            "bulk response has {} items for {} documents",
            response.items.len(),
            expected
        )));
    }

    Ok(response
        .items
        .into_iter()
        .map(|item| match item.index {
            Some(item) => {
                let detail = item
                    .error
                    .as_ref()
                    .and_then(|e| e.get("reason").or(e.get("type")))
                    .and_then(Value::as_str)
                    .unwrap_or("bulk item failed");
                classify_status(item.status, detail)
            }
            None => Err(SinkError::Transient("bulk item without status".to_string())),
        })
        .collect())
}

/// Posts window documents to `{url}/_bulk`
#[derive(Debug, Clone)]
pub struct ElasticSink {
    client: reqwest::Client,
    bulk_url: String,
    index: String,
    observer: String,
}

impl ElasticSink {
    pub fn new(config: &SinkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("netprobe/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()?;
        let observer = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Self {
            client,
            bulk_url: format!("{}/_bulk", config.url.trim_end_matches('/')),
            index: config.index.clone(),
            observer,
        })
    }
}

#[async_trait]
impl Sink for ElasticSink {
    fn name(&self) -> &str {
        &self.bulk_url
    }

    async fn deliver(&self, records: &[Arc<WindowRecord>]) -> std::result::Result<Vec<ItemResult>, SinkError> {
        let body = bulk_body(records, &self.index, &self.observer)
            .map_err(|e| SinkError::Permanent(format!("cannot encode documents: {}", e)))?;
        trace!("Bulk request body:\n{}", body);

        let response = self
            .client
            .post(&self.bulk_url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    SinkError::Permanent(e.to_string())
                } else {
                    SinkError::Transient(e.to_string())
                }
            })?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SinkError::Transient(format!("reading bulk response: {}", e)))?;
        debug!("Bulk request of {} document(s): {}", records.len(), status);

        if !status.is_success() {
            let detail = String::from_utf8_lossy(&bytes);
            classify_status(status.as_u16(), detail.trim())?;
        }
        parse_bulk_response(&bytes, records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{Metric, ProbeFailure, ProbeKind, Sample, SeriesKey};
    use crate::window::WindowSpec;
    use chrono::{TimeDelta, TimeZone, Utc};
    use std::time::Duration;

    fn record() -> Arc<WindowRecord> {
        let spec = WindowSpec::new(Duration::from_secs(3)).unwrap();
        let window = spec.window_of(Utc.timestamp_opt(1_700_000_001, 0).unwrap());
        let key = SeriesKey::new("resolver", Metric::IcmpRtt);
        let at = |ms| window.start + TimeDelta::milliseconds(ms);
        let samples = [
            Sample::success(key.clone(), at(100), 20.0),
            Sample::failure(key.clone(), at(900), ProbeFailure::Timeout(Duration::from_secs(1))),
            Sample::success(key.clone(), at(2_500), 30.0),
        ];
        Arc::new(WindowRecord::aggregate(
            key,
            "1.1.1.1".into(),
            ProbeKind::Ping,
            window,
            &samples,
            &[50.0, 99.0],
        ))
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(200, "").is_ok());
        assert!(classify_status(201, "").is_ok());
        for transient in [429, 500, 502, 503, 504] {
            assert!(classify_status(transient, "").unwrap_err().is_transient(), "{}", transient);
        }
        for permanent in [400, 401, 404, 413] {
            assert!(!classify_status(permanent, "").unwrap_err().is_transient(), "{}", permanent);
        }
    }

    #[test]
    fn test_document_fields() {
        let doc = document(&record(), "probe-host");
        assert_eq!(doc["target"], "resolver");
        assert_eq!(doc["metric"], "icmp_rtt_ms");
        assert_eq!(doc["probe"], "ping");
        assert_eq!(doc["count"], 2);
        assert_eq!(doc["failures"], 1);
        assert_eq!(doc["status"]["timeout"], 1);
        assert_eq!(doc["min"], 20.0);
        assert_eq!(doc["max"], 30.0);
        assert_eq!(doc["mean"], 25.0);
        assert_eq!(doc["percentiles"]["p50"], 25.0);
        assert_eq!(doc["window_seconds"], 3.0);
        assert_eq!(doc["partial"], false);
        assert_eq!(doc["observer"], "probe-host");
        assert_eq!(doc["@timestamp"], doc["window_start"]);
    }

    #[test]
    fn test_empty_window_document_has_nulls() {
        let spec = WindowSpec::new(Duration::from_secs(3)).unwrap();
        let empty = WindowRecord::aggregate(
            SeriesKey::new("resolver", Metric::IcmpRtt),
            "1.1.1.1".into(),
            ProbeKind::Ping,
            spec.window_of(Utc.timestamp_opt(1_700_000_001, 0).unwrap()),
            &[],
            &[50.0],
        );
        let doc = document(&empty, "probe-host");
        assert_eq!(doc["count"], 0);
        assert!(doc["mean"].is_null());
        assert!(doc["loss"].is_null());
    }

    #[test]
    fn test_bulk_body_uses_record_id() {
        let record = record();
        let body = bulk_body(&[Arc::clone(&record)], "netprobe", "probe-host").unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(body.ends_with('\n'));

        let action: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action["index"]["_index"], "netprobe");
        assert_eq!(action["index"]["_id"], record.id.to_string());
    }

    #[test]
    fn test_parse_bulk_response_per_item() {
        let body = br#"{"took":3,"errors":true,"items":[
            {"index":{"_id":"a","status":201}},
            {"index":{"_id":"b","status":429,"error":{"type":"es_rejected_execution_exception"}}},
            {"index":{"_id":"c","status":400,"error":{"type":"mapper_parsing_exception","reason":"failed to parse"}}}
        ]}"#;
        let results = parse_bulk_response(body, 3).unwrap();
        assert!(results[0].is_ok());
        assert!(results[1].as_ref().unwrap_err().is_transient());
        assert_eq!(
            results[2],
            Err(SinkError::Permanent("HTTP 400: failed to parse".to_string()))
        );
    }

    #[test]
    fn test_parse_bulk_response_without_errors() {
        let results = parse_bulk_response(br#"{"took":1,"errors":false,"items":[]}"#, 2).unwrap();
        assert_eq!(results, vec![Ok(()), Ok(())]);
        assert!(parse_bulk_response(b"<html>", 1).unwrap_err().is_transient());
    }
}
