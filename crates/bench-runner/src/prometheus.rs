use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::Value;

use crate::error::{OpResult, OrchestratorError};

const QUERY_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MetricStore {
    base_url: String,
    client: Client,
}

impl MetricStore {
    pub fn new(base_url: &str) -> OpResult<Self> {
        let client = Client::builder()
            .timeout(QUERY_TIMEOUT)
            .build()
            .map_err(|e| OrchestratorError::Measurement(format!("http client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn healthy(&self) -> bool {
        let url = format!("{}/-/healthy", self.base_url);
        matches!(
            self.client
                .get(url)
                .timeout(HEALTH_TIMEOUT)
                .send(),
            Ok(resp) if resp.status().is_success()
        )
    }

    // Averages the instant vector across all returned series; None for an
    // empty result set.
    pub fn query_avg(&self, expr: &str) -> OpResult<Option<f64>> {
        let url = format!("{}/api/v1/query", self.base_url);
        let resp = self
            .client
            .get(url)
            .query(&[("query", expr)])
            .send()
            .map_err(|e| OrchestratorError::Measurement(format!("query failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(OrchestratorError::Measurement(format!(
                "query returned {}",
                resp.status()
            )));
        }
        let body: Value = resp
            .json()
            .map_err(|e| OrchestratorError::Measurement(format!("invalid response: {}", e)))?;
        if body.get("status").and_then(|v| v.as_str()) != Some("success") {
            let reason = body
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            return Err(OrchestratorError::Measurement(format!(
                "query rejected: {}",
                reason
            )));
        }

        let mut values = Vec::new();
        if let Some(result) = body.pointer("/data/result").and_then(|v| v.as_array()) {
            for series in result {
                let sample = series
                    .get("value")
                    .and_then(|v| v.as_array())
                    .and_then(|pair| pair.get(1))
                    .and_then(|v| v.as_str())
                    .and_then(|v| v.parse::<f64>().ok());
                if let Some(v) = sample {
                    values.push(v);
                }
            }
        }
        if values.is_empty() {
            return Ok(None);
        }
        Ok(Some(values.iter().sum::<f64>() / values.len() as f64))
    }

    pub fn cpu_usage_avg(&self, namespace: &str) -> OpResult<Option<f64>> {
        self.query_avg(&format!(
            r#"rate(container_cpu_usage_seconds_total{{namespace="{}"}}[5m])"#,
            namespace
        ))
    }

    pub fn memory_usage_avg(&self, namespace: &str) -> OpResult<Option<f64>> {
        self.query_avg(&format!(
            r#"container_memory_working_set_bytes{{namespace="{}"}}"#,
            namespace
        ))
    }
}
