use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use powerproxy_core::config::query;
use powerproxy_core::slip::RoutingSlip;
use powerproxy_core::token::TokenSource;

use crate::base::{HookError, HookResult, ProxyPlugin};

/// One accounting line per completed request.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub request_received_utc: DateTime<Utc>,
    pub client: Option<String>,
    pub is_streaming: bool,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub aoai_roundtrip_time_ms: Option<u64>,
    pub aoai_region: Option<String>,
    pub aoai_endpoint: Option<String>,
    pub aoai_deployment_id: Option<String>,
    pub aoai_time_to_response_ms: Option<u64>,
}

const CSV_COLUMNS: [&str; 11] = [
    "request_received_utc",
    "client",
    "is_streaming",
    "prompt_tokens",
    "completion_tokens",
    "total_tokens",
    "aoai_roundtrip_time_ms",
    "aoai_region",
    "aoai_endpoint",
    "aoai_deployment_id",
    "aoai_time_to_response_ms",
];

impl UsageRecord {
    pub fn from_slip(slip: &RoutingSlip, is_streaming: bool) -> Self {
        Self {
            request_received_utc: slip.request_received_utc,
            client: slip.client.clone(),
            is_streaming,
            prompt_tokens: slip.usage.prompt_tokens,
            completion_tokens: slip.usage.completion_tokens,
            total_tokens: slip.usage.total_tokens,
            aoai_roundtrip_time_ms: slip.roundtrip_time_ms,
            aoai_region: slip.region_from_target(),
            aoai_endpoint: slip.upstream.as_ref().map(|u| u.endpoint.clone()),
            aoai_deployment_id: slip.deployment_id().map(str::to_string),
            aoai_time_to_response_ms: slip.time_to_response_ms,
        }
    }
}

/// Destination for usage records.
#[async_trait]
pub trait UsageSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn append(&self, record: &UsageRecord) -> Result<(), anyhow::Error>;
}

/// Structured print of each record to the process log.
pub struct ConsoleSink;

#[async_trait]
impl UsageSink for ConsoleSink {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn append(&self, record: &UsageRecord) -> Result<(), anyhow::Error> {
        let line = serde_json::to_string(record)?;
        tracing::info!(target: "powerproxy::usage", "{line}");
        Ok(())
    }
}

/// Appends records to a timestamped CSV file; the header row is written once
/// when the sink is instantiated.
pub struct CsvFileSink {
    log_file_path: PathBuf,
}

impl CsvFileSink {
    pub fn new(log_dir: &str) -> Result<Self, anyhow::Error> {
        std::fs::create_dir_all(log_dir)?;
        let file_name = format!("{}.logs.csv", Utc::now().format("%Y%m%d-%H%M%S"));
        let log_file_path = PathBuf::from(log_dir).join(file_name);

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(CSV_COLUMNS)?;
        let header = writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("failed to flush CSV header: {e}"))?;
        std::fs::write(&log_file_path, header)?;

        Ok(Self { log_file_path })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.log_file_path
    }
}

#[async_trait]
impl UsageSink for CsvFileSink {
    fn name(&self) -> &'static str {
        "csv-file"
    }

    async fn append(&self, record: &UsageRecord) -> Result<(), anyhow::Error> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer.serialize(record)?;
        let line = writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("failed to flush CSV row: {e}"))?;

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&self.log_file_path)
            .await?;
        file.write_all(&line).await?;
        Ok(())
    }
}

/// Uploads records to a log-ingestion endpoint with bearer authentication.
pub struct LogIngestionSink {
    endpoint: String,
    rule_id: String,
    stream_name: String,
    http: reqwest::Client,
    token_source: Arc<dyn TokenSource>,
}

impl LogIngestionSink {
    pub fn from_settings(
        settings: &serde_json::Value,
        token_source: Arc<dyn TokenSource>,
    ) -> Result<Self, anyhow::Error> {
        let required = |key: &str| {
            query(settings, key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("LogUsageToLogIngestion config misses '{key}'"))
        };
        Ok(Self {
            endpoint: required("log_ingestion_endpoint")?,
            rule_id: required("data_collection_rule_id")?,
            stream_name: query(settings, "stream_name")
                .and_then(|v| v.as_str())
                .unwrap_or("Custom-AzureOpenAIUsage_PP_CL")
                .to_string(),
            http: reqwest::Client::new(),
            token_source,
        })
    }
}

#[async_trait]
impl UsageSink for LogIngestionSink {
    fn name(&self) -> &'static str {
        "log-ingestion"
    }

    async fn append(&self, record: &UsageRecord) -> Result<(), anyhow::Error> {
        let bearer = self.token_source.bearer_header().await?;
        let url = format!(
            "{}/dataCollectionRules/{}/streams/{}?api-version=2023-01-01",
            self.endpoint.trim_end_matches('/'),
            self.rule_id,
            self.stream_name,
        );
        let response = self
            .http
            .post(url)
            .header("authorization", bearer.as_ref())
            .json(&[record])
            .send()
            .await?;
        anyhow::ensure!(
            response.status().is_success(),
            "log ingestion endpoint returned {}",
            response.status()
        );
        Ok(())
    }
}

/// Appends a usage record when a request completes: at body arrival for
/// buffered responses, at end of stream for streamed ones.
pub struct LogUsage {
    sink: Box<dyn UsageSink>,
}

impl LogUsage {
    pub fn new(sink: Box<dyn UsageSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl ProxyPlugin for LogUsage {
    fn name(&self) -> &'static str {
        "LogUsage"
    }

    fn requires_token_counts(&self) -> bool {
        true
    }

    fn on_print_configuration(&self) {
        tracing::info!(sink = self.sink.name(), "LogUsage sink");
    }

    async fn on_body_dict_from_target_available(&self, slip: &RoutingSlip) -> HookResult {
        let record = UsageRecord::from_slip(slip, false);
        self.sink.append(&record).await.map_err(HookError::Internal)
    }

    async fn on_end_of_target_response_stream_reached(&self, slip: &RoutingSlip) -> HookResult {
        let record = UsageRecord::from_slip(slip, true);
        self.sink.append(&record).await.map_err(HookError::Internal)
    }
}
