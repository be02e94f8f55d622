//! OpenSearch HTTP client
//!
//! Single-document index, `_bulk` with NDJSON bodies and a root info probe.

use std::collections::HashMap;

use async_trait::async_trait;
use ix_common::{BulkOutcome, ConnectionStatus, Document, IndexClient};
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::OpenSearchConfig;
use crate::error::OpenSearchError;
use crate::naming::index_name;
use crate::Result;

const NDJSON: &str = "application/x-ndjson";

#[derive(Debug, Deserialize)]
struct IndexResponse {
    #[serde(default)]
    result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<HashMap<String, BulkItemResult>>,
}

/// One entry of a `_bulk` response, keyed by action (`index`, `create`, ...)
#[derive(Debug, Deserialize)]
struct BulkItemResult {
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

impl BulkItemResult {
    fn failed(&self) -> bool {
        self.error.is_some() || self.status.map(|s| s >= 300).unwrap_or(false)
    }
}

#[derive(Debug, Deserialize)]
struct InfoResponse {
    version: VersionInfo,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    number: String,
    #[serde(default)]
    distribution: Option<String>,
}

/// reqwest-backed [`IndexClient`]
pub struct OpenSearchClient {
    config: OpenSearchConfig,
    base_url: String,
    client: reqwest::Client,
}

impl OpenSearchClient {
    pub fn new(config: OpenSearchConfig) -> Result<Self> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(OpenSearchError::InvalidUrl(config.base_url.clone()));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            config,
            base_url,
            client,
        })
    }

    pub fn index_name(&self, destination: &str) -> String {
        index_name(&self.config.index_prefix, destination)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let request = self.client.request(method, url);
        match self.config.username {
            Some(ref username) => request.basic_auth(username, self.config.password.as_ref()),
            None => request,
        }
    }

    async fn check_status(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(OpenSearchError::Status {
            status: status.as_u16(),
            body,
        })
    }

    /// Index one document. Succeeds only for a `created` or `updated` result.
    pub async fn index_document(&self, destination: &str, document: &Document) -> Result<()> {
        let path = format!("/{}/_doc", self.index_name(destination));
        let response = self.request(Method::POST, &path).json(document).send().await?;
        let response = Self::check_status(response).await?;

        let body: IndexResponse = response.json().await?;
        match body.result.as_deref() {
            Some("created") | Some("updated") => Ok(()),
            other => Err(OpenSearchError::UnexpectedResult(
                other.unwrap_or("<missing>").to_string(),
            )),
        }
    }

    /// Send `documents` in one `_bulk` request.
    ///
    /// Items missing from the response count as failed.
    pub async fn bulk(&self, destination: &str, documents: &[Document]) -> Result<BulkOutcome> {
        if documents.is_empty() {
            return Ok(BulkOutcome::all_succeeded(0));
        }

        let body = build_bulk_body(&self.index_name(destination), documents)?;
        let response = self
            .request(Method::POST, "/_bulk")
            .header(reqwest::header::CONTENT_TYPE, NDJSON)
            .body(body)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let parsed: BulkResponse = response.json().await?;

        let mut success_count = 0;
        let mut failed_positions = Vec::new();
        for position in 0..documents.len() {
            let failed = parsed
                .items
                .get(position)
                .map(|item| item.values().any(BulkItemResult::failed))
                .unwrap_or(true);
            if failed {
                failed_positions.push(position);
            } else {
                success_count += 1;
            }
        }

        if !failed_positions.is_empty() {
            warn!(
                destination = %destination,
                failed = failed_positions.len(),
                total = documents.len(),
                "Bulk request had item failures"
            );
        }
        Ok(BulkOutcome::new(success_count, failed_positions))
    }

    /// Fetch the cluster root document.
    pub async fn info(&self) -> Result<ConnectionStatus> {
        let response = self.request(Method::GET, "/").send().await?;
        let response = Self::check_status(response).await?;
        let info: InfoResponse = response.json().await?;

        let distribution = info
            .version
            .distribution
            .unwrap_or_else(|| "elasticsearch".to_string());
        Ok(ConnectionStatus::reachable(distribution, info.version.number))
    }
}

fn build_bulk_body(index: &str, documents: &[Document]) -> Result<String> {
    let action = serde_json::to_string(&json!({ "index": { "_index": index } }))?;
    let mut body = String::new();
    for document in documents {
        body.push_str(&action);
        body.push('\n');
        body.push_str(&serde_json::to_string(document)?);
        body.push('\n');
    }
    Ok(body)
}

#[async_trait]
impl IndexClient for OpenSearchClient {
    async fn push_one(&self, destination: &str, document: &Document) -> bool {
        match self.index_document(destination, document).await {
            Ok(()) => true,
            Err(e) => {
                debug!(destination = %destination, error = %e, "Index request failed");
                false
            }
        }
    }

    async fn push_bulk(&self, destination: &str, documents: &[Document]) -> BulkOutcome {
        match self.bulk(destination, documents).await {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(destination = %destination, count = documents.len(), error = %e, "Bulk request failed");
                BulkOutcome::failed()
            }
        }
    }

    async fn test_connection(&self) -> ConnectionStatus {
        match self.info().await {
            Ok(status) => status,
            Err(e) => {
                debug!(error = %e, "Connection probe failed");
                ConnectionStatus::unreachable(e.to_string())
            }
        }
    }
}
