//! The document-index bulk writer.
//!
//! Rows are upserted with `{"update": ...}` + `{"doc": ..., "doc_as_upsert":
//! true}` bulk operations, so replays converge instead of duplicating
//! documents. The HTTP client is opened per pipeline execution and dropped
//! by `close`.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;

use crate::error::ContractError;
use crate::record::{self, Record};
use crate::targets::{IndexTarget, TargetCatalog};
use crate::write::Writer;

/// Document-index connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

impl EsConfig {
    pub const DEFAULT_URL: &str = "http://localhost:9200";

    /// Build a config from `SLUICE_ES_URL` / `SLUICE_ES_USERNAME` /
    /// `SLUICE_ES_PASSWORD`, with defaults for anything unset.
    pub fn from_env() -> Self {
        Self {
            url: env::var("SLUICE_ES_URL").unwrap_or_else(|_| Self::DEFAULT_URL.to_owned()),
            username: env::var("SLUICE_ES_USERNAME").ok(),
            password: env::var("SLUICE_ES_PASSWORD").ok(),
            timeout_secs: env::var("SLUICE_ES_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_timeout_secs),
        }
    }
}

impl Default for EsConfig {
    fn default() -> Self {
        Self {
            url: Self::DEFAULT_URL.to_owned(),
            username: None,
            password: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

pub struct ElasticWriter {
    config: EsConfig,
    catalog: Arc<TargetCatalog>,
    client: reqwest::Client,
}

impl ElasticWriter {
    pub fn new(config: EsConfig, catalog: Arc<TargetCatalog>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            config,
            catalog,
            client,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.config.url.trim_end_matches('/'), path);
        let mut builder = self.client.request(method, url);
        if let Some(ref user) = self.config.username {
            builder = builder.basic_auth(user, self.config.password.as_deref());
        }
        builder
    }

    /// Create the index with its registered mappings unless it exists.
    async fn ensure_index(&self, index: &str, entry: &IndexTarget) -> Result<()> {
        let head = self
            .request(reqwest::Method::HEAD, index)
            .send()
            .await
            .with_context(|| format!("failed to check index {index:?}"))?;

        if head.status().is_success() {
            return Ok(());
        }

        let body = create_index_body(entry);
        let response = self
            .request(reqwest::Method::PUT, index)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to create index {index:?}"))?;

        // A concurrent writer may have created it between HEAD and PUT.
        if response.status().is_success() || response.status() == reqwest::StatusCode::BAD_REQUEST
        {
            return Ok(());
        }

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        bail!("index creation for {index:?} failed: {status} {text}");
    }
}

#[async_trait]
impl Writer for ElasticWriter {
    async fn write(
        &self,
        _conn: &mut PgConnection,
        target: &str,
        rows: &[Record],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let (index, entry) = self.catalog.index(target)?;
        self.ensure_index(index, entry).await?;

        let body = build_bulk_body(index, &entry.id_field, rows)?;

        let response = self
            .request(reqwest::Method::POST, "_bulk")
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .with_context(|| format!("bulk request to index {index:?} failed"))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("bulk request to index {index:?} failed: {status} {text}");
        }

        let summary: serde_json::Value = response
            .json()
            .await
            .context("bulk response was not valid JSON")?;

        if summary["errors"].as_bool().unwrap_or(false) {
            let first_error = first_item_error(&summary);
            bail!(
                "bulk write to index {index:?} reported item errors; first: {}",
                first_error.unwrap_or_else(|| "unknown".to_owned())
            );
        }

        Ok(rows.len() as u64)
    }

    async fn close(&self) -> Result<()> {
        // The HTTP client and its pooled connections drop with the writer.
        Ok(())
    }
}

/// Body for index creation: registered mappings, or dynamic mapping when
/// none are configured.
fn create_index_body(entry: &IndexTarget) -> serde_json::Value {
    match &entry.mappings {
        Some(mappings) => serde_json::json!({ "mappings": mappings }),
        None => serde_json::json!({ "mappings": { "dynamic": true } }),
    }
}

/// Assemble the NDJSON bulk body: one update action and one
/// `doc_as_upsert` document per row.
fn build_bulk_body(index: &str, id_field: &str, rows: &[Record]) -> Result<String> {
    let mut body = String::new();

    for row in rows {
        let doc = record::record_to_json(row);

        let id = match doc.get(id_field) {
            None => bail!(ContractError::MissingColumn(id_field.to_owned())),
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };

        let action = serde_json::json!({ "update": { "_index": index, "_id": id } });
        let payload = serde_json::json!({ "doc": doc, "doc_as_upsert": true });

        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&payload.to_string());
        body.push('\n');
    }

    Ok(body)
}

/// Pull the first per-item error out of a bulk response.
fn first_item_error(summary: &serde_json::Value) -> Option<String> {
    let items = summary["items"].as_array()?;
    for item in items {
        for op in ["update", "index", "create", "delete"] {
            if let Some(error) = item.get(op).and_then(|v| v.get("error")) {
                return Some(error.to_string());
            }
        }
    }
    None
}
