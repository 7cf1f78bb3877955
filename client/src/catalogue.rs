//! Metadata lookup for tracked entities over the betting JSON-RPC API.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::registry::EntityMetadata;

const LIST_MARKET_CATALOGUE: &str = "SportsAPING/v1.0/listMarketCatalogue";

/// One lookup result. Fields beyond the ones the registry keeps are
/// preserved so the persisted record carries the full response item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogueEntry {
    #[serde(rename = "marketId")]
    pub market_id: String,
    #[serde(rename = "marketName", default, skip_serializing_if = "Option::is_none")]
    pub market_name: Option<String>,
    #[serde(
        rename = "marketStartTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub market_start_time: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CatalogueEntry {
    pub fn metadata(&self) -> EntityMetadata {
        EntityMetadata {
            name: self.market_name.clone(),
            start_time: self.market_start_time.clone(),
            status: self
                .extra
                .get("status")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        }
    }
}

#[async_trait]
pub trait CatalogueLookup: Send + Sync {
    /// Look up metadata for `ids`. Ids the service does not know are simply
    /// absent from the result.
    async fn lookup(
        &self,
        session: &str,
        ids: &[String],
        fields: &[String],
        max_results: usize,
    ) -> Result<Vec<CatalogueEntry>>;
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Vec<CatalogueEntry>>,
    error: Option<Value>,
}

pub struct HttpCatalogueLookup {
    client: Client,
    url: String,
    app_key: String,
}

impl HttpCatalogueLookup {
    pub fn new(client: Client, url: impl Into<String>, app_key: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            app_key: app_key.into(),
        }
    }
}

#[async_trait]
impl CatalogueLookup for HttpCatalogueLookup {
    async fn lookup(
        &self,
        session: &str,
        ids: &[String],
        fields: &[String],
        max_results: usize,
    ) -> Result<Vec<CatalogueEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({
            "jsonrpc": "2.0",
            "method": LIST_MARKET_CATALOGUE,
            "params": {
                "filter": { "marketIds": ids },
                "maxResults": max_results,
                "marketProjection": fields,
                "sort": "FIRST_TO_START",
            },
            "id": 1,
        });
        let resp = self
            .client
            .post(&self.url)
            .header("Accept", "application/json")
            .header("X-Application", &self.app_key)
            .header("X-Authentication", session)
            .json(&body)
            .send()
            .await
            .context("sending catalogue request")?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("catalogue lookup failed with HTTP status {status}"));
        }
        let rpc: RpcResponse = resp.json().await.context("decoding catalogue response")?;
        if let Some(err) = rpc.error {
            return Err(anyhow!("catalogue lookup error: {err}"));
        }
        rpc.result
            .ok_or_else(|| anyhow!("catalogue response carried no result"))
    }
}
