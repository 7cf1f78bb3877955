use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{FilterConfig, StreamKind};

/// Two-byte terminator closing every protocol message in both directions.
pub const TERMINATOR: &[u8; 2] = b"\r\n";

/// Error code the server reports when the account has no free stream slots.
pub const MAX_CONNECTION_LIMIT_EXCEEDED: &str = "MAX_CONNECTION_LIMIT_EXCEEDED";

/// Inbound protocol message, dispatched on its `op` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op")]
pub enum StreamMessage {
    #[serde(rename = "connection")]
    Connection(ConnectionMessage),
    #[serde(rename = "status")]
    Status(StatusMessage),
    #[serde(rename = "mcm")]
    MarketChange(ChangeMessage),
    #[serde(rename = "rcm")]
    RaceChange(ChangeMessage),
    #[serde(other)]
    Unknown,
}

impl StreamMessage {
    pub fn op(&self) -> &'static str {
        match self {
            StreamMessage::Connection(_) => "connection",
            StreamMessage::Status(_) => "status",
            StreamMessage::MarketChange(_) => "mcm",
            StreamMessage::RaceChange(_) => "rcm",
            StreamMessage::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionMessage {
    #[serde(rename = "connectionId")]
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum StatusCode {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILURE")]
    Failure,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusMessage {
    /// Echo of the request id this status answers. Zero or absent for
    /// unsolicited status messages.
    pub id: Option<u64>,
    #[serde(rename = "statusCode")]
    pub status_code: Option<StatusCode>,
    #[serde(rename = "errorCode")]
    pub error_code: Option<String>,
    #[serde(rename = "errorMessage")]
    pub error_message: Option<String>,
    #[serde(rename = "connectionClosed")]
    pub connection_closed: Option<bool>,
    #[serde(rename = "connectionsAvailable")]
    pub connections_available: Option<i64>,
}

impl StatusMessage {
    pub fn request_id(&self) -> u64 {
        self.id.unwrap_or(0)
    }

    pub fn is_max_connections(&self) -> bool {
        self.error_code.as_deref() == Some(MAX_CONNECTION_LIMIT_EXCEEDED)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ChangeType {
    #[serde(rename = "SUB_IMAGE")]
    SubImage,
    #[serde(rename = "RESUB_DELTA")]
    ResubDelta,
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    #[serde(other)]
    Other,
}

/// Change message carrying per-entity updates (`mc` for markets, `rc` for
/// races) plus the checkpoint tokens used to resume the subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeMessage {
    pub id: Option<u64>,
    pub ct: Option<ChangeType>,
    pub clk: Option<String>,
    #[serde(rename = "initialClk")]
    pub initial_clk: Option<String>,
    /// Publish time in epoch milliseconds.
    pub pt: Option<u64>,
    #[serde(rename = "heartbeatMs")]
    pub heartbeat_ms: Option<u64>,
    pub mc: Option<Vec<Value>>,
    pub rc: Option<Vec<Value>>,
}

impl ChangeMessage {
    pub fn is_heartbeat(&self) -> bool {
        self.ct == Some(ChangeType::Heartbeat)
    }

    /// Entity change items for the given stream kind.
    pub fn items(&self, kind: StreamKind) -> Option<&[Value]> {
        match kind {
            StreamKind::Market => self.mc.as_deref(),
            StreamKind::Race => self.rc.as_deref(),
        }
    }
}

/// Lifecycle status reported for an entity by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStatus {
    Open,
    Closed,
}

impl EntityStatus {
    /// Map a feed status string. Anything other than `CLOSED` is still live.
    pub fn from_feed(status: &str) -> Self {
        if status == "CLOSED" {
            EntityStatus::Closed
        } else {
            EntityStatus::Open
        }
    }
}

/// The fields the registry needs out of one entity change item.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityChange<'a> {
    pub id: &'a str,
    pub version: Option<u64>,
    pub status: Option<EntityStatus>,
    pub raw: &'a Value,
}

impl<'a> EntityChange<'a> {
    /// Extract id, definition version and status from a change item.
    /// Returns `None` when the item carries no id.
    pub fn from_item(kind: StreamKind, item: &'a Value) -> Option<Self> {
        let key = match kind {
            StreamKind::Market => "id",
            StreamKind::Race => "mid",
        };
        let id = item.get(key)?.as_str()?;
        let definition = item.get("marketDefinition");
        let version = definition
            .and_then(|d| d.get("version"))
            .and_then(|v| v.as_u64());
        let status = definition
            .and_then(|d| d.get("status"))
            .and_then(|v| v.as_str())
            .map(EntityStatus::from_feed);
        Some(Self {
            id,
            version,
            status,
            raw: item,
        })
    }
}

/// Outbound protocol request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op")]
pub enum Request {
    #[serde(rename = "authentication")]
    Authentication(AuthenticationRequest),
    #[serde(rename = "marketSubscription")]
    MarketSubscription(SubscriptionRequest),
    #[serde(rename = "raceSubscription")]
    RaceSubscription(SubscriptionRequest),
}

impl Request {
    pub fn id(&self) -> u64 {
        match self {
            Request::Authentication(r) => r.id,
            Request::MarketSubscription(r) | Request::RaceSubscription(r) => r.id,
        }
    }

    /// Serialize to a single terminated protocol line.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.extend_from_slice(TERMINATOR);
        Ok(line)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationRequest {
    pub id: u64,
    pub app_key: String,
    pub session: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub id: u64,
    pub heartbeat_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_clk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_filter: Option<MarketFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_data_filter: Option<MarketDataFilter>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketFilter {
    pub market_types: Vec<String>,
    pub country_codes: Vec<String>,
    pub event_type_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketDataFilter {
    pub ladder_levels: u32,
    pub fields: Vec<String>,
}

impl From<&FilterConfig> for MarketFilter {
    fn from(f: &FilterConfig) -> Self {
        Self {
            market_types: f.market_types.clone(),
            country_codes: f.country_codes.clone(),
            event_type_ids: f.event_type_ids.clone(),
        }
    }
}

impl From<&FilterConfig> for MarketDataFilter {
    fn from(f: &FilterConfig) -> Self {
        Self {
            ladder_levels: f.ladder_levels,
            fields: f.fields.clone(),
        }
    }
}
