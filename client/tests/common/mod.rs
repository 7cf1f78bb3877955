#![allow(dead_code)]

use feed_client::{
    monitor::{HealthMonitor, MonitorSettings},
    refresh::RefreshScheduler,
    Registry, Session, SessionSettings, StreamEngine,
};
use feed_core::{
    config::StreamKind,
    events::{ChangeMessage, MarketDataFilter, MarketFilter, StatusMessage, StreamMessage},
    frame::parse_segment,
    Frame, LogLayout,
};

pub const BACKOFF_MS: u64 = 10_000;
pub const GRACE_MS: u64 = 10_000;

pub fn settings(kind: StreamKind) -> SessionSettings {
    SessionSettings {
        app_key: "app-key".into(),
        kind,
        heartbeat_ms: 2000,
        max_connections_backoff_ms: BACKOFF_MS,
        market_filter: MarketFilter {
            market_types: vec!["WIN".into(), "PLACE".into()],
            country_codes: vec!["GB".into()],
            event_type_ids: vec!["7".into()],
        },
        market_data_filter: MarketDataFilter {
            ladder_levels: 10,
            fields: vec!["EX_MARKET_DEF".into(), "EX_LTP".into()],
        },
    }
}

pub fn monitor_settings() -> MonitorSettings {
    MonitorSettings {
        heartbeat_ms: 2000,
        stale_warn_multiplier: 1,
        stale_close_multiplier: 2,
        keepalive_interval_ms: 3_600_000,
        archive_check_interval_ms: 60_000,
        latency_threshold_ms: 100,
        latency_report_ticks: 1000,
    }
}

pub fn engine(kind: StreamKind) -> StreamEngine {
    let layout = LogLayout::new("/data/logs", "/data/logs/closed");
    let registry = match kind {
        StreamKind::Market => Registry::new(layout),
        StreamKind::Race => Registry::without_refresh(layout),
    };
    StreamEngine::from_parts(
        Session::new(settings(kind), "token-1"),
        registry,
        RefreshScheduler::new(10_000, 2, 0),
        HealthMonitor::new(monitor_settings(), 0),
        GRACE_MS,
    )
}

pub fn frame(raw: &str, received_at: u64) -> Frame {
    parse_segment(raw.as_bytes(), received_at).expect("valid frame")
}

pub fn status(raw: &str) -> StatusMessage {
    match frame(raw, 0).message {
        StreamMessage::Status(s) => s,
        other => panic!("expected status, got {}", other.op()),
    }
}

pub fn change(raw: &str) -> ChangeMessage {
    match frame(raw, 0).message {
        StreamMessage::MarketChange(c) | StreamMessage::RaceChange(c) => c,
        other => panic!("expected change, got {}", other.op()),
    }
}

pub fn success(id: u64) -> StatusMessage {
    status(&format!(
        r#"{{"op":"status","id":{id},"statusCode":"SUCCESS","connectionClosed":false,"connectionsAvailable":5}}"#
    ))
}

pub fn failure(id: u64, code: &str) -> StatusMessage {
    status(&format!(
        r#"{{"op":"status","id":{id},"statusCode":"FAILURE","errorCode":"{code}","connectionClosed":true}}"#
    ))
}
