//! Deterministic core of the stream client.
//!
//! [`StreamEngine`] combines the session, the registry, the refresh scheduler
//! and the health monitor. Every input carries its own timestamp and every
//! output is an [`Effect`] for the driver to perform, so the engine can be
//! exercised without sockets or clocks.

use feed_core::{
    config::{Config, StreamKind},
    events::{ChangeMessage, EntityChange, Request, StreamMessage},
    Frame, LogLayout,
};
use tracing::{debug, info, warn};

use crate::{
    catalogue::CatalogueEntry,
    monitor::{HealthMonitor, MonitorSettings, Staleness},
    refresh::RefreshScheduler,
    registry::{ArchiveTask, Registry},
    session::{Session, SessionAction, SessionSettings, SessionState},
};

/// How long a race entity may go without updates before it is retired.
pub const DEFAULT_RACE_IDLE_MS: u64 = 600_000;

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Connect,
    Send(Request),
    Close,
    Append { entity_id: String, record: String },
    Relocate(ArchiveTask),
    Lookup { session: String, ids: Vec<String> },
    KeepAlive(String),
    Shutdown,
}

#[derive(Debug)]
pub struct StreamEngine {
    kind: StreamKind,
    session: Session,
    registry: Registry,
    scheduler: RefreshScheduler,
    monitor: HealthMonitor,
    archive_grace_ms: u64,
    race_idle_ms: u64,
    enrich: bool,
    shutdown_requested: bool,
}

impl StreamEngine {
    /// Engine for a session whose token was obtained at `now`. Metadata
    /// enrichment only runs for market streams.
    pub fn new(cfg: &Config, token: impl Into<String>, now: u64) -> Self {
        let layout = LogLayout::new(&cfg.log_dir, &cfg.archive_dir);
        let enrich = cfg.stream_kind == StreamKind::Market;
        let registry = if enrich {
            Registry::new(layout)
        } else {
            Registry::without_refresh(layout)
        };
        Self::from_parts(
            Session::new(SessionSettings::from_config(cfg), token),
            registry,
            RefreshScheduler::new(cfg.refresh_interval_ms, cfg.refresh_batch_size, now),
            HealthMonitor::new(MonitorSettings::from_config(cfg), now),
            cfg.archive_grace_ms,
        )
        .with_race_idle_ms(cfg.race_idle_ms)
    }

    pub fn from_parts(
        session: Session,
        registry: Registry,
        scheduler: RefreshScheduler,
        monitor: HealthMonitor,
        archive_grace_ms: u64,
    ) -> Self {
        let kind = session.kind();
        Self {
            kind,
            enrich: kind == StreamKind::Market,
            session,
            registry,
            scheduler,
            monitor,
            archive_grace_ms,
            race_idle_ms: DEFAULT_RACE_IDLE_MS,
            shutdown_requested: false,
        }
    }

    /// Race entities never close, so they are dropped after this long
    /// without an update instead.
    pub fn with_race_idle_ms(mut self, idle_ms: u64) -> Self {
        self.race_idle_ms = idle_ms;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }

    /// Replace the session token, as after a fresh login at `now`.
    pub fn on_login(&mut self, token: impl Into<String>, now: u64) {
        self.session.set_token(token);
        self.monitor.keepalive_finished(now, true);
        self.scheduler.reset(now);
    }

    pub fn on_open(&mut self, now: u64) {
        if feed_core::config::metrics_enabled() {
            metrics::counter!("stream_connections_total").increment(1);
        }
        self.session.on_open(now);
    }

    pub fn on_connect_failed(&mut self, now: u64) {
        self.session.on_connect_failed(now);
    }

    pub fn on_closed(&mut self, now: u64) {
        self.session.on_closed(now);
    }

    /// Bytes arrived on the socket at `now`.
    pub fn on_data(&mut self, now: u64) {
        self.session.on_data(now);
    }

    pub fn handle_frame(&mut self, frame: &Frame) -> Vec<Effect> {
        if feed_core::config::metrics_enabled() {
            metrics::counter!("stream_frames_total", "op" => frame.message.op()).increment(1);
        }
        #[cfg(feature = "debug-logs")]
        tracing::debug!(op = frame.message.op(), raw = %frame.raw);
        match &frame.message {
            StreamMessage::Connection(msg) => {
                info!(raw = %frame.raw, "connection message");
                self.session.on_connection(msg);
                Vec::new()
            }
            StreamMessage::Status(msg) => {
                info!(raw = %frame.raw, "status message");
                self.session.on_status(msg, frame.received_at);
                Vec::new()
            }
            StreamMessage::MarketChange(msg) | StreamMessage::RaceChange(msg) => {
                self.on_change(msg, frame.received_at)
            }
            StreamMessage::Unknown => {
                warn!(raw = %frame.raw, "unknown op");
                Vec::new()
            }
        }
    }

    fn on_change(&mut self, msg: &ChangeMessage, received_at: u64) -> Vec<Effect> {
        if let Some(pt) = msg.pt {
            self.monitor.observe_publish(pt, received_at);
        }
        self.session.on_change(msg);
        if msg.is_heartbeat() {
            return Vec::new();
        }
        let Some(items) = msg.items(self.kind) else {
            debug!(id = ?msg.id, "change message without entity changes");
            return Vec::new();
        };

        let publish_time = msg.pt.unwrap_or(0);
        let mut effects = Vec::with_capacity(items.len());
        for item in items {
            let Some(change) = EntityChange::from_item(self.kind, item) else {
                warn!(item = %item, "change item without an entity id");
                continue;
            };
            self.registry
                .upsert(change.id, change.version, change.status, received_at);
            effects.push(Effect::Append {
                entity_id: change.id.to_string(),
                record: format!("{received_at}|{publish_time}|{}", change.raw),
            });
        }
        if feed_core::config::metrics_enabled() {
            metrics::counter!("stream_entity_changes_total").increment(effects.len() as u64);
        }
        effects
    }

    /// One monitor tick at `now`.
    pub fn tick(&mut self, now: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.monitor.begin_tick();

        if self.monitor.keepalive_due(now) {
            info!("refreshing session token");
            effects.push(Effect::KeepAlive(self.session.token().to_string()));
        }

        self.monitor.report_latency();

        if self.shutdown_requested {
            warn!("shutdown requested, closing stream");
            if self.session.state().is_open() {
                effects.push(Effect::Close);
            }
            effects.push(Effect::Shutdown);
            return effects;
        }

        if self.enrich {
            if let Some(ids) = self
                .scheduler
                .poll(now, self.registry.refresh_queue_mut())
            {
                effects.push(Effect::Lookup {
                    session: self.session.token().to_string(),
                    ids,
                });
            }
        }

        if self.monitor.archive_check_due(now) {
            for task in self.registry.drain_archivable(now, self.archive_grace_ms) {
                info!(entity = %task.entity_id, archive = %task.archive.display(), "archiving closed entity");
                effects.push(Effect::Relocate(task));
            }
            if self.kind == StreamKind::Race {
                self.registry.retire_idle(now, self.race_idle_ms);
            }
        }

        if self.session.state().is_open() {
            match self
                .monitor
                .staleness(now, self.session.last_data_at())
            {
                Staleness::Fresh => {}
                Staleness::Lagging(lag) => warn!(lag_ms = lag, "stream data is late"),
                Staleness::Stale(lag) => {
                    if self.session.state() == SessionState::Subscribed {
                        warn!(lag_ms = lag, "no stream data, closing connection");
                        if feed_core::config::metrics_enabled() {
                            metrics::counter!("stream_stale_closes_total").increment(1);
                        }
                        effects.push(Effect::Close);
                        return effects;
                    }
                    warn!(lag_ms = lag, state = ?self.session.state(), "stream data is late");
                }
            }
        }

        match self.session.advance(now) {
            Some(SessionAction::Connect) => effects.push(Effect::Connect),
            Some(SessionAction::Send(request)) => effects.push(Effect::Send(request)),
            None => {}
        }
        effects
    }

    /// Apply metadata lookup results received at `now`.
    pub fn on_catalogue(&mut self, entries: Vec<CatalogueEntry>, now: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        for entry in entries {
            if self
                .registry
                .apply_metadata(&entry.market_id, entry.metadata(), now)
                .is_none()
            {
                debug!(entity = %entry.market_id, "metadata for untracked entity dropped");
                continue;
            }
            let json = match serde_json::to_string(&entry) {
                Ok(json) => json,
                Err(e) => {
                    warn!(entity = %entry.market_id, error = %e, "failed to encode metadata record");
                    continue;
                }
            };
            effects.push(Effect::Append {
                record: format!("{now}|MARKETCATALOG|{json}"),
                entity_id: entry.market_id,
            });
        }
        effects
    }

    /// Outcome of a keep-alive started by an [`Effect::KeepAlive`].
    pub fn on_keep_alive(&mut self, result: anyhow::Result<String>, now: u64) {
        match result {
            Ok(token) => {
                info!("session token extended");
                self.session.set_token(token);
                self.monitor.keepalive_finished(now, true);
            }
            Err(e) => {
                warn!(error = %e, "keep-alive failed");
                self.monitor.keepalive_finished(now, false);
            }
        }
    }
}
