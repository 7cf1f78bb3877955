//! Periodic health checks run from the monitor tick: session token
//! keep-alive, publish latency accounting, archival cadence and data
//! staleness.

use feed_core::config::Config;
use tracing::info;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub heartbeat_ms: u64,
    pub stale_warn_multiplier: u64,
    pub stale_close_multiplier: u64,
    pub keepalive_interval_ms: u64,
    pub archive_check_interval_ms: u64,
    pub latency_threshold_ms: u64,
    pub latency_report_ticks: u64,
}

impl MonitorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            heartbeat_ms: cfg.heartbeat_ms,
            stale_warn_multiplier: cfg.stale_warn_multiplier,
            stale_close_multiplier: cfg.stale_close_multiplier,
            keepalive_interval_ms: cfg.keepalive_interval_ms,
            archive_check_interval_ms: cfg.archive_check_interval_ms,
            latency_threshold_ms: cfg.latency_threshold_ms,
            latency_report_ticks: cfg.latency_report_ticks,
        }
    }
}

/// Data freshness relative to the subscription heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    /// Silent for longer than the warning threshold; carries the lag in ms.
    Lagging(u64),
    /// Silent for longer than the close threshold; carries the lag in ms.
    Stale(u64),
}

#[derive(Debug)]
pub struct HealthMonitor {
    settings: MonitorSettings,
    ticks: u64,
    lagged_messages: u64,
    last_keepalive: u64,
    keepalive_in_flight: bool,
    next_archive_check: u64,
}

impl HealthMonitor {
    /// `start` is when the session token was obtained.
    pub fn new(settings: MonitorSettings, start: u64) -> Self {
        let next_archive_check = start + settings.archive_check_interval_ms;
        Self {
            settings,
            ticks: 0,
            lagged_messages: 0,
            last_keepalive: start,
            keepalive_in_flight: false,
            next_archive_check,
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Count a tick and return the running total.
    pub fn begin_tick(&mut self) -> u64 {
        self.ticks += 1;
        self.ticks
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn lagged_messages(&self) -> u64 {
        self.lagged_messages
    }

    /// True when a keep-alive should start now. Marks one as in flight.
    pub fn keepalive_due(&mut self, now: u64) -> bool {
        if self.keepalive_in_flight
            || now.saturating_sub(self.last_keepalive) <= self.settings.keepalive_interval_ms
        {
            return false;
        }
        self.keepalive_in_flight = true;
        true
    }

    /// A failed keep-alive leaves the interval expired, so the next tick
    /// tries again.
    pub fn keepalive_finished(&mut self, now: u64, succeeded: bool) {
        self.keepalive_in_flight = false;
        if succeeded {
            self.last_keepalive = now;
        }
    }

    pub fn keepalive_in_flight(&self) -> bool {
        self.keepalive_in_flight
    }

    /// Account one message's publish-to-receive lag. Returns true when it
    /// exceeded the threshold.
    pub fn observe_publish(&mut self, published_at: u64, received_at: u64) -> bool {
        let lag = received_at.saturating_sub(published_at);
        if feed_core::config::metrics_enabled() {
            metrics::gauge!("stream_receive_lag_ms").set(lag as f64);
        }
        if lag > self.settings.latency_threshold_ms {
            self.lagged_messages += 1;
            if feed_core::config::metrics_enabled() {
                metrics::counter!("stream_lagged_messages_total").increment(1);
            }
            return true;
        }
        false
    }

    /// Log the lagged-message count every `latency_report_ticks` ticks.
    pub fn report_latency(&self) -> bool {
        let every = self.settings.latency_report_ticks;
        if every == 0 || self.ticks % every != 0 {
            return false;
        }
        info!(
            lagged = self.lagged_messages,
            threshold_ms = self.settings.latency_threshold_ms,
            "latency update: messages received over threshold"
        );
        true
    }

    pub fn archive_check_due(&mut self, now: u64) -> bool {
        if now < self.next_archive_check {
            return false;
        }
        self.next_archive_check = now + self.settings.archive_check_interval_ms;
        true
    }

    pub fn staleness(&self, now: u64, last_data_at: u64) -> Staleness {
        let lag = now.saturating_sub(last_data_at);
        let hb = self.settings.heartbeat_ms;
        if lag > hb.saturating_mul(self.settings.stale_close_multiplier) {
            Staleness::Stale(lag)
        } else if lag > hb.saturating_mul(self.settings.stale_warn_multiplier) {
            Staleness::Lagging(lag)
        } else {
            Staleness::Fresh
        }
    }
}
