//! Connection, authentication and subscription lifecycle of one stream
//! session, driven forward by the monitor tick.
//!
//! The session never performs I/O itself. [`Session::advance`] returns the
//! next [`SessionAction`] for the caller to execute, and the socket and
//! protocol callbacks (`on_open`, `on_status`, `on_closed`, ...) feed the
//! outcomes back in. All times are epoch milliseconds supplied by the caller.

use feed_core::{
    config::{Config, StreamKind},
    events::{
        AuthenticationRequest, ChangeMessage, ConnectionMessage, MarketDataFilter, MarketFilter,
        Request, StatusCode, StatusMessage, SubscriptionRequest,
    },
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    /// Socket open. Authentication waits for the server's connection message.
    Connected,
    Authenticating,
    Authenticated,
    Subscribing,
    Subscribed,
}

impl SessionState {
    /// True while a socket is open.
    pub fn is_open(self) -> bool {
        !matches!(self, SessionState::Disconnected | SessionState::Connecting)
    }
}

/// What the caller must do next to move the session forward.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    Connect,
    Send(Request),
}

/// Server-issued resume tokens. Each token remembers the connection epoch it
/// arrived on; the pair is only trusted when both came from the same one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    initial_clk: Option<String>,
    clk: Option<String>,
    initial_epoch: u64,
    clk_epoch: u64,
}

impl Checkpoint {
    pub fn record(&mut self, initial_clk: Option<&str>, clk: Option<&str>, epoch: u64) {
        if let Some(v) = initial_clk {
            self.initial_clk = Some(v.to_string());
            self.initial_epoch = epoch;
        }
        if let Some(v) = clk {
            self.clk = Some(v.to_string());
            self.clk_epoch = epoch;
        }
    }

    /// `(initialClk, clk)` when the pair can be used to resume.
    pub fn resumable(&self) -> Option<(&str, &str)> {
        match (self.initial_clk.as_deref(), self.clk.as_deref()) {
            (Some(i), Some(c))
                if !i.is_empty() && !c.is_empty() && self.initial_epoch == self.clk_epoch =>
            {
                Some((i, c))
            }
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        *self = Checkpoint::default();
    }

    /// A resumed subscription continues the old token chain on a new socket.
    fn carry_to(&mut self, epoch: u64) {
        if self.resumable().is_some() {
            self.initial_epoch = epoch;
            self.clk_epoch = epoch;
        }
    }
}

/// Static inputs the session needs to build its requests.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub app_key: String,
    pub kind: StreamKind,
    pub heartbeat_ms: u64,
    pub max_connections_backoff_ms: u64,
    pub market_filter: MarketFilter,
    pub market_data_filter: MarketDataFilter,
}

impl SessionSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            app_key: cfg.credentials.app_key.clone(),
            kind: cfg.stream_kind,
            heartbeat_ms: cfg.heartbeat_ms,
            max_connections_backoff_ms: cfg.max_connections_backoff_ms,
            market_filter: MarketFilter::from(&cfg.filter),
            market_data_filter: MarketDataFilter::from(&cfg.filter),
        }
    }
}

#[derive(Debug)]
pub struct Session {
    settings: SessionSettings,
    state: SessionState,
    token: String,
    connection_id: Option<String>,
    epoch: u64,
    request_counter: u64,
    last_auth_request_id: u64,
    last_subscription_request_id: u64,
    resuming: bool,
    resubscribe_needed: bool,
    checkpoint: Checkpoint,
    last_data_at: u64,
    reconnect_not_before: Option<u64>,
    connections_available: Option<i64>,
    connections_reported_at: u64,
}

impl Session {
    pub fn new(settings: SessionSettings, token: impl Into<String>) -> Self {
        Self {
            settings,
            state: SessionState::Disconnected,
            token: token.into(),
            connection_id: None,
            epoch: 0,
            request_counter: 1,
            last_auth_request_id: 0,
            last_subscription_request_id: 0,
            resuming: false,
            resubscribe_needed: false,
            checkpoint: Checkpoint::default(),
            last_data_at: 0,
            reconnect_not_before: None,
            connections_available: None,
            connections_reported_at: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn kind(&self) -> StreamKind {
        self.settings.kind
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn set_token(&mut self, token: impl Into<String>) {
        self.token = token.into();
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn resubscribe_needed(&self) -> bool {
        self.resubscribe_needed
    }

    pub fn last_auth_request_id(&self) -> u64 {
        self.last_auth_request_id
    }

    pub fn last_subscription_request_id(&self) -> u64 {
        self.last_subscription_request_id
    }

    pub fn connections_available(&self) -> Option<i64> {
        self.connections_available
    }

    /// Receive time of the most recent socket read.
    pub fn last_data_at(&self) -> u64 {
        self.last_data_at
    }

    fn transition(&mut self, next: SessionState, now: u64) {
        if self.state != next {
            info!(from = ?self.state, to = ?next, at = now, "session transition");
            self.state = next;
        }
    }

    fn next_request_id(&mut self) -> u64 {
        self.request_counter += 1;
        self.request_counter
    }

    /// Whether a new connection attempt may start at `now`.
    pub fn connect_permitted(&self, now: u64) -> bool {
        if let Some(until) = self.reconnect_not_before {
            if now < until {
                info!(
                    retry_in_ms = until - now,
                    "delaying reconnection: max connection limit reached"
                );
                return false;
            }
        }
        // A reported zero holds for one backoff window, then a fresh
        // authentication is allowed to report again.
        if self.connections_available == Some(0)
            && now < self.connections_reported_at + self.settings.max_connections_backoff_ms
        {
            warn!("zero connections available, connection will not be attempted");
            return false;
        }
        true
    }

    /// Next step for the tick at `now`, if any.
    pub fn advance(&mut self, now: u64) -> Option<SessionAction> {
        match self.state {
            SessionState::Disconnected => {
                if !self.connect_permitted(now) {
                    return None;
                }
                self.transition(SessionState::Connecting, now);
                Some(SessionAction::Connect)
            }
            SessionState::Connecting => None,
            SessionState::Connected => {
                if self.connection_id.is_none() {
                    debug!("awaiting connection message");
                    return None;
                }
                Some(SessionAction::Send(self.authenticate(now)))
            }
            SessionState::Authenticating => {
                info!("authentication pending");
                None
            }
            SessionState::Authenticated => Some(SessionAction::Send(self.subscribe(now))),
            SessionState::Subscribing | SessionState::Subscribed => None,
        }
    }

    fn authenticate(&mut self, now: u64) -> Request {
        let id = self.next_request_id();
        self.last_auth_request_id = id;
        info!(id, "authenticating");
        self.transition(SessionState::Authenticating, now);
        Request::Authentication(AuthenticationRequest {
            id,
            app_key: self.settings.app_key.clone(),
            session: self.token.clone(),
        })
    }

    fn subscribe(&mut self, now: u64) -> Request {
        let resume = if self.resubscribe_needed {
            self.checkpoint
                .resumable()
                .map(|(i, c)| (i.to_string(), c.to_string()))
        } else {
            None
        };
        // A resume continues the current id sequence; a clean subscription
        // takes a fresh id.
        let id = if resume.is_some() {
            self.request_counter
        } else {
            self.next_request_id()
        };
        self.last_subscription_request_id = id;
        self.resuming = resume.is_some();
        let (initial_clk, clk) = match resume {
            Some((i, c)) => {
                info!(id, initial_clk = %i, clk = %c, "re-subscribing from checkpoint");
                (Some(i), Some(c))
            }
            None => {
                info!(id, "subscribing");
                (None, None)
            }
        };
        self.transition(SessionState::Subscribing, now);

        let mut request = SubscriptionRequest {
            id,
            heartbeat_ms: self.settings.heartbeat_ms,
            initial_clk,
            clk,
            market_filter: None,
            market_data_filter: None,
        };
        match self.settings.kind {
            StreamKind::Market => {
                request.market_filter = Some(self.settings.market_filter.clone());
                request.market_data_filter = Some(self.settings.market_data_filter.clone());
                Request::MarketSubscription(request)
            }
            StreamKind::Race => Request::RaceSubscription(request),
        }
    }

    pub fn on_open(&mut self, now: u64) {
        self.epoch += 1;
        self.connection_id = None;
        self.last_data_at = now;
        self.transition(SessionState::Connected, now);
    }

    pub fn on_connect_failed(&mut self, now: u64) {
        self.on_closed(now);
    }

    pub fn on_data(&mut self, now: u64) {
        self.last_data_at = now;
    }

    pub fn on_connection(&mut self, msg: &ConnectionMessage) {
        match &msg.connection_id {
            Some(id) => {
                info!(connection_id = %id, "connection established");
                self.connection_id = Some(id.clone());
            }
            None => warn!("connection message without a connection id"),
        }
    }

    pub fn on_change(&mut self, msg: &ChangeMessage) {
        self.checkpoint
            .record(msg.initial_clk.as_deref(), msg.clk.as_deref(), self.epoch);
    }

    pub fn on_status(&mut self, msg: &StatusMessage, now: u64) {
        match msg.status_code {
            Some(StatusCode::Success) => self.on_success(msg, now),
            Some(StatusCode::Failure) => self.on_failure(msg, now),
            _ => debug!(id = msg.request_id(), "ignoring status without a status code"),
        }
    }

    fn on_success(&mut self, msg: &StatusMessage, now: u64) {
        let id = msg.request_id();
        if id == 0 {
            return;
        }
        match self.state {
            SessionState::Authenticating => {
                if id != self.last_auth_request_id {
                    error!(
                        expected = self.last_auth_request_id,
                        received = id,
                        "authentication response id does not match last request"
                    );
                    self.transition(SessionState::Connected, now);
                    return;
                }
                self.reconnect_not_before = None;
                self.transition(SessionState::Authenticated, now);
                match msg.connections_available {
                    Some(n) => {
                        info!(connections_available = n, "authenticated");
                        self.connections_available = Some(n);
                        self.connections_reported_at = now;
                    }
                    None => warn!("authentication success did not report available connections"),
                }
            }
            SessionState::Subscribing => {
                if id != self.last_subscription_request_id {
                    error!(
                        expected = self.last_subscription_request_id,
                        received = id,
                        "subscription response id does not match last request"
                    );
                    self.resuming = false;
                    self.transition(SessionState::Authenticated, now);
                    return;
                }
                if self.resuming {
                    self.checkpoint.carry_to(self.epoch);
                }
                self.resuming = false;
                self.resubscribe_needed = false;
                self.transition(SessionState::Subscribed, now);
            }
            _ => debug!(id, state = ?self.state, "unsolicited success status"),
        }
    }

    fn on_failure(&mut self, msg: &StatusMessage, now: u64) {
        error!(
            id = msg.request_id(),
            error_code = msg.error_code.as_deref().unwrap_or(""),
            error_message = msg.error_message.as_deref().unwrap_or(""),
            connection_closed = msg.connection_closed.unwrap_or(true),
            "status failure"
        );
        if feed_core::config::metrics_enabled() {
            metrics::counter!("stream_status_failures_total").increment(1);
        }
        match self.state {
            SessionState::Authenticating => self.transition(SessionState::Connected, now),
            SessionState::Subscribing => {
                if self.resuming {
                    warn!("resubscription rejected, discarding checkpoint");
                    self.checkpoint.clear();
                }
                self.resuming = false;
                self.transition(SessionState::Authenticated, now);
            }
            _ => {}
        }
        if msg.is_max_connections() {
            let until = now + self.settings.max_connections_backoff_ms;
            warn!(
                delay_ms = self.settings.max_connections_backoff_ms,
                "max connection limit reached, delaying reconnection"
            );
            self.reconnect_not_before = Some(until);
        }
    }

    /// Socket closed or errored. Checkpoint tokens and the last reported
    /// connection count survive so the next attempt can use them.
    pub fn on_closed(&mut self, now: u64) {
        self.connection_id = None;
        self.resuming = false;
        self.resubscribe_needed = true;
        self.transition(SessionState::Disconnected, now);
    }
}
