use anyhow::{anyhow, Context, Result};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use simd_json::serde::from_slice;
use std::{env, fs, path::PathBuf, str::FromStr, time::Duration};

#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub app_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***redacted***")
            .field("app_key", &"***redacted***")
            .finish()
    }
}

/// Which push feed the session subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Market change stream: `marketSubscription`, entities keyed by `id`.
    Market,
    /// Race position stream: `raceSubscription`, entities keyed by `mid`.
    Race,
}

impl FromStr for StreamKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "market" => Ok(StreamKind::Market),
            "race" => Ok(StreamKind::Race),
            other => Err(anyhow!("unknown stream kind: {other}")),
        }
    }
}

/// Entity filter sent with a market subscription.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub market_types: Vec<String>,
    pub country_codes: Vec<String>,
    pub event_type_ids: Vec<String>,
    pub ladder_levels: u32,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub credentials: Credentials,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub stream_host: String,
    pub stream_port: u16,
    pub stream_kind: StreamKind,
    pub connect_timeout_ms: u64,
    pub heartbeat_ms: u64,
    pub monitor_tick_ms: u64,
    pub stale_warn_multiplier: u64,
    pub stale_close_multiplier: u64,
    pub max_connections_backoff_ms: u64,
    pub keepalive_interval_ms: u64,
    pub refresh_interval_ms: u64,
    pub refresh_batch_size: usize,
    pub lookup_max_results: usize,
    pub lookup_fields: Vec<String>,
    pub archive_check_interval_ms: u64,
    pub archive_grace_ms: u64,
    /// Race entities with no update for this long leave the registry.
    pub race_idle_ms: u64,
    pub latency_threshold_ms: u64,
    pub latency_report_ticks: u64,
    pub filter: FilterConfig,
    pub log_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub login_url: String,
    pub keepalive_url: String,
    pub betting_api_url: String,
    pub enable_metrics: bool,
    pub ca_bundle: Option<String>,
    pub cert_pins: Vec<String>,
}

static CONFIG: OnceCell<Config> = OnceCell::new();

const DEFAULT_STREAM_FIELDS: &[&str] = &[
    "EX_ALL_OFFERS",
    "EX_TRADED",
    "EX_TRADED_VOL",
    "EX_LTP",
    "EX_MARKET_DEF",
    "EX_BEST_OFFERS_DISP",
    "SP_PROJECTED",
];

const DEFAULT_LOOKUP_FIELDS: &[&str] = &[
    "MARKET_DESCRIPTION",
    "RUNNER_METADATA",
    "MARKET_START_TIME",
    "EVENT",
    "COMPETITION",
    "EVENT_TYPE",
];

fn load_credentials() -> Result<Credentials> {
    if let (Ok(username), Ok(password), Ok(app_key)) = (
        env::var("STREAM_USERNAME"),
        env::var("STREAM_PASSWORD"),
        env::var("STREAM_APP_KEY"),
    ) {
        if !username.is_empty() && !password.is_empty() && !app_key.is_empty() {
            return Ok(Credentials {
                username,
                password,
                app_key,
            });
        }
    }

    if let Ok(path) = env::var("STREAM_CREDENTIALS_FILE") {
        let mut content = fs::read(&path).context("reading credentials file")?;
        let creds: Credentials = from_slice(&mut content).context("parsing credentials file")?;
        if !creds.username.is_empty() && !creds.password.is_empty() && !creds.app_key.is_empty()
        {
            return Ok(creds);
        }
    }

    Err(anyhow!(
        "STREAM_USERNAME, STREAM_PASSWORD and STREAM_APP_KEY must be set via env or credentials file"
    ))
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(v) => v
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect(),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}

fn env_num<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let credentials = load_credentials()?;
        let stream_kind = match env::var("STREAM_KIND") {
            Ok(v) => v.parse()?,
            Err(_) => StreamKind::Market,
        };
        let log_dir = PathBuf::from(env::var("LOG_DIR").unwrap_or_else(|_| "./stream_logs".into()));
        let archive_dir = env::var("ARCHIVE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| log_dir.join("closed"));

        Ok(Config {
            credentials,
            cert_file: env::var("STREAM_CERT_FILE").ok().map(PathBuf::from),
            key_file: env::var("STREAM_KEY_FILE").ok().map(PathBuf::from),
            stream_host: env::var("STREAM_HOST")
                .unwrap_or_else(|_| "stream-api.betfair.com".into()),
            stream_port: env_num("STREAM_PORT", 443),
            stream_kind,
            connect_timeout_ms: env_num("CONNECT_TIMEOUT_MS", 15_000),
            heartbeat_ms: env_num("HEARTBEAT_MS", 2000),
            monitor_tick_ms: env_num("MONITOR_TICK_MS", 500),
            stale_warn_multiplier: env_num("STALE_WARN_MULTIPLIER", 1),
            stale_close_multiplier: env_num("STALE_CLOSE_MULTIPLIER", 2),
            max_connections_backoff_ms: env_num("MAX_CONNECTIONS_BACKOFF_MS", 10_000),
            keepalive_interval_ms: env_num("KEEPALIVE_INTERVAL_MS", 14_400_000),
            refresh_interval_ms: env_num("REFRESH_INTERVAL_MS", 10_000),
            refresh_batch_size: env_num("REFRESH_BATCH_SIZE", 50),
            lookup_max_results: env_num("LOOKUP_MAX_RESULTS", 100),
            lookup_fields: env_list("LOOKUP_FIELDS", DEFAULT_LOOKUP_FIELDS),
            archive_check_interval_ms: env_num("ARCHIVE_CHECK_INTERVAL_MS", 60_000),
            archive_grace_ms: env_num("ARCHIVE_GRACE_MS", 10_000),
            race_idle_ms: env_num("RACE_IDLE_MS", 600_000),
            latency_threshold_ms: env_num("LATENCY_THRESHOLD_MS", 100),
            latency_report_ticks: env_num("LATENCY_REPORT_TICKS", 1000),
            filter: FilterConfig {
                market_types: env_list("MARKET_TYPES", &["WIN", "PLACE"]),
                country_codes: env_list("COUNTRY_CODES", &["GB", "US", "IE"]),
                event_type_ids: env_list("EVENT_TYPE_IDS", &["7"]),
                ladder_levels: env_num("LADDER_LEVELS", 10),
                fields: env_list("STREAM_FIELDS", DEFAULT_STREAM_FIELDS),
            },
            log_dir,
            archive_dir,
            login_url: env::var("LOGIN_URL")
                .unwrap_or_else(|_| "https://identitysso-cert.betfair.com/api/certlogin".into()),
            keepalive_url: env::var("KEEPALIVE_URL")
                .unwrap_or_else(|_| "https://identitysso.betfair.com/api/keepAlive".into()),
            betting_api_url: env::var("BETTING_API_URL").unwrap_or_else(|_| {
                "https://api.betfair.com/exchange/betting/json-rpc/v1".into()
            }),
            enable_metrics: env_flag("ENABLE_METRICS", true),
            ca_bundle: env::var("CA_BUNDLE").ok(),
            cert_pins: env_list("CERT_PINS", &[]),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.credentials.username.is_empty()
            || self.credentials.password.is_empty()
            || self.credentials.app_key.is_empty()
        {
            return Err(anyhow!("stream credentials are required"));
        }
        if self.stream_host.is_empty() || self.stream_port == 0 {
            return Err(anyhow!("stream endpoint must have a host and a non-zero port"));
        }
        if self.heartbeat_ms < 500 || self.heartbeat_ms > 5000 {
            return Err(anyhow!("heartbeat_ms must be between 500 and 5000"));
        }
        if self.monitor_tick_ms == 0 || self.monitor_tick_ms > self.heartbeat_ms {
            return Err(anyhow!(
                "monitor_tick_ms must be non-zero and no longer than the heartbeat"
            ));
        }
        if self.stale_warn_multiplier == 0 || self.stale_close_multiplier < self.stale_warn_multiplier
        {
            return Err(anyhow!(
                "stale multipliers must satisfy 0 < warn <= close"
            ));
        }
        if self.refresh_batch_size == 0 || self.refresh_batch_size > self.lookup_max_results {
            return Err(anyhow!(
                "refresh_batch_size must be between 1 and lookup_max_results"
            ));
        }
        if self.lookup_max_results == 0 || self.lookup_max_results > 1000 {
            return Err(anyhow!("lookup_max_results must be between 1 and 1000"));
        }
        if self.connect_timeout_ms == 0 || self.race_idle_ms == 0 {
            return Err(anyhow!("connect_timeout_ms and race_idle_ms must be greater than zero"));
        }
        if self.refresh_interval_ms == 0 || self.archive_check_interval_ms == 0 {
            return Err(anyhow!("refresh and archive intervals must be greater than zero"));
        }
        if self.latency_report_ticks == 0 {
            return Err(anyhow!("latency_report_ticks must be greater than zero"));
        }
        if self.stream_kind == StreamKind::Market && self.filter.fields.is_empty() {
            return Err(anyhow!("market stream field list cannot be empty"));
        }
        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(anyhow!(
                "STREAM_CERT_FILE and STREAM_KEY_FILE must be set together"
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn monitor_tick(&self) -> Duration {
        Duration::from_millis(self.monitor_tick_ms)
    }
}

pub fn load() -> Result<&'static Config> {
    let cfg = Config::from_env()?;
    cfg.validate()?;
    if cfg.enable_metrics {
        if let Err(e) = crate::metrics::init_exporter() {
            tracing::warn!(error = %e, "metrics exporter not installed");
        }
    }
    Ok(CONFIG.get_or_init(|| cfg))
}

pub fn get() -> &'static Config {
    CONFIG.get().expect("config not loaded")
}

pub fn metrics_enabled() -> bool {
    CONFIG.get().map(|c| c.enable_metrics).unwrap_or(false)
}
