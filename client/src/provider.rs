use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use feed_core::config::{Config, Credentials};
use reqwest::{Client, Identity};
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

/// Issues and extends the session token the stream authenticates with.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn login(&self) -> Result<String>;

    /// Extend `token`. Returns the token to use from now on.
    async fn keep_alive(&self, token: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "sessionToken")]
    session_token: Option<String>,
    #[serde(rename = "loginStatus")]
    login_status: String,
}

#[derive(Debug, Deserialize)]
struct KeepAliveResponse {
    token: Option<String>,
    status: String,
    #[serde(default)]
    error: Option<String>,
}

/// Certificate login and keep-alive against the identity endpoints.
pub struct HttpSessionProvider {
    login_client: Client,
    client: Client,
    login_url: String,
    keepalive_url: String,
    credentials: Credentials,
}

impl HttpSessionProvider {
    pub fn new(
        login_client: Client,
        client: Client,
        login_url: impl Into<String>,
        keepalive_url: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            login_client,
            client,
            login_url: login_url.into(),
            keepalive_url: keepalive_url.into(),
            credentials,
        }
    }

    /// Build clients from config. The login client presents the client
    /// certificate when one is configured.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let mut builder = Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(30));
        if let (Some(cert), Some(key)) = (&cfg.cert_file, &cfg.key_file) {
            let mut pem = std::fs::read(cert)
                .with_context(|| format!("reading client certificate {}", cert.display()))?;
            pem.push(b'\n');
            pem.extend(
                std::fs::read(key)
                    .with_context(|| format!("reading client key {}", key.display()))?,
            );
            builder = builder.identity(Identity::from_pem(&pem)?);
        }
        let login_client = builder.build()?;
        let client = Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::new(
            login_client,
            client,
            cfg.login_url.clone(),
            cfg.keepalive_url.clone(),
            cfg.credentials.clone(),
        ))
    }
}

#[async_trait]
impl SessionProvider for HttpSessionProvider {
    async fn login(&self) -> Result<String> {
        let resp = self
            .login_client
            .post(&self.login_url)
            .header("X-Application", &self.credentials.app_key)
            .form(&[
                ("username", self.credentials.username.as_str()),
                ("password", self.credentials.password.as_str()),
            ])
            .send()
            .await
            .context("sending login request")?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("login failed with HTTP status {status}"));
        }
        let body: LoginResponse = resp.json().await.context("decoding login response")?;
        if body.login_status != "SUCCESS" {
            return Err(anyhow!("login rejected: {}", body.login_status));
        }
        let token = body
            .session_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow!("login succeeded without a session token"))?;
        info!("session token obtained");
        Ok(token)
    }

    async fn keep_alive(&self, token: &str) -> Result<String> {
        let resp = self
            .client
            .post(&self.keepalive_url)
            .header("Accept", "application/json")
            .header("X-Application", &self.credentials.app_key)
            .header("X-Authentication", token)
            .send()
            .await
            .context("sending keep-alive request")?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("keep-alive failed with HTTP status {status}"));
        }
        let body: KeepAliveResponse = resp.json().await.context("decoding keep-alive response")?;
        if body.status != "SUCCESS" {
            return Err(anyhow!(
                "keep-alive rejected: {} {}",
                body.status,
                body.error.unwrap_or_default()
            ));
        }
        Ok(body
            .token
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| token.to_string()))
    }
}
