pub mod breaker;
pub mod cache;
pub mod endpoint;
pub mod error;
pub mod response;
pub mod retry;
pub mod token;

use crate::model::{Credential, Device, Snapshot};
pub use error::{Error, NetworkFailure};
use breaker::CircuitBreaker;
use cache::ResponseCache;
use response::GetDeviceList;
use retry::RetryPolicy;
use serde_json::Value;
use token::TokenManager;
use tokio::sync::Mutex;

use std::time::{Duration, Instant};

const USER_AGENT: &str = concat!("marstek-cloud-rs/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    /// Whole-request deadline.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
    pub token_lifetime: Duration,
    pub token_refresh_buffer: Duration,
    pub cache_ttl: Duration,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
    /// Minimum gap between two upstream requests.
    pub min_request_spacing: Duration,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            api_url: endpoint::API_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            pool_max_idle_per_host: 2,
            pool_idle_timeout: Duration::from_secs(30),
            token_lifetime: token::DEFAULT_LIFETIME,
            token_refresh_buffer: token::DEFAULT_REFRESH_BUFFER,
            cache_ttl: cache::DEFAULT_TTL,
            breaker_threshold: breaker::DEFAULT_THRESHOLD,
            breaker_cooldown: breaker::DEFAULT_COOLDOWN,
            min_request_spacing: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

/// Mutable per-account state. Everything behind one lock so that only one request sequence is
/// in flight at a time.
struct Session {
    http: Option<reqwest::Client>,
    tokens: TokenManager,
    cache: ResponseCache,
    breaker: CircuitBreaker,
    last_request: Option<Instant>,
}

/// Client for the Marstek cloud.
pub struct MarstekApi {
    config: ClientConfig,
    credential: Credential,
    session: Mutex<Session>,
}

impl MarstekApi {
    pub fn new(credential: Credential, config: ClientConfig) -> Self {
        let session = Session {
            http: None,
            tokens: TokenManager::new(config.token_lifetime, config.token_refresh_buffer),
            cache: ResponseCache::new(config.cache_ttl),
            breaker: CircuitBreaker::new(config.breaker_threshold, config.breaker_cooldown),
            last_request: None,
        };
        MarstekApi {
            config,
            credential,
            session: Mutex::new(session),
        }
    }

    /// Lazily build the pooled HTTP client. Only ever called from within a running runtime.
    fn http(&self, session: &mut Session) -> Result<reqwest::Client, Error> {
        if let Some(client) = &session.http {
            return Ok(client.clone());
        }

        let client = reqwest::ClientBuilder::new()
            .user_agent(USER_AGENT)
            .timeout(self.config.request_timeout)
            .connect_timeout(self.config.connect_timeout)
            .pool_max_idle_per_host(self.config.pool_max_idle_per_host)
            .pool_idle_timeout(self.config.pool_idle_timeout)
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;
        log::debug!("HTTP client created");
        session.http = Some(client.clone());
        Ok(client)
    }

    /// Keep consecutive upstream requests at least `min_request_spacing` apart.
    async fn pace(&self, session: &mut Session) {
        if let Some(last) = session.last_request {
            let next = last + self.config.min_request_spacing;
            if next > Instant::now() {
                tokio::time::sleep_until(next.into()).await;
            }
        }
        session.last_request = Some(Instant::now());
    }

    /// Return a usable token, logging in (with retries) if there is none or it is about to
    /// expire.
    async fn ensure_valid_token(&self, session: &mut Session) -> Result<String, Error> {
        if let Some(token) = session.tokens.usable(Instant::now()) {
            return Ok(token.to_owned());
        }
        log::debug!("Token missing or due for refresh, logging in");

        let client = self.http(session)?;
        let mut retry = self.config.retry.start("login");
        loop {
            self.pace(session).await;
            match token::login(&client, &self.config.api_url, &self.credential).await {
                Ok(value) => {
                    log::info!("Obtained new API token");
                    return Ok(session.tokens.store(value, Instant::now()).to_owned());
                }
                Err(e) => retry.backoff(e).await?,
            }
        }
    }

    /// One GET of the device list with `token`, no retries.
    async fn request_devices(
        &self,
        session: &mut Session,
        token: &str,
    ) -> Result<Vec<Device>, Error> {
        let client = self.http(session)?;
        self.pace(session).await;

        let url = format!("{}{}", self.config.api_url, endpoint::DEVICES);
        let reply = client.get(url).query(&[("token", token)]).send().await?;
        let status = reply.status();
        let text = reply.text().await?;

        log::trace!("devices: status {}, response_text: {}", status, text);

        match status {
            http::StatusCode::OK => {}
            http::StatusCode::UNAUTHORIZED | http::StatusCode::FORBIDDEN => {
                return Err(Error::Authentication(format!("status {}", status)))
            }
            http::StatusCode::TOO_MANY_REQUESTS => {
                return Err(Error::RateLimited(format!("status {}", status)))
            }
            s if s.is_server_error() => return Err(Error::Server(format!("status {}", s))),
            s => return Err(Error::Data(format!("unexpected status {}", s))),
        }

        serde_json::from_str::<Value>(&text)
            .map_err(|e| Error::Data(format!("{}: {}", e, text)))
            .map(response::check_code)?
            .map(serde_json::from_value::<GetDeviceList>)?
            .map_err(|e| Error::Data(e.to_string()))?
            .data
            .ok_or_else(|| Error::Data(format!("no `data` in response: {}", text)))
    }

    /// Fetch with a valid token; if the vendor rejects the token, log in once more and replay.
    async fn fetch_authenticated(&self, session: &mut Session) -> Result<Vec<Device>, Error> {
        let token = self.ensure_valid_token(session).await?;
        match self.request_devices(session, &token).await {
            Err(Error::Authentication(reason)) => {
                log::warn!("Token rejected ({}), logging in again", reason);
                session.tokens.clear();
                let token = self.ensure_valid_token(session).await?;
                self.request_devices(session, &token).await
            }
            other => other,
        }
    }

    /// While the breaker is open: the last cached list however old, else `CircuitOpen`.
    fn breaker_fallback(session: &Session) -> Option<Result<Snapshot, Error>> {
        if !session.breaker.is_open(Instant::now()) {
            return None;
        }
        Some(match session.cache.entry() {
            Some(entry) => {
                log::warn!("Circuit breaker open, serving cached device data");
                Ok(entry.snapshot(true))
            }
            None => Err(Error::CircuitOpen),
        })
    }

    /// Current device list: from the cache while fresh, otherwise from upstream with retries.
    /// While the circuit breaker is open the last cached list is served, however old.
    pub async fn get_devices(&self) -> Result<Snapshot, Error> {
        let mut session = self.session.lock().await;

        if session.cache.is_valid(Instant::now()) {
            if let Some(entry) = session.cache.entry() {
                log::debug!("Returning cached device data");
                return Ok(entry.snapshot(true));
            }
        }

        let mut retry = self.config.retry.start("device fetch");
        loop {
            if let Some(fallback) = Self::breaker_fallback(&session) {
                return fallback;
            }

            match self.fetch_authenticated(&mut session).await {
                Ok(devices) => {
                    session.breaker.record_success();
                    let entry = session.cache.store(devices, Instant::now());
                    log::debug!(
                        "Fetched {} devices, fingerprint {}",
                        entry.devices.len(),
                        entry.fingerprint
                    );
                    return Ok(entry.snapshot(false));
                }
                Err(error @ Error::Permission(_)) => {
                    log::error!("{}; clearing token until the next poll", error);
                    session.tokens.clear();
                    return Err(error);
                }
                Err(error) => {
                    if error.is_server_failure() {
                        session.breaker.record_error(Instant::now());
                        /* an open breaker refuses the next attempt, so skip the backoff */
                        if let Some(fallback) = Self::breaker_fallback(&session) {
                            log::warn!("Circuit breaker opened after: {}", error);
                            return fallback;
                        }
                    }
                    retry.backoff(error).await?;
                }
            }
        }
    }

    /// Log in unconditionally, replacing any current token.
    pub async fn obtain_token(&self) -> Result<(), Error> {
        let mut session = self.session.lock().await;
        session.tokens.clear();
        self.ensure_valid_token(&mut session).await.map(|_| ())
    }

    pub async fn has_token(&self) -> bool {
        self.session.lock().await.tokens.token().is_some()
    }

    pub async fn set_cache_ttl(&self, ttl: Duration) {
        self.session.lock().await.cache.set_ttl(ttl);
    }

    /// Drop pooled connections. Safe to call repeatedly; a later request builds a new pool.
    pub async fn close(&self) {
        if self.session.lock().await.http.take().is_some() {
            log::debug!("HTTP client closed");
        }
    }
}
