use serde_json::Value;

use std::time::{Duration, Instant};

use super::{endpoint, response, Error};
use crate::model::Credential;

/// Assumed token lifetime. The login endpoint does not report one.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct Token {
    value: String,
    expires_at: Instant,
}

impl Token {
    pub fn new(value: String, expires_at: Instant) -> Self {
        Token { value, expires_at }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

/// Holds the current bearer token and decides when it has to be renewed.
#[derive(Debug)]
pub struct TokenManager {
    lifetime: Duration,
    refresh_buffer: Duration,
    token: Option<Token>,
}

impl TokenManager {
    pub fn new(lifetime: Duration, refresh_buffer: Duration) -> Self {
        TokenManager {
            lifetime,
            refresh_buffer,
            token: None,
        }
    }

    /// True when there is no token or it expires within the refresh buffer. A token is usable
    /// only while `now < expires_at - refresh_buffer`.
    pub fn needs_refresh(&self, now: Instant) -> bool {
        match &self.token {
            None => true,
            Some(token) => token
                .expires_at
                .checked_duration_since(now)
                .map_or(true, |remaining| remaining <= self.refresh_buffer),
        }
    }

    /// The current token, if it is not due for refresh at `now`.
    pub fn usable(&self, now: Instant) -> Option<&str> {
        if self.needs_refresh(now) {
            None
        } else {
            self.token.as_ref().map(Token::value)
        }
    }

    /// Store a freshly issued token; expiry is `issued_at` plus the configured lifetime.
    pub fn store(&mut self, value: String, issued_at: Instant) -> &str {
        let token = self.token.insert(Token::new(value, issued_at + self.lifetime));
        &token.value
    }

    pub fn set(&mut self, token: Token) {
        self.token = Some(token);
    }

    pub fn clear(&mut self) {
        self.token = None;
    }

    pub fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }
}

/// Exchange the credential for a token.
///
/// 5xx replies and the vendor's server-error code are reported as `Error::Server` so the caller
/// may retry; any other non-200 reply, or a 200 reply without a token, is an authentication
/// failure.
pub async fn login(
    client: &reqwest::Client,
    api_url: &str,
    credential: &Credential,
) -> Result<String, Error> {
    let url = format!("{}{}", api_url, endpoint::LOGIN);
    let query = [
        ("pwd", credential.password_digest()),
        ("mailbox", credential.email.to_owned()),
    ];

    let reply = client.post(url).query(&query).send().await?;
    let status = reply.status();
    log::debug!("login responded {}", status);

    if status.is_server_error() {
        return Err(Error::Server(format!("login failed with status {}", status)));
    }
    if status != http::StatusCode::OK {
        return Err(Error::Authentication(format!(
            "login failed with status {}",
            status
        )));
    }

    let text = reply.text().await?;
    let value = serde_json::from_str::<Value>(&text)
        .map_err(|e| Error::Data(format!("login response is not JSON: {}", e)))?;

    response::check_code(value)
        .map(serde_json::from_value::<response::Login>)?
        .map_err(|e| Error::Data(e.to_string()))?
        .token
        .filter(|token| !token.is_empty())
        .ok_or_else(|| Error::Authentication("login response carried no token".to_string()))
}

#[cfg(test)]
mod test {
    use super::*;

    fn manager() -> TokenManager {
        TokenManager::new(DEFAULT_LIFETIME, DEFAULT_REFRESH_BUFFER)
    }

    #[test]
    fn empty_manager_needs_refresh() {
        let tokens = manager();
        assert!(tokens.needs_refresh(Instant::now()));
        assert!(tokens.usable(Instant::now()).is_none());
    }

    #[test]
    fn refresh_buffer_boundary() {
        let now = Instant::now();
        let mut tokens = manager();

        tokens.set(Token::new("fresh".into(), now + Duration::from_secs(301)));
        assert!(!tokens.needs_refresh(now));
        assert_eq!(Some("fresh"), tokens.usable(now));

        tokens.set(Token::new("stale".into(), now + Duration::from_secs(299)));
        assert!(tokens.needs_refresh(now));
        assert_eq!(None, tokens.usable(now));
    }

    #[test]
    fn expired_token_needs_refresh() {
        let now = Instant::now();
        let mut tokens = manager();
        tokens.set(Token::new("old".into(), now));
        assert!(tokens.needs_refresh(now + Duration::from_secs(1)));
    }

    #[test]
    fn store_sets_expiry_from_lifetime() {
        let now = Instant::now();
        let mut tokens = manager();
        assert_eq!("abc123", tokens.store("abc123".into(), now));
        assert_eq!(Some(now + DEFAULT_LIFETIME), tokens.token().map(Token::expires_at));
        assert!(!tokens.needs_refresh(now));

        tokens.clear();
        assert!(tokens.token().is_none());
    }
}
