use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use std::error::Error as _;
use std::fmt;
use std::io::Cursor;

/// What kind of transport problem ended a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFailure {
    Timeout,
    Dns,
    Connect,
}

impl fmt::Display for NetworkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NetworkFailure::Timeout => "timeout",
            NetworkFailure::Dns => "dns",
            NetworkFailure::Connect => "connect",
        })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("no access permission: {0}")]
    Permission(String),
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("network error ({kind}): {message}")]
    Network {
        kind: NetworkFailure,
        message: String,
    },
    #[error("invalid API response: {0}")]
    Data(String),
    #[error("circuit breaker open and no cached data available")]
    CircuitOpen,
    #[error("update failed after {attempts} attempts: {cause}")]
    UpdateFailed { attempts: u32, cause: Box<Error> },
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this failure, or the cause wrapped by `UpdateFailed`, came from the server side.
    pub fn is_server_failure(&self) -> bool {
        match self {
            Error::Server(_) => true,
            Error::UpdateFailed { cause, .. } => cause.is_server_failure(),
            _ => false,
        }
    }
}

/// Walk the source chain of a connect error looking for a failed name lookup.
fn is_dns_failure(error: &reqwest::Error) -> bool {
    let mut source = error.source();
    while let Some(inner) = source {
        let message = inner.to_string().to_lowercase();
        if message.contains("dns error") || message.contains("failed to lookup address") {
            return true;
        }
        source = inner.source();
    }
    false
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        let kind = if error.is_timeout() {
            NetworkFailure::Timeout
        } else if error.is_decode() {
            return Error::Data(error.to_string());
        } else if error.is_connect() && is_dns_failure(&error) {
            NetworkFailure::Dns
        } else {
            NetworkFailure::Connect
        };

        Error::Network {
            kind,
            message: error.to_string(),
        }
    }
}

impl<'r> Responder<'r, 'static> for Error {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        let (status, title) = match self {
            Error::RateLimited(_) => (Status::TooManyRequests, "429 Too Many Requests"),
            Error::Authentication(_) | Error::Permission(_) => (Status::Forbidden, "403 Forbidden"),
            Error::CircuitOpen | Error::UpdateFailed { .. } => {
                (Status::ServiceUnavailable, "503 Service Unavailable")
            }
            _ => (Status::InternalServerError, "500 Internal Server Error"),
        };
        let body = format!(
            "<html><body><h3>{}</h3>Upstream API: <code>{}</code></body></html>",
            title, self
        );

        Response::build()
            .status(status)
            .sized_body(body.len(), Cursor::new(body))
            .header(ContentType::new("text", "html"))
            .ok()
    }
}
