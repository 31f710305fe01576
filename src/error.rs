//! Error types shared across the pipeline.
//!
//! Library components return these typed errors; the jobs and the binary
//! wrap them in `anyhow` with context, the same split the service uses
//! between its handlers and `main`.

use crate::retry::Retryable;

/// Errors raised while talking to a sensor or reading its payload.
#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    /// Non-2xx response from the sensor's CGI endpoint.
    #[error("sensor HTTP error: status={status}, body={body}")]
    Http { status: u16, body: String },

    /// Transport failure (connect, DNS, reset, timeout).
    #[error("sensor network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Payload was not valid CSV at all (row-level problems are skipped, not raised).
    #[error("sensor payload error: {0}")]
    Payload(String),

    /// The request URL could not be built from the sensor's address.
    #[error("invalid sensor address '{0}'")]
    InvalidAddress(String),
}

impl Retryable for SensorError {
    fn error_code(&self) -> Option<&'static str> {
        match self {
            SensorError::Network(e) => network_error_code(e),
            _ => None,
        }
    }

    fn http_status(&self) -> Option<u16> {
        match self {
            SensorError::Http { status, .. } => Some(*status),
            SensorError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    fn is_permanent(&self) -> bool {
        match self {
            SensorError::Network(e) => e.is_builder() || e.is_decode(),
            SensorError::Payload(_) | SensorError::InvalidAddress(_) => true,
            SensorError::Http { .. } => false,
        }
    }

    /// Only the transport error's own source chain; a response body never decides.
    fn retry_message(&self) -> Option<String> {
        match self {
            SensorError::Network(e) => Some(error_chain(e)),
            _ => None,
        }
    }
}

/// `err` and its sources joined with `": "`.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    // ---
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

/// Map a `reqwest` transport failure to the errno-style code it corresponds to.
///
/// Walks the source chain looking for the underlying `io::Error`; falls back
/// to the DNS resolver's message for lookup failures.
pub fn network_error_code(err: &reqwest::Error) -> Option<&'static str> {
    // ---
    if err.is_timeout() {
        return Some("ETIMEDOUT");
    }

    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind;
            match io.kind() {
                ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                    return Some("ECONNRESET")
                }
                ErrorKind::ConnectionRefused => return Some("ECONNREFUSED"),
                ErrorKind::TimedOut => return Some("ETIMEDOUT"),
                ErrorKind::BrokenPipe => return Some("EPIPE"),
                _ => {}
            }
        }
        let text = cause.to_string().to_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return Some("ENOTFOUND");
        }
        if text.contains("no route to host") || text.contains("host unreachable") {
            return Some("EHOSTUNREACH");
        }
        source = cause.source();
    }

    if err.is_connect() {
        return Some("ECONNREFUSED");
    }
    None
}

/// Errors raised by the warehouse repository.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Postgres driver error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Non-2xx response from the PostgREST API.
    #[error("REST API error on {table}: status={status}, body={body}")]
    Api {
        table: String,
        status: u16,
        body: String,
    },

    /// Transport failure talking to the PostgREST API.
    #[error("REST network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored row holds a value the domain types cannot represent.
    #[error("invalid row: {0}")]
    InvalidRow(String),
}

/// Convenience alias so store code can write `error::Result<T>`.
pub type Result<T> = std::result::Result<T, StoreError>;
