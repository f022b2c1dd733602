use {chrono::{DateTime, Utc}, thiserror::Error};

#[derive(Debug, Error)]
pub enum Error {
    #[error("authentication required")]
    AuthRequired,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict or already exists: {0}")]
    Conflict(String),

    #[error("rate limited")]
    RateLimited { reset: Option<DateTime<Utc>> },

    #[error("github unavailable: {0}")]
    Transient(String),

    #[error("github rejected the request: {0}")]
    Fatal(String),

    #[error("invalid app private key: {0}")]
    InvalidKey(String),

    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response shape: {0}")]
    Decode(String),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::RateLimited { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Classify a non-2xx GitHub response. Consumes the response to read the
/// body into the message.
pub(crate) async fn classify_response(resp: reqwest::Response) -> Error {
    let status = resp.status();
    let reset = resp
        .headers()
        .get("x-ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
    let remaining_zero = resp
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        == Some("0");
    let body = resp.text().await.unwrap_or_default();

    match status.as_u16() {
        401 => Error::AuthRequired,
        404 => Error::NotFound(body),
        422 => Error::Conflict(body),
        403 if remaining_zero => Error::RateLimited { reset },
        429 => Error::RateLimited { reset },
        500..=599 => Error::Transient(format!("{status}: {body}")),
        _ => Error::Fatal(format!("{status}: {body}")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(Error::Transient("502".into()).is_retryable());
        assert!(Error::RateLimited { reset: None }.is_retryable());
        assert!(!Error::AuthRequired.is_retryable());
        assert!(!Error::Conflict("422".into()).is_retryable());
        assert!(!Error::NotFound("404".into()).is_retryable());
    }
}
