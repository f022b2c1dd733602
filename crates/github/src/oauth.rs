//! OAuth authorization-code exchange.
//!
//! Trades a callback code for a short-lived user access token, then reads
//! `/user` to capture the numeric account id and login. The result is
//! installation-shaped: the caller upserts it straight into the registry.

use {
    chrono::{DateTime, Duration, Utc},
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    tracing::debug,
};

use crate::{API_BASE, Error, OAUTH_BASE, Result, USER_AGENT, error::classify_response};

/// User tokens are treated as valid for at most one hour regardless of
/// what the endpoint reports; callers refresh well before that.
const MAX_TOKEN_TTL_SECS: i64 = 3600;

#[derive(Clone)]
pub struct OauthConfig {
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub redirect_url: String,
    /// Overridable endpoint bases (tests).
    pub oauth_base: String,
    pub api_base: String,
}

impl OauthConfig {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: Secret<String>,
        redirect_url: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
            redirect_url: redirect_url.into(),
            oauth_base: OAUTH_BASE.to_string(),
            api_base: API_BASE.to_string(),
        }
    }

    /// The URL users visit to authorize the app.
    pub fn authorize_url(&self, state: &str) -> String {
        format!(
            "{}/login/oauth/authorize?client_id={}&redirect_uri={}&state={state}",
            self.oauth_base,
            self.client_id,
            urlencoding::encode(&self.redirect_url),
        )
    }
}

impl std::fmt::Debug for OauthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OauthConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_url", &self.redirect_url)
            .finish()
    }
}

/// Result of a code exchange, ready to upsert as an installation.
#[derive(Clone)]
pub struct UserAccessToken {
    pub access_token: Secret<String>,
    pub expires_at: DateTime<Utc>,
    pub account_id: i64,
    pub account_login: String,
}

impl std::fmt::Debug for UserAccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserAccessToken")
            .field("access_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("account_id", &self.account_id)
            .field("account_login", &self.account_login)
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct UserResponse {
    id: i64,
    login: String,
}

/// Exchange an authorization code for a user access token and resolve the
/// acting account.
pub async fn exchange_code(config: &OauthConfig, code: &str) -> Result<UserAccessToken> {
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/login/oauth/access_token", config.oauth_base))
        .header("accept", "application/json")
        .header("user-agent", USER_AGENT)
        .form(&[
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.expose_secret()),
            ("code", code),
            ("redirect_uri", config.redirect_url.as_str()),
        ])
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(classify_response(resp).await);
    }
    let token: TokenResponse = resp
        .json()
        .await
        .map_err(|e| Error::Decode(e.to_string()))?;
    if let Some(error) = token.error {
        let description = token.error_description.unwrap_or_default();
        return Err(Error::Fatal(format!("{error}: {description}")));
    }
    let access_token = token
        .access_token
        .ok_or_else(|| Error::Decode("token response without access_token".into()))?;

    let ttl = token
        .expires_in
        .map(|secs| secs.min(MAX_TOKEN_TTL_SECS))
        .unwrap_or(MAX_TOKEN_TTL_SECS);
    let expires_at = Utc::now() + Duration::seconds(ttl);

    let resp = client
        .get(format!("{}/user", config.api_base))
        .bearer_auth(&access_token)
        .header("accept", "application/vnd.github+json")
        .header("user-agent", USER_AGENT)
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(classify_response(resp).await);
    }
    let user: UserResponse = resp
        .json()
        .await
        .map_err(|e| Error::Decode(e.to_string()))?;
    debug!(login = %user.login, account_id = user.id, "oauth exchange complete");

    Ok(UserAccessToken {
        access_token: Secret::new(access_token),
        expires_at,
        account_id: user.id,
        account_login: user.login,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn test_config(server: &mockito::Server) -> OauthConfig {
        let mut config = OauthConfig::new(
            "Iv1.abc",
            Secret::new("shh".into()),
            "http://localhost:3001/auth/github/callback",
        );
        config.oauth_base = server.url();
        config.api_base = server.url();
        config
    }

    #[tokio::test]
    async fn exchange_resolves_token_and_account() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/login/oauth/access_token")
            .with_status(200)
            .with_body(r#"{"access_token":"ghu_token","expires_in":28800,"token_type":"bearer"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/user")
            .match_header("authorization", "Bearer ghu_token")
            .with_status(200)
            .with_body(r#"{"id":12345,"login":"alice"}"#)
            .create_async()
            .await;

        let before = Utc::now();
        let token = exchange_code(&test_config(&server), "the-code").await.unwrap();
        assert_eq!(token.account_id, 12345);
        assert_eq!(token.account_login, "alice");
        assert_eq!(token.access_token.expose_secret(), "ghu_token");
        // Expiry clamps to one hour even when the endpoint reports more.
        assert!(token.expires_at > before);
        assert!(token.expires_at <= before + Duration::seconds(MAX_TOKEN_TTL_SECS + 5));
    }

    #[tokio::test]
    async fn oauth_error_body_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/login/oauth/access_token")
            .with_status(200)
            .with_body(r#"{"error":"bad_verification_code","error_description":"expired"}"#)
            .create_async()
            .await;

        match exchange_code(&test_config(&server), "stale").await {
            Err(Error::Fatal(msg)) => assert!(msg.contains("bad_verification_code")),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn authorize_url_escapes_redirect() {
        let config = OauthConfig::new(
            "Iv1.abc",
            Secret::new("shh".into()),
            "http://localhost:3001/auth/github/callback",
        );
        let url = config.authorize_url("state123");
        assert!(url.starts_with("https://github.com/login/oauth/authorize?"));
        assert!(url.contains("client_id=Iv1.abc"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A3001%2Fauth%2Fgithub%2Fcallback"));
        assert!(url.ends_with("state=state123"));
    }
}
