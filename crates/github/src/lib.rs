//! GitHub App adapter: JWT minting, OAuth code exchange, installation
//! access tokens, and idempotent fork operations.
//!
//! The adapter is stateless — tokens live in the registry's installation
//! records, and callers refresh at expiry minus five minutes. Tokens and
//! private keys only cross this boundary as explicit parameters.

pub mod app;
pub mod error;
pub mod forks;
pub mod oauth;

pub use {
    app::{GithubApp, InstallationToken},
    error::{Error, Result},
    forks::{ForksClient, Repo},
    oauth::{OauthConfig, UserAccessToken, exchange_code},
};

/// Default REST API base.
pub const API_BASE: &str = "https://api.github.com";
/// Default OAuth endpoint base.
pub const OAUTH_BASE: &str = "https://github.com";

pub(crate) const USER_AGENT: &str = concat!("dockyard/", env!("CARGO_PKG_VERSION"));

/// Map SSH-style remotes onto HTTPS clone URLs; HTTPS URLs pass through.
pub fn to_https_clone_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("git@github.com:") {
        let rest = rest.strip_suffix(".git").unwrap_or(rest);
        return format!("https://github.com/{rest}.git");
    }
    if let Some(rest) = url.strip_prefix("ssh://git@github.com/") {
        let rest = rest.strip_suffix(".git").unwrap_or(rest);
        return format!("https://github.com/{rest}.git");
    }
    url.to_string()
}
