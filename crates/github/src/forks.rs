//! Fork operations against the REST API, acting as a user token.
//!
//! Fork creation is idempotent: an existing fork whose parent matches the
//! requested repository is returned as-is, and a 422 from the fork
//! endpoint is treated as "already exists, re-resolve".

use {
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    tracing::{debug, info},
};

use crate::{
    API_BASE, Error, Result, USER_AGENT, error::classify_response, to_https_clone_url,
};

#[derive(Debug, Clone, Deserialize)]
pub struct RepoOwner {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repo {
    pub name: String,
    pub full_name: String,
    pub owner: RepoOwner,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub fork: bool,
    pub clone_url: String,
    /// Present on fork repos fetched individually; names the upstream.
    #[serde(default)]
    pub parent: Option<Box<Repo>>,
}

pub struct ForksClient {
    token: Secret<String>,
    api_base: String,
    client: reqwest::Client,
}

impl ForksClient {
    pub fn new(token: Secret<String>) -> Self {
        Self {
            token,
            api_base: API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{path}", self.api_base))
            .bearer_auth(self.token.expose_secret())
            .header("accept", "application/vnd.github+json")
            .header("user-agent", USER_AGENT)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{path}", self.api_base))
            .bearer_auth(self.token.expose_secret())
            .header("accept", "application/vnd.github+json")
            .header("user-agent", USER_AGENT)
    }

    async fn json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        if !resp.status().is_success() {
            return Err(classify_response(resp).await);
        }
        resp.json().await.map_err(|e| Error::Decode(e.to_string()))
    }

    /// The login of the account the token acts as.
    pub async fn current_login(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct User {
            login: String,
        }
        let user: User = Self::json(self.get("/user").send().await?).await?;
        Ok(user.login)
    }

    /// Repositories visible to the acting token.
    pub async fn get_user_repos(&self) -> Result<Vec<Repo>> {
        let resp = self
            .get("/user/repos")
            .query(&[("per_page", "100"), ("sort", "updated")])
            .send()
            .await?;
        Self::json(resp).await
    }

    pub async fn get_repo(&self, owner: &str, repo: &str) -> Result<Repo> {
        Self::json(self.get(&format!("/repos/{owner}/{repo}")).send().await?).await
    }

    /// Whether `candidate_owner/repo` is a fork of `parent_owner/repo`,
    /// verified through the upstream's parent metadata.
    pub async fn is_fork_of(
        &self,
        candidate_owner: &str,
        repo: &str,
        parent_owner: &str,
    ) -> Result<bool> {
        match self.get_repo(candidate_owner, repo).await {
            Ok(candidate) => Ok(candidate.fork
                && candidate
                    .parent
                    .as_deref()
                    .is_some_and(|p| p.full_name == format!("{parent_owner}/{repo}"))),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Ensure the acting user holds a fork of `owner/repo` and return it.
    ///
    /// Check-then-create: the existing fork wins; a 422 on creation means
    /// someone got there first, so the fork is re-resolved instead of
    /// failing the pipeline.
    pub async fn fork_repository(&self, owner: &str, repo: &str) -> Result<Repo> {
        let login = self.current_login().await?;

        if self.is_fork_of(&login, repo, owner).await? {
            debug!(owner, repo, login = %login, "fork already exists");
            return self.get_repo(&login, repo).await;
        }

        let resp = self
            .post(&format!("/repos/{owner}/{repo}/forks"))
            .send()
            .await?;
        match Self::json::<Repo>(resp).await {
            Ok(fork) => {
                info!(owner, repo, fork = %fork.full_name, "fork created");
                Ok(fork)
            },
            Err(Error::Conflict(_)) => {
                debug!(owner, repo, "fork endpoint reported 422, re-resolving");
                self.get_repo(&login, repo).await
            },
            Err(e) => Err(e),
        }
    }

    /// HTTPS clone URL for a repository, mapping SSH forms if encountered.
    pub async fn get_fork_url(&self, owner: &str, repo: &str) -> Result<String> {
        let repo = self.get_repo(owner, repo).await?;
        Ok(to_https_clone_url(&repo.clone_url))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn client(server: &mockito::Server) -> ForksClient {
        ForksClient::new(Secret::new("ghs_token".into())).with_api_base(server.url())
    }

    fn fork_body() -> &'static str {
        r#"{
            "name": "epson-eshop",
            "full_name": "alice/epson-eshop",
            "owner": {"login": "alice"},
            "private": false,
            "fork": true,
            "clone_url": "https://github.com/alice/epson-eshop.git",
            "parent": {
                "name": "epson-eshop",
                "full_name": "oursky/epson-eshop",
                "owner": {"login": "oursky"},
                "private": true,
                "fork": false,
                "clone_url": "https://github.com/oursky/epson-eshop.git"
            }
        }"#
    }

    #[tokio::test]
    async fn existing_fork_short_circuits_creation() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/user")
            .with_status(200)
            .with_body(r#"{"login":"alice"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/repos/alice/epson-eshop")
            .with_status(200)
            .with_body(fork_body())
            .expect_at_least(1)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/repos/oursky/epson-eshop/forks")
            .expect(0)
            .create_async()
            .await;

        let fork = client(&server)
            .fork_repository("oursky", "epson-eshop")
            .await
            .unwrap();
        assert_eq!(fork.full_name, "alice/epson-eshop");
        create.assert_async().await;
    }

    #[tokio::test]
    async fn fork_created_when_absent() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/user")
            .with_status(200)
            .with_body(r#"{"login":"alice"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/repos/alice/epson-eshop")
            .with_status(404)
            .with_body(r#"{"message":"Not Found"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/repos/oursky/epson-eshop/forks")
            .with_status(202)
            .with_body(fork_body())
            .create_async()
            .await;

        let fork = client(&server)
            .fork_repository("oursky", "epson-eshop")
            .await
            .unwrap();
        assert_eq!(fork.clone_url, "https://github.com/alice/epson-eshop.git");
    }

    #[tokio::test]
    async fn conflict_on_create_re_resolves() {
        use std::sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        };

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/user")
            .with_status(200)
            .with_body(r#"{"login":"alice"}"#)
            .create_async()
            .await;
        // The user holds a same-name repo that is not a fork of the
        // upstream, so the parent check fails, creation hits 422, and the
        // pipeline re-resolves. Serve the non-fork shape first, then the
        // fork shape.
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_mock = Arc::clone(&calls);
        server
            .mock("GET", "/repos/alice/epson-eshop")
            .with_status(200)
            .with_body_from_request(move |_| {
                if calls_in_mock.fetch_add(1, Ordering::SeqCst) == 0 {
                    br#"{
                        "name": "epson-eshop",
                        "full_name": "alice/epson-eshop",
                        "owner": {"login": "alice"},
                        "fork": false,
                        "clone_url": "https://github.com/alice/epson-eshop.git"
                    }"#
                    .to_vec()
                } else {
                    fork_body().as_bytes().to_vec()
                }
            })
            .create_async()
            .await;
        let create = server
            .mock("POST", "/repos/oursky/epson-eshop/forks")
            .with_status(422)
            .with_body(r#"{"message":"already exists"}"#)
            .create_async()
            .await;

        let fork = client(&server)
            .fork_repository("oursky", "epson-eshop")
            .await
            .unwrap();
        assert_eq!(fork.full_name, "alice/epson-eshop");
        assert!(fork.fork);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        create.assert_async().await;
    }

    #[tokio::test]
    async fn is_fork_of_checks_parent() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/alice/epson-eshop")
            .with_status(200)
            .with_body(fork_body())
            .create_async()
            .await;

        let c = client(&server);
        assert!(c.is_fork_of("alice", "epson-eshop", "oursky").await.unwrap());
        assert!(!c.is_fork_of("alice", "epson-eshop", "someone").await.unwrap());
    }

    #[tokio::test]
    async fn fork_url_maps_ssh_remotes() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/alice/epson-eshop")
            .with_status(200)
            .with_body(
                r#"{
                    "name": "epson-eshop",
                    "full_name": "alice/epson-eshop",
                    "owner": {"login": "alice"},
                    "fork": true,
                    "clone_url": "git@github.com:alice/epson-eshop.git"
                }"#,
            )
            .create_async()
            .await;

        let url = client(&server)
            .get_fork_url("alice", "epson-eshop")
            .await
            .unwrap();
        assert_eq!(url, "https://github.com/alice/epson-eshop.git");
    }
}
