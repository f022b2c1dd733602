//! HTTP transport.
//!
//! Commands are POSTed as JSON to a well-known path on the target's agent
//! endpoint. Streaming uses a chunked response body of JSON lines with a
//! trailing exit-code sentinel. TLS verification is on by default and can
//! be explicitly disabled or pointed at a custom certificate authority.

use std::{path::PathBuf, sync::atomic::{AtomicBool, Ordering}, time::Duration};

use {
    async_trait::async_trait,
    futures::StreamExt,
    serde::{Deserialize, Serialize},
    tokio::{
        io::{AsyncWrite, AsyncWriteExt},
        sync::Mutex,
    },
    tracing::debug,
};

use {
    crate::{Error, Result, Transport},
    dockyard_protocol::{Command, CommandResult},
};

/// Path the agent serves command dispatch on.
pub const COMMAND_PATH: &str = "/api/v1/agent/commands";
/// Path for streamed execution.
pub const STREAM_PATH: &str = "/api/v1/agent/commands/stream";
/// Liveness path used by the keepalive probe.
pub const HEALTH_PATH: &str = "/health";

#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum HttpAuth {
    #[default]
    None,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
}

impl std::fmt::Debug for HttpAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpAuth::None => f.write_str("None"),
            HttpAuth::Bearer { .. } => f
                .debug_struct("Bearer")
                .field("token", &"[REDACTED]")
                .finish(),
            HttpAuth::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
        }
    }
}

/// One frame of a streamed execution body.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamFrame {
    Chunk { stream: String, data: String },
    Exit { exit: i32 },
}

pub struct HttpTransport {
    base_url: String,
    auth: HttpAuth,
    verify_tls: bool,
    ca_path: Option<PathBuf>,
    client: Mutex<Option<reqwest::Client>>,
    connected: AtomicBool,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, auth: HttpAuth) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
            verify_tls: true,
            ca_path: None,
            client: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Disable certificate verification or install a CA override. Verification
    /// stays on unless explicitly turned off.
    #[must_use]
    pub fn with_tls(mut self, verify: bool, ca_path: Option<PathBuf>) -> Self {
        self.verify_tls = verify;
        self.ca_path = ca_path;
        self
    }

    fn build_client(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(dockyard_protocol::HTTP_TIMEOUT_SECS))
            .danger_accept_invalid_certs(!self.verify_tls);
        if let Some(ca) = &self.ca_path {
            let pem = std::fs::read(ca)?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::InvalidTarget(format!("bad CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        builder
            .build()
            .map_err(|e| Error::ConnectionFailed(e.to_string()))
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            HttpAuth::None => req,
            HttpAuth::Bearer { token } => req.bearer_auth(token),
            HttpAuth::Basic { username, password } => req.basic_auth(username, Some(password)),
        }
    }

    fn classify(e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout
        } else {
            Error::ConnectionFailed(e.to_string())
        }
    }

    fn classify_status(status: reqwest::StatusCode, body: String) -> Error {
        match status.as_u16() {
            401 | 403 => Error::AuthFailed(body),
            404 => Error::InvalidTarget(body),
            500..=599 => Error::ConnectionFailed(format!("{status}: {body}")),
            _ => Error::InvalidTarget(format!("{status}: {body}")),
        }
    }

    async fn client(&self) -> Result<reqwest::Client> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or(Error::NotConnected)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self) -> Result<()> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            *guard = Some(self.build_client()?);
        }
        drop(guard);
        // Verify the endpoint answers before declaring the target usable.
        self.probe().await?;
        self.connected.store(true, Ordering::SeqCst);
        debug!(base_url = %self.base_url, "http transport ready");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.client.lock().await.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn probe(&self) -> Result<()> {
        let client = {
            let guard = self.client.lock().await;
            guard.clone().ok_or(Error::NotConnected)?
        };
        let url = format!("{}{HEALTH_PATH}", self.base_url);
        let resp = self
            .apply_auth(client.get(&url))
            .send()
            .await
            .map_err(Self::classify)?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, body));
        }
        Ok(())
    }

    async fn execute(&self, command: &Command) -> Result<CommandResult> {
        let client = self.client().await?;
        let url = format!("{}{COMMAND_PATH}", self.base_url);
        let resp = tokio::time::timeout(
            Duration::from_secs(command.timeout_secs),
            self.apply_auth(client.post(&url)).json(command).send(),
        )
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(Self::classify)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, body));
        }
        resp.json::<CommandResult>().await.map_err(Self::classify)
    }

    async fn stream(
        &self,
        command: &Command,
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
        stderr: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<i32> {
        let client = self.client().await?;
        let url = format!("{}{STREAM_PATH}", self.base_url);
        let resp = self
            .apply_auth(client.post(&url))
            .json(command)
            .send()
            .await
            .map_err(Self::classify)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, body));
        }

        let mut exit_code: Option<i32> = None;
        let mut buf = String::new();
        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(Self::classify)?;
            buf.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buf.find('\n') {
                let line: String = buf.drain(..=pos).collect();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<StreamFrame>(line)? {
                    StreamFrame::Chunk { stream, data } => {
                        if stream == "stderr" {
                            stderr.write_all(data.as_bytes()).await?;
                        } else {
                            stdout.write_all(data.as_bytes()).await?;
                        }
                    },
                    StreamFrame::Exit { exit } => exit_code = Some(exit),
                }
            }
        }
        exit_code.ok_or_else(|| {
            Error::ConnectionFailed("stream ended without exit-code sentinel".into())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, dockyard_protocol::CommandStatus};

    fn running_ack(command_id: &str) -> CommandResult {
        CommandResult {
            command_id: command_id.into(),
            node_id: "node-1".into(),
            status: CommandStatus::Running,
            output: String::new(),
            error: None,
            duration_ms: 0,
            finished_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn execute_posts_command_and_parses_result() {
        let mut server = mockito::Server::new_async().await;
        let cmd = crate::exec_command("true", &[], &[], None, 5);
        let ack = running_ack(&cmd.id);

        let mock = server
            .mock("POST", COMMAND_PATH)
            .match_header("authorization", "Bearer sekrit")
            .with_status(200)
            .with_body(serde_json::to_string(&ack).unwrap())
            .create_async()
            .await;
        let health = server
            .mock("GET", HEALTH_PATH)
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let t = HttpTransport::new(
            server.url(),
            HttpAuth::Bearer {
                token: "sekrit".into(),
            },
        );
        t.connect().await.unwrap();
        let result = t.execute(&cmd).await.unwrap();
        assert_eq!(result.command_id, cmd.id);
        assert_eq!(result.status, CommandStatus::Running);

        mock.assert_async().await;
        health.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_classifies() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", HEALTH_PATH)
            .with_status(200)
            .create_async()
            .await;
        server
            .mock("POST", COMMAND_PATH)
            .with_status(401)
            .with_body("nope")
            .create_async()
            .await;

        let t = HttpTransport::new(server.url(), HttpAuth::None);
        t.connect().await.unwrap();
        let cmd = crate::exec_command("true", &[], &[], None, 5);
        match t.execute(&cmd).await {
            Err(Error::AuthFailed(_)) => {},
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_writes_chunks_and_returns_exit() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", HEALTH_PATH)
            .with_status(200)
            .create_async()
            .await;
        let body = concat!(
            "{\"stream\":\"stdout\",\"data\":\"hello \"}\n",
            "{\"stream\":\"stderr\",\"data\":\"warn\"}\n",
            "{\"stream\":\"stdout\",\"data\":\"world\"}\n",
            "{\"exit\":0}\n",
        );
        server
            .mock("POST", STREAM_PATH)
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let t = HttpTransport::new(server.url(), HttpAuth::None);
        t.connect().await.unwrap();

        let cmd = crate::exec_command("echo", &["hello"], &[], None, 5);
        let mut out = Vec::new();
        let mut err = Vec::new();
        let exit = t.stream(&cmd, &mut out, &mut err).await.unwrap();
        assert_eq!(exit, 0);
        assert_eq!(String::from_utf8(out).unwrap(), "hello world");
        assert_eq!(String::from_utf8(err).unwrap(), "warn");
    }

    #[tokio::test]
    async fn missing_sentinel_is_connection_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", HEALTH_PATH)
            .with_status(200)
            .create_async()
            .await;
        server
            .mock("POST", STREAM_PATH)
            .with_status(200)
            .with_body("{\"stream\":\"stdout\",\"data\":\"x\"}\n")
            .create_async()
            .await;

        let t = HttpTransport::new(server.url(), HttpAuth::None);
        t.connect().await.unwrap();
        let cmd = crate::exec_command("true", &[], &[], None, 5);
        let mut out = Vec::new();
        let mut err = Vec::new();
        match t.stream(&cmd, &mut out, &mut err).await {
            Err(Error::ConnectionFailed(_)) => {},
            other => panic!("unexpected: {other:?}"),
        }
    }
}
