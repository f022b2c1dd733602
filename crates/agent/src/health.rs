//! Service health probes.
//!
//! A declared health check is probed against the service's published host
//! port: `tcp` checks connect, `http` checks expect a 2xx from the target
//! path. Retries pace at the declared interval; each attempt is bounded by
//! the declared timeout.

use std::time::Duration;

use {tokio::net::TcpStream, tracing::debug};

use dockyard_protocol::HealthCheckSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => f.write_str("healthy"),
            HealthStatus::Unhealthy => f.write_str("unhealthy"),
        }
    }
}

async fn attempt(spec: &HealthCheckSpec, port: u16) -> bool {
    let timeout = Duration::from_secs(spec.timeout_secs);
    match spec.kind.as_str() {
        "tcp" => tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port)))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false),
        "http" => {
            let path = if spec.target.starts_with('/') {
                spec.target.clone()
            } else {
                format!("/{}", spec.target)
            };
            let url = format!("http://127.0.0.1:{port}{path}");
            let client = match reqwest::Client::builder().timeout(timeout).build() {
                Ok(client) => client,
                Err(_) => return false,
            };
            client
                .get(&url)
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false)
        },
        other => {
            debug!(kind = other, "unknown health check kind");
            false
        },
    }
}

/// Probe until the first success or until the declared retries run out.
pub async fn check(spec: &HealthCheckSpec, port: u16) -> HealthStatus {
    let attempts = spec.retries.max(1);
    for n in 0..attempts {
        if attempt(spec, port).await {
            return HealthStatus::Healthy;
        }
        if n + 1 < attempts {
            tokio::time::sleep(Duration::from_secs(spec.interval_secs)).await;
        }
    }
    HealthStatus::Unhealthy
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn spec(kind: &str, target: &str) -> HealthCheckSpec {
        HealthCheckSpec {
            kind: kind.into(),
            target: target.into(),
            interval_secs: 0,
            timeout_secs: 2,
            retries: 2,
        }
    }

    #[tokio::test]
    async fn tcp_probe_succeeds_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        assert_eq!(check(&spec("tcp", ""), port).await, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn tcp_probe_fails_on_closed_port() {
        // Grab a free port and release it so nothing listens there.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        assert_eq!(check(&spec("tcp", ""), port).await, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn http_probe_checks_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/healthz")
            .with_status(200)
            .create_async()
            .await;
        let port: u16 = server
            .host_with_port()
            .rsplit(':')
            .next()
            .unwrap()
            .parse()
            .unwrap();

        assert_eq!(
            check(&spec("http", "/healthz"), port).await,
            HealthStatus::Healthy
        );
        assert_eq!(
            check(&spec("http", "/missing"), port).await,
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn unknown_kind_is_unhealthy() {
        assert_eq!(check(&spec("icmp", ""), 1).await, HealthStatus::Unhealthy);
    }
}
