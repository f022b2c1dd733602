//! Asynchronous result submission.
//!
//! Results are POSTed to the server keyed by command id. When the server
//! is unreachable they are buffered in memory up to a cap (oldest dropped)
//! and flushed ahead of the next successful submission. Results are never
//! merged.

use std::collections::VecDeque;

use {tokio::sync::Mutex, tracing::{debug, warn}};

use {
    crate::{Error, Result},
    dockyard_protocol::CommandResult,
};

pub struct ResultSubmitter {
    client: reqwest::Client,
    server_url: String,
    buffer: Mutex<VecDeque<CommandResult>>,
    buffer_cap: usize,
}

impl ResultSubmitter {
    pub fn new(client: reqwest::Client, server_url: impl Into<String>, buffer_cap: usize) -> Self {
        Self {
            client,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            buffer: Mutex::new(VecDeque::new()),
            buffer_cap,
        }
    }

    async fn post(&self, result: &CommandResult) -> Result<()> {
        let url = format!(
            "{}/api/v1/commands/{}/result",
            self.server_url, result.command_id
        );
        let resp = self
            .client
            .post(&url)
            .json(result)
            .send()
            .await
            .map_err(|e| Error::ServerUnreachable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::ServerUnreachable(format!(
                "result endpoint returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Submit a result, flushing any buffered backlog first. On failure the
    /// result joins the buffer.
    pub async fn submit(&self, result: CommandResult) {
        // Flush backlog in arrival order before the fresh result.
        loop {
            let buffered = self.buffer.lock().await.pop_front();
            let Some(buffered) = buffered else { break };
            if let Err(e) = self.post(&buffered).await {
                debug!(error = %e, "backlog flush failed, re-buffering");
                self.buffer.lock().await.push_front(buffered);
                break;
            }
        }

        if let Err(e) = self.post(&result).await {
            warn!(command = %result.command_id, error = %e, "result submission failed, buffering");
            let mut buffer = self.buffer.lock().await;
            if buffer.len() >= self.buffer_cap {
                let dropped = buffer.pop_front();
                if let Some(dropped) = dropped {
                    warn!(command = %dropped.command_id, "result buffer full, dropping oldest");
                }
            }
            buffer.push_back(result);
        }
    }

    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, dockyard_protocol::CommandResult};

    #[tokio::test]
    async fn unreachable_server_buffers_up_to_cap() {
        // Point at a closed port.
        let submitter = ResultSubmitter::new(reqwest::Client::new(), "http://127.0.0.1:1", 2);

        for i in 0..3 {
            submitter
                .submit(CommandResult::success(&format!("c{i}"), "node-1", ""))
                .await;
        }
        // Cap is 2: c0 was dropped, c1 and c2 remain.
        assert_eq!(submitter.buffered().await, 2);
        let front = submitter.buffer.lock().await.front().cloned().unwrap();
        assert_eq!(front.command_id, "c1");
    }

    #[tokio::test]
    async fn backlog_flushes_before_fresh_result() {
        let mut server = mockito::Server::new_async().await;
        let c1 = server
            .mock("POST", "/api/v1/commands/c1/result")
            .with_status(202)
            .create_async()
            .await;
        let c2 = server
            .mock("POST", "/api/v1/commands/c2/result")
            .with_status(202)
            .create_async()
            .await;

        let submitter = ResultSubmitter::new(reqwest::Client::new(), server.url(), 8);
        submitter
            .buffer
            .lock()
            .await
            .push_back(CommandResult::success("c1", "node-1", ""));

        submitter
            .submit(CommandResult::success("c2", "node-1", ""))
            .await;

        assert_eq!(submitter.buffered().await, 0);
        c1.assert_async().await;
        c2.assert_async().await;
    }
}
