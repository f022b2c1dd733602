//! The agent's command listener.
//!
//! A small axum router: the server POSTs typed commands here. Commands are
//! acknowledged with a `running` result and executed asynchronously by the
//! queue worker; a full queue surfaces as 503 so the caller backs off.
//! Streamed execution runs inline and chunks JSON frames with a trailing
//! exit-code sentinel.

use std::sync::Arc;

use {
    axum::{
        Json, Router,
        body::Body,
        extract::State,
        http::StatusCode,
        response::{IntoResponse, Response},
        routing::{get, post},
    },
    tokio::sync::mpsc,
    tokio_stream::wrappers::ReceiverStream,
    tracing::debug,
};

use {
    crate::executor::Executor,
    dockyard_protocol::{Command, CommandResult, CommandStatus},
    dockyard_providers::ProviderSet,
};

#[derive(Clone)]
pub struct AgentState {
    queue: mpsc::Sender<Command>,
    executor: Arc<Executor>,
    node_id: String,
    providers: ProviderSet,
}

pub fn build_router(
    queue: mpsc::Sender<Command>,
    executor: Arc<Executor>,
    node_id: String,
    providers: ProviderSet,
) -> Router {
    let state = AgentState {
        queue,
        executor,
        node_id,
        providers,
    };
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/agent/commands", post(enqueue_command))
        .route("/api/v1/agent/commands/stream", post(stream_command))
        .with_state(state)
}

async fn health(State(state): State<AgentState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "nodeId": state.node_id,
        "version": env!("CARGO_PKG_VERSION"),
        "providers": state.providers.availability().await,
    }))
}

/// Accept a command into the bounded queue. The `running` ack carries the
/// command id; the real result arrives at the server's result endpoint.
async fn enqueue_command(
    State(state): State<AgentState>,
    Json(command): Json<Command>,
) -> Response {
    let command_id = command.id.clone();
    match state.queue.try_send(command) {
        Ok(()) => {
            debug!(command = %command_id, "command queued");
            let ack = CommandResult {
                command_id,
                node_id: state.node_id.clone(),
                status: CommandStatus::Running,
                output: String::new(),
                error: None,
                duration_ms: 0,
                finished_at: chrono::Utc::now(),
            };
            (StatusCode::ACCEPTED, Json(ack)).into_response()
        },
        Err(_) => {
            let rejection =
                CommandResult::failed(&command_id, &state.node_id, "command queue full");
            (StatusCode::SERVICE_UNAVAILABLE, Json(rejection)).into_response()
        },
    }
}

/// Execute a command inline, chunking output frames as they are produced.
/// Frames are JSON lines; the last line is the exit-code sentinel.
async fn stream_command(
    State(state): State<AgentState>,
    Json(command): Json<Command>,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<bytes::Bytes, std::convert::Infallible>>(16);

    let executor = Arc::clone(&state.executor);
    tokio::spawn(async move {
        let result = executor.execute(&command).await;
        let (exit, chunk) = match result.status {
            CommandStatus::Success => (0, ("stdout", result.output)),
            _ => (1, ("stderr", result.error.unwrap_or_default())),
        };
        if !chunk.1.is_empty() {
            let frame = serde_json::json!({ "stream": chunk.0, "data": chunk.1 });
            let _ = tx.send(Ok(format!("{frame}\n").into())).await;
        }
        let sentinel = serde_json::json!({ "exit": exit });
        let _ = tx.send(Ok(format!("{sentinel}\n").into())).await;
    });

    Body::from_stream(ReceiverStream::new(rx)).into_response()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        dockyard_protocol::{CommandAction, CommandType},
        std::path::PathBuf,
        tower::ServiceExt,
    };

    fn test_router(queue_capacity: usize) -> (Router, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let executor = Arc::new(Executor::new(
            "node-1",
            ProviderSet::new(),
            PathBuf::from("/tmp/dockyard-agent-test"),
        ));
        (
            build_router(tx, executor, "node-1".into(), ProviderSet::new()),
            rx,
        )
    }

    fn command_request(cmd: &Command) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri("/api/v1/agent/commands")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(cmd).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn command_is_acked_and_queued() {
        let (router, mut rx) = test_router(4);
        let cmd = Command::new(CommandType::System, CommandAction::Health, 10);

        let response = router.oneshot(command_request(&cmd)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let ack: CommandResult = serde_json::from_slice(&body).unwrap();
        assert_eq!(ack.status, CommandStatus::Running);
        assert_eq!(ack.command_id, cmd.id);

        let queued = rx.recv().await.unwrap();
        assert_eq!(queued.id, cmd.id);
    }

    #[tokio::test]
    async fn full_queue_returns_service_unavailable() {
        let (router, _rx) = test_router(1);
        let first = Command::new(CommandType::System, CommandAction::Health, 10);
        let second = Command::new(CommandType::System, CommandAction::Health, 10);

        let response = router
            .clone()
            .oneshot(command_request(&first))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = router.oneshot(command_request(&second)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn health_reports_node_id() {
        let (router, _rx) = test_router(4);
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["nodeId"], "node-1");
    }
}
