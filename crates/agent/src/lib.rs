//! Node agent.
//!
//! One agent runs on each execution host. It registers itself with the
//! coordination server, heartbeats on an interval, receives typed commands
//! over a small HTTP listener, executes them against the host's providers
//! through a bounded single-worker queue, and POSTs results back
//! asynchronously keyed by command id.

pub mod agent;
pub mod executor;
pub mod health;
pub mod results;
pub mod server;

pub use agent::{AgentHandle, NodeAgent};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("command queue full")]
    QueueFull,

    #[error("server unreachable: {0}")]
    ServerUnreachable(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
