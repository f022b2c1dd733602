//! Coordination core: the HTTP API, the workspace state machine, node
//! scheduling, and command dispatch.
//!
//! The gateway holds no authoritative in-memory state — the registry owns
//! users, installations, forks, nodes, and workspaces; everything here is
//! plumbing from HTTP requests down to providers and node agents.

pub mod auth_routes;
pub mod commands;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod nodes;
pub mod pipeline;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod sweep;
pub mod users;
pub mod workspaces;

pub use {
    error::{ApiError, ApiResult},
    server::{build_router, run},
    state::{AppState, GatewayState},
};
