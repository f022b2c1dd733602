//! Shared error plumbing and configuration used across all dockyard crates.

pub mod config;
pub mod error;

pub use {
    config::DockyardConfig,
    error::{Error, FromMessage, Result},
};
