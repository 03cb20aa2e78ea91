#![forbid(unsafe_code)]

//! Supervise interactive coding agents running in tmux sessions or
//! isolated docker containers.

pub mod backend;
pub mod bridge;
pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod provision;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
