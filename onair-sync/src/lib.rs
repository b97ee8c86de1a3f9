//! onair-sync library
//!
//! Mirrors primary-store writes into the legacy MySQL store (reachable only
//! through an SSH bastion) and streams live events, including the mirror's own
//! health, to connected operator clients.

pub mod api;
pub mod bridge;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod mirror;
pub mod tunnel;

pub use config::SyncConfig;
pub use error::{Error, Result};
