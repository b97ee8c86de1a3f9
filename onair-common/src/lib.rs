//! # OnAir Common Library
//!
//! Shared code for the OnAir station services including:
//! - Error types
//! - Configuration file resolution and TOML loading
//! - Event frame types pushed to live clients
//! - SSE framing helpers

pub mod config;
pub mod error;
pub mod events;
pub mod sse;

pub use error::{Error, Result};
pub use events::{EventFrame, SyncEventType};
