//! HTTP API
//!
//! Health and build info, the SSE event stream with its subscription
//! endpoints, and the mirror queue's enqueue and state endpoints.

pub mod handlers;
pub mod server;
pub mod sse;

pub use server::{build_router, run, AppContext};
