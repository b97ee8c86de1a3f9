//! Mirror replication
//!
//! Writes made against the primary store are re-applied to the legacy store
//! through an ordered, retrying queue. The queue publishes lifecycle events that
//! the broadcast bridge forwards to operational clients.

pub mod backoff;
pub mod command;
pub mod events;
pub mod executor;
pub mod fatal;
pub mod queue;

pub use backoff::{compute_delay, BackoffPolicy};
pub use command::{CommandOutcome, CommandStatus, MirrorCommand, MirrorStatement, QueueState};
pub use events::QueueEvent;
pub use executor::{CommandExecutor, MySqlExecutor};
pub use fatal::FatalInfo;
pub use queue::{MirrorCommandQueue, QueueOptions};
