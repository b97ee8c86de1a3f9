//! Live client fan-out

pub mod broadcaster;
pub mod transport;

pub use broadcaster::{EventBroadcaster, EventClient};
pub use transport::{ChannelTransport, ClientTransport};
