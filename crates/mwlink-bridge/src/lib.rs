//! The client role of mwlink: one serial device, one network connection.
//!
//! Request envelopes arriving from the network are queued into two
//! priority lanes and dispatched to the serial side one at a time. A
//! serial response releases the in-flight slot and is forwarded back as
//! a response envelope tagged with the originating correlation id; an
//! overdue response trips the advance timer instead, which clears the
//! slot without forwarding anything — a liveness valve bounding
//! serial-side starvation, not a retry.

pub mod bridge;
pub mod error;
pub mod queue;

pub use bridge::{BridgeConfig, LinkBridge, ADVANCE_TIMEOUT, RECONNECT_DELAY};
pub use error::{BridgeError, Result};
pub use queue::{OutboundQueue, QueueItem};
