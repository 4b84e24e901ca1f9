//! Outbox dispatcher and event channel adapter.
//!
//! This crate provides:
//! - `Dispatcher`: background loop that drains pending outbox entries,
//!   with claim leases, exponential backoff, and dead-lettering
//! - `EventChannel`: the publish seam between the dispatcher and the
//!   external channel
//! - `RedisEventChannel`: Redis Streams implementation of that seam

mod channel;
mod dispatcher;
mod error;

pub use channel::{EventChannel, RedisEventChannel, UserEvent};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{ChannelError, OutboxError, OutboxResult};
