//! Mutation service for user records.
//!
//! Translates each logical operation into one atomic unit of
//! {entity write, outbox append}. Publishing to the event channel is
//! not this crate's concern; the outbox entry written here is drained
//! asynchronously by the dispatcher.

mod error;
mod service;
mod validate;

pub use error::{ServiceError, ServiceResult};
pub use service::{UserInput, UserService};
