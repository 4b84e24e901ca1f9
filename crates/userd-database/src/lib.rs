//! SQLite storage for user records and the notification outbox.
//!
//! This crate provides:
//! - `DatabasePool`: thread-safe connection pool with WAL mode
//! - `Database`: high-level handle exposing `with_tx`, the single
//!   all-or-nothing primitive that entity writes and outbox appends
//!   are composed with
//! - `queries`: standalone query functions over `&Connection` so they
//!   compose inside one transaction

mod db;
mod error;
pub mod migrations;
mod models;
mod pool;
pub mod queries;

pub use db::Database;
pub use error::{DatabaseError, DatabaseResult};
pub use models::{
    DeliveryStatus, NewUser, OutboxEntry, OutboxOperation, User,
};
pub use pool::{DatabasePool, PoolConfig, PoolState};
