//! Database migrations.
//!
//! Migrations are run in order and tracked in the `migrations` table.

use crate::DatabaseResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_users(conn)?;
    }
    if current_version < 2 {
        migrate_v2_event_outbox(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: users table.
fn migrate_v1_users(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: users");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            age INTEGER,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;

    record_migration(conn, 1, "users")?;
    Ok(())
}

/// V2: event outbox for notification delivery.
fn migrate_v2_event_outbox(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v2: event outbox");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS user_event_outbox (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            operation TEXT NOT NULL,
            email TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempt_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            claimed_by TEXT,
            claim_expires_at TEXT,
            last_attempt_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            delivered_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_status_seq
            ON user_event_outbox(status, seq);
        CREATE INDEX IF NOT EXISTS idx_outbox_claim_expires_at
            ON user_event_outbox(claim_expires_at);
        ",
    )?;

    record_migration(conn, 2, "event_outbox")?;
    Ok(())
}
