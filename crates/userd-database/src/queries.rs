//! Standalone query functions that work with any Connection.
//!
//! Each function takes a `&Connection` as its first parameter, so the
//! same functions run against a plain connection, a pooled connection,
//! or inside a transaction. That last property is what lets the
//! mutation service compose an entity write and an outbox append into
//! one atomic unit.

use crate::{
    DatabaseError, DatabaseResult, DeliveryStatus, NewUser, OutboxEntry, OutboxOperation, User,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};

// ==========================================
// Users
// ==========================================

/// Insert a new user, assigning id and creation timestamp.
///
/// A duplicate email surfaces as `DatabaseError::Conflict`.
pub fn insert_user(conn: &Connection, user: &NewUser) -> DatabaseResult<User> {
    let now = fmt_ts(Utc::now());
    conn.execute(
        "INSERT INTO users (name, email, age, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![user.name, user.email, user.age, now],
    )
    .map_err(|e| map_email_conflict(e, &user.email))?;

    let id = conn.last_insert_rowid();
    get_user(conn, id)?
        .ok_or_else(|| DatabaseError::NotFound("User not found after insert".to_string()))
}

/// Get a user by id.
pub fn get_user(conn: &Connection, id: i64) -> DatabaseResult<Option<User>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, name, email, age, created_at FROM users WHERE id = ?1",
    )?;

    let result = stmt.query_row(params![id], |row| {
        Ok(User {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            age: row.get(3)?,
            created_at: parse_datetime(row.get::<_, String>(4)?),
        })
    });

    match result {
        Ok(user) => Ok(Some(user)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// List all users ordered by id.
pub fn list_users(conn: &Connection) -> DatabaseResult<Vec<User>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, name, email, age, created_at FROM users ORDER BY id ASC",
    )?;

    let users = stmt
        .query_map([], |row| {
            Ok(User {
                id: row.get(0)?,
                name: row.get(1)?,
                email: row.get(2)?,
                age: row.get(3)?,
                created_at: parse_datetime(row.get::<_, String>(4)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(users)
}

/// Overwrite the mutable fields of a user (name, email, age).
///
/// Id and creation timestamp are never touched. Returns the updated
/// row, or None if the id does not exist. A duplicate email surfaces
/// as `DatabaseError::Conflict`.
pub fn update_user(conn: &Connection, id: i64, fields: &NewUser) -> DatabaseResult<Option<User>> {
    let count = conn
        .execute(
            "UPDATE users SET name = ?1, email = ?2, age = ?3 WHERE id = ?4",
            params![fields.name, fields.email, fields.age, id],
        )
        .map_err(|e| map_email_conflict(e, &fields.email))?;

    if count == 0 {
        return Ok(None);
    }
    get_user(conn, id)
}

/// Delete a user by id, returning the removed row.
pub fn delete_user(conn: &Connection, id: i64) -> DatabaseResult<Option<User>> {
    let existing = match get_user(conn, id)? {
        Some(user) => user,
        None => return Ok(None),
    };

    conn.execute("DELETE FROM users WHERE id = ?1", params![id])?;
    Ok(Some(existing))
}

// ==========================================
// Event outbox
// ==========================================

/// Append a pending outbox entry, assigning its sequence number.
pub fn insert_outbox_entry(
    conn: &Connection,
    operation: OutboxOperation,
    email: &str,
) -> DatabaseResult<OutboxEntry> {
    let now = fmt_ts(Utc::now());
    conn.execute(
        "INSERT INTO user_event_outbox (operation, email, status, created_at)
         VALUES (?1, ?2, 'pending', ?3)",
        params![operation.as_str(), email, now],
    )?;

    let seq = conn.last_insert_rowid();
    get_outbox_entry(conn, seq)?
        .ok_or_else(|| DatabaseError::NotFound("Outbox entry not found after insert".to_string()))
}

/// Get an outbox entry by sequence number.
pub fn get_outbox_entry(conn: &Connection, seq: i64) -> DatabaseResult<Option<OutboxEntry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {OUTBOX_COLUMNS} FROM user_event_outbox WHERE seq = ?1"
    ))?;

    let result = stmt.query_row(params![seq], outbox_from_row);

    match result {
        Ok(entry) => Ok(Some(entry)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// List outbox entries in a given delivery state, in sequence order.
pub fn list_outbox_by_status(
    conn: &Connection,
    status: DeliveryStatus,
    limit: usize,
) -> DatabaseResult<Vec<OutboxEntry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {OUTBOX_COLUMNS} FROM user_event_outbox
         WHERE status = ?1 ORDER BY seq ASC LIMIT ?2"
    ))?;

    let entries = stmt
        .query_map(params![status.as_str(), limit as i64], outbox_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(entries)
}

/// Count outbox entries in a given delivery state.
pub fn count_outbox_by_status(conn: &Connection, status: DeliveryStatus) -> DatabaseResult<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM user_event_outbox WHERE status = ?1",
        params![status.as_str()],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// List pending entries whose claim lease is absent or expired, in
/// sequence order. Backoff eligibility is the dispatcher's concern;
/// this only filters on state and lease.
pub fn list_claimable_outbox(
    conn: &Connection,
    now: DateTime<Utc>,
    limit: usize,
) -> DatabaseResult<Vec<OutboxEntry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {OUTBOX_COLUMNS} FROM user_event_outbox
         WHERE status = 'pending'
           AND (claimed_by IS NULL OR claim_expires_at < ?1)
         ORDER BY seq ASC LIMIT ?2"
    ))?;

    let entries = stmt
        .query_map(params![fmt_ts(now), limit as i64], outbox_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(entries)
}

/// Take the claim lease on a pending entry.
///
/// The guard re-checks state and lease inside the UPDATE, so two
/// dispatcher instances racing for the same entry resolve to exactly
/// one winner. Returns false if the entry was already claimed,
/// delivered, or dead.
pub fn claim_outbox_entry(
    conn: &Connection,
    seq: i64,
    instance: &str,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let count = conn.execute(
        "UPDATE user_event_outbox
         SET claimed_by = ?2, claim_expires_at = ?3
         WHERE seq = ?1 AND status = 'pending'
           AND (claimed_by IS NULL OR claim_expires_at < ?4)",
        params![seq, instance, fmt_ts(expires_at), fmt_ts(now)],
    )?;
    Ok(count > 0)
}

/// Mark a claimed entry delivered after a confirmed publish.
///
/// Only the lease holder may perform this transition.
pub fn mark_outbox_delivered(
    conn: &Connection,
    seq: i64,
    instance: &str,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let count = conn.execute(
        "UPDATE user_event_outbox
         SET status = 'delivered', delivered_at = ?3,
             claimed_by = NULL, claim_expires_at = NULL
         WHERE seq = ?1 AND claimed_by = ?2 AND status = 'pending'",
        params![seq, instance, fmt_ts(now)],
    )?;
    Ok(count > 0)
}

/// Release the claim after a failed publish, recording the error and
/// bumping the attempt count. The entry stays pending for retry.
pub fn release_outbox_claim(
    conn: &Connection,
    seq: i64,
    instance: &str,
    error: &str,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let count = conn.execute(
        "UPDATE user_event_outbox
         SET claimed_by = NULL, claim_expires_at = NULL,
             attempt_count = attempt_count + 1,
             last_error = ?3, last_attempt_at = ?4
         WHERE seq = ?1 AND claimed_by = ?2 AND status = 'pending'",
        params![seq, instance, error, fmt_ts(now)],
    )?;
    Ok(count > 0)
}

/// Move a claimed entry to the dead state once its retry budget is
/// exhausted. Dead entries are excluded from claiming and surface only
/// through the operator counters.
pub fn mark_outbox_dead(
    conn: &Connection,
    seq: i64,
    instance: &str,
    error: &str,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let count = conn.execute(
        "UPDATE user_event_outbox
         SET status = 'dead',
             claimed_by = NULL, claim_expires_at = NULL,
             attempt_count = attempt_count + 1,
             last_error = ?3, last_attempt_at = ?4
         WHERE seq = ?1 AND claimed_by = ?2 AND status = 'pending'",
        params![seq, instance, error, fmt_ts(now)],
    )?;
    Ok(count > 0)
}

// ==========================================
// Helpers
// ==========================================

const OUTBOX_COLUMNS: &str = "seq, operation, email, status, attempt_count, last_error, \
     claimed_by, claim_expires_at, last_attempt_at, created_at, delivered_at";

fn outbox_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
    Ok(OutboxEntry {
        seq: row.get(0)?,
        operation: OutboxOperation::from_str(&row.get::<_, String>(1)?),
        email: row.get(2)?,
        status: DeliveryStatus::from_str(&row.get::<_, String>(3)?),
        attempt_count: row.get(4)?,
        last_error: row.get(5)?,
        claimed_by: row.get(6)?,
        claim_expires_at: row.get::<_, Option<String>>(7)?.map(parse_datetime),
        last_attempt_at: row.get::<_, Option<String>>(8)?.map(parse_datetime),
        created_at: parse_datetime(row.get::<_, String>(9)?),
        delivered_at: row.get::<_, Option<String>>(10)?.map(parse_datetime),
    })
}

/// Map a unique-constraint failure on users.email to a Conflict error.
fn map_email_conflict(e: rusqlite::Error, email: &str) -> DatabaseError {
    if let rusqlite::Error::SqliteFailure(err, Some(ref msg)) = e {
        if err.code == rusqlite::ErrorCode::ConstraintViolation && msg.contains("users.email") {
            return DatabaseError::Conflict(format!("email already in use: {}", email));
        }
    }
    DatabaseError::Sqlite(e)
}

/// Format a timestamp for storage. Fixed fractional width keeps stored
/// values lexicographically comparable in SQL.
fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Parse an RFC 3339 datetime string, falling back to current time on error.
fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
