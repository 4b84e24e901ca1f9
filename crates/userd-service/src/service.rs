//! User mutation service.

use crate::error::{ServiceError, ServiceResult};
use crate::validate::validate_input;
use serde::Deserialize;
use tracing::{debug, info};
use userd_database::{queries, Database, DatabaseError, NewUser, OutboxOperation, User};

/// Normalized user input from the API layer.
///
/// Shape validation (field presence) happens upstream; the semantic
/// constraints are re-checked here.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInput {
    pub name: String,
    pub email: String,
    pub age: Option<i64>,
}

impl UserInput {
    fn into_fields(self) -> NewUser {
        NewUser {
            name: self.name,
            email: self.email,
            age: self.age,
        }
    }
}

/// Mutation service for user records.
///
/// Each mutating operation is exactly one atomic transaction. Create
/// and delete append the matching outbox entry inside that same
/// transaction; there is no code path that commits one side without
/// the other.
#[derive(Clone)]
pub struct UserService {
    db: Database,
}

impl UserService {
    /// Create a new user service over the given store.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Get a user by id.
    pub fn get(&self, id: i64) -> ServiceResult<User> {
        let user = self.db.with_conn(|conn| queries::get_user(conn, id))?;
        user.ok_or_else(|| ServiceError::NotFound(format!("user {}", id)))
    }

    /// List all users.
    pub fn list(&self) -> ServiceResult<Vec<User>> {
        Ok(self.db.with_conn(queries::list_users)?)
    }

    /// Create a user and stage its CREATE notification atomically.
    ///
    /// Fails with `Validation` or `Conflict` before anything is
    /// persisted; on success both the row and the outbox entry are
    /// committed together.
    pub fn create(&self, input: UserInput) -> ServiceResult<User> {
        validate_input(&input)?;
        let fields = input.into_fields();

        let user = self.db.with_tx(|tx| {
            let user = queries::insert_user(tx, &fields)?;
            let entry = queries::insert_outbox_entry(tx, OutboxOperation::Create, &user.email)?;
            debug!(user_id = user.id, seq = entry.seq, "Staged CREATE event");
            Ok(user)
        })?;

        info!(user_id = user.id, email = %user.email, "Created user");
        Ok(user)
    }

    /// Overwrite the mutable fields of an existing user.
    ///
    /// Id and creation timestamp never change. No outbox entry is
    /// written; downstream consumers are not notified of updates.
    pub fn update(&self, id: i64, input: UserInput) -> ServiceResult<User> {
        validate_input(&input)?;
        let fields = input.into_fields();

        let user = self.db.with_tx(|tx| {
            queries::update_user(tx, id, &fields)?
                .ok_or_else(|| DatabaseError::NotFound(format!("user {}", id)))
        })?;

        info!(user_id = user.id, "Updated user");
        Ok(user)
    }

    /// Delete a user and stage its DELETE notification atomically.
    ///
    /// The staged event carries the email of the removed row. Returns
    /// the removed row.
    pub fn delete(&self, id: i64) -> ServiceResult<User> {
        let user = self.db.with_tx(|tx| {
            let removed = queries::delete_user(tx, id)?
                .ok_or_else(|| DatabaseError::NotFound(format!("user {}", id)))?;
            let entry = queries::insert_outbox_entry(tx, OutboxOperation::Delete, &removed.email)?;
            debug!(user_id = removed.id, seq = entry.seq, "Staged DELETE event");
            Ok(removed)
        })?;

        info!(user_id = user.id, email = %user.email, "Deleted user");
        Ok(user)
    }
}
