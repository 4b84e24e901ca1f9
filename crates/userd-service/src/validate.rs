//! Semantic validation of user input.
//!
//! The HTTP layer only checks field presence; the constraints here are
//! re-checked regardless of what the caller claims to have validated.

use crate::{ServiceError, ServiceResult, UserInput};

/// Validate a user input against the semantic constraints:
/// non-blank name, syntactically valid email, non-negative age.
///
/// Email uniqueness is not checked here; the store constraint is the
/// single source of truth for that.
pub fn validate_input(input: &UserInput) -> ServiceResult<()> {
    if input.name.trim().is_empty() {
        return Err(ServiceError::Validation("name must not be blank".to_string()));
    }
    if !is_valid_email(&input.email) {
        return Err(ServiceError::Validation(format!(
            "invalid email address: {}",
            input.email
        )));
    }
    if let Some(age) = input.age {
        if age < 0 {
            return Err(ServiceError::Validation(format!(
                "age must not be negative: {}",
                age
            )));
        }
    }
    Ok(())
}

/// Minimal email syntax check: one `@`, a non-empty local part, and a
/// dotted domain with non-empty labels. No whitespace anywhere.
pub fn is_valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }

    let mut parts = email.splitn(2, '@');
    let local = parts.next().unwrap_or("");
    let domain = match parts.next() {
        Some(d) => d,
        None => return false,
    };

    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return false;
    }

    domain.contains('.') && domain.split('.').all(|label| !label.is_empty())
}
