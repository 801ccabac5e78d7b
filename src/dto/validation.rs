//! Validation helpers for DTOs.

use validator::ValidationError;

use crate::state::registry::KEY_SEPARATOR;

/// Longest identifier accepted for discs, stores and codes.
pub const MAX_RECORD_ID_LENGTH: usize = 128;

/// Validates an identifier used as (part of) a document key.
///
/// # Examples
///
/// ```ignore
/// validate_record_id("disc123")    // Ok
/// validate_record_id("")           // Err - empty
/// validate_record_id("a::b")       // Err - contains the key separator
/// validate_record_id("stores/a")   // Err - contains a path separator
/// ```
pub fn validate_record_id(id: &str) -> Result<(), ValidationError> {
    if id.trim().is_empty() {
        let mut err = ValidationError::new("record_id_empty");
        err.message = Some("Identifier must not be empty".into());
        return Err(err);
    }

    if id.len() > MAX_RECORD_ID_LENGTH {
        let mut err = ValidationError::new("record_id_length");
        err.message = Some(
            format!(
                "Identifier must be at most {MAX_RECORD_ID_LENGTH} bytes (got {})",
                id.len()
            )
            .into(),
        );
        return Err(err);
    }

    if id.contains(KEY_SEPARATOR) || id.contains('/') || id.chars().any(char::is_control) {
        let mut err = ValidationError::new("record_id_format");
        err.message = Some(
            format!("Identifier must not contain `{KEY_SEPARATOR}`, `/` or control characters")
                .into(),
        );
        return Err(err);
    }

    Ok(())
}
