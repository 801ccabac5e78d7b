//! Caller identity and path parameter checks shared by the route handlers.

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::{dto::validation::validate_record_id, error::AppError};

/// Header carrying the opaque identity of the player or store making the call.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Identity of the caller, taken from the `X-User-Id` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerId(pub String);

impl CallerId {
    /// Caller id as sent.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reject the call unless the caller is `store_id` itself.
    pub fn ensure_store(&self, store_id: &str) -> Result<(), AppError> {
        if self.0 == store_id {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "caller `{}` cannot act for store `{store_id}`",
                self.0
            )))
        }
    }
}

impl<S> FromRequestParts<S> for CallerId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .ok_or_else(|| AppError::Unauthorized("missing `X-User-Id` header".into()))?;

        validate_record_id(value)
            .map_err(|err| AppError::Unauthorized(format!("invalid `X-User-Id` header: {err}")))?;

        Ok(CallerId(value.to_owned()))
    }
}

/// Validate an identifier taken from the request path.
pub fn path_id<'a>(name: &str, value: &'a str) -> Result<&'a str, AppError> {
    validate_record_id(value).map_err(|err| AppError::BadRequest(format!("invalid {name}: {err}")))?;
    Ok(value)
}
