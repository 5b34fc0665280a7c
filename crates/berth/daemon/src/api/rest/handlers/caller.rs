//! Caller identity extracted from the request.
//!
//! The gateway in front of the daemon authenticates the user and forwards
//! the owner id in a header; nothing here verifies it again.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use berth_types::OwnerId;

use crate::error::ApiError;

/// Header carrying the authenticated owner id.
pub const OWNER_HEADER: &str = "x-berth-owner";

/// The owner on whose behalf the request is made
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub OwnerId);

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(OWNER_HEADER)
            .ok_or_else(|| ApiError::Unauthenticated(format!("missing {} header", OWNER_HEADER)))?
            .to_str()
            .map_err(|_| ApiError::BadRequest(format!("{} is not valid text", OWNER_HEADER)))?;

        raw.trim()
            .parse::<i64>()
            .map(|id| Caller(OwnerId::new(id)))
            .map_err(|_| ApiError::BadRequest(format!("{} must be an integer", OWNER_HEADER)))
    }
}
