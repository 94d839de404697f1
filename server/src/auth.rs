//! Caller identity extraction from the bearer credential (§6: "Caller
//! identity is taken from the bearer credential, not the body").
//!
//! The identity provider itself is out of scope (§1) — specified only at
//! this interface. This extractor decodes the minimal claims an upstream
//! gateway would have already verified: `userId` and `tier`, carried as
//! `Bearer <userId>:<tier>`.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::header;

use crate::error::ApiError;
use crate::types::Tier;

pub struct AuthContext {
    pub user_id: String,
    pub tier: Tier,
}

impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;

        let token = header_value.strip_prefix("Bearer ").ok_or(ApiError::Unauthorized)?;
        let (user_id, tier_raw) = token.split_once(':').ok_or(ApiError::Unauthorized)?;

        if user_id.is_empty() {
            return Err(ApiError::Unauthorized);
        }

        let tier = Tier::parse(tier_raw).ok_or(ApiError::Unauthorized)?;
        Ok(AuthContext { user_id: user_id.to_string(), tier })
    }
}
