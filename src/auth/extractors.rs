use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use uuid::Uuid;

use crate::auth::jwt::JwtKeys;
use crate::error::{ApiError, AuthError};
use crate::state::AppState;
use crate::users::repo_types::User;

/// Identity resolved from a verified access token. Denormalized claims only;
/// handlers needing the full record re-fetch by id.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: Uuid,
    pub username: String,
    pub email: String,
}

/// Extractor guarding authenticated routes. Verifies the Bearer access token
/// and checks the subject still exists, so a signed token for a deleted
/// account is rejected.
pub struct CurrentUser(pub Principal);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .ok_or(AuthError::InvalidToken)?;

        let token = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
            .ok_or(AuthError::InvalidToken)?;

        let keys = JwtKeys::from_ref(state);
        let claims = keys.verify_access(token)?;

        let exists = User::find_by_id(&state.db, claims.sub)
            .await
            .map_err(ApiError::Internal)?
            .is_some();
        if !exists {
            return Err(AuthError::PrincipalNotFound.into());
        }

        Ok(CurrentUser(Principal {
            id: claims.sub,
            username: claims.username,
            email: claims.email,
        }))
    }
}
