use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts, HeaderMap},
};
use tracing::warn;

use crate::{
    auth::jwt::JwtKeys,
    error::ApiError,
    state::AppState,
    users::repo::{Role, User},
};

/// Authenticated caller, resolved before any handler runs. Extractor
/// rejection short-circuits the request, so a handler can never observe an
/// absent or stale identity.
pub struct CurrentUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ApiError::unauthenticated("You are not logged in!"))?;

        let keys = JwtKeys::from_ref(state);
        let claims = keys.verify(&token).map_err(|e| {
            warn!(error = %e, "token verification failed");
            ApiError::unauthenticated("Invalid or expired token. Please log in again!")
        })?;

        let user = User::find_active_by_id(&state.db, claims.sub)
            .await?
            .ok_or_else(|| {
                ApiError::unauthenticated("The user belonging to this token no longer exists.")
            })?;

        if user.password_changed_after(claims.iat as i64) {
            return Err(ApiError::unauthenticated(
                "Password was recently changed! Please log in again.",
            ));
        }

        Ok(CurrentUser(user))
    }
}

impl CurrentUser {
    /// Role guard: the caller's role must be in the allowed set. Call sites
    /// guarding a single role pass a one-element slice.
    pub fn require_role(&self, allowed: &[Role]) -> Result<(), ApiError> {
        if allowed.contains(&self.0.role) {
            Ok(())
        } else {
            Err(ApiError::forbidden(
                "You do not have permission to perform this action!",
            ))
        }
    }
}

/// Token from `Authorization: Bearer <t>`, falling back to the `jwt` cookie.
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
        {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
        return None;
    }
    headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                (name == "jwt" && !value.is_empty()).then(|| value.to_string())
            })
        })
}
