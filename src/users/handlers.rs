use std::collections::HashMap;

use axum::{
    extract::{FromRef, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use time::{Duration, OffsetDateTime};
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        extract::CurrentUser,
        jwt::JwtKeys,
        password::{digest_reset_token, generate_reset_token, hash_password, verify_password},
    },
    error::{parse_uuid, ApiError, Payload},
    query::QueryFeatures,
    state::AppState,
    users::{
        dto::{
            AdminUpdateUserRequest, AuthResponse, ForgotPasswordRequest, LoginRequest, PublicUser,
            ResetPasswordRequest, SignupRequest, UpdateMeRequest, UpdatePasswordRequest,
        },
        repo::{Role, User, USER_FILTER_COLUMNS},
    },
};

const RESET_TOKEN_TTL_MINUTES: i64 = 10;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users/signup", post(signup))
        .route("/users/login", post(login))
        .route("/users/forgotPassword", post(forgot_password))
        .route("/users/resetPassword/:token", patch(reset_password))
        .route("/users/updatePassword", patch(update_password))
        .route("/users/updateMe", patch(update_me))
        .route("/users/me", delete(delete_me))
        .route("/users", get(list_users))
        .route(
            "/users/:id",
            get(get_user).put(admin_update_user).delete(admin_delete_user),
        )
}

/// Signs a token for the user and pairs it with the matching httpOnly cookie.
fn issue_token(state: &AppState, user: &User) -> Result<(String, HeaderMap), ApiError> {
    let keys = JwtKeys::from_ref(state);
    let token = keys.sign(user.id)?;
    let cookie = format!(
        "jwt={token}; HttpOnly; Path=/; Max-Age={}; SameSite=Lax",
        keys.ttl_secs()
    );
    let mut headers = HeaderMap::new();
    headers.insert(
        header::SET_COOKIE,
        cookie.parse().map_err(ApiError::internal)?,
    );
    Ok((token, headers))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(ApiError::internal)
}

#[instrument(skip(state, payload))]
async fn signup(
    State(state): State<AppState>,
    Payload(mut payload): Payload<SignupRequest>,
) -> Result<(StatusCode, HeaderMap, Json<AuthResponse>), ApiError> {
    payload.validate()?;
    let hash = hash_password(&payload.password)?;
    let user = User::create(&state.db, &payload.name, &payload.email, &hash).await?;
    let (token, headers) = issue_token(&state, &user)?;
    info!(user_id = %user.id, email = %user.email, "user signed up");
    Ok((
        StatusCode::CREATED,
        headers,
        Json(AuthResponse {
            status: "success",
            token,
            user: (&user).into(),
        }),
    ))
}

#[instrument(skip(state, payload))]
async fn login(
    State(state): State<AppState>,
    Payload(mut payload): Payload<LoginRequest>,
) -> Result<(HeaderMap, Json<AuthResponse>), ApiError> {
    payload.email = payload.email.trim().to_lowercase();

    // Unknown email and wrong password are indistinguishable to the caller.
    let user = User::find_active_by_email(&state.db, &payload.email)
        .await?
        .ok_or_else(|| ApiError::unauthenticated("Incorrect email or password"))?;

    if !verify_password(&payload.password, &user.password_hash)? {
        warn!(user_id = %user.id, "login with wrong password");
        return Err(ApiError::unauthenticated("Incorrect email or password"));
    }

    let (token, headers) = issue_token(&state, &user)?;
    info!(user_id = %user.id, "user logged in");
    Ok((
        headers,
        Json(AuthResponse {
            status: "success",
            token,
            user: (&user).into(),
        }),
    ))
}

#[instrument(skip(state, payload))]
async fn forgot_password(
    State(state): State<AppState>,
    Payload(payload): Payload<ForgotPasswordRequest>,
) -> Result<Json<Value>, ApiError> {
    let email = payload.email.trim().to_lowercase();

    // The response never reveals whether the account exists.
    if let Some(user) = User::find_active_by_email(&state.db, &email).await? {
        let token = generate_reset_token();
        let expires = OffsetDateTime::now_utc() + Duration::minutes(RESET_TOKEN_TTL_MINUTES);
        User::set_reset_token(&state.db, user.id, &token.digest, expires).await?;

        let body = format!(
            "Forgot your password? Submit a PATCH request with your new password and \
             confirmPassword to: /api/users/resetPassword/{}\n\
             If you didn't forget your password, please ignore this email!",
            token.plain
        );
        if let Err(e) = state
            .mailer
            .send(
                &user.email,
                "Your password reset token (valid for 10 minutes)",
                &body,
            )
            .await
        {
            // Don't leave a live token behind if it never reached the user.
            User::clear_reset_token(&state.db, user.id).await?;
            return Err(ApiError::internal(format!("send reset email: {e:#}")));
        }
        info!(user_id = %user.id, "password reset token issued");
    }

    Ok(Json(json!({
        "status": "success",
        "message": "If an account with that email exists, a reset token has been sent."
    })))
}

#[instrument(skip(state, payload))]
async fn reset_password(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Payload(payload): Payload<ResetPasswordRequest>,
) -> Result<(HeaderMap, Json<AuthResponse>), ApiError> {
    let digest = digest_reset_token(&token);
    let user = User::find_by_reset_digest(&state.db, &digest)
        .await?
        .ok_or_else(|| ApiError::validation("Token is invalid or has expired"))?;

    payload.validate()?;
    let hash = hash_password(&payload.password)?;
    // Burns the token and stamps password_changed_at.
    let user = User::set_password(&state.db, user.id, &hash)
        .await?
        .ok_or_else(|| ApiError::not_found("User with that ID is not found"))?;

    let (token, headers) = issue_token(&state, &user)?;
    info!(user_id = %user.id, "password reset");
    Ok((
        headers,
        Json(AuthResponse {
            status: "success",
            token,
            user: (&user).into(),
        }),
    ))
}

#[instrument(skip(state, current, payload))]
async fn update_password(
    State(state): State<AppState>,
    current: CurrentUser,
    Payload(payload): Payload<UpdatePasswordRequest>,
) -> Result<(HeaderMap, Json<AuthResponse>), ApiError> {
    let user = current.0;
    if !verify_password(&payload.current_password, &user.password_hash)? {
        return Err(ApiError::unauthenticated("Your current password is wrong."));
    }
    payload.validate()?;
    let hash = hash_password(&payload.password)?;
    let user = User::set_password(&state.db, user.id, &hash)
        .await?
        .ok_or_else(|| ApiError::not_found("User with that ID is not found"))?;

    let (token, headers) = issue_token(&state, &user)?;
    info!(user_id = %user.id, "password updated");
    Ok((
        headers,
        Json(AuthResponse {
            status: "success",
            token,
            user: (&user).into(),
        }),
    ))
}

#[instrument(skip(state, current, payload))]
async fn update_me(
    State(state): State<AppState>,
    current: CurrentUser,
    Payload(mut payload): Payload<UpdateMeRequest>,
) -> Result<Json<Value>, ApiError> {
    payload.validate()?;
    let user = User::update_profile(
        &state.db,
        current.0.id,
        payload.name.as_deref(),
        payload.email.as_deref(),
    )
    .await?
    .ok_or_else(|| ApiError::not_found("User with that ID is not found"))?;

    Ok(Json(json!({
        "status": "success",
        "data": { "user": to_value(&PublicUser::from(&user))? }
    })))
}

#[instrument(skip(state, current))]
async fn delete_me(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<StatusCode, ApiError> {
    User::deactivate(&state.db, current.0.id).await?;
    info!(user_id = %current.0.id, "account deactivated");
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, current))]
async fn list_users(
    State(state): State<AppState>,
    current: CurrentUser,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    current.require_role(&[Role::Admin])?;
    let features = QueryFeatures::from_params(&params, &USER_FILTER_COLUMNS)?;
    let users = User::list(&state.db, &features).await?;
    let items = users
        .iter()
        .map(|u| Ok(features.project(to_value(&PublicUser::from(u))?)))
        .collect::<Result<Vec<_>, ApiError>>()?;

    Ok(Json(json!({
        "status": "success",
        "results": items.len(),
        "data": { "users": items }
    })))
}

#[instrument(skip(state, current))]
async fn get_user(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    current.require_role(&[Role::Admin])?;
    let id = parse_uuid("id", &id)?;
    let user = User::find_by_id(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::not_found("User with that ID is not found"))?;

    Ok(Json(json!({
        "status": "success",
        "data": { "user": to_value(&PublicUser::from(&user))? }
    })))
}

#[instrument(skip(state, current, payload))]
async fn admin_update_user(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<String>,
    Payload(mut payload): Payload<AdminUpdateUserRequest>,
) -> Result<Json<Value>, ApiError> {
    current.require_role(&[Role::Admin])?;
    let id = parse_uuid("id", &id)?;
    payload.validate()?;
    let user = User::admin_update(
        &state.db,
        id,
        payload.name.as_deref(),
        payload.email.as_deref(),
        payload.role,
        payload.is_active,
    )
    .await?
    .ok_or_else(|| ApiError::not_found("User with that ID is not found"))?;

    Ok(Json(json!({
        "status": "success",
        "data": { "user": to_value(&PublicUser::from(&user))? }
    })))
}

#[instrument(skip(state, current))]
async fn admin_delete_user(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    current.require_role(&[Role::Admin])?;
    let id = parse_uuid("id", &id)?;
    let deleted = User::delete(&state.db, id).await?;
    if deleted == 0 {
        return Err(ApiError::not_found("User with that ID is not found"));
    }
    info!(user_id = %id, "user hard-deleted by admin");
    Ok(StatusCode::NO_CONTENT)
}
