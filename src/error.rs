use axum::{
    async_trait,
    extract::{FromRequest, Request, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::{error, warn};
use uuid::Uuid;

use crate::{config::EnvMode, state::AppState};

/// Application error taxonomy. Everything a handler can fail with ends up
/// here, and every variant except `Internal` is operational: its message is
/// safe to show to clients in production.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("There is already a record with {field} {value}. Please use another.")]
    Duplicate { field: String, value: String },
    #[error("Invalid value for {field}: {value}")]
    Cast { field: String, value: String },
    #[error("{0}")]
    Unauthenticated(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Too many requests from this IP! Please try again later.")]
    RateLimited,
    #[error("{message}")]
    Internal {
        message: String,
        detail: Option<String>,
    },
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ApiError::Validation(msg.into())
    }

    pub fn cast(field: impl Into<String>, value: impl Into<String>) -> Self {
        ApiError::Cast {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        ApiError::Unauthenticated(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        ApiError::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError::NotFound(msg.into())
    }

    pub fn internal(detail: impl ToString) -> Self {
        ApiError::Internal {
            message: "Something went wrong! Please try again later.".into(),
            detail: Some(detail.to_string()),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::Duplicate { .. } | ApiError::Cast { .. } => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Operational errors are expected conditions raised on purpose; anything
    /// else must not leak its message to clients in production.
    pub fn is_operational(&self) -> bool {
        !matches!(self, ApiError::Internal { .. })
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => ApiError::not_found("Record not found"),
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                match db
                    .try_downcast_ref::<sqlx::postgres::PgDatabaseError>()
                    .and_then(|pg| pg.detail())
                    .and_then(parse_unique_violation)
                {
                    Some((field, value)) => ApiError::Duplicate { field, value },
                    None => ApiError::validation("Duplicate field value. Please use another."),
                }
            }
            _ => ApiError::internal(err),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::internal(format!("{err:#}"))
    }
}

/// Pulls `(field, value)` out of a Postgres unique-violation detail line of
/// the form `Key (title)=(Buy milk) already exists.`
fn parse_unique_violation(detail: &str) -> Option<(String, String)> {
    let rest = detail.strip_prefix("Key (")?;
    let sep = rest.find(")=(")?;
    let field = &rest[..sep];
    let tail = &rest[sep + 3..];
    let end = tail.rfind(") already exists")?;
    Some((field.to_string(), tail[..end].to_string()))
}

/// Path-segment identifier parsing; a malformed id is a cast failure, not a
/// routing miss.
pub fn parse_uuid(field: &str, raw: &str) -> Result<Uuid, ApiError> {
    raw.parse::<Uuid>().map_err(|_| ApiError::cast(field, raw))
}

/// Everything the terminal responder needs to shape and log the failure,
/// attached to the response as an extension by `IntoResponse`.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub status: StatusCode,
    pub message: String,
    pub operational: bool,
    pub detail: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ctx = ErrorContext {
            status: self.status_code(),
            message: self.to_string(),
            operational: self.is_operational(),
            detail: match &self {
                ApiError::Internal { detail, .. } => detail.clone(),
                _ => None,
            },
        };
        // Safe default shape in case the terminal layer is bypassed; the
        // layer rebuilds the body from the attached context.
        let (status, body) = shape(&ctx, EnvMode::Production);
        let mut res = (status, Json(body)).into_response();
        res.extensions_mut().insert(ctx);
        res
    }
}

/// Response shaping policy. In production only operational messages are
/// surfaced; in development every error carries its real message and detail.
pub(crate) fn shape(ctx: &ErrorContext, env: EnvMode) -> (StatusCode, Value) {
    if env.is_production() {
        if ctx.operational {
            (
                ctx.status,
                json!({ "status": ctx.status.as_u16(), "message": ctx.message }),
            )
        } else {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "status": 500,
                    "message": "Something went wrong! Please try again later."
                }),
            )
        }
    } else {
        (
            ctx.status,
            json!({
                "status": ctx.status.as_u16(),
                "message": ctx.message,
                "detail": ctx.detail,
            }),
        )
    }
}

/// Terminal error responder: the single place every failed request is shaped
/// and logged. Installed as the outermost `map_response` layer.
pub async fn respond(State(state): State<AppState>, res: Response) -> Response {
    let Some(ctx) = res.extensions().get::<ErrorContext>().cloned() else {
        return res;
    };

    let event_id = Uuid::new_v4();
    state
        .event_log
        .append(event_id, ctx.status.as_u16(), &ctx.message)
        .await;

    if ctx.operational {
        warn!(%event_id, status = %ctx.status, message = %ctx.message, "request failed");
    } else {
        error!(
            %event_id,
            status = %ctx.status,
            message = %ctx.message,
            detail = ctx.detail.as_deref().unwrap_or(""),
            "unexpected error"
        );
    }

    let (status, body) = shape(&ctx, state.config.env);
    (status, Json(body)).into_response()
}

/// Fallback for unmatched routes, funneled through the same responder.
pub async fn unmatched_route(uri: Uri) -> ApiError {
    ApiError::not_found(format!("Can't find {uri} on this server!"))
}

/// JSON body extractor whose rejection is an `ApiError`, so malformed bodies
/// get the same shaping and event logging as every other failure instead of
/// axum's plain-text rejection.
pub struct Payload<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for Payload<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Payload(value)),
            Err(rejection) => Err(ApiError::validation(rejection.body_text())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(
            ApiError::validation("x").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::cast("id", "nope").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::unauthenticated("x").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::forbidden("x").status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::not_found("x").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::RateLimited.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::internal("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn duplicate_message_names_field_and_value() {
        let err = ApiError::Duplicate {
            field: "title".into(),
            value: "Buy milk".into(),
        };
        assert_eq!(
            err.to_string(),
            "There is already a record with title Buy milk. Please use another."
        );
    }

    #[test]
    fn cast_message_names_field_and_value() {
        let err = ApiError::cast("id", "not-a-uuid");
        assert_eq!(err.to_string(), "Invalid value for id: not-a-uuid");
    }

    #[test]
    fn parses_pg_unique_violation_detail() {
        let detail = "Key (title)=(Buy milk) already exists.";
        assert_eq!(
            parse_unique_violation(detail),
            Some(("title".to_string(), "Buy milk".to_string()))
        );
    }

    #[test]
    fn parses_detail_with_parens_in_value() {
        let detail = "Key (title)=(Call mum (tonight)) already exists.";
        assert_eq!(
            parse_unique_violation(detail),
            Some(("title".to_string(), "Call mum (tonight)".to_string()))
        );
    }

    #[test]
    fn unique_violation_parse_rejects_garbage() {
        assert_eq!(parse_unique_violation("nothing useful"), None);
    }

    #[test]
    fn malformed_uuid_is_a_cast_error() {
        let err = parse_uuid("id", "not-a-uuid").unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "Invalid value for id: not-a-uuid");
        assert!(parse_uuid("id", "7c9e6679-7425-40de-944b-e07fc1f90ae7").is_ok());
    }

    #[test]
    fn production_hides_internal_detail() {
        let ctx = ErrorContext {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "db exploded".into(),
            operational: false,
            detail: Some("connection refused".into()),
        };
        let (status, body) = shape(&ctx, EnvMode::Production);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body["message"],
            "Something went wrong! Please try again later."
        );
        assert!(body.get("detail").is_none());
    }

    #[test]
    fn production_surfaces_operational_message() {
        let ctx = ErrorContext {
            status: StatusCode::UNAUTHORIZED,
            message: "You are not logged in!".into(),
            operational: true,
            detail: None,
        };
        let (status, body) = shape(&ctx, EnvMode::Production);
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["status"], 401);
        assert_eq!(body["message"], "You are not logged in!");
    }

    #[tokio::test]
    async fn responder_shapes_body_and_appends_event_log() {
        let state = AppState::fake();
        let res = ApiError::unauthenticated("You are not logged in!").into_response();
        let res = respond(State(state.clone()), res).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .expect("body readable");
        let body: Value = serde_json::from_slice(&bytes).expect("json body");
        assert_eq!(body["status"], 401);
        assert_eq!(body["message"], "You are not logged in!");

        let log = tokio::fs::read_to_string(&state.config.error_log_path)
            .await
            .expect("event log written");
        assert!(log.contains("401\tYou are not logged in!"));
        tokio::fs::remove_file(&state.config.error_log_path).await.ok();
    }

    #[tokio::test]
    async fn malformed_json_body_is_a_validation_error() {
        #[derive(serde::Deserialize)]
        struct Input {
            title: String,
        }

        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(r#"{"title":"#))
            .unwrap();
        let err = Payload::<Input>::from_request(req, &())
            .await
            .err()
            .expect("malformed body must be rejected");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.is_operational());

        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(r#"{"title":"Buy milk"}"#))
            .unwrap();
        let Payload(input) = Payload::<Input>::from_request(req, &())
            .await
            .expect("well-formed body");
        assert_eq!(input.title, "Buy milk");
    }

    #[tokio::test]
    async fn responder_passes_success_responses_through() {
        let state = AppState::fake();
        let res = (StatusCode::OK, Json(json!({ "status": "success" }))).into_response();
        let res = respond(State(state), res).await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[test]
    fn development_keeps_detail() {
        let ctx = ErrorContext {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "db exploded".into(),
            operational: false,
            detail: Some("connection refused".into()),
        };
        let (_, body) = shape(&ctx, EnvMode::Development);
        assert_eq!(body["message"], "db exploded");
        assert_eq!(body["detail"], "connection refused");
    }
}
