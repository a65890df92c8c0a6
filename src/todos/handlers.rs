use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tracing::{info, instrument};

use crate::{
    auth::extract::CurrentUser,
    error::{parse_uuid, ApiError, Payload},
    query::QueryFeatures,
    state::AppState,
    todos::{
        dto::{CreateTodoRequest, TodoResponse, UpdateTodoRequest},
        repo::{Todo, TODO_FILTER_COLUMNS},
    },
    users::repo::User,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/todos", get(list_todos).post(create_todo))
        .route("/todos/highest-priorities", get(highest_priorities))
        .route(
            "/todos/:id",
            get(get_todo).put(update_todo).delete(delete_todo),
        )
}

fn assert_owner(todo: &Todo, user: &User) -> Result<(), ApiError> {
    if todo.created_by == user.id {
        Ok(())
    } else {
        Err(ApiError::forbidden(
            "You do not have permission to perform this action!",
        ))
    }
}

async fn render_list(
    state: &AppState,
    user: &User,
    params: &HashMap<String, String>,
) -> Result<Json<Value>, ApiError> {
    let features = QueryFeatures::from_params(params, &TODO_FILTER_COLUMNS)?;
    let todos = Todo::list_for_owner(&state.db, user.id, &features).await?;
    let items = todos
        .iter()
        .map(|t| {
            serde_json::to_value(TodoResponse::from(t))
                .map(|v| features.project(v))
                .map_err(ApiError::internal)
        })
        .collect::<Result<Vec<_>, ApiError>>()?;

    Ok(Json(json!({
        "status": "success",
        "results": items.len(),
        "data": { "todos": items }
    })))
}

#[instrument(skip(state, current))]
async fn list_todos(
    State(state): State<AppState>,
    current: CurrentUser,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    render_list(&state, &current.0, &params).await
}

/// Alias route: the five most urgent todos, whatever the caller asked for.
#[instrument(skip(state, current))]
async fn highest_priorities(
    State(state): State<AppState>,
    current: CurrentUser,
    Query(mut params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    params.insert("sort".to_string(), "-priority".to_string());
    params.insert("limit".to_string(), "5".to_string());
    params.insert("page".to_string(), "1".to_string());
    render_list(&state, &current.0, &params).await
}

#[instrument(skip(state, current))]
async fn get_todo(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_uuid("id", &id)?;
    let todo = Todo::find_by_id(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Todo with that ID is not found"))?;
    assert_owner(&todo, &current.0)?;

    Ok(Json(json!({
        "status": "success",
        "data": { "todo": TodoResponse::from(&todo) }
    })))
}

#[instrument(skip(state, current, payload))]
async fn create_todo(
    State(state): State<AppState>,
    current: CurrentUser,
    Payload(mut payload): Payload<CreateTodoRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    payload.validate()?;
    // Owner comes from the verified caller, never from the body.
    let todo = Todo::create(&state.db, current.0.id, &payload).await?;
    info!(todo_id = %todo.id, user_id = %current.0.id, "todo created");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "success",
            "data": { "todo": TodoResponse::from(&todo) }
        })),
    ))
}

#[instrument(skip(state, current, payload))]
async fn update_todo(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<String>,
    Payload(mut payload): Payload<UpdateTodoRequest>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_uuid("id", &id)?;
    let todo = Todo::find_by_id(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Todo with that ID is not found"))?;
    assert_owner(&todo, &current.0)?;

    payload.validate()?;
    let todo = Todo::update(&state.db, id, &payload)
        .await?
        .ok_or_else(|| ApiError::not_found("Todo with that ID is not found"))?;

    Ok(Json(json!({
        "status": "success",
        "data": { "todo": TodoResponse::from(&todo) }
    })))
}

#[instrument(skip(state, current))]
async fn delete_todo(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_uuid("id", &id)?;
    let todo = Todo::find_by_id(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Todo with that ID is not found"))?;
    assert_owner(&todo, &current.0)?;

    Todo::delete(&state.db, id).await?;
    info!(todo_id = %id, user_id = %current.0.id, "todo deleted");
    Ok(StatusCode::NO_CONTENT)
}
