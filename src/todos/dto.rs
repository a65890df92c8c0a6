use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ApiError;
use crate::todos::repo::Todo;

const MAX_TITLE_LENGTH: usize = 60;
const MAX_DESCRIPTION_LENGTH: usize = 200;
const MIN_PRIORITY: i32 = 1;
const MAX_PRIORITY: i32 = 3;
const DEFAULT_PRIORITY: i32 = 1;

fn validate_title(raw: &str) -> Result<String, ApiError> {
    let title = raw.trim().to_string();
    if title.is_empty() {
        return Err(ApiError::validation("Title is required"));
    }
    if title.chars().count() > MAX_TITLE_LENGTH {
        return Err(ApiError::validation(format!(
            "Title cannot be more than {MAX_TITLE_LENGTH} characters"
        )));
    }
    Ok(title)
}

fn validate_description(raw: &str) -> Result<String, ApiError> {
    let description = raw.trim().to_string();
    if description.chars().count() > MAX_DESCRIPTION_LENGTH {
        return Err(ApiError::validation(format!(
            "Description cannot be more than {MAX_DESCRIPTION_LENGTH} characters"
        )));
    }
    Ok(description)
}

fn validate_priority(priority: i32) -> Result<i32, ApiError> {
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        return Err(ApiError::validation(format!(
            "Priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}"
        )));
    }
    Ok(priority)
}

/// Creation body. Owner and timestamps are never client input; unknown body
/// keys (including any attempted `created_by`) are dropped at deserialization.
#[derive(Debug, Deserialize)]
pub struct CreateTodoRequest {
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<i32>,
    pub completed: Option<bool>,
}

impl CreateTodoRequest {
    pub fn validate(&mut self) -> Result<(), ApiError> {
        self.title = validate_title(&self.title)?;
        if let Some(description) = &self.description {
            self.description = Some(validate_description(description)?);
        }
        self.priority = Some(validate_priority(self.priority.unwrap_or(DEFAULT_PRIORITY))?);
        Ok(())
    }
}

/// Partial update; only the mutable fields exist here.
#[derive(Debug, Deserialize)]
pub struct UpdateTodoRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<i32>,
    pub completed: Option<bool>,
}

impl UpdateTodoRequest {
    pub fn validate(&mut self) -> Result<(), ApiError> {
        if let Some(title) = &self.title {
            self.title = Some(validate_title(title)?);
        }
        if let Some(description) = &self.description {
            self.description = Some(validate_description(description)?);
        }
        if let Some(priority) = self.priority {
            validate_priority(priority)?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct TodoResponse {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub priority: i32,
    pub completed: bool,
    pub created_by: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<&Todo> for TodoResponse {
    fn from(todo: &Todo) -> Self {
        Self {
            id: todo.id,
            title: todo.title.clone(),
            description: todo.description.clone(),
            priority: todo.priority,
            completed: todo.completed,
            created_by: todo.created_by,
            created_at: todo.created_at,
        }
    }
}
