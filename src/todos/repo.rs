use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::query::{Column, QueryFeatures};
use crate::todos::dto::{CreateTodoRequest, UpdateTodoRequest};

/// Filterable/sortable columns exposed to the query feature builder. The
/// owner column is absent on purpose: list queries are always scoped to the
/// caller by the handler.
pub const TODO_FILTER_COLUMNS: [Column; 5] = [
    Column::text("title"),
    Column::text("description"),
    Column::int("priority"),
    Column::boolean("completed"),
    Column::timestamp("created_at"),
];

const TODO_SELECT: &str =
    "SELECT id, title, description, priority, completed, created_by, created_at FROM todos";

#[derive(Debug, Clone, FromRow)]
pub struct Todo {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub priority: i32,
    pub completed: bool,
    pub created_by: Uuid,
    pub created_at: OffsetDateTime,
}

impl Todo {
    pub async fn create(
        db: &PgPool,
        owner: Uuid,
        req: &CreateTodoRequest,
    ) -> Result<Todo, sqlx::Error> {
        sqlx::query_as::<_, Todo>(
            r#"
            INSERT INTO todos (title, description, priority, completed, created_by)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, title, description, priority, completed, created_by, created_at
            "#,
        )
        .bind(&req.title)
        .bind(&req.description)
        .bind(req.priority.unwrap_or(1))
        .bind(req.completed.unwrap_or(false))
        .bind(owner)
        .fetch_one(db)
        .await
    }

    pub async fn find_by_id(db: &PgPool, id: Uuid) -> Result<Option<Todo>, sqlx::Error> {
        sqlx::query_as::<_, Todo>(&format!("{TODO_SELECT} WHERE id = $1"))
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn list_for_owner(
        db: &PgPool,
        owner: Uuid,
        features: &QueryFeatures,
    ) -> Result<Vec<Todo>, sqlx::Error> {
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("{TODO_SELECT} WHERE created_by = "));
        qb.push_bind(owner);
        features.push_conditions(&mut qb);
        features.push_order_by(&mut qb);
        features.push_pagination(&mut qb);
        qb.build_query_as::<Todo>().fetch_all(db).await
    }

    /// Partial update of the mutable fields; owner and creation time are
    /// immutable by construction.
    pub async fn update(
        db: &PgPool,
        id: Uuid,
        req: &UpdateTodoRequest,
    ) -> Result<Option<Todo>, sqlx::Error> {
        sqlx::query_as::<_, Todo>(
            r#"
            UPDATE todos
            SET title = COALESCE($2, title),
                description = COALESCE($3, description),
                priority = COALESCE($4, priority),
                completed = COALESCE($5, completed)
            WHERE id = $1
            RETURNING id, title, description, priority, completed, created_by, created_at
            "#,
        )
        .bind(id)
        .bind(&req.title)
        .bind(&req.description)
        .bind(req.priority)
        .bind(req.completed)
        .fetch_optional(db)
        .await
    }

    pub async fn delete(db: &PgPool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM todos WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;
        Ok(result.rows_affected())
    }
}
