use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::query::{Column, QueryFeatures};

/// Filterable/sortable columns exposed to the query feature builder.
pub const USER_FILTER_COLUMNS: [Column; 5] = [
    Column::text("name"),
    Column::text("email"),
    Column::enumerated("role"),
    Column::boolean("is_active"),
    Column::timestamp("created_at"),
];

const USER_SELECT: &str = "SELECT id, name, email, password_hash, role, is_active, \
     password_changed_at, password_reset_token, password_reset_expires, created_at FROM users";

const SET_PASSWORD_SQL: &str = r#"
    UPDATE users
    SET password_hash = $2,
        password_changed_at = now(),
        password_reset_token = NULL,
        password_reset_expires = NULL
    WHERE id = $1
    RETURNING id, name, email, password_hash, role, is_active,
              password_changed_at, password_reset_token, password_reset_expires, created_at
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "user_role", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub is_active: bool,
    pub password_changed_at: Option<OffsetDateTime>,
    pub password_reset_token: Option<String>,
    pub password_reset_expires: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl User {
    /// True iff the password changed strictly after the given issued-at time.
    /// A token minted in the same second as the change stays valid.
    pub fn password_changed_after(&self, iat_secs: i64) -> bool {
        self.password_changed_at
            .map(|t| t.unix_timestamp() > iat_secs)
            .unwrap_or(false)
    }

    pub async fn create(
        db: &PgPool,
        name: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<User, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (name, email, password_hash)
            VALUES ($1, $2, $3)
            RETURNING id, name, email, password_hash, role, is_active,
                      password_changed_at, password_reset_token, password_reset_expires, created_at
            "#,
        )
        .bind(name)
        .bind(email)
        .bind(password_hash)
        .fetch_one(db)
        .await
    }

    /// Default read path: soft-deleted accounts are invisible.
    pub async fn find_active_by_id(db: &PgPool, id: Uuid) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(&format!("{USER_SELECT} WHERE id = $1 AND is_active = TRUE"))
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn find_active_by_email(
        db: &PgPool,
        email: &str,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(&format!(
            "{USER_SELECT} WHERE email = $1 AND is_active = TRUE"
        ))
        .bind(email)
        .fetch_optional(db)
        .await
    }

    /// Unfiltered lookup for administrators; sees soft-deleted accounts.
    pub async fn find_by_id(db: &PgPool, id: Uuid) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(&format!("{USER_SELECT} WHERE id = $1"))
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn list(db: &PgPool, features: &QueryFeatures) -> Result<Vec<User>, sqlx::Error> {
        let mut qb = Self::list_query(features);
        qb.build_query_as::<User>().fetch_all(db).await
    }

    /// Default scope hides deactivated accounts; an explicit `is_active`
    /// filter replaces the scope so admins can list them.
    fn list_query(features: &QueryFeatures) -> QueryBuilder<'static, Postgres> {
        let base = if features.has_filter("is_active") {
            format!("{USER_SELECT} WHERE TRUE")
        } else {
            format!("{USER_SELECT} WHERE is_active = TRUE")
        };
        let mut qb: QueryBuilder<'static, Postgres> = QueryBuilder::new(base);
        features.push_conditions(&mut qb);
        features.push_order_by(&mut qb);
        features.push_pagination(&mut qb);
        qb
    }

    pub async fn update_profile(
        db: &PgPool,
        id: Uuid,
        name: Option<&str>,
        email: Option<&str>,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET name = COALESCE($2, name), email = COALESCE($3, email)
            WHERE id = $1 AND is_active = TRUE
            RETURNING id, name, email, password_hash, role, is_active,
                      password_changed_at, password_reset_token, password_reset_expires, created_at
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(email)
        .fetch_optional(db)
        .await
    }

    pub async fn admin_update(
        db: &PgPool,
        id: Uuid,
        name: Option<&str>,
        email: Option<&str>,
        role: Option<Role>,
        is_active: Option<bool>,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET name = COALESCE($2, name),
                email = COALESCE($3, email),
                role = COALESCE($4, role),
                is_active = COALESCE($5, is_active)
            WHERE id = $1
            RETURNING id, name, email, password_hash, role, is_active,
                      password_changed_at, password_reset_token, password_reset_expires, created_at
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(email)
        .bind(role)
        .bind(is_active)
        .fetch_optional(db)
        .await
    }

    /// Rotates the credential: records the change time and burns any
    /// outstanding reset token, so a used reset link cannot be replayed.
    pub async fn set_password(
        db: &PgPool,
        id: Uuid,
        password_hash: &str,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(SET_PASSWORD_SQL)
            .bind(id)
            .bind(password_hash)
            .fetch_optional(db)
            .await
    }

    pub async fn set_reset_token(
        db: &PgPool,
        id: Uuid,
        digest: &str,
        expires: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE users SET password_reset_token = $2, password_reset_expires = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(digest)
        .bind(expires)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn clear_reset_token(db: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE users SET password_reset_token = NULL, password_reset_expires = NULL \
             WHERE id = $1",
        )
        .bind(id)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Resolves a reset secret digest inside its validity window.
    pub async fn find_by_reset_digest(
        db: &PgPool,
        digest: &str,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(&format!(
            "{USER_SELECT} WHERE password_reset_token = $1 AND password_reset_expires > now()"
        ))
        .bind(digest)
        .fetch_optional(db)
        .await
    }

    /// Soft delete: the account disappears from default reads.
    pub async fn deactivate(db: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE users SET is_active = FALSE WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;
        Ok(())
    }

    pub async fn delete(db: &PgPool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn user_changed_at(changed: Option<OffsetDateTime>) -> User {
        User {
            id: Uuid::new_v4(),
            name: "A".into(),
            email: "a@b.com".into(),
            password_hash: "hash".into(),
            role: Role::User,
            is_active: true,
            password_changed_at: changed,
            password_reset_token: None,
            password_reset_expires: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn never_changed_password_is_never_stale() {
        let user = user_changed_at(None);
        assert!(!user.password_changed_after(0));
        assert!(!user.password_changed_after(OffsetDateTime::now_utc().unix_timestamp()));
    }

    #[test]
    fn token_issued_before_change_is_stale() {
        let now = OffsetDateTime::now_utc();
        let user = user_changed_at(Some(now));
        let issued_earlier = (now - Duration::hours(1)).unix_timestamp();
        assert!(user.password_changed_after(issued_earlier));
    }

    #[test]
    fn token_issued_after_change_is_fresh() {
        let now = OffsetDateTime::now_utc();
        let user = user_changed_at(Some(now - Duration::hours(1)));
        assert!(!user.password_changed_after(now.unix_timestamp()));
    }

    #[test]
    fn comparison_is_strict_at_the_boundary() {
        let now = OffsetDateTime::now_utc();
        let user = user_changed_at(Some(now));
        assert!(!user.password_changed_after(now.unix_timestamp()));
    }

    #[test]
    fn password_rotation_burns_reset_token() {
        // A second reset with the same link must fail: once the password
        // changes, the stored digest and expiry are gone.
        assert!(SET_PASSWORD_SQL.contains("password_reset_token = NULL"));
        assert!(SET_PASSWORD_SQL.contains("password_reset_expires = NULL"));
        assert!(SET_PASSWORD_SQL.contains("password_changed_at = now()"));
    }

    fn list_params(pairs: &[(&str, &str)]) -> QueryFeatures {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        QueryFeatures::from_params(&map, &USER_FILTER_COLUMNS).expect("params should parse")
    }

    #[test]
    fn list_defaults_to_active_accounts() {
        let mut qb = User::list_query(&list_params(&[]));
        assert!(qb.sql().contains("WHERE is_active = TRUE"));
    }

    #[test]
    fn explicit_is_active_filter_overrides_default_scope() {
        let mut qb = User::list_query(&list_params(&[("is_active", "false")]));
        let sql = qb.sql().to_string();
        assert!(sql.contains("WHERE TRUE"));
        assert!(!sql.contains("is_active = TRUE"));
        assert!(sql.contains("AND \"is_active\" = $1"));
    }
}
