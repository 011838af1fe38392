//! Minimal tenant-local user directory: accounts, status and group membership.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::{FromRow, PgConnection};
use tracing::info;

use super::models::{GroupId, User, UserId, UserStatus};
use crate::auth::password;
use crate::error::{is_unique_violation, Result, StratumError};

const USER_SELECT: &str = r#"
    SELECT u.id,
           u.username,
           u.email,
           u.password_hash,
           u.first_name,
           u.last_name,
           u.status,
           COALESCE(
               ARRAY_AGG(ug.group_id ORDER BY ug.group_id)
                   FILTER (WHERE ug.group_id IS NOT NULL),
               '{}'::INT[]
           ) AS group_ids,
           u.created_at,
           u.updated_at
    FROM users u
    LEFT JOIN user_groups ug ON ug.user_id = u.id
"#;

#[derive(FromRow)]
struct UserRow {
    id: i32,
    username: String,
    email: String,
    password_hash: String,
    first_name: String,
    last_name: String,
    status: String,
    group_ids: Vec<i32>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = StratumError;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(Self {
            id: UserId(row.id),
            username: row.username,
            email: row.email,
            password_hash: row.password_hash,
            first_name: row.first_name,
            last_name: row.last_name,
            status: row.status.parse()?,
            group_ids: row.group_ids.into_iter().map(GroupId).collect(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Input for [`UserDirectory::create_user`].
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

/// User accounts inside one tenant schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserDirectory;

impl UserDirectory {
    pub fn new() -> Self {
        Self
    }

    /// Create an active user with an Argon2-hashed password.
    pub async fn create_user(&self, conn: &mut PgConnection, new_user: &NewUser) -> Result<User> {
        let username = new_user.username.trim();
        if username.is_empty() {
            return Err(StratumError::invalid_argument("username must not be empty"));
        }
        if !new_user.email.contains('@') {
            return Err(StratumError::invalid_argument("email address is not valid"));
        }
        let password_hash = password::hash_password(&new_user.password)?;

        let id: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO users (username, email, password_hash, first_name, last_name)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(username)
        .bind(new_user.email.trim())
        .bind(password_hash)
        .bind(&new_user.first_name)
        .bind(&new_user.last_name)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StratumError::conflict("user", username).with_source(e)
            } else {
                e.into()
            }
        })?;

        info!(user_id = id, "User created");
        self.get_user(&mut *conn, UserId(id)).await
    }

    pub async fn get_user(&self, conn: &mut PgConnection, id: UserId) -> Result<User> {
        let sql = format!("{USER_SELECT} WHERE u.id = $1 GROUP BY u.id");
        sqlx::query_as::<_, UserRow>(&sql)
            .bind(id.0)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| StratumError::not_found("user", id))?
            .try_into()
    }

    pub async fn find_by_username(&self, conn: &mut PgConnection, username: &str) -> Result<Option<User>> {
        let sql = format!("{USER_SELECT} WHERE u.username = $1 GROUP BY u.id");
        sqlx::query_as::<_, UserRow>(&sql)
            .bind(username)
            .fetch_optional(&mut *conn)
            .await?
            .map(User::try_from)
            .transpose()
    }

    /// Transition a user's status. There is no hard delete.
    pub async fn set_status(&self, conn: &mut PgConnection, id: UserId, status: UserStatus) -> Result<User> {
        let updated = sqlx::query("UPDATE users SET status = $2 WHERE id = $1")
            .bind(id.0)
            .bind(status.as_str())
            .execute(&mut *conn)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(StratumError::not_found("user", id));
        }

        info!(user_id = id.0, status = %status, "User status changed");
        self.get_user(&mut *conn, id).await
    }

    /// Replace a user's password after checking the current one.
    ///
    /// # Errors
    ///
    /// `Unauthorized` when `current` does not match, `InvalidArgument` when
    /// the new password is too short.
    pub async fn change_password(
        &self,
        conn: &mut PgConnection,
        id: UserId,
        current: &str,
        new_password: &str,
    ) -> Result<()> {
        let user = self.get_user(&mut *conn, id).await?;
        if !password::verify_password(current, &user.password_hash)? {
            return Err(StratumError::unauthorized("Current password is incorrect"));
        }
        let password_hash = password::hash_password(new_password)?;

        sqlx::query("UPDATE users SET password_hash = $2 WHERE id = $1")
            .bind(id.0)
            .bind(password_hash)
            .execute(&mut *conn)
            .await?;

        info!(user_id = id.0, "Password changed");
        Ok(())
    }

    /// Add a user to a group. Adding an existing membership is a no-op.
    pub async fn add_user_to_group(&self, conn: &mut PgConnection, user: UserId, group: GroupId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_groups (user_id, group_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(user.0)
        .bind(group.0)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            // The foreign key names the missing side.
            let missing = match &e {
                sqlx::Error::Database(db) => db.constraint().map(str::to_owned),
                _ => None,
            };
            match missing.as_deref() {
                Some(c) if c.contains("user_id") => StratumError::not_found("user", user).with_source(e),
                Some(c) if c.contains("group_id") => StratumError::not_found("group", group).with_source(e),
                _ => e.into(),
            }
        })?;
        Ok(())
    }

    pub async fn remove_user_from_group(&self, conn: &mut PgConnection, user: UserId, group: GroupId) -> Result<()> {
        let removed = sqlx::query("DELETE FROM user_groups WHERE user_id = $1 AND group_id = $2")
            .bind(user.0)
            .bind(group.0)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        if removed == 0 {
            return Err(StratumError::not_found(
                "group membership",
                format!("{}/{}", user, group),
            ));
        }
        Ok(())
    }
}
