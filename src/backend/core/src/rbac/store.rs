//! Permission store: permissions, groups and the group↔permission relation
//! inside one tenant schema.
//!
//! Every operation takes a caller-supplied connection whose `search_path`
//! already points at the tenant (a [`crate::db::TenantConnection`] derefs to
//! one). After any mutation touching a group's permissions the store runs
//! [`PermissionStore::enforce_invariants`], which re-attaches whatever the
//! [`ProtectedGroups`] policy requires.

use chrono::{DateTime, Utc};
use sqlx::{Connection, FromRow, PgConnection};
use std::collections::BTreeSet;
use tracing::{debug, instrument};

use super::models::{Group, GroupId, Page, Permission, PermissionId, PermissionRef, UserId};
use super::system::ProtectedGroups;
use crate::error::{is_unique_violation, Result, StratumError};

/// Column width of `permissions.name` and `groups.name`.
const MAX_NAME_LEN: usize = 100;

const GROUP_SELECT: &str = r#"
    SELECT g.id,
           g.name,
           COALESCE(
               ARRAY_AGG(gp.permission_id ORDER BY gp.permission_id)
                   FILTER (WHERE gp.permission_id IS NOT NULL),
               '{}'::INT[]
           ) AS permission_ids,
           g.created_at,
           g.updated_at
    FROM groups g
    LEFT JOIN group_permissions gp ON gp.group_id = g.id
"#;

#[derive(FromRow)]
struct GroupRow {
    id: i32,
    name: String,
    permission_ids: Vec<i32>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<GroupRow> for Group {
    fn from(row: GroupRow) -> Self {
        Self {
            id: GroupId(row.id),
            name: row.name,
            permission_ids: row.permission_ids.into_iter().map(PermissionId).collect(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// CRUD over permissions and groups, guarded by a [`ProtectedGroups`] policy.
#[derive(Debug, Clone, Default)]
pub struct PermissionStore {
    policy: ProtectedGroups,
}

impl PermissionStore {
    pub fn new(policy: ProtectedGroups) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ProtectedGroups {
        &self.policy
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Permissions
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn create_permission(&self, conn: &mut PgConnection, name: &str) -> Result<Permission> {
        let name = validate_name("permission", name)?;
        sqlx::query_as::<_, Permission>(
            "INSERT INTO permissions (name) VALUES ($1) RETURNING id, name, created_at",
        )
        .bind(name)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| unique_conflict(e, "permission", name))
    }

    pub async fn get_permission(
        &self,
        conn: &mut PgConnection,
        permission: impl Into<PermissionRef>,
    ) -> Result<Permission> {
        let permission = permission.into();
        let row = match &permission {
            PermissionRef::Id(id) => {
                sqlx::query_as::<_, Permission>(
                    "SELECT id, name, created_at FROM permissions WHERE id = $1",
                )
                .bind(id.0)
                .fetch_optional(&mut *conn)
                .await?
            }
            PermissionRef::Name(name) => {
                sqlx::query_as::<_, Permission>(
                    "SELECT id, name, created_at FROM permissions WHERE name = $1",
                )
                .bind(name)
                .fetch_optional(&mut *conn)
                .await?
            }
        };
        row.ok_or_else(|| StratumError::not_found("permission", permission))
    }

    /// Rename a permission. Permissions required by a protected group keep
    /// their name.
    pub async fn update_permission(
        &self,
        conn: &mut PgConnection,
        id: PermissionId,
        name: &str,
    ) -> Result<Permission> {
        let name = validate_name("permission", name)?;
        let current = self.get_permission(&mut *conn, id).await?;
        if current.name == name {
            return Ok(current);
        }
        if self.policy.is_protected_permission(&current.name) {
            return Err(StratumError::protected(format!(
                "Cannot rename system permission '{}'",
                current.name
            )));
        }

        sqlx::query_as::<_, Permission>(
            "UPDATE permissions SET name = $2 WHERE id = $1 RETURNING id, name, created_at",
        )
        .bind(id.0)
        .bind(name)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| unique_conflict(e, "permission", name))
    }

    /// Delete a permission; it is detached from every group by cascade.
    ///
    /// # Errors
    ///
    /// `ProtectedResource` for system permissions, whichever groups hold them.
    pub async fn delete_permission(&self, conn: &mut PgConnection, id: PermissionId) -> Result<()> {
        let current = self.get_permission(&mut *conn, id).await?;
        if self.policy.is_protected_permission(&current.name) {
            return Err(StratumError::protected(format!(
                "Cannot delete system permission '{}'",
                current.name
            ))
            .with_context("permission_id", id.0));
        }

        sqlx::query("DELETE FROM permissions WHERE id = $1")
            .bind(id.0)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn list_permissions(&self, conn: &mut PgConnection, page: Page) -> Result<Vec<Permission>> {
        let rows = sqlx::query_as::<_, Permission>(
            "SELECT id, name, created_at FROM permissions ORDER BY id LIMIT $1 OFFSET $2",
        )
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows)
    }

    /// Insert any of `names` that do not exist yet.
    pub async fn ensure_permissions(&self, conn: &mut PgConnection, names: &[&str]) -> Result<()> {
        sqlx::query(
            "INSERT INTO permissions (name) SELECT UNNEST($1::TEXT[]) ON CONFLICT (name) DO NOTHING",
        )
        .bind(names)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Groups
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a group. A protected group starts out holding its required
    /// permissions; the insert and the grants commit together.
    pub async fn create_group(&self, conn: &mut PgConnection, name: &str) -> Result<Group> {
        let name = validate_name("group", name)?;
        let mut tx = conn.begin().await?;
        let id: i32 = sqlx::query_scalar("INSERT INTO groups (name) VALUES ($1) RETURNING id")
            .bind(name)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| unique_conflict(e, "group", name))?;

        self.enforce_invariants(&mut *tx, GroupId(id), name).await?;
        tx.commit().await?;
        self.get_group(&mut *conn, GroupId(id)).await
    }

    /// Return the group named `name`, creating it if absent. An existing
    /// group row is left untouched.
    pub async fn ensure_group(&self, conn: &mut PgConnection, name: &str) -> Result<Group> {
        let name = validate_name("group", name)?;
        let mut tx = conn.begin().await?;
        sqlx::query("INSERT INTO groups (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        let id: i32 = sqlx::query_scalar("SELECT id FROM groups WHERE name = $1")
            .bind(name)
            .fetch_one(&mut *tx)
            .await?;

        self.enforce_invariants(&mut *tx, GroupId(id), name).await?;
        tx.commit().await?;
        self.get_group(&mut *conn, GroupId(id)).await
    }

    pub async fn get_group(&self, conn: &mut PgConnection, id: GroupId) -> Result<Group> {
        let sql = format!("{GROUP_SELECT} WHERE g.id = $1 GROUP BY g.id");
        sqlx::query_as::<_, GroupRow>(&sql)
            .bind(id.0)
            .fetch_optional(&mut *conn)
            .await?
            .map(Group::from)
            .ok_or_else(|| StratumError::not_found("group", id))
    }

    /// Rename a group. Protected groups cannot be renamed.
    pub async fn update_group(&self, conn: &mut PgConnection, id: GroupId, name: &str) -> Result<Group> {
        let name = validate_name("group", name)?;
        let current = self.get_group(&mut *conn, id).await?;
        if current.name == name {
            return Ok(current);
        }
        if self.policy.is_protected(&current.name) {
            return Err(StratumError::protected(format!(
                "Cannot rename protected group '{}'",
                current.name
            )));
        }

        let mut tx = conn.begin().await?;
        sqlx::query("UPDATE groups SET name = $2 WHERE id = $1")
            .bind(id.0)
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(|e| unique_conflict(e, "group", name))?;

        // Renaming onto a protected name makes this the protected group.
        self.enforce_invariants(&mut *tx, id, name).await?;
        tx.commit().await?;
        self.get_group(&mut *conn, id).await
    }

    /// Delete a group. Protected groups cannot be deleted.
    pub async fn delete_group(&self, conn: &mut PgConnection, id: GroupId) -> Result<()> {
        let current = self.get_group(&mut *conn, id).await?;
        if self.policy.is_protected(&current.name) {
            return Err(StratumError::protected(format!(
                "Cannot delete protected group '{}'",
                current.name
            )));
        }

        sqlx::query("DELETE FROM groups WHERE id = $1")
            .bind(id.0)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Groups with their permission ids, aggregated in one grouped query.
    pub async fn list_groups(&self, conn: &mut PgConnection, page: Page) -> Result<Vec<Group>> {
        let sql = format!("{GROUP_SELECT} GROUP BY g.id ORDER BY g.id LIMIT $1 OFFSET $2");
        let rows = sqlx::query_as::<_, GroupRow>(&sql)
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&mut *conn)
            .await?;
        Ok(rows.into_iter().map(Group::from).collect())
    }

    /// Case-insensitive substring search on group names.
    pub async fn search_groups(
        &self,
        conn: &mut PgConnection,
        query: &str,
        page: Page,
    ) -> Result<Vec<Group>> {
        let pattern = format!("%{}%", escape_like(query));
        let sql = format!(
            "{GROUP_SELECT} WHERE g.name ILIKE $1 ESCAPE '\\' GROUP BY g.id ORDER BY g.id LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query_as::<_, GroupRow>(&sql)
            .bind(pattern)
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&mut *conn)
            .await?;
        Ok(rows.into_iter().map(Group::from).collect())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Group permissions
    // ─────────────────────────────────────────────────────────────────────────

    /// The permissions attached to one group.
    pub async fn group_permissions(&self, conn: &mut PgConnection, group: GroupId) -> Result<Vec<Permission>> {
        ensure_group_exists(&mut *conn, group).await?;
        let rows = sqlx::query_as::<_, Permission>(
            r#"
            SELECT p.id, p.name, p.created_at
            FROM permissions p
            JOIN group_permissions gp ON gp.permission_id = p.id
            WHERE gp.group_id = $1
            ORDER BY p.id
            "#,
        )
        .bind(group.0)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows)
    }

    /// # Errors
    ///
    /// `NotFound` when either side is missing, `AlreadyGranted` when the pair
    /// already exists.
    #[instrument(skip(self, conn))]
    pub async fn add_permission_to_group(
        &self,
        conn: &mut PgConnection,
        group: GroupId,
        permission: PermissionId,
    ) -> Result<()> {
        let target = self.get_group(&mut *conn, group).await?;
        self.get_permission(&mut *conn, permission).await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO group_permissions (group_id, permission_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(group.0)
        .bind(permission.0)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(StratumError::already_granted(group.0, permission.0));
        }

        self.enforce_invariants(&mut *conn, group, &target.name).await
    }

    /// # Errors
    ///
    /// `ProtectedResource` when the policy requires the group to hold the
    /// permission, `NotFound` when the pair does not exist.
    #[instrument(skip(self, conn))]
    pub async fn remove_permission_from_group(
        &self,
        conn: &mut PgConnection,
        group: GroupId,
        permission: PermissionId,
    ) -> Result<()> {
        let target = self.get_group(&mut *conn, group).await?;
        let perm = self.get_permission(&mut *conn, permission).await?;

        if self.policy.requires(&target.name, &perm.name) {
            return Err(StratumError::protected(format!(
                "Cannot remove system permission '{}' from group '{}'",
                perm.name, target.name
            )));
        }

        let removed = sqlx::query(
            "DELETE FROM group_permissions WHERE group_id = $1 AND permission_id = $2",
        )
        .bind(group.0)
        .bind(permission.0)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if removed == 0 {
            return Err(StratumError::not_found(
                "group permission",
                format!("{}/{}", group, permission),
            ));
        }

        self.enforce_invariants(&mut *conn, group, &target.name).await
    }

    /// Replace a group's permissions in one transaction.
    ///
    /// For a protected group the result is the union of `permission_ids` and
    /// the permissions the policy requires. Unknown ids fail with `NotFound`
    /// and leave the previous set untouched.
    #[instrument(skip(self, conn, permission_ids), fields(requested = permission_ids.len()))]
    pub async fn set_group_permissions(
        &self,
        conn: &mut PgConnection,
        group: GroupId,
        permission_ids: &[PermissionId],
    ) -> Result<Group> {
        let ids: Vec<i32> = permission_ids
            .iter()
            .map(|id| id.0)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut tx = conn.begin().await?;

        let name: String = sqlx::query_scalar("SELECT name FROM groups WHERE id = $1 FOR UPDATE")
            .bind(group.0)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StratumError::not_found("group", group))?;

        let known: Vec<i32> = sqlx::query_scalar("SELECT id FROM permissions WHERE id = ANY($1)")
            .bind(&ids)
            .fetch_all(&mut *tx)
            .await?;
        if let Some(missing) = ids.iter().find(|id| !known.contains(id)) {
            return Err(StratumError::not_found("permission", missing));
        }

        sqlx::query("DELETE FROM group_permissions WHERE group_id = $1")
            .bind(group.0)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO group_permissions (group_id, permission_id)
            SELECT $1, UNNEST($2::INT[])
            "#,
        )
        .bind(group.0)
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        self.enforce_invariants(&mut *tx, group, &name).await?;
        tx.commit().await?;

        self.get_group(&mut *conn, group).await
    }

    /// Re-attach everything the policy requires `group` to hold, creating
    /// missing required permissions by name. No-op for unprotected groups.
    pub async fn enforce_invariants(&self, conn: &mut PgConnection, group: GroupId, name: &str) -> Result<()> {
        if !self.policy.is_protected(name) {
            return Ok(());
        }
        let required = self.policy.required_for(name);

        self.ensure_permissions(&mut *conn, &required).await?;
        let attached = sqlx::query(
            r#"
            INSERT INTO group_permissions (group_id, permission_id)
            SELECT $1, id FROM permissions WHERE name = ANY($2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(group.0)
        .bind(&required)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if attached > 0 {
            debug!(group = %name, attached, "Restored required permissions on protected group");
        }
        Ok(())
    }

    /// Enforce the policy on every protected group present in the schema.
    pub async fn enforce_all(&self, conn: &mut PgConnection) -> Result<()> {
        let protected: Vec<&str> = self.policy.groups().collect();
        let groups: Vec<(i32, String)> =
            sqlx::query_as("SELECT id, name FROM groups WHERE name = ANY($1)")
                .bind(&protected)
                .fetch_all(&mut *conn)
                .await?;

        for (id, name) in groups {
            self.enforce_invariants(&mut *conn, GroupId(id), &name).await?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Checks
    // ─────────────────────────────────────────────────────────────────────────

    /// Whether any group the user belongs to holds the permission.
    pub async fn user_has_permission(
        &self,
        conn: &mut PgConnection,
        user: UserId,
        permission: impl Into<PermissionRef>,
    ) -> Result<bool> {
        let allowed: bool = match permission.into() {
            PermissionRef::Id(id) => {
                sqlx::query_scalar(
                    r#"
                    SELECT EXISTS (
                        SELECT 1
                        FROM user_groups ug
                        JOIN group_permissions gp ON gp.group_id = ug.group_id
                        WHERE ug.user_id = $1 AND gp.permission_id = $2
                    )
                    "#,
                )
                .bind(user.0)
                .bind(id.0)
                .fetch_one(&mut *conn)
                .await?
            }
            PermissionRef::Name(name) => {
                sqlx::query_scalar(
                    r#"
                    SELECT EXISTS (
                        SELECT 1
                        FROM user_groups ug
                        JOIN group_permissions gp ON gp.group_id = ug.group_id
                        JOIN permissions p ON p.id = gp.permission_id
                        WHERE ug.user_id = $1 AND p.name = $2
                    )
                    "#,
                )
                .bind(user.0)
                .bind(name)
                .fetch_one(&mut *conn)
                .await?
            }
        };
        Ok(allowed)
    }
}

async fn ensure_group_exists(conn: &mut PgConnection, group: GroupId) -> Result<()> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM groups WHERE id = $1)")
        .bind(group.0)
        .fetch_one(conn)
        .await?;
    if exists {
        Ok(())
    } else {
        Err(StratumError::not_found("group", group))
    }
}

fn validate_name<'a>(entity: &str, name: &'a str) -> Result<&'a str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StratumError::invalid_argument(format!(
            "{} name must not be empty",
            entity
        )));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(StratumError::invalid_argument(format!(
            "{} name must be at most {} characters",
            entity, MAX_NAME_LEN
        )));
    }
    Ok(name)
}

fn unique_conflict(error: sqlx::Error, entity: &str, name: &str) -> StratumError {
    if is_unique_violation(&error) {
        StratumError::conflict(entity, name).with_source(error)
    } else {
        error.into()
    }
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
