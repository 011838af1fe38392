//! Table definitions provisioned into every tenant schema.
//!
//! Statements run unqualified: the router has already pointed the
//! connection's `search_path` at the tenant schema, so tables, foreign keys
//! and the `touch_updated_at()` trigger function all resolve there.

use async_trait::async_trait;
use sqlx::{Executor, PgConnection};

use super::registry::{SchemaCreator, SchemaRegistry};
use crate::error::{ErrorContext, Result};

/// Capability name of the users table.
pub const USERS: &str = "users";

/// Capability name of the groups, permissions and membership tables.
pub const GROUPS_PERMISSIONS: &str = "groups_permissions";

/// Name of the per-schema helper used by `updated_at` triggers.
pub const TOUCH_UPDATED_AT_FN: &str = "touch_updated_at";

/// The helper routine, created inside `schema` (an already-quoted identifier).
///
/// Plain `CREATE`: callers check `pg_proc` first, and a session that
/// loses the first-create race gets a duplicate error it can retry.
pub(crate) fn touch_updated_at_ddl(schema: &str) -> String {
    format!(
        r#"
        CREATE FUNCTION {schema}.{TOUCH_UPDATED_AT_FN}()
        RETURNS TRIGGER AS $$
        BEGIN
            NEW.updated_at = NOW();
            RETURN NEW;
        END;
        $$ LANGUAGE plpgsql
        "#
    )
}

const USERS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id            SERIAL PRIMARY KEY,
    username      VARCHAR(64)  NOT NULL UNIQUE,
    email         VARCHAR(255) NOT NULL UNIQUE,
    password_hash TEXT         NOT NULL,
    first_name    VARCHAR(100) NOT NULL DEFAULT '',
    last_name     VARCHAR(100) NOT NULL DEFAULT '',
    status        VARCHAR(16)  NOT NULL DEFAULT 'active'
                  CHECK (status IN ('active', 'inactive', 'suspended')),
    created_at    TIMESTAMPTZ  NOT NULL DEFAULT NOW(),
    updated_at    TIMESTAMPTZ  NOT NULL DEFAULT NOW()
);

DROP TRIGGER IF EXISTS users_touch_updated_at ON users;
CREATE TRIGGER users_touch_updated_at
    BEFORE UPDATE ON users
    FOR EACH ROW EXECUTE FUNCTION touch_updated_at();
"#;

// user_groups references users, so the users capability must be applied first.
const GROUPS_PERMISSIONS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS permissions (
    id         SERIAL PRIMARY KEY,
    name       VARCHAR(100) NOT NULL UNIQUE,
    created_at TIMESTAMPTZ  NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS groups (
    id         SERIAL PRIMARY KEY,
    name       VARCHAR(100) NOT NULL UNIQUE,
    created_at TIMESTAMPTZ  NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ  NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS group_permissions (
    group_id      INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
    permission_id INTEGER NOT NULL REFERENCES permissions(id) ON DELETE CASCADE,
    PRIMARY KEY (group_id, permission_id)
);

CREATE INDEX IF NOT EXISTS idx_group_permissions_permission_id
    ON group_permissions (permission_id);

CREATE TABLE IF NOT EXISTS user_groups (
    user_id  INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
    PRIMARY KEY (user_id, group_id)
);

CREATE INDEX IF NOT EXISTS idx_user_groups_group_id
    ON user_groups (group_id);

DROP TRIGGER IF EXISTS groups_touch_updated_at ON groups;
CREATE TRIGGER groups_touch_updated_at
    BEFORE UPDATE ON groups
    FOR EACH ROW EXECUTE FUNCTION touch_updated_at();
"#;

/// Creates the `users` table.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsersSchema;

#[async_trait]
impl SchemaCreator for UsersSchema {
    async fn create(&self, conn: &mut PgConnection) -> Result<()> {
        conn.execute(USERS_DDL)
            .await
            .context("Failed to create users table")?;
        Ok(())
    }
}

/// Creates `permissions`, `groups`, `group_permissions` and `user_groups`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupsPermissionsSchema;

#[async_trait]
impl SchemaCreator for GroupsPermissionsSchema {
    async fn create(&self, conn: &mut PgConnection) -> Result<()> {
        conn.execute(GROUPS_PERMISSIONS_DDL)
            .await
            .context("Failed to create groups and permissions tables")?;
        Ok(())
    }
}

/// The registry every binary starts with.
pub fn default_registry() -> Result<SchemaRegistry> {
    Ok(SchemaRegistry::builder()
        .register_schema_creator(USERS, UsersSchema)?
        .register_schema_creator(GROUPS_PERMISSIONS, GroupsPermissionsSchema)?
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_contents() {
        let registry = default_registry().unwrap();
        assert!(registry.contains(USERS));
        assert!(registry.contains(GROUPS_PERMISSIONS));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_triggers_fire_before_update() {
        for ddl in [USERS_DDL, GROUPS_PERMISSIONS_DDL] {
            assert!(ddl.contains("BEFORE UPDATE"));
            assert!(!ddl.contains("AFTER UPDATE"));
        }
    }

    #[test]
    fn test_touch_updated_at_is_schema_qualified() {
        let ddl = touch_updated_at_ddl("\"acme\"");
        assert!(ddl.contains("\"acme\".touch_updated_at()"));
        assert!(ddl.contains("CREATE FUNCTION"));
        assert!(!ddl.contains("OR REPLACE"));
    }
}
