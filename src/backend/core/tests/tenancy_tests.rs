//! Tenant provisioning and permission store tests against PostgreSQL.
//!
//! Set `STRATUM_TEST_DATABASE_URL` to run them; without it every test
//! returns early. Each test works in its own uniquely named tenant.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stratum_core::auth::{LoginService, TokenService};
use stratum_core::config::{DatabaseConfig, JwtConfig};
use stratum_core::db::{default_registry, Database, TenantDirectory, TenantLookup, TenantName, TenantRouter};
use stratum_core::error::ErrorCode;
use stratum_core::rbac::{
    AuthorizationService, NewUser, Page, PermissionChecker, PermissionId, PermissionStore,
    ProtectedGroups, UserDirectory, UserStatus, SYSTEM_PERMISSIONS,
};
use stratum_core::tenancy::{TenantBootstrapper, TenantSetup};

const DATABASE_URL_ENV: &str = "STRATUM_TEST_DATABASE_URL";

static NEXT_TENANT: AtomicU32 = AtomicU32::new(0);

struct Harness {
    router: TenantRouter,
    directory: TenantDirectory,
    store: Arc<PermissionStore>,
    bootstrapper: TenantBootstrapper,
}

async fn harness() -> Option<Harness> {
    let url = std::env::var(DATABASE_URL_ENV).ok()?;
    let config = DatabaseConfig {
        max_connections: 10,
        min_connections: 0,
        ..DatabaseConfig::default()
    };
    let db = Database::connect_url(&url, &config).await.unwrap();

    let router = TenantRouter::new(db.pool().clone(), Arc::new(default_registry().unwrap()));
    let directory = TenantDirectory::new(db.pool().clone());
    directory.ensure_table().await.unwrap();
    let store = Arc::new(PermissionStore::new(ProtectedGroups::system()));
    let bootstrapper = TenantBootstrapper::new(router.clone(), directory.clone(), store.clone());

    Some(Harness {
        router,
        directory,
        store,
        bootstrapper,
    })
}

/// A tenant name no other test (or earlier run) uses.
fn unique_tenant(label: &str) -> TenantName {
    let n = NEXT_TENANT.fetch_add(1, Ordering::Relaxed);
    let stamp = chrono::Utc::now().timestamp_micros();
    TenantName::parse(&format!("t_{label}_{}_{stamp}_{n}", std::process::id())).unwrap()
}

async fn setup(h: &Harness, label: &str) -> TenantSetup {
    let tenant = unique_tenant(label);
    h.bootstrapper.setup(&tenant).await.unwrap()
}

async fn permission_id(h: &Harness, tenant: &TenantName, name: &str) -> PermissionId {
    let mut conn = h.router.connection_for(tenant).await.unwrap();
    h.store.get_permission(&mut conn, name).await.unwrap().id
}

// ============================================================================
// Provisioning
// ============================================================================

#[tokio::test]
async fn test_provision_is_idempotent() {
    let Some(h) = harness().await else { return };
    let tenant = unique_tenant("idem");

    drop(h.router.provision(&tenant).await.unwrap());
    let conn = h.router.provision(&tenant).await.unwrap();
    assert_eq!(conn.tenant(), &tenant);
    drop(conn);

    let namespaces = h.router.list_namespaces().await.unwrap();
    assert_eq!(namespaces.iter().filter(|t| **t == tenant).count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_provisioning_succeeds() {
    let Some(h) = harness().await else { return };

    // Every round races eight first-time provisions of a fresh tenant.
    for round in 0..10 {
        let tenant = unique_tenant("race");
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let router = h.router.clone();
                let tenant = tenant.clone();
                tokio::spawn(async move { router.provision(&tenant).await.map(drop) })
            })
            .collect();

        for task in tasks {
            if let Err(e) = task.await.unwrap() {
                panic!("round {round}: provision failed: {e}");
            }
        }
        assert!(h.router.connection_for(&tenant).await.is_ok());
    }
}

#[tokio::test]
async fn test_unprovisioned_tenant_is_schema_missing() {
    let Some(h) = harness().await else { return };
    let tenant = unique_tenant("ghost");

    let err = h.router.connection_for(&tenant).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::SchemaMissing);
}

#[tokio::test]
async fn test_unknown_schema_creator_has_no_side_effects() {
    let Some(h) = harness().await else { return };
    let tenant = unique_tenant("creator");

    let mut conn = h.router.provision(&tenant).await.unwrap();
    let err = h
        .router
        .apply_schema_creators(&mut conn, &["users", "no_such_creator"])
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);

    let users_table: Option<String> = sqlx::query_scalar("SELECT to_regclass('users')::TEXT")
        .fetch_one(&mut *conn)
        .await
        .unwrap();
    assert!(users_table.is_none());
}

#[tokio::test]
async fn test_released_connection_is_unscoped() {
    let Some(h) = harness().await else { return };
    let tenant = unique_tenant("reset");

    drop(h.router.provision(&tenant).await.unwrap());

    // Grab every connection the pool has; none may still point at the tenant.
    let mut held = Vec::new();
    for _ in 0..3 {
        let mut conn = h.router.pool().acquire().await.unwrap();
        let path: String = sqlx::query_scalar("SHOW search_path")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert!(!path.contains(tenant.as_str()), "search_path leaked: {path}");
        held.push(conn);
    }
}

// ============================================================================
// Tenant Setup
// ============================================================================

#[tokio::test]
async fn test_setup_seeds_admin_with_all_system_permissions() {
    let Some(h) = harness().await else { return };
    let setup = setup(&h, "acme").await;

    assert_eq!(setup.admin_group.name, "admin");
    assert_eq!(setup.admin_group.permission_ids.len(), SYSTEM_PERMISSIONS.len());

    let mut conn = h.router.connection_for(&setup.tenant).await.unwrap();
    let permissions = h.store.list_permissions(&mut conn, Page::new(1, 100)).await.unwrap();
    let mut names: Vec<_> = permissions.iter().map(|p| p.name.as_str()).collect();
    names.sort_unstable();
    let mut expected = SYSTEM_PERMISSIONS.to_vec();
    expected.sort_unstable();
    assert_eq!(names, expected);
}

#[tokio::test]
async fn test_setup_is_repeatable() {
    let Some(h) = harness().await else { return };
    let first = setup(&h, "again").await;
    let second = h.bootstrapper.setup(&first.tenant).await.unwrap();

    assert_eq!(first.tenant_id, second.tenant_id);
    assert_eq!(first.admin_group.id, second.admin_group.id);
    assert_eq!(first.admin_group.updated_at, second.admin_group.updated_at);
    assert_eq!(second.admin_group.permission_ids.len(), SYSTEM_PERMISSIONS.len());
    assert_eq!(
        h.directory.tenant_id(&first.tenant).await.unwrap(),
        Some(first.tenant_id)
    );
}

#[tokio::test]
async fn test_initialize_all_covers_existing_namespaces() {
    let Some(h) = harness().await else { return };
    let tenant = unique_tenant("init");
    drop(h.router.provision(&tenant).await.unwrap());

    let report = h.bootstrapper.initialize_all().await.unwrap();
    assert!(report.succeeded.contains(&tenant));

    let mut conn = h.router.connection_for(&tenant).await.unwrap();
    let admin = h.store.search_groups(&mut conn, "admin", Page::new(1, 10)).await.unwrap();
    assert_eq!(admin.len(), 1);
    assert_eq!(admin[0].permission_ids.len(), SYSTEM_PERMISSIONS.len());
}

// ============================================================================
// Admin Invariant
// ============================================================================

#[tokio::test]
async fn test_set_permissions_keeps_admin_superset() {
    let Some(h) = harness().await else { return };
    let setup = setup(&h, "superset").await;
    let mut conn = h.router.connection_for(&setup.tenant).await.unwrap();

    let extra = h.store.create_permission(&mut conn, "report_view").await.unwrap();
    let group = h
        .store
        .set_group_permissions(&mut conn, setup.admin_group.id, &[extra.id])
        .await
        .unwrap();

    assert_eq!(group.permission_ids.len(), SYSTEM_PERMISSIONS.len() + 1);
    assert!(group.permission_ids.contains(&extra.id));

    let cleared = h
        .store
        .set_group_permissions(&mut conn, setup.admin_group.id, &[])
        .await
        .unwrap();
    assert_eq!(cleared.permission_ids.len(), SYSTEM_PERMISSIONS.len());
}

#[tokio::test]
async fn test_acme_admin_gets_every_system_permission() {
    let Some(h) = harness().await else { return };
    let tenant = unique_tenant("acme");

    let mut conn = h.router.provision(&tenant).await.unwrap();
    h.router
        .apply_schema_creators(&mut conn, &["users", "groups_permissions"])
        .await
        .unwrap();
    h.store.create_permission(&mut conn, "user_view").await.unwrap();
    let admin = h.store.create_group(&mut conn, "admin").await.unwrap();

    let admin = h.store.set_group_permissions(&mut conn, admin.id, &[]).await.unwrap();
    assert_eq!(admin.permission_ids.len(), 12);
}

#[tokio::test]
async fn test_custom_permission_can_be_deleted() {
    let Some(h) = harness().await else { return };
    let setup = setup(&h, "custom").await;
    let mut conn = h.router.connection_for(&setup.tenant).await.unwrap();

    let perm = h.store.create_permission(&mut conn, "invoice_view").await.unwrap();
    h.store.delete_permission(&mut conn, perm.id).await.unwrap();

    let err = h.store.get_permission(&mut conn, perm.id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn test_system_permission_cannot_be_deleted() {
    let Some(h) = harness().await else { return };
    let setup = setup(&h, "nodelete").await;
    let id = permission_id(&h, &setup.tenant, "user_view").await;

    let mut conn = h.router.connection_for(&setup.tenant).await.unwrap();
    let err = h.store.delete_permission(&mut conn, id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ProtectedResource);
    assert!(h.store.get_permission(&mut conn, id).await.is_ok());
}

#[tokio::test]
async fn test_system_permission_cannot_leave_admin() {
    let Some(h) = harness().await else { return };
    let setup = setup(&h, "noremove").await;
    let id = permission_id(&h, &setup.tenant, "group_delete").await;

    let mut conn = h.router.connection_for(&setup.tenant).await.unwrap();
    let err = h
        .store
        .remove_permission_from_group(&mut conn, setup.admin_group.id, id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ProtectedResource);

    let admin = h.store.get_group(&mut conn, setup.admin_group.id).await.unwrap();
    assert!(admin.permission_ids.contains(&id));
}

#[tokio::test]
async fn test_admin_group_cannot_be_deleted() {
    let Some(h) = harness().await else { return };
    let setup = setup(&h, "keepadmin").await;

    let mut conn = h.router.connection_for(&setup.tenant).await.unwrap();
    let err = h.store.delete_group(&mut conn, setup.admin_group.id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ProtectedResource);
}

// ============================================================================
// Group Permissions
// ============================================================================

#[tokio::test]
async fn test_grant_twice_is_already_granted() {
    let Some(h) = harness().await else { return };
    let setup = setup(&h, "grant").await;
    let mut conn = h.router.connection_for(&setup.tenant).await.unwrap();

    let editors = h.store.create_group(&mut conn, "editors").await.unwrap();
    let perm = h.store.create_permission(&mut conn, "report_edit").await.unwrap();

    h.store
        .add_permission_to_group(&mut conn, editors.id, perm.id)
        .await
        .unwrap();
    let err = h
        .store
        .add_permission_to_group(&mut conn, editors.id, perm.id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::AlreadyGranted);

    h.store
        .remove_permission_from_group(&mut conn, editors.id, perm.id)
        .await
        .unwrap();
    let err = h
        .store
        .remove_permission_from_group(&mut conn, editors.id, perm.id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn test_unknown_ids_are_not_found() {
    let Some(h) = harness().await else { return };
    let setup = setup(&h, "unknown").await;
    let mut conn = h.router.connection_for(&setup.tenant).await.unwrap();

    let editors = h.store.create_group(&mut conn, "editors").await.unwrap();
    let err = h
        .store
        .add_permission_to_group(&mut conn, editors.id, PermissionId(999_999))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);

    let err = h
        .store
        .set_group_permissions(&mut conn, editors.id, &[PermissionId(999_999)])
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn test_failed_set_keeps_previous_permissions() {
    let Some(h) = harness().await else { return };
    let setup = setup(&h, "rollback").await;
    let mut conn = h.router.connection_for(&setup.tenant).await.unwrap();

    let editors = h.store.create_group(&mut conn, "editors").await.unwrap();
    let perm = h.store.create_permission(&mut conn, "article_edit").await.unwrap();
    h.store
        .set_group_permissions(&mut conn, editors.id, &[perm.id])
        .await
        .unwrap();

    let err = h
        .store
        .set_group_permissions(&mut conn, editors.id, &[perm.id, PermissionId(999_999)])
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);

    let after = h.store.get_group(&mut conn, editors.id).await.unwrap();
    assert_eq!(after.permission_ids, vec![perm.id]);
}

#[tokio::test]
async fn test_search_groups_ignores_case() {
    let Some(h) = harness().await else { return };
    let setup = setup(&h, "search").await;
    let mut conn = h.router.connection_for(&setup.tenant).await.unwrap();

    h.store.create_group(&mut conn, "Editors").await.unwrap();
    h.store.create_group(&mut conn, "support").await.unwrap();

    let found = h.store.search_groups(&mut conn, "DIT", Page::new(1, 10)).await.unwrap();
    let names: Vec<_> = found.iter().map(|g| g.name.as_str()).collect();
    assert_eq!(names, vec!["Editors"]);

    let found = h.store.search_groups(&mut conn, "ADMIN", Page::new(1, 10)).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, setup.admin_group.id);
}

#[tokio::test]
async fn test_custom_permission_can_leave_admin() {
    let Some(h) = harness().await else { return };
    let setup = setup(&h, "leave").await;
    let mut conn = h.router.connection_for(&setup.tenant).await.unwrap();

    let extra = h.store.create_permission(&mut conn, "report_export").await.unwrap();
    h.store
        .add_permission_to_group(&mut conn, setup.admin_group.id, extra.id)
        .await
        .unwrap();
    h.store
        .remove_permission_from_group(&mut conn, setup.admin_group.id, extra.id)
        .await
        .unwrap();

    let admin = h.store.get_group(&mut conn, setup.admin_group.id).await.unwrap();
    assert!(!admin.permission_ids.contains(&extra.id));
    assert_eq!(admin.permission_ids.len(), SYSTEM_PERMISSIONS.len());
}

#[tokio::test]
async fn test_protected_names_cannot_be_renamed() {
    let Some(h) = harness().await else { return };
    let setup = setup(&h, "rename").await;
    let id = permission_id(&h, &setup.tenant, "user_view").await;
    let mut conn = h.router.connection_for(&setup.tenant).await.unwrap();

    let err = h.store.update_permission(&mut conn, id, "people_view").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ProtectedResource);
    assert_eq!(h.store.get_permission(&mut conn, id).await.unwrap().name, "user_view");

    let err = h
        .store
        .update_group(&mut conn, setup.admin_group.id, "superusers")
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ProtectedResource);

    let custom = h.store.create_permission(&mut conn, "invoice_view").await.unwrap();
    let renamed = h.store.update_permission(&mut conn, custom.id, "invoice_read").await.unwrap();
    assert_eq!(renamed.name, "invoice_read");

    let editors = h.store.create_group(&mut conn, "editors").await.unwrap();
    let renamed = h.store.update_group(&mut conn, editors.id, "writers").await.unwrap();
    assert_eq!(renamed.name, "writers");
}

#[tokio::test]
async fn test_failed_enforcement_discards_new_group() {
    let Some(h) = harness().await else { return };
    let setup = setup(&h, "atomic").await;
    let mut conn = h.router.connection_for(&setup.tenant).await.unwrap();

    // The required permission cannot be stored, so granting it fails.
    let strict = PermissionStore::new(ProtectedGroups::none().protect("vault", ["x".repeat(101)]));
    assert!(strict.create_group(&mut conn, "vault").await.is_err());

    let found = h.store.search_groups(&mut conn, "vault", Page::new(1, 10)).await.unwrap();
    assert!(found.is_empty());
}

#[tokio::test]
async fn test_duplicate_group_name_conflicts() {
    let Some(h) = harness().await else { return };
    let setup = setup(&h, "dupe").await;
    let mut conn = h.router.connection_for(&setup.tenant).await.unwrap();

    h.store.create_group(&mut conn, "support").await.unwrap();
    let err = h.store.create_group(&mut conn, "support").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Conflict);
}

// ============================================================================
// Authorization
// ============================================================================

fn new_user(username: &str) -> NewUser {
    NewUser {
        username: username.to_string(),
        email: format!("{username}@example.com"),
        password: "correct horse battery".to_string(),
        first_name: String::new(),
        last_name: String::new(),
    }
}

#[tokio::test]
async fn test_user_permissions_follow_group_membership() {
    let Some(h) = harness().await else { return };
    let setup = setup(&h, "authz").await;
    let users = UserDirectory::new();

    let mut conn = h.router.connection_for(&setup.tenant).await.unwrap();
    let alice = users.create_user(&mut conn, &new_user("alice")).await.unwrap();
    let bob = users.create_user(&mut conn, &new_user("bob")).await.unwrap();
    users
        .add_user_to_group(&mut conn, alice.id, setup.admin_group.id)
        .await
        .unwrap();
    drop(conn);

    let authz = AuthorizationService::new(h.router.clone(), h.store.clone());
    assert!(authz.user_has_permission(&setup.tenant, alice.id, "user_delete").await.unwrap());
    assert!(!authz.user_has_permission(&setup.tenant, bob.id, "user_delete").await.unwrap());
    assert!(!authz.user_has_permission(&setup.tenant, alice.id, "no_such_permission").await.unwrap());

    let names = vec!["group_view".to_string(), "group_update".to_string()];
    assert!(authz.require_all(&setup.tenant, alice.id, &names).await.is_ok());
    let err = authz.require_all(&setup.tenant, bob.id, &names).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Forbidden);

    let mut conn = h.router.connection_for(&setup.tenant).await.unwrap();
    users
        .remove_user_from_group(&mut conn, alice.id, setup.admin_group.id)
        .await
        .unwrap();
    let err = users
        .remove_user_from_group(&mut conn, alice.id, setup.admin_group.id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    drop(conn);

    assert!(!authz.user_has_permission(&setup.tenant, alice.id, "user_delete").await.unwrap());
}

#[tokio::test]
async fn test_change_password_checks_current_password() {
    let Some(h) = harness().await else { return };
    let setup = setup(&h, "passwd").await;
    let users = UserDirectory::new();

    let mut conn = h.router.connection_for(&setup.tenant).await.unwrap();
    let erin = users.create_user(&mut conn, &new_user("erin")).await.unwrap();

    let err = users
        .change_password(&mut conn, erin.id, "not my password", "brand new secret")
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Unauthorized);

    let err = users
        .change_password(&mut conn, erin.id, "correct horse battery", "short")
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    users
        .change_password(&mut conn, erin.id, "correct horse battery", "brand new secret")
        .await
        .unwrap();
    let stored = users.get_user(&mut conn, erin.id).await.unwrap();
    assert!(stratum_core::auth::verify_password("brand new secret", &stored.password_hash).unwrap());
}

#[tokio::test]
async fn test_login_issues_tokens_for_tenant() {
    let Some(h) = harness().await else { return };
    let setup = setup(&h, "login").await;
    let users = UserDirectory::new();

    let mut conn = h.router.connection_for(&setup.tenant).await.unwrap();
    let carol = users.create_user(&mut conn, &new_user("carol")).await.unwrap();
    let dave = users.create_user(&mut conn, &new_user("dave")).await.unwrap();
    users.set_status(&mut conn, dave.id, UserStatus::Inactive).await.unwrap();
    drop(conn);

    let tokens = Arc::new(
        TokenService::new(&JwtConfig {
            access_secret: "login-access-secret".to_string(),
            access_issuer: "stratum-access".to_string(),
            access_ttl: Duration::from_secs(900),
            refresh_secret: "login-refresh-secret".to_string(),
            refresh_issuer: "stratum-refresh".to_string(),
            refresh_ttl: Duration::from_secs(3600),
        })
        .unwrap(),
    );
    let login = LoginService::new(h.router.clone(), Arc::new(h.directory.clone()), tokens.clone());

    let pair = login
        .login(&setup.tenant, "carol", "correct horse battery")
        .await
        .unwrap();
    let claims = tokens.validate_access(&pair.access_token).unwrap();
    assert_eq!((claims.user_id, claims.tenant_id), (carol.id, setup.tenant_id));

    let err = login.login(&setup.tenant, "carol", "wrong password").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Unauthorized);

    let err = login.login(&setup.tenant, "nobody", "whatever123").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Unauthorized);

    let err = login
        .login(&setup.tenant, "dave", "correct horse battery")
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Forbidden);
}
