//! Integration tests for access/refresh token issuance and validation.
//!
//! Tests cover:
//! - Round trip of identity through both token kinds
//! - Access and refresh tokens never validating as each other
//! - Expiry with zero leeway
//! - Refresh exchange

use std::time::Duration;

use stratum_core::auth::{TokenError, TokenKind, TokenService};
use stratum_core::config::JwtConfig;
use stratum_core::db::TenantId;
use stratum_core::error::ErrorCode;
use stratum_core::rbac::UserId;

fn jwt_config(access_ttl: Duration) -> JwtConfig {
    JwtConfig {
        access_secret: "integration-access-secret".to_string(),
        access_issuer: "stratum-access".to_string(),
        access_ttl,
        refresh_secret: "integration-refresh-secret".to_string(),
        refresh_issuer: "stratum-refresh".to_string(),
        refresh_ttl: Duration::from_secs(7 * 24 * 3600),
    }
}

fn service() -> TokenService {
    TokenService::new(&jwt_config(Duration::from_secs(900))).unwrap()
}

// ============================================================================
// Round Trip
// ============================================================================

#[test]
fn test_access_and_refresh_carry_identity() {
    let tokens = service();
    let pair = tokens.issue_tokens(UserId(11), TenantId(4)).unwrap();

    let access = tokens.validate_access(&pair.access_token).unwrap();
    assert_eq!((access.user_id, access.tenant_id), (UserId(11), TenantId(4)));
    assert_eq!(access.iss, "stratum-access");

    let refresh = tokens.validate_refresh(&pair.refresh_token).unwrap();
    assert_eq!((refresh.user_id, refresh.tenant_id), (UserId(11), TenantId(4)));
    assert_eq!(refresh.iss, "stratum-refresh");
    assert!(refresh.exp > access.exp);
}

#[test]
fn test_generic_validate_matches_kind_specific() {
    let tokens = service();
    let pair = tokens.issue_tokens(UserId(1), TenantId(1)).unwrap();

    assert!(tokens.validate(TokenKind::Access, &pair.access_token).is_ok());
    assert!(tokens.validate(TokenKind::Refresh, &pair.refresh_token).is_ok());
    assert!(tokens.validate(TokenKind::Access, &pair.refresh_token).is_err());
}

// ============================================================================
// Non Cross-Use
// ============================================================================

#[test]
fn test_refresh_token_is_not_an_access_token() {
    let tokens = service();
    let pair = tokens.issue_tokens(UserId(2), TenantId(2)).unwrap();

    assert_eq!(
        tokens.validate_access(&pair.refresh_token).unwrap_err(),
        TokenError::BadSignature
    );
    assert_eq!(
        tokens.validate_refresh(&pair.access_token).unwrap_err(),
        TokenError::BadSignature
    );
}

#[test]
fn test_refresh_with_access_token_is_invalid_refresh() {
    let tokens = service();
    let pair = tokens.issue_tokens(UserId(2), TenantId(2)).unwrap();

    let err = tokens.refresh(&pair.access_token).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidRefresh);
    assert_eq!(err.http_status(), axum::http::StatusCode::UNAUTHORIZED);
}

#[test]
fn test_tampered_token_fails_signature() {
    let tokens = service();
    let pair = tokens.issue_tokens(UserId(3), TenantId(3)).unwrap();

    let forged_sig = "A".repeat(43);
    let mut parts: Vec<&str> = pair.access_token.split('.').collect();
    parts[2] = &forged_sig;
    let forged = parts.join(".");

    assert_eq!(tokens.validate_access(&forged).unwrap_err(), TokenError::BadSignature);
}

// ============================================================================
// Expiry
// ============================================================================

#[tokio::test]
async fn test_one_second_token_expires() {
    let tokens = TokenService::new(&jwt_config(Duration::from_secs(1))).unwrap();
    let pair = tokens.issue_tokens(UserId(5), TenantId(5)).unwrap();
    assert!(tokens.validate_access(&pair.access_token).is_ok());

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(
        tokens.validate_access(&pair.access_token).unwrap_err(),
        TokenError::Expired
    );
    // The refresh token outlives the access token.
    assert!(tokens.validate_refresh(&pair.refresh_token).is_ok());
}

// ============================================================================
// Refresh
// ============================================================================

#[test]
fn test_refresh_mints_access_for_same_identity() {
    let tokens = service();
    let pair = tokens.issue_tokens(UserId(8), TenantId(6)).unwrap();

    let refreshed = tokens.refresh(&pair.refresh_token).unwrap();
    assert_eq!(refreshed.token_type, "Bearer");
    assert_eq!(refreshed.expires_in, 900);

    let claims = tokens.validate_access(&refreshed.access_token).unwrap();
    assert_eq!((claims.user_id, claims.tenant_id), (UserId(8), TenantId(6)));
}

#[test]
fn test_configuration_with_shared_issuer_is_rejected() {
    let mut cfg = jwt_config(Duration::from_secs(60));
    cfg.refresh_issuer = cfg.access_issuer.clone();
    assert_eq!(
        TokenService::new(&cfg).unwrap_err().code(),
        ErrorCode::ConfigurationError
    );
}
