//! Access and refresh token issuance and validation.
//!
//! Both token kinds are HS256 JWTs carrying [`IdentityClaims`]. They are
//! signed with disjoint secrets and stamped with disjoint issuers, so a
//! refresh token never validates as an access token and vice versa.
//! Validation is pure: no clock leeway, no revocation list, no I/O.

use chrono::Utc;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

use super::claims::{IdentityClaims, TokenKind};
use crate::config::JwtConfig;
use crate::db::TenantId;
use crate::error::{ErrorCode, Result, StratumError};
use crate::rbac::UserId;
use crate::telemetry::{AuthMetrics, TokenMetrics};

/// The only accepted signing algorithm.
pub const TOKEN_ALGORITHM: Algorithm = Algorithm::HS256;

// ═══════════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Why a token failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("Token has expired")]
    Expired,

    #[error("Token is not valid yet")]
    NotYetValid,

    #[error("Token signature is invalid")]
    BadSignature,

    #[error("Token was issued by an unexpected issuer")]
    WrongIssuer,

    #[error("Token is malformed: {0}")]
    Malformed(String),
}

impl TokenError {
    /// Label used for the auth failure counter.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::NotYetValid => "not_yet_valid",
            Self::BadSignature => "bad_signature",
            Self::WrongIssuer => "wrong_issuer",
            Self::Malformed(_) => "malformed",
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Expired => ErrorCode::TokenExpired,
            Self::NotYetValid => ErrorCode::TokenNotYetValid,
            Self::BadSignature => ErrorCode::BadSignature,
            Self::WrongIssuer => ErrorCode::WrongIssuer,
            Self::Malformed(_) => ErrorCode::MalformedToken,
        }
    }
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        match e.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::ImmatureSignature => Self::NotYetValid,
            ErrorKind::InvalidSignature => Self::BadSignature,
            ErrorKind::InvalidIssuer => Self::WrongIssuer,
            _ => Self::Malformed(e.to_string()),
        }
    }
}

impl From<TokenError> for StratumError {
    fn from(e: TokenError) -> Self {
        let message = match &e {
            TokenError::Malformed(_) => "Token is malformed".to_string(),
            other => other.to_string(),
        };
        StratumError::new(e.code(), message).with_source(e)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Token Pair
// ═══════════════════════════════════════════════════════════════════════════════

/// Tokens returned on login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
}

/// A freshly minted access token, returned by [`TokenService::refresh`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Token Service
// ═══════════════════════════════════════════════════════════════════════════════

/// Signing material and validation rules for one token kind.
#[derive(Clone)]
struct TokenKeys {
    kind: TokenKind,
    issuer: String,
    ttl: Duration,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenKeys {
    fn new(kind: TokenKind, secret: &str, issuer: &str, ttl: Duration) -> Self {
        let mut validation = Validation::new(TOKEN_ALGORITHM);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["exp", "nbf", "iss"]);

        Self {
            kind,
            issuer: issuer.to_string(),
            ttl,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    fn sign(&self, user_id: UserId, tenant_id: TenantId) -> Result<String> {
        let ttl = chrono::Duration::from_std(self.ttl).map_err(|e| {
            StratumError::new(ErrorCode::SigningFailure, "Failed to sign token").with_source(e)
        })?;
        let claims = IdentityClaims::new(user_id, tenant_id, &self.issuer, Utc::now(), ttl);

        let token = encode(&Header::new(TOKEN_ALGORITHM), &claims, &self.encoding_key).map_err(|e| {
            error!(kind = %self.kind, error = %e, "Token signing failed");
            StratumError::new(ErrorCode::SigningFailure, "Failed to sign token").with_source(e)
        })?;

        TokenMetrics::issued(self.kind.as_str());
        Ok(token)
    }

    fn verify(&self, token: &str) -> std::result::Result<IdentityClaims, TokenError> {
        match decode::<IdentityClaims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => {
                let err = TokenError::from(e);
                debug!(kind = %self.kind, reason = err.reason(), "Token rejected");
                AuthMetrics::failure(err.reason());
                Err(err)
            }
        }
    }
}

/// Issues and validates access and refresh tokens.
#[derive(Clone)]
pub struct TokenService {
    access: TokenKeys,
    refresh: TokenKeys,
}

impl fmt::Debug for TokenService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenService")
            .field("access_issuer", &self.access.issuer)
            .field("access_ttl", &self.access.ttl)
            .field("refresh_issuer", &self.refresh.issuer)
            .field("refresh_ttl", &self.refresh.ttl)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    /// Build from configuration. Coinciding secrets or issuers, empty secrets
    /// and zero lifetimes are rejected.
    pub fn new(config: &JwtConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            access: TokenKeys::new(
                TokenKind::Access,
                &config.access_secret,
                &config.access_issuer,
                config.access_ttl,
            ),
            refresh: TokenKeys::new(
                TokenKind::Refresh,
                &config.refresh_secret,
                &config.refresh_issuer,
                config.refresh_ttl,
            ),
        })
    }

    fn keys(&self, kind: TokenKind) -> &TokenKeys {
        match kind {
            TokenKind::Access => &self.access,
            TokenKind::Refresh => &self.refresh,
        }
    }

    /// Sign a single token of the given kind.
    pub fn issue(&self, kind: TokenKind, user_id: UserId, tenant_id: TenantId) -> Result<String> {
        self.keys(kind).sign(user_id, tenant_id)
    }

    /// Sign an access and a refresh token for the same identity.
    pub fn issue_tokens(&self, user_id: UserId, tenant_id: TenantId) -> Result<TokenPair> {
        let access_token = self.access.sign(user_id, tenant_id)?;
        let refresh_token = self.refresh.sign(user_id, tenant_id)?;
        debug!(user_id = user_id.0, tenant_id = tenant_id.0, "Token pair issued");

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.access.ttl.as_secs(),
        })
    }

    /// Validate a token of the given kind.
    pub fn validate(&self, kind: TokenKind, token: &str) -> std::result::Result<IdentityClaims, TokenError> {
        self.keys(kind).verify(token)
    }

    pub fn validate_access(&self, token: &str) -> std::result::Result<IdentityClaims, TokenError> {
        self.access.verify(token)
    }

    pub fn validate_refresh(&self, token: &str) -> std::result::Result<IdentityClaims, TokenError> {
        self.refresh.verify(token)
    }

    /// Exchange a valid refresh token for a new access token. The refresh
    /// token itself is not rotated.
    pub fn refresh(&self, refresh_token: &str) -> Result<AccessToken> {
        let claims = self.validate_refresh(refresh_token).map_err(|e| {
            StratumError::invalid_refresh("Refresh token is invalid")
                .with_internal_message(e.to_string())
                .with_source(e)
        })?;

        Ok(AccessToken {
            access_token: self.access.sign(claims.user_id, claims.tenant_id)?,
            token_type: "Bearer".to_string(),
            expires_in: self.access.ttl.as_secs(),
        })
    }

    /// Check a refresh token presented at logout against the session that
    /// presents it.
    pub fn verify_logout(&self, refresh_token: &str, user_id: UserId, tenant_id: TenantId) -> Result<()> {
        let claims = self.validate_refresh(refresh_token).map_err(|e| {
            StratumError::invalid_refresh("Refresh token is invalid")
                .with_internal_message(e.to_string())
                .with_source(e)
        })?;
        if claims.user_id != user_id || claims.tenant_id != tenant_id {
            return Err(StratumError::invalid_refresh("Refresh token belongs to another session"));
        }
        Ok(())
    }

    pub fn access_ttl(&self) -> Duration {
        self.access.ttl
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh.ttl
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> JwtConfig {
        JwtConfig {
            access_secret: "access-secret-for-tests".to_string(),
            access_issuer: "stratum-access".to_string(),
            access_ttl: Duration::from_secs(900),
            refresh_secret: "refresh-secret-for-tests".to_string(),
            refresh_issuer: "stratum-refresh".to_string(),
            refresh_ttl: Duration::from_secs(3600),
        }
    }

    fn service() -> TokenService {
        TokenService::new(&config()).unwrap()
    }

    #[test]
    fn test_access_round_trip() {
        let svc = service();
        let pair = svc.issue_tokens(UserId(42), TenantId(5)).unwrap();
        assert_eq!(pair.token_type, "Bearer");
        assert_eq!(pair.expires_in, 900);

        let claims = svc.validate_access(&pair.access_token).unwrap();
        assert_eq!(claims.user_id, UserId(42));
        assert_eq!(claims.tenant_id, TenantId(5));
        assert_eq!(claims.iss, "stratum-access");
    }

    #[test]
    fn test_tokens_are_not_interchangeable() {
        let svc = service();
        let pair = svc.issue_tokens(UserId(1), TenantId(1)).unwrap();
        assert_eq!(
            svc.validate_access(&pair.refresh_token).unwrap_err(),
            TokenError::BadSignature
        );
        assert_eq!(
            svc.validate_refresh(&pair.access_token).unwrap_err(),
            TokenError::BadSignature
        );
    }

    #[test]
    fn test_wrong_issuer_with_shared_secret() {
        let mut other = config();
        other.access_issuer = "someone-else".to_string();
        let foreign = TokenService::new(&other).unwrap();
        let token = foreign.issue(TokenKind::Access, UserId(1), TenantId(1)).unwrap();

        assert_eq!(service().validate_access(&token).unwrap_err(), TokenError::WrongIssuer);
    }

    #[test]
    fn test_expired_token() {
        let keys = &service().access;
        let now = Utc::now();
        let claims = IdentityClaims {
            user_id: UserId(1),
            tenant_id: TenantId(1),
            iss: "stratum-access".to_string(),
            iat: now.timestamp() - 120,
            exp: now.timestamp() - 60,
            nbf: now.timestamp() - 120,
        };
        let token = encode(&Header::new(TOKEN_ALGORITHM), &claims, &keys.encoding_key).unwrap();
        assert_eq!(keys.verify(&token).unwrap_err(), TokenError::Expired);
    }

    #[test]
    fn test_not_yet_valid_token() {
        let keys = &service().access;
        let now = Utc::now();
        let claims = IdentityClaims {
            user_id: UserId(1),
            tenant_id: TenantId(1),
            iss: "stratum-access".to_string(),
            iat: now.timestamp(),
            exp: now.timestamp() + 600,
            nbf: now.timestamp() + 300,
        };
        let token = encode(&Header::new(TOKEN_ALGORITHM), &claims, &keys.encoding_key).unwrap();
        assert_eq!(keys.verify(&token).unwrap_err(), TokenError::NotYetValid);
    }

    #[test]
    fn test_other_algorithm_is_malformed() {
        let keys = &service().access;
        let claims = IdentityClaims::new(
            UserId(1),
            TenantId(1),
            "stratum-access",
            Utc::now(),
            chrono::Duration::minutes(5),
        );
        let token = encode(&Header::new(Algorithm::HS512), &claims, &keys.encoding_key).unwrap();
        assert!(matches!(keys.verify(&token), Err(TokenError::Malformed(_))));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            service().validate_access("not-a-jwt"),
            Err(TokenError::Malformed(_))
        ));
    }

    #[test]
    fn test_refresh_issues_access_token() {
        let svc = service();
        let pair = svc.issue_tokens(UserId(9), TenantId(2)).unwrap();
        let refreshed = svc.refresh(&pair.refresh_token).unwrap();
        let claims = svc.validate_access(&refreshed.access_token).unwrap();
        assert_eq!(claims.user_id, UserId(9));
        assert_eq!(claims.tenant_id, TenantId(2));
    }

    #[test]
    fn test_refresh_rejects_access_token() {
        let svc = service();
        let pair = svc.issue_tokens(UserId(9), TenantId(2)).unwrap();
        let err = svc.refresh(&pair.access_token).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRefresh);
    }

    #[test]
    fn test_logout_accepts_own_refresh_token() {
        let svc = service();
        let pair = svc.issue_tokens(UserId(9), TenantId(2)).unwrap();
        assert!(svc.verify_logout(&pair.refresh_token, UserId(9), TenantId(2)).is_ok());
    }

    #[test]
    fn test_logout_rejects_foreign_or_wrong_kind() {
        let svc = service();
        let pair = svc.issue_tokens(UserId(9), TenantId(2)).unwrap();

        let err = svc.verify_logout(&pair.refresh_token, UserId(10), TenantId(2)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRefresh);
        let err = svc.verify_logout(&pair.refresh_token, UserId(9), TenantId(3)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRefresh);
        let err = svc.verify_logout(&pair.access_token, UserId(9), TenantId(2)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRefresh);
    }

    #[test]
    fn test_rejects_shared_secret_config() {
        let mut cfg = config();
        cfg.refresh_secret = cfg.access_secret.clone();
        let err = TokenService::new(&cfg).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
    }

    #[test]
    fn test_token_error_maps_to_error_code() {
        let err: StratumError = TokenError::Expired.into();
        assert_eq!(err.code(), ErrorCode::TokenExpired);
        assert_eq!(err.http_status(), axum::http::StatusCode::UNAUTHORIZED);

        let err: StratumError = TokenError::Malformed("bad base64".into()).into();
        assert_eq!(err.code(), ErrorCode::MalformedToken);
        assert_eq!(err.user_message(), "Token is malformed");
    }
}
