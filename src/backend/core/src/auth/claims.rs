//! Identity claims carried by access and refresh tokens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::db::TenantId;
use crate::rbac::UserId;

/// Which of the two token families a token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Claims shared by both token kinds. Tokens never carry permission data;
/// authorization always goes back to the tenant's schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    #[serde(rename = "userID")]
    pub user_id: UserId,

    #[serde(rename = "tenantID")]
    pub tenant_id: TenantId,

    /// Issuer
    pub iss: String,

    /// Issued at (Unix seconds)
    pub iat: i64,

    /// Expiration (Unix seconds)
    pub exp: i64,

    /// Not before (Unix seconds)
    pub nbf: i64,
}

impl IdentityClaims {
    /// Claims valid from `now` for `ttl`.
    pub fn new(
        user_id: UserId,
        tenant_id: TenantId,
        issuer: impl Into<String>,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        let iat = now.timestamp();
        Self {
            user_id,
            tenant_id,
            iss: issuer.into(),
            iat,
            exp: (now + ttl).timestamp(),
            nbf: iat,
        }
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.iat, 0).unwrap_or_default()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or_default()
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.nbf, 0).unwrap_or_default()
    }

    /// Seconds from iat to exp.
    pub fn lifetime_secs(&self) -> i64 {
        self.exp - self.iat
    }
}
