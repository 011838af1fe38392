//! Tenant identifiers and the PostgreSQL schema names derived from them.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, StratumError};

/// Name of the default/root tenant.
pub const PUBLIC_TENANT: &str = "public";

/// PostgreSQL identifiers are truncated past this many bytes.
const MAX_IDENTIFIER_LEN: usize = 63;

/// A validated tenant identifier. Doubles as the tenant's schema name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantName(String);

impl TenantName {
    /// Validate a tenant identifier.
    ///
    /// Accepts 1-63 bytes of `[a-z0-9_-]` starting with a letter. Names in
    /// the `pg_` prefix and `information_schema` are reserved by PostgreSQL.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() || raw.len() > MAX_IDENTIFIER_LEN {
            return Err(StratumError::invalid_argument(format!(
                "tenant identifier must be 1-{} characters",
                MAX_IDENTIFIER_LEN
            )));
        }

        let mut chars = raw.chars();
        if !chars.next().is_some_and(|c| c.is_ascii_lowercase()) {
            return Err(StratumError::invalid_argument(
                "tenant identifier must start with a lowercase letter",
            ));
        }
        if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-') {
            return Err(StratumError::invalid_argument(
                "tenant identifier may only contain lowercase letters, digits, '_' and '-'",
            ));
        }

        if raw.starts_with("pg_") || raw == "information_schema" {
            return Err(StratumError::invalid_argument(format!(
                "tenant identifier is reserved: {}",
                raw
            )));
        }

        Ok(Self(raw.to_string()))
    }

    /// The root tenant.
    pub fn public() -> Self {
        Self(PUBLIC_TENANT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_public(&self) -> bool {
        self.0 == PUBLIC_TENANT
    }

    /// The schema name as a double-quoted SQL identifier.
    ///
    /// Identifiers cannot be bound as parameters, so DDL and `SET search_path`
    /// interpolate this. The character set accepted by [`TenantName::parse`]
    /// contains no quotes, which keeps the interpolation safe.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for TenantName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TenantName {
    type Error = StratumError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<TenantName> for String {
    fn from(value: TenantName) -> Self {
        value.0
    }
}

impl std::str::FromStr for TenantName {
    type Err = StratumError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
