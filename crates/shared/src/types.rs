//! Platform-wide types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Platform role carried in the identity provider's token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Creator,
    Subscriber,
    /// Anonymous or unrecognised caller
    Visitor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Creator => "creator",
            Role::Subscriber => "subscriber",
            Role::Visitor => "visitor",
        }
    }

    /// Resolve the role claim from a token, falling back to `Visitor`
    /// for missing or unknown values.
    pub fn from_claim(claim: Option<&str>) -> Self {
        claim
            .and_then(|value| value.parse().ok())
            .unwrap_or(Role::Visitor)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct ParseRoleError(pub String);

impl FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "creator" => Ok(Role::Creator),
            "subscriber" => Ok(Role::Subscriber),
            "visitor" => Ok(Role::Visitor),
            other => Err(ParseRoleError(other.to_string())),
        }
    }
}
