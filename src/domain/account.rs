//! ePA account routing

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of an account lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LookupCode {
    /// Record exists and the medication service is permitted
    Allowed,
    /// Record exists but the insurant objected
    Deny,
    /// No ePA host knows the insurant
    NotFound,
    /// The record is being moved between providers
    Conflict,
    /// The lookup itself failed
    Unknown,
}

impl fmt::Display for LookupCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LookupCode::Allowed => "allowed",
            LookupCode::Deny => "deny",
            LookupCode::NotFound => "notFound",
            LookupCode::Conflict => "conflict",
            LookupCode::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl LookupCode {
    /// True when an ePA host answered with a decision for the insurant
    pub fn reached_host(self) -> bool {
        matches!(self, LookupCode::Allowed | LookupCode::Deny | LookupCode::Conflict)
    }
}

/// Result of looking up where (and whether) a KVNR's record lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpaAccount {
    /// Lookup outcome
    pub code: LookupCode,
    /// ePA host that answered, empty for `NotFound` and `Unknown`
    pub host: String,
    /// Port of that host
    pub port: u16,
}

impl EpaAccount {
    /// A result with a resolved host
    pub fn routed(code: LookupCode, host: impl Into<String>, port: u16) -> Self {
        Self {
            code,
            host: host.into(),
            port,
        }
    }

    /// A result without a host
    pub fn unrouted(code: LookupCode) -> Self {
        Self {
            code,
            host: String::new(),
            port: 0,
        }
    }
}
