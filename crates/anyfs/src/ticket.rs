//! Credential tickets and scope reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The credentials held for one authenticated session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ticket {
    pub user_id: Option<String>,
    pub auth_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
    pub granted_scopes: Vec<String>,
    pub declined_scopes: Vec<String>,
    /// Opaque provider tag.
    pub tag: Option<String>,
}

impl Ticket {
    pub fn is_expired(&self) -> bool {
        matches!(self.expiration, Some(at) if at <= Utc::now())
    }

    pub fn has_auth_token(&self) -> bool {
        self.auth_token.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

/// Outcome of reconciling a ticket against a requested scope set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeCheck {
    /// Some requested scope is not among the granted scopes.
    pub needs_new: bool,
    /// Some requested scope was explicitly declined. A stronger signal:
    /// cannot be resolved by silent refresh, only by an explicit re-prompt
    /// that surfaces the denial.
    pub needs_denied: bool,
}

impl ScopeCheck {
    pub fn satisfied(&self) -> bool {
        !self.needs_new && !self.needs_denied
    }
}

/// Checks whether a ticket covers every requested scope and whether any
/// requested scope has been declined. The two flags are independent.
pub fn reconcile(ticket: &Ticket, scopes: &[String]) -> ScopeCheck {
    let needs_new = !scopes
        .iter()
        .all(|scope| ticket.granted_scopes.contains(scope));
    let needs_denied = scopes
        .iter()
        .any(|scope| ticket.declined_scopes.contains(scope));
    ScopeCheck {
        needs_new,
        needs_denied,
    }
}
