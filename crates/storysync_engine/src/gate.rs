//! Safety gate for write and destructive invocations.
//!
//! The gate runs before the cursor lock is taken and before any upstream or
//! destination call. Writes need the operator to type an acknowledgment
//! phrase; destructive operations need a stronger phrase and, by default, a
//! narrowed scope.

use crate::error::{SyncError, SyncResult};
use crate::transport::{Filters, IterationFilter};
use tracing::{info, warn};

/// Acknowledgment required for additive writes.
pub const WRITE_ACK: &str = "write to destination";

/// Acknowledgment required for destructive operations.
pub const DESTRUCTIVE_ACK: &str = "archive destination documents";

/// How dangerous an invocation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperationClass {
    /// Reads only. Dry runs fall here.
    ReadOnly,
    /// Creates or updates documents.
    AdditiveWrite,
    /// Archives documents or discards sync state.
    Destructive,
}

impl std::fmt::Display for OperationClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OperationClass::ReadOnly => "read-only",
            OperationClass::AdditiveWrite => "additive-write",
            OperationClass::Destructive => "destructive",
        })
    }
}

/// What an invocation is restricted to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    narrowed_by: Vec<String>,
}

impl Scope {
    /// A scope covering everything.
    pub fn unscoped() -> Self {
        Self::default()
    }

    /// Derives the scope from a run's filters.
    pub fn from_filters(filters: &Filters) -> Self {
        let mut narrowed_by = Vec::new();
        if !filters.ids.is_empty() {
            narrowed_by.push(format!("ids={}", filters.ids.len()));
        }
        if !filters.owners.is_empty() {
            narrowed_by.push(format!("owner={}", filters.owners.join(",")));
        }
        match &filters.iteration {
            IterationFilter::Any => {}
            IterationFilter::Current => narrowed_by.push("iteration=current".into()),
            IterationFilter::Id(id) => narrowed_by.push(format!("iteration={id}")),
        }
        Self { narrowed_by }
    }

    /// Returns true if the scope is narrower than everything.
    pub fn is_narrowed(&self) -> bool {
        !self.narrowed_by.is_empty()
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.narrowed_by.is_empty() {
            f.write_str("all records")
        } else {
            f.write_str(&self.narrowed_by.join(" "))
        }
    }
}

/// Gate verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Proceed.
    Allow,
    /// Refuse, with the reason shown to the operator.
    Deny(String),
}

impl GateDecision {
    /// Converts a denial into [`SyncError::GateDenied`].
    pub fn into_result(self) -> SyncResult<()> {
        match self {
            GateDecision::Allow => Ok(()),
            GateDecision::Deny(reason) => Err(SyncError::GateDenied(reason)),
        }
    }
}

/// Evaluates invocations against acknowledgment tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyGate {
    allow_unscoped: bool,
}

impl SafetyGate {
    /// Creates a gate that requires destructive operations to be scoped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows destructive operations over all records.
    pub fn allow_unscoped(mut self, allow: bool) -> Self {
        self.allow_unscoped = allow;
        self
    }

    /// Checks one invocation.
    pub fn check(&self, class: OperationClass, scope: &Scope, ack: Option<&str>) -> GateDecision {
        let decision = self.evaluate(class, scope, ack.map(str::trim));
        match &decision {
            GateDecision::Allow => info!(%class, %scope, "safety gate passed"),
            GateDecision::Deny(reason) => warn!(%class, %scope, %reason, "safety gate denied"),
        }
        decision
    }

    fn evaluate(&self, class: OperationClass, scope: &Scope, ack: Option<&str>) -> GateDecision {
        let required = match class {
            OperationClass::ReadOnly => return GateDecision::Allow,
            OperationClass::AdditiveWrite => WRITE_ACK,
            OperationClass::Destructive => DESTRUCTIVE_ACK,
        };

        match ack {
            None | Some("") => {
                return GateDecision::Deny(format!(
                    "{class} operation requires --ack \"{required}\""
                ))
            }
            Some(given) if given != required => {
                return GateDecision::Deny(format!(
                    "acknowledgment does not match; {class} operation requires \"{required}\""
                ))
            }
            Some(_) => {}
        }

        if class == OperationClass::Destructive && !scope.is_narrowed() && !self.allow_unscoped {
            return GateDecision::Deny(
                "destructive operation over all records; narrow by owner or iteration, \
                 or allow unscoped operations explicitly"
                    .into(),
            );
        }
        GateDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scoped() -> Scope {
        Scope::from_filters(&Filters::new().with_owners("alice"))
    }

    #[test]
    fn read_only_is_always_allowed() {
        let gate = SafetyGate::new();
        assert_eq!(
            gate.check(OperationClass::ReadOnly, &Scope::unscoped(), None),
            GateDecision::Allow
        );
    }

    #[test]
    fn writes_need_the_exact_phrase() {
        let gate = SafetyGate::new();
        let scope = Scope::unscoped();
        assert!(matches!(
            gate.check(OperationClass::AdditiveWrite, &scope, None),
            GateDecision::Deny(_)
        ));
        assert!(matches!(
            gate.check(OperationClass::AdditiveWrite, &scope, Some("yes")),
            GateDecision::Deny(_)
        ));
        assert_eq!(
            gate.check(OperationClass::AdditiveWrite, &scope, Some(" write to destination ")),
            GateDecision::Allow
        );
    }

    #[test]
    fn destructive_needs_stronger_phrase() {
        let gate = SafetyGate::new();
        assert!(matches!(
            gate.check(OperationClass::Destructive, &scoped(), Some(WRITE_ACK)),
            GateDecision::Deny(_)
        ));
        assert_eq!(
            gate.check(OperationClass::Destructive, &scoped(), Some(DESTRUCTIVE_ACK)),
            GateDecision::Allow
        );
    }

    #[test]
    fn destructive_needs_scope_unless_allowed() {
        let unscoped = Scope::unscoped();
        assert!(matches!(
            SafetyGate::new().check(OperationClass::Destructive, &unscoped, Some(DESTRUCTIVE_ACK)),
            GateDecision::Deny(_)
        ));
        assert_eq!(
            SafetyGate::new().allow_unscoped(true).check(
                OperationClass::Destructive,
                &unscoped,
                Some(DESTRUCTIVE_ACK)
            ),
            GateDecision::Allow
        );
    }

    #[test]
    fn denial_becomes_error() {
        let err = GateDecision::Deny("nope".into()).into_result().unwrap_err();
        assert!(matches!(err, SyncError::GateDenied(reason) if reason == "nope"));
        assert!(GateDecision::Allow.into_result().is_ok());
    }

    #[test]
    fn scope_description() {
        let filters = Filters::new()
            .with_owners("alice,bob")
            .with_iteration(IterationFilter::Id("it-3".into()));
        assert_eq!(
            Scope::from_filters(&filters).to_string(),
            "owner=alice,bob iteration=it-3"
        );
        assert_eq!(Scope::unscoped().to_string(), "all records");
    }
}
