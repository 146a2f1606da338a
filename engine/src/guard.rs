//! # Authorization Guard
//!
//! Every privileged entry point starts with exactly one call:
//!
//! ```text
//! self.guard.authorize(Access::Operator(cap), self.status, StatusRequirement::Normal)?;
//! ```
//!
//! The guard checks the credential first (a revoked operator is rejected
//! before anything else is looked at) and the vault status second.
//!
//! ## Capabilities
//!
//! - [`AdminCap`]: generated once and bound to a vault (and its price cache)
//!   at creation. Not `Clone`: holding it is the authority.
//! - [`OperatorCap`]: issued from an admin cap and remembers its issuer.
//!   A vault accepts operator caps issued by its own admin that it has not
//!   revoked.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::VaultError;
use crate::vault::VaultStatus;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Administrative capability.
#[derive(Debug)]
pub struct AdminCap {
    id: Uuid,
}

impl AdminCap {
    /// Generates a fresh admin capability.
    pub fn generate() -> Self {
        Self { id: Uuid::new_v4() }
    }

    /// Capability id.
    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// Operator capability.
#[derive(Debug)]
pub struct OperatorCap {
    id: Uuid,
    issuer: Uuid,
}

impl OperatorCap {
    /// Issues a new operator capability under `admin`.
    pub fn issue(admin: &AdminCap) -> Self {
        Self {
            id: Uuid::new_v4(),
            issuer: admin.id,
        }
    }

    /// Capability id. This is what gets revoked.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The admin capability that issued this one.
    pub fn issuer(&self) -> Uuid {
        self.issuer
    }
}

/// Fails with [`VaultError::Unauthorized`] unless `cap` is the admin `expected`.
pub fn ensure_admin(cap: &AdminCap, expected: Uuid) -> Result<(), VaultError> {
    if cap.id != expected {
        warn!(presented = %cap.id, "admin capability rejected");
        return Err(VaultError::Unauthorized("admin capability does not match"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Access & requirements
// ---------------------------------------------------------------------------

/// Who is calling.
#[derive(Debug, Clone, Copy)]
pub enum Access<'a> {
    /// Holder of the vault's admin capability.
    Admin(&'a AdminCap),
    /// Holder of an operator capability.
    Operator(&'a OperatorCap),
    /// Anyone. Identity checks, if any, happen against request data.
    Public,
}

/// Which vault statuses a call may run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusRequirement {
    /// Only `Normal`.
    Normal,
    /// Only `DuringOperation`.
    DuringOperation,
    /// `Normal` or `Disabled`.
    NotDuringOperation,
    /// Any status.
    Any,
}

impl StatusRequirement {
    /// `true` if `status` satisfies this requirement.
    pub fn admits(self, status: VaultStatus) -> bool {
        match self {
            StatusRequirement::Normal => status == VaultStatus::Normal,
            StatusRequirement::DuringOperation => status == VaultStatus::DuringOperation,
            StatusRequirement::NotDuringOperation => status != VaultStatus::DuringOperation,
            StatusRequirement::Any => true,
        }
    }
}

impl fmt::Display for StatusRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusRequirement::Normal => write!(f, "Normal"),
            StatusRequirement::DuringOperation => write!(f, "DuringOperation"),
            StatusRequirement::NotDuringOperation => write!(f, "Normal or Disabled"),
            StatusRequirement::Any => write!(f, "any status"),
        }
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// Per-vault authorization state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guard {
    admin: Uuid,
    revoked_operators: BTreeSet<Uuid>,
}

impl Guard {
    /// Creates a guard bound to `admin`.
    pub fn new(admin: &AdminCap) -> Self {
        Self {
            admin: admin.id,
            revoked_operators: BTreeSet::new(),
        }
    }

    /// Admin capability id this guard accepts.
    pub fn admin_id(&self) -> Uuid {
        self.admin
    }

    /// The single check every privileged entry point runs first.
    ///
    /// # Errors
    ///
    /// - [`VaultError::OperatorRevoked`] for a revoked operator, regardless
    ///   of vault status.
    /// - [`VaultError::Unauthorized`] for a capability this vault did not
    ///   issue.
    /// - [`VaultError::InvalidStateTransition`] if `status` does not meet
    ///   `requirement`.
    pub fn authorize(
        &self,
        access: Access<'_>,
        status: VaultStatus,
        requirement: StatusRequirement,
    ) -> Result<(), VaultError> {
        match access {
            Access::Admin(cap) => ensure_admin(cap, self.admin)?,
            Access::Operator(cap) => self.ensure_operator(cap)?,
            Access::Public => {}
        }

        if !requirement.admits(status) {
            return Err(VaultError::InvalidStateTransition {
                current: status.to_string(),
                expected: requirement.to_string(),
            });
        }
        Ok(())
    }

    fn ensure_operator(&self, cap: &OperatorCap) -> Result<(), VaultError> {
        if self.revoked_operators.contains(&cap.id) {
            warn!(operator = %cap.id, "revoked operator rejected");
            return Err(VaultError::OperatorRevoked(cap.id));
        }
        if cap.issuer != self.admin {
            warn!(operator = %cap.id, "foreign operator capability rejected");
            return Err(VaultError::Unauthorized("operator capability issued elsewhere"));
        }
        Ok(())
    }

    /// Revokes (`frozen = true`) or restores an operator.
    pub fn set_operator_frozen(&mut self, operator: Uuid, frozen: bool) {
        if frozen {
            self.revoked_operators.insert(operator);
        } else {
            self.revoked_operators.remove(&operator);
        }
    }

    /// `true` if `operator` is revoked.
    pub fn is_revoked(&self, operator: Uuid) -> bool {
        self.revoked_operators.contains(&operator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revocation_wins_over_status() {
        let admin = AdminCap::generate();
        let operator = OperatorCap::issue(&admin);
        let mut guard = Guard::new(&admin);
        guard.set_operator_frozen(operator.id(), true);

        // Even with a status that would otherwise fail, revocation is reported.
        let err = guard
            .authorize(
                Access::Operator(&operator),
                VaultStatus::Disabled,
                StatusRequirement::Normal,
            )
            .unwrap_err();
        assert_eq!(err, VaultError::OperatorRevoked(operator.id()));

        guard.set_operator_frozen(operator.id(), false);
        assert!(guard
            .authorize(
                Access::Operator(&operator),
                VaultStatus::Normal,
                StatusRequirement::Normal
            )
            .is_ok());
    }

    #[test]
    fn foreign_caps_are_unauthorized() {
        let admin = AdminCap::generate();
        let other = AdminCap::generate();
        let guard = Guard::new(&admin);
        let foreign_operator = OperatorCap::issue(&other);

        assert!(matches!(
            guard.authorize(Access::Admin(&other), VaultStatus::Normal, StatusRequirement::Any),
            Err(VaultError::Unauthorized(_))
        ));
        assert!(matches!(
            guard.authorize(
                Access::Operator(&foreign_operator),
                VaultStatus::Normal,
                StatusRequirement::Any
            ),
            Err(VaultError::Unauthorized(_))
        ));
    }

    #[test]
    fn status_requirements() {
        use VaultStatus::*;
        assert!(StatusRequirement::Normal.admits(Normal));
        assert!(!StatusRequirement::Normal.admits(Disabled));
        assert!(StatusRequirement::NotDuringOperation.admits(Disabled));
        assert!(!StatusRequirement::NotDuringOperation.admits(DuringOperation));
        assert!(StatusRequirement::DuringOperation.admits(DuringOperation));
        assert!(StatusRequirement::Any.admits(DuringOperation));
    }

    #[test]
    fn public_access_still_checks_status() {
        let admin = AdminCap::generate();
        let guard = Guard::new(&admin);
        assert!(matches!(
            guard.authorize(Access::Public, VaultStatus::DuringOperation, StatusRequirement::Normal),
            Err(VaultError::InvalidStateTransition { .. })
        ));
    }
}
