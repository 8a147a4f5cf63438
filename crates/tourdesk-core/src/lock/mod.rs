//! Three-tier sequential record locks.
//!
//! Tiers are locked strictly in ascending order (`KT`, then `Admin`, then
//! `Final`) and unlocked strictly in descending order. A record with any
//! active tier is not editable and is never written back to the spreadsheet.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::models::{LockState, LockTier, TierLock};

/// Back-office roles relevant to locking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    Accountant,
    Seller,
    Operator,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "ADMIN",
            Self::Accountant => "ACCOUNTANT",
            Self::Seller => "SELLER",
            Self::Operator => "OPERATOR",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ADMIN" => Ok(Self::Admin),
            "ACCOUNTANT" => Ok(Self::Accountant),
            "SELLER" => Ok(Self::Seller),
            "OPERATOR" => Ok(Self::Operator),
            other => Err(format!("unknown role `{other}`")),
        }
    }
}

/// Rejected lock/unlock request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("Role {role} may not change the {tier} lock")]
    PermissionDenied { role: Role, tier: LockTier },
    #[error("{0} lock is already active")]
    AlreadyLocked(LockTier),
    #[error("{0} lock is not active")]
    NotLocked(LockTier),
    #[error("Cannot lock {tier} before {missing} is locked")]
    LowerTierUnlocked { tier: LockTier, missing: LockTier },
    #[error("Cannot unlock {tier} while {blocking} is locked")]
    HigherTierLocked { tier: LockTier, blocking: LockTier },
}

/// Roles allowed to lock or unlock a tier
pub const fn allowed_roles(tier: LockTier) -> &'static [Role] {
    match tier {
        LockTier::Kt => &[Role::Accountant, Role::Admin],
        LockTier::Admin | LockTier::Final => &[Role::Admin],
    }
}

pub fn has_permission(role: Role, tier: LockTier) -> bool {
    allowed_roles(tier).contains(&role)
}

pub fn check_lock(role: Role, tier: LockTier, state: &LockState) -> Result<(), LockError> {
    if !has_permission(role, tier) {
        return Err(LockError::PermissionDenied { role, tier });
    }
    if state.is_tier_locked(tier) {
        return Err(LockError::AlreadyLocked(tier));
    }
    if let Some(missing) = tier.below().find(|lower| !state.is_tier_locked(*lower)) {
        return Err(LockError::LowerTierUnlocked { tier, missing });
    }
    Ok(())
}

pub fn check_unlock(role: Role, tier: LockTier, state: &LockState) -> Result<(), LockError> {
    if !has_permission(role, tier) {
        return Err(LockError::PermissionDenied { role, tier });
    }
    if !state.is_tier_locked(tier) {
        return Err(LockError::NotLocked(tier));
    }
    if let Some(blocking) = tier.above().find(|higher| state.is_tier_locked(*higher)) {
        return Err(LockError::HigherTierLocked { tier, blocking });
    }
    Ok(())
}

pub fn can_lock(role: Role, tier: LockTier, state: &LockState) -> bool {
    check_lock(role, tier, state).is_ok()
}

pub fn can_unlock(role: Role, tier: LockTier, state: &LockState) -> bool {
    check_unlock(role, tier, state).is_ok()
}

/// Field patch for one tier, produced by [`apply`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockPatch {
    pub tier: LockTier,
    pub value: TierLock,
}

impl LockPatch {
    pub fn apply_to(&self, state: &mut LockState) {
        *state.tier_mut(self.tier) = self.value.clone();
    }

    pub const fn is_lock(&self) -> bool {
        self.value.locked
    }
}

/// Build the patch for a lock (`locking = true`) or unlock action.
///
/// Unlocking clears the timestamp and actor. Callers validate first with
/// [`check_lock`] / [`check_unlock`].
pub fn apply(tier: LockTier, actor_id: &str, locking: bool, now: i64) -> LockPatch {
    let value = if locking {
        TierLock {
            locked: true,
            locked_at: Some(now),
            locked_by: Some(actor_id.to_string()),
        }
    } else {
        TierLock::default()
    };
    LockPatch { tier, value }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every combination of the three tier flags
    fn all_states() -> Vec<LockState> {
        (0u8..8)
            .map(|bits| {
                let mut state = LockState::default();
                for (index, tier) in LockTier::ALL.into_iter().enumerate() {
                    state.tier_mut(tier).locked = bits & (1 << index) != 0;
                }
                state
            })
            .collect()
    }

    #[test]
    fn lock_succeeds_iff_lower_tiers_locked_and_tier_unlocked() {
        for state in all_states() {
            for tier in LockTier::ALL {
                let expected = !state.is_tier_locked(tier)
                    && tier.below().all(|lower| state.is_tier_locked(lower));
                assert_eq!(
                    can_lock(Role::Admin, tier, &state),
                    expected,
                    "lock {tier} on {state:?}"
                );
            }
        }
    }

    #[test]
    fn unlock_succeeds_iff_higher_tiers_unlocked_and_tier_locked() {
        for state in all_states() {
            for tier in LockTier::ALL {
                let expected = state.is_tier_locked(tier)
                    && tier.above().all(|higher| !state.is_tier_locked(higher));
                assert_eq!(
                    can_unlock(Role::Admin, tier, &state),
                    expected,
                    "unlock {tier} on {state:?}"
                );
            }
        }
    }

    #[test]
    fn admin_lock_requires_kt() {
        let state = LockState::default();
        assert_eq!(
            check_lock(Role::Admin, LockTier::Admin, &state),
            Err(LockError::LowerTierUnlocked {
                tier: LockTier::Admin,
                missing: LockTier::Kt
            })
        );
    }

    #[test]
    fn kt_unlock_blocked_by_admin_tier() {
        let mut state = LockState::default();
        state.kt.locked = true;
        state.admin.locked = true;
        assert_eq!(
            check_unlock(Role::Admin, LockTier::Kt, &state),
            Err(LockError::HigherTierLocked {
                tier: LockTier::Kt,
                blocking: LockTier::Admin
            })
        );
    }

    #[test]
    fn accountant_may_only_touch_kt() {
        let mut state = LockState::default();
        assert!(can_lock(Role::Accountant, LockTier::Kt, &state));
        state.kt.locked = true;
        assert!(can_unlock(Role::Accountant, LockTier::Kt, &state));
        assert_eq!(
            check_lock(Role::Accountant, LockTier::Admin, &state),
            Err(LockError::PermissionDenied {
                role: Role::Accountant,
                tier: LockTier::Admin
            })
        );
    }

    #[test]
    fn sellers_and_operators_cannot_lock() {
        let state = LockState::default();
        for role in [Role::Seller, Role::Operator] {
            for tier in LockTier::ALL {
                assert!(!can_lock(role, tier, &state));
            }
        }
    }

    #[test]
    fn apply_sets_and_clears_actor() {
        let mut state = LockState::default();
        apply(LockTier::Kt, "user-1", true, 42).apply_to(&mut state);
        assert!(state.kt.locked);
        assert_eq!(state.kt.locked_at, Some(42));
        assert_eq!(state.kt.locked_by.as_deref(), Some("user-1"));

        apply(LockTier::Kt, "user-2", false, 43).apply_to(&mut state);
        assert_eq!(state.kt, TierLock::default());
        assert!(state.is_editable());
    }
}
