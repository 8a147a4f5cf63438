//! Lock tiers embedded in every synced record

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sequential approval tiers, ordered `Kt < Admin < Final`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockTier {
    #[serde(rename = "KT")]
    Kt,
    Admin,
    Final,
}

impl LockTier {
    /// All tiers in ascending order
    pub const ALL: [Self; 3] = [Self::Kt, Self::Admin, Self::Final];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Kt => "KT",
            Self::Admin => "Admin",
            Self::Final => "Final",
        }
    }

    /// Tiers ordered strictly below this one
    pub fn below(self) -> impl Iterator<Item = Self> {
        Self::ALL.into_iter().filter(move |tier| *tier < self)
    }

    /// Tiers ordered strictly above this one
    pub fn above(self) -> impl Iterator<Item = Self> {
        Self::ALL.into_iter().filter(move |tier| *tier > self)
    }
}

impl fmt::Display for LockTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kt" => Ok(Self::Kt),
            "admin" => Ok(Self::Admin),
            "final" => Ok(Self::Final),
            other => Err(format!("unknown lock tier `{other}`")),
        }
    }
}

/// Flag, timestamp and actor for a single tier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLock {
    pub locked: bool,
    /// When the tier was last locked (Unix ms)
    pub locked_at: Option<i64>,
    /// Actor who last locked the tier
    pub locked_by: Option<String>,
}

/// Lock state of a record. Created fully unlocked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    pub kt: TierLock,
    pub admin: TierLock,
    #[serde(rename = "final")]
    pub final_tier: TierLock,
}

impl LockState {
    pub const fn tier(&self, tier: LockTier) -> &TierLock {
        match tier {
            LockTier::Kt => &self.kt,
            LockTier::Admin => &self.admin,
            LockTier::Final => &self.final_tier,
        }
    }

    pub fn tier_mut(&mut self, tier: LockTier) -> &mut TierLock {
        match tier {
            LockTier::Kt => &mut self.kt,
            LockTier::Admin => &mut self.admin,
            LockTier::Final => &mut self.final_tier,
        }
    }

    pub const fn is_tier_locked(&self, tier: LockTier) -> bool {
        self.tier(tier).locked
    }

    /// A record is editable (and sync-eligible) only when no tier is active.
    pub const fn is_editable(&self) -> bool {
        !(self.kt.locked || self.admin.locked || self.final_tier.locked)
    }

    /// Highest active tier, if any
    pub fn current_tier(&self) -> Option<LockTier> {
        LockTier::ALL
            .into_iter()
            .rev()
            .find(|tier| self.is_tier_locked(*tier))
    }

    /// Active tiers in ascending order
    pub fn active_tiers(&self) -> Vec<LockTier> {
        LockTier::ALL
            .into_iter()
            .filter(|tier| self.is_tier_locked(*tier))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locked(tiers: &[LockTier]) -> LockState {
        let mut state = LockState::default();
        for tier in tiers {
            state.tier_mut(*tier).locked = true;
        }
        state
    }

    #[test]
    fn default_state_is_editable() {
        let state = LockState::default();
        assert!(state.is_editable());
        assert_eq!(state.current_tier(), None);
        assert!(state.active_tiers().is_empty());
    }

    #[test]
    fn any_active_tier_blocks_editing() {
        for tier in LockTier::ALL {
            assert!(!locked(&[tier]).is_editable());
        }
    }

    #[test]
    fn current_tier_is_highest_active() {
        let state = locked(&[LockTier::Kt, LockTier::Admin]);
        assert_eq!(state.current_tier(), Some(LockTier::Admin));
        assert_eq!(state.active_tiers(), vec![LockTier::Kt, LockTier::Admin]);
    }

    #[test]
    fn tier_neighbours_follow_order() {
        assert_eq!(LockTier::Kt.below().count(), 0);
        assert_eq!(
            LockTier::Final.below().collect::<Vec<_>>(),
            vec![LockTier::Kt, LockTier::Admin]
        );
        assert_eq!(LockTier::Admin.above().collect::<Vec<_>>(), vec![LockTier::Final]);
    }

    #[test]
    fn tier_serializes_with_display_names() {
        assert_eq!(serde_json::to_string(&LockTier::Kt).unwrap(), "\"KT\"");
        assert_eq!("FINAL".parse::<LockTier>(), Ok(LockTier::Final));
    }
}
