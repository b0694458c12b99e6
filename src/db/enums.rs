use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "Text", enum_name = "account_status_enum")]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    #[sea_orm(string_value = "ready")]
    Ready,
    #[sea_orm(string_value = "building")]
    Building,
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "dead")]
    Dead,
}

impl AccountStatus {
    /// Whether a plain status write from `self` to `next` is allowed.
    ///
    /// A dead account can only be revived by a balance re-check, which goes through
    /// [`AccountStatus::after_balance_check`] instead of this function.
    pub fn can_transition_to(self, next: AccountStatus) -> bool {
        match self {
            AccountStatus::Dead => next == AccountStatus::Dead,
            _ => true,
        }
    }

    /// Status after a fresh balance reading.
    pub fn after_balance_check(balance: f64, threshold: f64, is_bound: bool) -> AccountStatus {
        if balance < threshold {
            AccountStatus::Dead
        } else if is_bound {
            AccountStatus::Active
        } else {
            AccountStatus::Ready
        }
    }

    /// Statuses of the account currently bound to the platform profile.
    pub fn is_bound(self) -> bool {
        matches!(self, AccountStatus::Active | AccountStatus::Building)
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AccountStatus::Ready => "ready",
            AccountStatus::Building => "building",
            AccountStatus::Active => "active",
            AccountStatus::Dead => "dead",
        };
        f.pad(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_cannot_be_written_back_to_life() {
        assert!(!AccountStatus::Dead.can_transition_to(AccountStatus::Active));
        assert!(!AccountStatus::Dead.can_transition_to(AccountStatus::Building));
        assert!(!AccountStatus::Dead.can_transition_to(AccountStatus::Ready));
        assert!(AccountStatus::Dead.can_transition_to(AccountStatus::Dead));
    }

    #[test]
    fn test_live_statuses_move_freely() {
        assert!(AccountStatus::Ready.can_transition_to(AccountStatus::Active));
        assert!(AccountStatus::Active.can_transition_to(AccountStatus::Building));
        assert!(AccountStatus::Building.can_transition_to(AccountStatus::Ready));
        assert!(AccountStatus::Active.can_transition_to(AccountStatus::Dead));
    }

    #[test]
    fn test_after_balance_check() {
        assert_eq!(
            AccountStatus::after_balance_check(1.99, 2.0, true),
            AccountStatus::Dead
        );
        assert_eq!(
            AccountStatus::after_balance_check(2.0, 2.0, true),
            AccountStatus::Active
        );
        assert_eq!(
            AccountStatus::after_balance_check(30.0, 2.0, false),
            AccountStatus::Ready
        );
    }
}
