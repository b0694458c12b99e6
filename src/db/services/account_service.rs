use chrono::Utc;
use sea_orm::{
    ActiveEnum, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait, prelude::Expr,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::entities::account;
use crate::db::enums::AccountStatus;
use crate::error::{Result, RotorError};
use crate::platform::profile::Credentials;
use crate::services::encryption_service::EncryptionService;

pub type Account = account::Model;

/// Durable table of accounts, their encrypted tokens and their credit state.
///
/// Every mutation is a single-row write, except `set_active` which swaps the bound
/// account inside one transaction.
#[derive(Clone, Debug)]
pub struct AccountStore {
    db: DatabaseConnection,
    vault: Arc<EncryptionService>,
}

impl AccountStore {
    pub fn new(db: DatabaseConnection, vault: Arc<EncryptionService>) -> Self {
        Self { db, vault }
    }

    #[cfg(test)]
    pub(crate) fn db_connection(&self) -> &DatabaseConnection {
        &self.db
    }

    // --- Administration ---

    /// Adds an account. Both tokens are encrypted before they touch the database.
    ///
    /// The balance is unknown until the first check, so the account starts `dead`
    /// with balance 0 and is revived by `record_balance`.
    pub async fn create_account(
        &self,
        username: &str,
        token_id: &str,
        token_secret: &str,
    ) -> Result<Account> {
        let username = username.trim();
        if username.is_empty() || token_id.trim().is_empty() || token_secret.trim().is_empty() {
            return Err(RotorError::InvalidInput(
                "username, token id and token secret are all required".to_string(),
            ));
        }
        if account::Entity::find_by_id(username).one(&self.db).await?.is_some() {
            return Err(RotorError::Conflict(format!(
                "account '{username}' already exists"
            )));
        }

        let encrypt = |value: &str| {
            self.vault
                .encrypt(value.trim())
                .map_err(|e| RotorError::Credential {
                    username: username.to_string(),
                    reason: e.to_string(),
                })
        };

        let now = Utc::now();
        let model = account::ActiveModel {
            username: Set(username.to_string()),
            token_id: Set(encrypt(token_id)?),
            token_secret: Set(encrypt(token_secret)?),
            balance: Set(0.0),
            status: Set(AccountStatus::Dead),
            selected_gpu: Set(None),
            last_checked: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.db)
        .await?;

        info!(username = %model.username, "Account created.");
        Ok(model)
    }

    /// Decrypts the platform tokens of `username`.
    pub async fn credentials(&self, username: &str) -> Result<Credentials> {
        let account = self.get(username).await?;
        let decrypt = |cipher: &str| {
            self.vault
                .decrypt(cipher)
                .map_err(|e| RotorError::Credential {
                    username: username.to_string(),
                    reason: e.to_string(),
                })
        };
        Ok(Credentials {
            token_id: decrypt(&account.token_id)?,
            token_secret: decrypt(&account.token_secret)?,
        })
    }

    // --- Queries ---

    pub async fn get(&self, username: &str) -> Result<Account> {
        account::Entity::find_by_id(username)
            .one(&self.db)
            .await?
            .ok_or_else(|| RotorError::NotFound(username.to_string()))
    }

    pub async fn list_all(&self) -> Result<Vec<Account>> {
        Ok(account::Entity::find()
            .order_by_asc(account::Column::Username)
            .all(&self.db)
            .await?)
    }

    /// The account currently bound to the platform profile, if any.
    pub async fn bound_account(&self) -> Result<Option<Account>> {
        Ok(account::Entity::find()
            .filter(
                account::Column::Status.is_in([AccountStatus::Active, AccountStatus::Building]),
            )
            .order_by_asc(account::Column::Username)
            .one(&self.db)
            .await?)
    }

    /// Picks the eligible account with the highest balance, ties broken by the
    /// lexicographically smallest username.
    pub async fn next_available(
        &self,
        threshold: f64,
        excluding: &BTreeSet<String>,
    ) -> Result<Option<Account>> {
        let mut query = account::Entity::find()
            .filter(account::Column::Status.is_in([AccountStatus::Ready, AccountStatus::Active]))
            .filter(account::Column::Balance.gte(threshold));
        if !excluding.is_empty() {
            query = query.filter(account::Column::Username.is_not_in(excluding.iter().cloned()));
        }

        Ok(query
            .order_by_desc(account::Column::Balance)
            .order_by_asc(account::Column::Username)
            .one(&self.db)
            .await?)
    }

    // --- Mutations ---

    pub async fn set_status(&self, username: &str, status: AccountStatus) -> Result<Account> {
        let current = self.get(username).await?;
        if !current.status.can_transition_to(status) {
            return Err(RotorError::Conflict(format!(
                "account '{username}' cannot move from {} to {status}",
                current.status
            )));
        }
        if current.status == status {
            return Ok(current);
        }

        let mut model: account::ActiveModel = current.into();
        model.status = Set(status);
        model.updated_at = Set(Utc::now());
        let updated = model.update(&self.db).await?;
        info!(username = %username, status = %status, "Account status updated.");
        Ok(updated)
    }

    /// Moves a live account back to `ready`. Dead accounts stay dead.
    pub async fn release(&self, username: &str) -> Result<Account> {
        let current = self.get(username).await?;
        if current.status == AccountStatus::Dead {
            warn!(username = %username, "Account is dead; leaving status unchanged.");
            return Ok(current);
        }
        self.set_status(username, AccountStatus::Ready).await
    }

    /// Writes a balance against `threshold`, keeping the account bound if it was.
    pub async fn set_balance(
        &self,
        username: &str,
        balance: f64,
        threshold: f64,
    ) -> Result<Account> {
        let is_bound = self.get(username).await?.status.is_bound();
        self.record_balance(username, balance, threshold, is_bound)
            .await
    }

    /// Stores a fresh balance reading and recomputes the status in the same write.
    pub async fn record_balance(
        &self,
        username: &str,
        balance: f64,
        threshold: f64,
        is_bound: bool,
    ) -> Result<Account> {
        let mut model: account::ActiveModel = self.get(username).await?.into();
        let now = Utc::now();
        let status = AccountStatus::after_balance_check(balance, threshold, is_bound);
        model.balance = Set(balance);
        model.status = Set(status);
        model.last_checked = Set(Some(now));
        model.updated_at = Set(now);
        let updated = model.update(&self.db).await?;
        info!(username = %username, balance, status = %status, "Balance recorded.");
        Ok(updated)
    }

    pub async fn set_selected_gpu(&self, username: &str, gpu: &str) -> Result<Account> {
        let mut model: account::ActiveModel = self.get(username).await?.into();
        model.selected_gpu = Set(Some(gpu.to_string()));
        model.updated_at = Set(Utc::now());
        Ok(model.update(&self.db).await?)
    }

    /// Makes `username` the single bound account.
    ///
    /// Any other `active` or `building` account is moved to `ready` in the same
    /// transaction, so no reader ever sees two bound accounts.
    pub async fn set_active(&self, username: &str) -> Result<Account> {
        let txn = self.db.begin().await?;

        let target = account::Entity::find_by_id(username)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                RotorError::Conflict(format!("cannot activate unknown account '{username}'"))
            })?;
        if !target.status.can_transition_to(AccountStatus::Active) {
            return Err(RotorError::Conflict(format!(
                "account '{username}' is {} and cannot be activated",
                target.status
            )));
        }

        let now = Utc::now();
        let released = account::Entity::update_many()
            .col_expr(
                account::Column::Status,
                Expr::value(AccountStatus::Ready.to_value()),
            )
            .col_expr(account::Column::UpdatedAt, Expr::value(now))
            .filter(account::Column::Status.is_in([AccountStatus::Active, AccountStatus::Building]))
            .filter(account::Column::Username.ne(username))
            .exec(&txn)
            .await?;

        let mut model: account::ActiveModel = target.into();
        model.status = Set(AccountStatus::Active);
        model.updated_at = Set(now);
        let updated = model.update(&txn).await?;

        txn.commit().await?;
        info!(
            username = %username,
            released = released.rows_affected,
            "Account marked active."
        );
        Ok(updated)
    }
}
