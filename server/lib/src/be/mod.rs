//! Storage and delivery seams. The protocol core only ever touches
//! accounts and email through these traits; the in-memory implementations
//! back tests and single-node deployments, a real deployment injects its
//! own at construction time.

use hashbrown::HashMap;
use std::sync::Mutex;

use crate::idm::account::Account;
use crate::prelude::*;

/// Account persistence. A put replaces the whole record in one atomic
/// write, so concurrent completions (two tabs enrolling TOTP) converge on
/// last-writer-wins rather than a torn record.
pub trait AccountStore: Send + Sync {
    fn get_by_uuid(&self, account_id: Uuid) -> Result<Option<Account>, OperationError>;

    fn get_by_username(
        &self,
        tenant_id: Uuid,
        username: &str,
    ) -> Result<Option<Account>, OperationError>;

    fn put(&self, account: Account) -> Result<(), OperationError>;

    /// Insert a new record only if no account in the tenant already holds
    /// the username. Check and insert happen under one guard, so two
    /// racing registrations of the same name cannot both persist. Returns
    /// false when the name is taken.
    fn create(&self, account: Account) -> Result<bool, OperationError>;
}

/// Out-of-band delivery of email verification codes.
pub trait EmailSender: Send + Sync {
    fn send_verification_code(&self, email: &str, code: &str) -> Result<(), OperationError>;
}

#[derive(Default)]
pub struct MemoryAccountStore {
    inner: Mutex<HashMap<Uuid, Account>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AccountStore for MemoryAccountStore {
    fn get_by_uuid(&self, account_id: Uuid) -> Result<Option<Account>, OperationError> {
        let inner = self.inner.lock().map_err(|_e| {
            admin_error!("account store poisoned");
            OperationError::BackendFailure
        })?;
        Ok(inner.get(&account_id).cloned())
    }

    fn get_by_username(
        &self,
        tenant_id: Uuid,
        username: &str,
    ) -> Result<Option<Account>, OperationError> {
        let inner = self.inner.lock().map_err(|_e| {
            admin_error!("account store poisoned");
            OperationError::BackendFailure
        })?;
        Ok(inner
            .values()
            .find(|a| a.tenant_id == tenant_id && a.username.eq_ignore_ascii_case(username))
            .cloned())
    }

    fn put(&self, account: Account) -> Result<(), OperationError> {
        let mut inner = self.inner.lock().map_err(|_e| {
            admin_error!("account store poisoned");
            OperationError::BackendFailure
        })?;
        inner.insert(account.uuid, account);
        Ok(())
    }

    fn create(&self, account: Account) -> Result<bool, OperationError> {
        let mut inner = self.inner.lock().map_err(|_e| {
            admin_error!("account store poisoned");
            OperationError::BackendFailure
        })?;
        let taken = inner.values().any(|a| {
            a.tenant_id == account.tenant_id
                && a.username.eq_ignore_ascii_case(&account.username)
        });
        if taken {
            return Ok(false);
        }
        inner.insert(account.uuid, account);
        Ok(true)
    }
}

/// Sink that records delivery without a mail relay. The code itself is
/// never written to the log.
#[derive(Default)]
pub struct LoggingEmailSender;

impl EmailSender for LoggingEmailSender {
    fn send_verification_code(&self, email: &str, _code: &str) -> Result<(), OperationError> {
        admin_info!(%email, "verification code issued");
        Ok(())
    }
}
