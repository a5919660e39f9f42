//! The account record and its credential material. Accounts are read and
//! written whole through [`crate::be::AccountStore`]; the state machines
//! work on owned copies and persist with a single put.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use webauthn_rs::prelude::{AuthenticationResult, SecurityKey};

use crate::credential::totp::Totp;
use crate::credential::{CryptoPolicy, Password};
use crate::prelude::*;

#[derive(Clone, Serialize, Deserialize)]
pub struct LabeledSecurityKey {
    pub label: String,
    pub key: SecurityKey,
}

/// The outcome of checking a cleartext against an account's passwords.
/// A duress match is reported to the caller but must complete through the
/// externally identical path as a primary match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordVerdict {
    Accept {
        duress: bool,
        upgrade_required: bool,
    },
    Reject,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Account {
    pub uuid: Uuid,
    pub tenant_id: Uuid,
    pub username: String,
    pub displayname: String,
    pub email: String,
    pub backup_email: Option<String>,
    pub enabled: bool,
    /// Forces the rotation step on next successful password verification.
    pub must_rotate_password: bool,
    primary: Option<Password>,
    duress: Option<Password>,
    totp: Option<Totp>,
    pub security_keys: BTreeMap<Uuid, LabeledSecurityKey>,
}

impl fmt::Debug for Account {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Account")
            .field("uuid", &self.uuid)
            .field("tenant_id", &self.tenant_id)
            .field("username", &self.username)
            .field("enabled", &self.enabled)
            .field("must_rotate_password", &self.must_rotate_password)
            .field("primary", &self.primary.is_some())
            .field("duress", &self.duress.is_some())
            .field("totp", &self.totp.is_some())
            .field("security_keys", &self.security_keys.len())
            .finish()
    }
}

impl Account {
    pub fn new(tenant_id: Uuid, username: &str, displayname: &str, email: &str) -> Self {
        Account {
            uuid: Uuid::new_v4(),
            tenant_id,
            username: username.to_string(),
            displayname: displayname.to_string(),
            email: email.to_string(),
            backup_email: None,
            enabled: true,
            must_rotate_password: false,
            primary: None,
            duress: None,
            totp: None,
            security_keys: BTreeMap::new(),
        }
    }

    /// Check a cleartext against the primary password, then the duress
    /// password. The primary is always tried first so the two can never
    /// shadow each other.
    pub fn verify_password(&self, cleartext: &str) -> Result<PasswordVerdict, OperationError> {
        if let Some(primary) = &self.primary {
            if primary.verify(cleartext)? {
                return Ok(PasswordVerdict::Accept {
                    duress: false,
                    upgrade_required: primary.requires_upgrade(),
                });
            }
        }
        if let Some(duress) = &self.duress {
            if duress.verify(cleartext)? {
                return Ok(PasswordVerdict::Accept {
                    duress: true,
                    upgrade_required: false,
                });
            }
        }
        Ok(PasswordVerdict::Reject)
    }

    pub fn set_password(
        &mut self,
        policy: &CryptoPolicy,
        cleartext: &str,
    ) -> Result<(), OperationError> {
        self.primary = Some(Password::new(policy, cleartext)?);
        Ok(())
    }

    /// Import a legacy marked hash, e.g. from a directory server
    /// migration. The credential will flag itself for upgrade on first
    /// successful verification.
    pub fn import_password(&mut self, marked: &str) -> Result<(), OperationError> {
        let password = Password::try_from(marked).map_err(|_e| {
            admin_error!("unable to parse imported credential material");
            OperationError::InvalidRequestState
        })?;
        self.primary = Some(password);
        Ok(())
    }

    pub fn set_duress_password(
        &mut self,
        policy: &CryptoPolicy,
        cleartext: &str,
    ) -> Result<(), OperationError> {
        self.duress = Some(Password::new(policy, cleartext)?);
        Ok(())
    }

    pub fn has_totp(&self) -> bool {
        self.totp.is_some()
    }

    pub fn set_totp(&mut self, totp: Totp) {
        self.totp = Some(totp);
    }

    /// Check a code against the persisted authenticator. Unlike session
    /// tokens, valid codes keep verifying for the life of the credential.
    pub fn verify_totp(&self, chal: u32, ct: Duration) -> bool {
        match &self.totp {
            Some(totp) => totp.verify(chal, ct),
            None => false,
        }
    }

    pub fn has_security_keys(&self) -> bool {
        !self.security_keys.is_empty()
    }

    pub fn add_security_key(&mut self, label: &str, key: SecurityKey) -> Uuid {
        let key_id = Uuid::new_v4();
        self.security_keys.insert(
            key_id,
            LabeledSecurityKey {
                label: label.to_string(),
                key,
            },
        );
        key_id
    }

    pub fn security_keys(&self) -> Vec<SecurityKey> {
        self.security_keys.values().map(|l| l.key.clone()).collect()
    }

    /// Apply a post-assertion counter update to the matching key. Returns
    /// true when a stored key actually changed and needs persisting.
    pub fn update_security_key_counter(&mut self, auth_result: &AuthenticationResult) -> bool {
        for labeled in self.security_keys.values_mut() {
            if let Some(true) = labeled.key.update_credential(auth_result) {
                return true;
            }
        }
        false
    }
}
