//! Work queued during authentication that must not block or fail the
//! attempt itself: re-hashing a password stored under a legacy algorithm,
//! and persisting a security key's updated sign counter. The server owner
//! drains these off an unbounded channel after the response is sent.

use crate::prelude::*;
use webauthn_rs::prelude::AuthenticationResult;

pub struct PasswordUpgrade {
    pub account_id: Uuid,
    pub existing_password: String,
}

pub struct SecurityKeyCounterIncrement {
    pub account_id: Uuid,
    pub auth_result: AuthenticationResult,
}

pub enum DelayedAction {
    PwUpgrade(PasswordUpgrade),
    SecurityKeyCounterIncrement(SecurityKeyCounterIncrement),
}

impl std::fmt::Debug for DelayedAction {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DelayedAction::PwUpgrade(PasswordUpgrade { account_id, .. }) => {
                write!(fmt, "PwUpgrade({account_id})")
            }
            DelayedAction::SecurityKeyCounterIncrement(SecurityKeyCounterIncrement {
                account_id,
                ..
            }) => write!(fmt, "SecurityKeyCounterIncrement({account_id})"),
        }
    }
}
