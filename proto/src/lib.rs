//! Wire types shared between the vigil server and its clients. Almost
//! everything here is serde over JSON; the only logic is formatting (the
//! otpauth provisioning URI) and the normalisation of internal errors into
//! the public error taxonomy.

#![deny(warnings)]
#![warn(unused_extern_crates)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod oidc;
pub mod v1;

/// Feedback on why a candidate password was rejected by tenant policy.
/// Exactly one of these is returned per rejection - the first rule that
/// failed in the server's fixed evaluation order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PasswordFeedback {
    TooShort(usize),
    TooLong(usize),
    LeadingOrTrailingWhitespace,
    InvalidCharacter,
    MissingDigit,
    MissingLowercase,
    MissingUppercase,
    MissingSpecialCharacter,
    RepeatingCharacters(usize),
    BadListed,
}

impl fmt::Display for PasswordFeedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PasswordFeedback::TooShort(min) => {
                write!(f, "password must be at least {min} characters")
            }
            PasswordFeedback::TooLong(max) => {
                write!(f, "password must be at most {max} characters")
            }
            PasswordFeedback::LeadingOrTrailingWhitespace => {
                write!(f, "password must not begin or end with whitespace")
            }
            PasswordFeedback::InvalidCharacter => {
                write!(f, "password contains a character that is not permitted")
            }
            PasswordFeedback::MissingDigit => write!(f, "password must contain a digit"),
            PasswordFeedback::MissingLowercase => {
                write!(f, "password must contain a lowercase letter")
            }
            PasswordFeedback::MissingUppercase => {
                write!(f, "password must contain an uppercase letter")
            }
            PasswordFeedback::MissingSpecialCharacter => {
                write!(f, "password must contain a special character")
            }
            PasswordFeedback::RepeatingCharacters(max) => {
                write!(f, "password must not repeat a character more than {max} times in a row")
            }
            PasswordFeedback::BadListed => {
                write!(f, "password is on the list of compromised passwords")
            }
        }
    }
}

/// The error taxonomy of the portal. Verification failures of any kind are
/// collapsed into the generic variants here before they cross the client
/// boundary - granular reasons stay in the server logs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperationError {
    /// Bad username or bad password - deliberately indistinguishable.
    InvalidCredential,
    /// Unknown, expired, replayed or kind-mismatched session token - all
    /// deliberately indistinguishable from ordinary expiry.
    InvalidOrExpiredSession,
    /// A FIDO2 challenge that is unknown, expired, already consumed, scoped
    /// to the other flow, or whose ceremony response failed verification.
    InvalidOrExpiredChallenge,
    /// A password failed tenant policy. Carries the first violated rule.
    PasswordQuality(PasswordFeedback),
    InsufficientPermission,
    // Internal variants. These never cross the boundary - `normalise`
    // folds them into Unknown first.
    InvalidRequestState,
    InvalidState,
    BackendFailure,
    CryptographyError,
    Unknown,
}

impl OperationError {
    /// Collapse internal variants into the public taxonomy. Called at the
    /// response boundary so storage/crypto detail never leaks.
    pub fn normalise(self) -> Self {
        match self {
            OperationError::InvalidRequestState
            | OperationError::InvalidState
            | OperationError::BackendFailure
            | OperationError::CryptographyError
            | OperationError::Unknown => OperationError::Unknown,
            e => e,
        }
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationError::InvalidCredential => write!(f, "invalid credentials"),
            OperationError::InvalidOrExpiredSession => {
                write!(f, "invalid or expired session")
            }
            OperationError::InvalidOrExpiredChallenge => {
                write!(f, "invalid or expired challenge")
            }
            OperationError::PasswordQuality(fb) => write!(f, "password rejected: {fb}"),
            OperationError::InsufficientPermission => write!(f, "insufficient permission"),
            OperationError::InvalidRequestState
            | OperationError::InvalidState
            | OperationError::BackendFailure
            | OperationError::CryptographyError
            | OperationError::Unknown => write!(f, "an internal error occurred"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_error_normalise_hides_internal_detail() {
        assert_eq!(
            OperationError::CryptographyError.normalise(),
            OperationError::Unknown
        );
        assert_eq!(
            OperationError::InvalidState.normalise(),
            OperationError::Unknown
        );
        // Public variants pass through untouched.
        assert_eq!(
            OperationError::InvalidOrExpiredSession.normalise(),
            OperationError::InvalidOrExpiredSession
        );
        assert_eq!(
            OperationError::PasswordQuality(PasswordFeedback::MissingDigit).normalise(),
            OperationError::PasswordQuality(PasswordFeedback::MissingDigit)
        );
    }
}
