use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;
use uuid::Uuid;

use webauthn_rs_proto::{CreationChallengeResponse, PublicKeyCredential, RequestChallengeResponse};

use crate::v1::TotpSecret;
use crate::OperationError;

// Login is a multi-step exchange. The client opens with `Init`, then
// answers whatever the returned state asks for, presenting the session
// token from the previous response each time. A token is good for exactly
// one step - every accepted step returns a replacement.

/// One authentication mutation. Apart from `Init`, every variant carries
/// the session token from the previous server response.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStep {
    /// "I want to authenticate as this user." The tenant may be named
    /// explicitly, or left to the server to resolve from the username.
    Init {
        username: String,
        tenant_id: Option<Uuid>,
        pre_auth_token: Option<String>,
    },
    /// Disambiguate between candidate tenants offered in `SelectTenant`.
    SelectTenant {
        session_token: String,
        tenant_id: Uuid,
    },
    Password {
        session_token: String,
        password: String,
    },
    RotatePassword {
        session_token: String,
        new_password: String,
    },
    /// Request a fresh TOTP enrolment. Only valid in `ConfigureTotp`.
    TotpGenerate { session_token: String },
    TotpVerify { session_token: String, totp: u32 },
    /// Complete the security key registration ceremony announced by
    /// `ConfigureSecurityKey`.
    SecurityKeyRegister {
        session_token: String,
        label: String,
        response: Box<webauthn_rs_proto::RegisterPublicKeyCredential>,
    },
    /// Complete the assertion ceremony announced by `ValidateSecurityKey`.
    SecurityKeyAssert {
        session_token: String,
        response: Box<PublicKeyCredential>,
    },
}

impl fmt::Debug for AuthStep {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthStep::Init {
                username,
                tenant_id,
                ..
            } => write!(fmt, "Init({username}, {tenant_id:?})"),
            AuthStep::SelectTenant { tenant_id, .. } => write!(fmt, "SelectTenant({tenant_id})"),
            AuthStep::Password { .. } => write!(fmt, "Password(_)"),
            AuthStep::RotatePassword { .. } => write!(fmt, "RotatePassword(_)"),
            AuthStep::TotpGenerate { .. } => write!(fmt, "TotpGenerate"),
            AuthStep::TotpVerify { .. } => write!(fmt, "TotpVerify(_)"),
            AuthStep::SecurityKeyRegister { label, .. } => {
                write!(fmt, "SecurityKeyRegister({label}, _)")
            }
            AuthStep::SecurityKeyAssert { .. } => write!(fmt, "SecurityKeyAssert(_)"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthRequest {
    pub step: AuthStep,
}

/// Explicit cancellation. Tolerates stale or already-invalid tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthCancelRequest {
    pub session_token: String,
    pub pre_auth_token: Option<String>,
}

/// A tenant a username could belong to, offered for disambiguation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TenantCandidate {
    pub tenant_id: Uuid,
    pub name: String,
}

/// The server side of the exchange: what the client must provide next, or
/// where it must go. Challenge-bearing states carry their challenge so the
/// ceremony needs no extra round trip.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthState {
    /// The username matched more than one enabled tenant.
    SelectTenant { candidates: Vec<TenantCandidate> },
    EnterPassword,
    /// The tenant federates this domain - hand off to the remote provider.
    AuthWithFederatedOidc { uri: Url },
    /// The tenant requires self-registration for unknown users.
    Register,
    /// The stored credential is flagged for mandatory rotation. The policy
    /// view is advisory for client-side pre-validation only.
    RotatePassword { policy: PasswordPolicyView },
    ConfigureTotp,
    /// Submit a code. The enrolment secret is present exactly once, in the
    /// response to `TotpGenerate`; absent when validating an existing
    /// credential.
    ValidateTotp { secret: Option<TotpSecret> },
    ConfigureSecurityKey {
        challenge: Box<CreationChallengeResponse>,
    },
    ValidateSecurityKey {
        challenge: Box<RequestChallengeResponse>,
    },
    RedirectBackToApplication { uri: Url },
    RedirectToIamPortal {
        uri: Url,
        access_token: String,
        expiry_secs: u64,
    },
    Cancelled,
    Denied { error: OperationError },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    /// Token for the next step. Absent on terminal states.
    pub session_token: Option<String>,
    pub state: AuthState,
    /// Feedback on a rejected but retryable step, such as a rotation
    /// candidate that failed a policy rule. Terminal failures use
    /// `AuthState::Denied` instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

/// Advisory client-side mirror of the tenant password policy. The server
/// re-validates regardless.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PasswordPolicyView {
    pub min_length: usize,
    pub max_length: usize,
    pub require_digit: bool,
    pub require_lowercase: bool,
    pub require_uppercase: bool,
    pub require_special: bool,
    pub allowed_special: String,
    pub max_repeat_run: usize,
}
