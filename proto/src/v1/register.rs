use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;
use uuid::Uuid;

use webauthn_rs_proto::{CreationChallengeResponse, RegisterPublicKeyCredential};

use crate::v1::{PasswordPolicyView, TotpSecret};
use crate::OperationError;

// Registration mirrors the authentication exchange: server-driven steps,
// one single-use session token per transition. Optional steps accept an
// explicit skip; steps the tenant policy requires cannot be skipped.

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterStep {
    /// Open an enrolment with the profile fields.
    Init {
        username: String,
        displayname: String,
        email: String,
        tenant_id: Option<Uuid>,
    },
    SetPassword {
        session_token: String,
        password: String,
    },
    BackupEmail {
        session_token: String,
        email: Option<String>,
        #[serde(default)]
        skip: bool,
    },
    DuressPassword {
        session_token: String,
        password: Option<String>,
        #[serde(default)]
        skip: bool,
    },
    VerifyEmail {
        session_token: String,
        code: String,
    },
    TotpGenerate {
        session_token: String,
        #[serde(default)]
        skip: bool,
    },
    TotpVerify {
        session_token: String,
        totp: u32,
    },
    SecurityKeyRegister {
        session_token: String,
        label: String,
        response: Option<Box<RegisterPublicKeyCredential>>,
        #[serde(default)]
        skip: bool,
    },
}

impl fmt::Debug for RegisterStep {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RegisterStep::Init { username, .. } => write!(fmt, "Init({username})"),
            RegisterStep::SetPassword { .. } => write!(fmt, "SetPassword(_)"),
            RegisterStep::BackupEmail { skip, .. } => write!(fmt, "BackupEmail(skip: {skip})"),
            RegisterStep::DuressPassword { skip, .. } => {
                write!(fmt, "DuressPassword(skip: {skip})")
            }
            RegisterStep::VerifyEmail { .. } => write!(fmt, "VerifyEmail(_)"),
            RegisterStep::TotpGenerate { skip, .. } => write!(fmt, "TotpGenerate(skip: {skip})"),
            RegisterStep::TotpVerify { .. } => write!(fmt, "TotpVerify(_)"),
            RegisterStep::SecurityKeyRegister { label, skip, .. } => {
                write!(fmt, "SecurityKeyRegister({label}, skip: {skip})")
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub step: RegisterStep,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterCancelRequest {
    pub session_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterState {
    SetPassword { policy: PasswordPolicyView },
    AddBackupEmail,
    AddDuressPassword,
    /// A code has been sent out-of-band to the profile email address.
    VerifyEmail,
    ConfigureTotp { required: bool },
    ValidateTotp { secret: TotpSecret },
    ConfigureSecurityKey {
        required: bool,
        challenge: Box<CreationChallengeResponse>,
    },
    Complete { uri: Url },
    Cancelled,
    Denied { error: OperationError },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Token for the next step. Absent on terminal states.
    pub session_token: Option<String>,
    pub state: RegisterState,
    /// Feedback on a rejected but retryable step. Terminal failures use
    /// `RegisterState::Denied` instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}
