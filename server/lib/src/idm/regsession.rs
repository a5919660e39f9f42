//! The registration state machine. Enrolment walks profile → password →
//! optional backup email → optional duress password → email verification →
//! TOTP → security key → complete, with the same one-token-per-step
//! discipline as authentication. Optional steps take an explicit skip;
//! steps the tenant mandates cannot be skipped. The account record is
//! built up privately inside the session and persisted in a single insert
//! at completion.

use std::mem;
use std::sync::Arc;

use webauthn_rs_proto::RegisterPublicKeyCredential;

use vigil_proto::v1::RegisterState;

use crate::be::{AccountStore, EmailSender};
use crate::credential::totp::{Totp, TOTP_DEFAULT_STEP};
use crate::credential::CryptoPolicy;
use crate::idm::account::Account;
use crate::idm::challenge::MfaChallengeEngine;
use crate::idm::token::SessionTokenKind;
use crate::prelude::*;
use crate::tenant::{Tenant, TenantPolicyResolver};
use crate::utils::verification_code_from_random;

const MINIMUM_USERNAME_LENGTH: usize = 3;
pub const EMAIL_CODE_TTL: Duration = Duration::from_secs(3600);

pub struct RegSessionContext<'a> {
    pub accounts: &'a dyn AccountStore,
    pub resolver: &'a dyn TenantPolicyResolver,
    pub challenges: &'a MfaChallengeEngine,
    pub crypto_policy: &'a CryptoPolicy,
    pub email: &'a dyn EmailSender,
    pub ct: Duration,
}

/// A step input with the session token already stripped by the caller.
pub enum RegInput {
    SetPassword { password: String },
    BackupEmail { email: Option<String>, skip: bool },
    DuressPassword { password: Option<String>, skip: bool },
    VerifyEmail { code: String },
    TotpGenerate { skip: bool },
    TotpVerify { totp: u32 },
    SecurityKeyRegister {
        label: String,
        response: Option<Box<RegisterPublicKeyCredential>>,
        skip: bool,
    },
}

#[derive(Clone)]
enum RegSessionState {
    SetPassword,
    AddBackupEmail,
    AddDuressPassword,
    VerifyEmail { code: String, expires_at: Duration },
    ConfigureTotp { pending: Option<Totp> },
    ConfigureSecurityKey { challenge_id: Uuid },
}

pub struct RegOutput {
    pub session: Option<RegSession>,
    pub state: RegisterState,
    pub error: Option<OperationError>,
}

impl RegOutput {
    fn terminal(state: RegisterState) -> Self {
        RegOutput {
            session: None,
            state,
            error: None,
        }
    }

    fn denied(error: OperationError) -> Self {
        Self::terminal(RegisterState::Denied { error })
    }

    fn along(session: RegSession, state: RegisterState) -> Self {
        RegOutput {
            session: Some(session),
            state,
            error: None,
        }
    }

    fn retry(session: RegSession, state: RegisterState, error: OperationError) -> Self {
        RegOutput {
            session: Some(session),
            state,
            error: Some(error),
        }
    }
}

#[derive(Clone)]
pub struct RegSession {
    /// The record under construction. Not visible to lookups until the
    /// final put at completion.
    account: Account,
    tenant: Arc<Tenant>,
    state: RegSessionState,
}

impl RegSession {
    /// Open an enrolment from the submitted profile fields.
    pub fn begin(
        username: &str,
        displayname: &str,
        email: &str,
        tenant_hint: Option<Uuid>,
        ctx: &RegSessionContext<'_>,
    ) -> RegOutput {
        let username = username.trim();
        if username.chars().count() < MINIMUM_USERNAME_LENGTH || !email.contains('@') {
            security_info!("registration init rejected, malformed profile");
            return RegOutput::denied(OperationError::InvalidRequestState);
        }

        let mut open: Vec<Arc<Tenant>> = match tenant_hint {
            Some(id) => ctx.resolver.resolve(id).into_iter().collect(),
            None => ctx.resolver.tenants(),
        };
        open.retain(|t| t.enabled && t.allow_self_registration);

        let tenant = match open.len() {
            1 => open.swap_remove(0),
            0 => {
                security_info!("no tenant permits self registration for this request");
                return RegOutput::denied(OperationError::InsufficientPermission);
            }
            _ => {
                // Registration has no disambiguation step - the caller must
                // name the tenant.
                security_info!("ambiguous tenant for registration init");
                return RegOutput::denied(OperationError::InvalidRequestState);
            }
        };

        match ctx.accounts.get_by_username(tenant.tenant_id, username) {
            Ok(Some(_)) => {
                security_info!(%username, "registration init for an existing username");
                return RegOutput::denied(OperationError::InvalidCredential);
            }
            Ok(None) => {}
            Err(e) => return RegOutput::denied(e),
        }

        let account = Account::new(tenant.tenant_id, username, displayname, email);
        let policy = tenant.password.to_view();
        let session = RegSession {
            account,
            tenant,
            state: RegSessionState::SetPassword,
        };
        RegOutput::along(session, RegisterState::SetPassword { policy })
    }

    pub fn step(mut self, input: RegInput, ctx: &RegSessionContext<'_>) -> RegOutput {
        let state = mem::replace(&mut self.state, RegSessionState::SetPassword);
        match (state, input) {
            (RegSessionState::SetPassword, RegInput::SetPassword { password }) => {
                self.handle_set_password(&password, ctx)
            }
            (RegSessionState::AddBackupEmail, RegInput::BackupEmail { email, skip }) => {
                self.handle_backup_email(email, skip, ctx)
            }
            (RegSessionState::AddDuressPassword, RegInput::DuressPassword { password, skip }) => {
                self.handle_duress_password(password, skip, ctx)
            }
            (
                RegSessionState::VerifyEmail { code, expires_at },
                RegInput::VerifyEmail { code: submitted },
            ) => self.handle_verify_email(&code, expires_at, &submitted, ctx),
            (RegSessionState::ConfigureTotp { .. }, RegInput::TotpGenerate { skip }) => {
                self.handle_totp_generate(skip, ctx)
            }
            (
                RegSessionState::ConfigureTotp { pending: Some(pending) },
                RegInput::TotpVerify { totp },
            ) => self.handle_totp_verify(pending, totp, ctx),
            (
                RegSessionState::ConfigureSecurityKey { challenge_id },
                RegInput::SecurityKeyRegister {
                    label,
                    response,
                    skip,
                },
            ) => self.handle_securitykey(challenge_id, &label, response, skip, ctx),
            (_, _) => {
                security_error!("registration step out of sequence");
                RegOutput::denied(OperationError::InvalidRequestState)
            }
        }
    }

    fn handle_set_password(mut self, password: &str, ctx: &RegSessionContext<'_>) -> RegOutput {
        if let Err(feedback) = self.tenant.password.check_password(password) {
            security_info!("registration password rejected by tenant policy");
            let policy = self.tenant.password.to_view();
            self.state = RegSessionState::SetPassword;
            return RegOutput::retry(
                self,
                RegisterState::SetPassword { policy },
                OperationError::PasswordQuality(feedback),
            );
        }
        if let Err(e) = self.account.set_password(ctx.crypto_policy, password) {
            security_error!(?e, "unable to derive credential");
            return RegOutput::denied(e);
        }
        self.state = RegSessionState::AddBackupEmail;
        RegOutput::along(self, RegisterState::AddBackupEmail)
    }

    fn handle_backup_email(
        mut self,
        email: Option<String>,
        skip: bool,
        _ctx: &RegSessionContext<'_>,
    ) -> RegOutput {
        if !skip {
            match email {
                Some(addr) if addr.contains('@') => {
                    self.account.backup_email = Some(addr);
                }
                _ => {
                    self.state = RegSessionState::AddBackupEmail;
                    return RegOutput::retry(
                        self,
                        RegisterState::AddBackupEmail,
                        OperationError::InvalidRequestState,
                    );
                }
            }
        }
        self.state = RegSessionState::AddDuressPassword;
        RegOutput::along(self, RegisterState::AddDuressPassword)
    }

    fn handle_duress_password(
        mut self,
        password: Option<String>,
        skip: bool,
        ctx: &RegSessionContext<'_>,
    ) -> RegOutput {
        if !skip {
            let password = match password {
                Some(p) => p,
                None => {
                    self.state = RegSessionState::AddDuressPassword;
                    return RegOutput::retry(
                        self,
                        RegisterState::AddDuressPassword,
                        OperationError::InvalidRequestState,
                    );
                }
            };
            // The duress password faces the same composition rules as the
            // primary.
            if let Err(feedback) = self.tenant.password.check_password(&password) {
                self.state = RegSessionState::AddDuressPassword;
                return RegOutput::retry(
                    self,
                    RegisterState::AddDuressPassword,
                    OperationError::PasswordQuality(feedback),
                );
            }
            if let Err(e) = self.account.set_duress_password(ctx.crypto_policy, &password) {
                security_error!(?e, "unable to derive duress credential");
                return RegOutput::denied(e);
            }
        }
        self.send_email_code(ctx)
    }

    fn send_email_code(mut self, ctx: &RegSessionContext<'_>) -> RegOutput {
        let code = verification_code_from_random();
        if let Err(e) = ctx
            .email
            .send_verification_code(&self.account.email, &code)
        {
            admin_error!(?e, "unable to deliver verification code");
            return RegOutput::denied(e);
        }
        self.state = RegSessionState::VerifyEmail {
            code,
            expires_at: ctx.ct + EMAIL_CODE_TTL,
        };
        RegOutput::along(self, RegisterState::VerifyEmail)
    }

    fn handle_verify_email(
        mut self,
        expected: &str,
        expires_at: Duration,
        submitted: &str,
        ctx: &RegSessionContext<'_>,
    ) -> RegOutput {
        // Expired and incorrect are deliberately indistinguishable.
        if ctx.ct >= expires_at || submitted.trim() != expected {
            security_info!("email verification failed");
            return RegOutput::denied(OperationError::InvalidOrExpiredChallenge);
        }
        let required = self.tenant.mfa.require_totp;
        self.state = RegSessionState::ConfigureTotp { pending: None };
        RegOutput::along(self, RegisterState::ConfigureTotp { required })
    }

    fn handle_totp_generate(mut self, skip: bool, ctx: &RegSessionContext<'_>) -> RegOutput {
        if skip {
            if self.tenant.mfa.require_totp {
                security_info!("attempt to skip a mandated totp enrolment");
                self.state = RegSessionState::ConfigureTotp { pending: None };
                return RegOutput::retry(
                    self,
                    RegisterState::ConfigureTotp { required: true },
                    OperationError::InsufficientPermission,
                );
            }
            return self.enter_securitykey_stage(ctx);
        }
        let totp = Totp::generate_secure(TOTP_DEFAULT_STEP);
        let secret = totp.to_proto(&self.account.username, &self.tenant.name);
        self.state = RegSessionState::ConfigureTotp {
            pending: Some(totp),
        };
        RegOutput::along(self, RegisterState::ValidateTotp { secret })
    }

    fn handle_totp_verify(
        mut self,
        pending: Totp,
        totp: u32,
        ctx: &RegSessionContext<'_>,
    ) -> RegOutput {
        if pending.verify(totp, ctx.ct) {
            self.account.set_totp(pending);
            self.enter_securitykey_stage(ctx)
        } else {
            security_info!("totp enrolment code incorrect");
            let secret = pending.to_proto(&self.account.username, &self.tenant.name);
            self.state = RegSessionState::ConfigureTotp {
                pending: Some(pending),
            };
            RegOutput::retry(
                self,
                RegisterState::ValidateTotp { secret },
                OperationError::InvalidCredential,
            )
        }
    }

    fn enter_securitykey_stage(mut self, ctx: &RegSessionContext<'_>) -> RegOutput {
        let required = self.tenant.mfa.require_security_key;
        match ctx.challenges.begin_securitykey_registration(
            &self.account,
            SessionTokenKind::Registration,
            ctx.ct,
        ) {
            Ok((challenge_id, ccr)) => {
                self.state = RegSessionState::ConfigureSecurityKey { challenge_id };
                RegOutput::along(
                    self,
                    RegisterState::ConfigureSecurityKey {
                        required,
                        challenge: Box::new(ccr),
                    },
                )
            }
            Err(e) => RegOutput::denied(e),
        }
    }

    fn handle_securitykey(
        mut self,
        challenge_id: Uuid,
        label: &str,
        response: Option<Box<RegisterPublicKeyCredential>>,
        skip: bool,
        ctx: &RegSessionContext<'_>,
    ) -> RegOutput {
        if skip {
            if self.tenant.mfa.require_security_key {
                security_info!("attempt to skip a mandated security key enrolment");
                // A skipped ceremony spends nothing - reissue a challenge
                // so the client can still complete.
                return self.enter_securitykey_stage(ctx);
            }
            return self.complete(ctx);
        }
        let response = match response {
            Some(r) => r,
            None => {
                security_error!("security key step with neither response nor skip");
                return RegOutput::denied(OperationError::InvalidRequestState);
            }
        };
        match ctx.challenges.finish_securitykey_registration(
            challenge_id,
            self.account.uuid,
            SessionTokenKind::Registration,
            &response,
            ctx.ct,
        ) {
            Ok(key) => {
                self.account.add_security_key(label, key);
                self.complete(ctx)
            }
            Err(e) => RegOutput::denied(e),
        }
    }

    fn complete(self, ctx: &RegSessionContext<'_>) -> RegOutput {
        // The store checks the name and inserts under one guard; this is
        // the only moment the account becomes visible to lookups.
        match ctx.accounts.create(self.account.clone()) {
            Ok(true) => {}
            Ok(false) => {
                security_info!(
                    username = %self.account.username,
                    "registration lost the race for this username"
                );
                return RegOutput::denied(OperationError::InvalidCredential);
            }
            Err(e) => return RegOutput::denied(e),
        }
        security_info!(
            username = %self.account.username,
            tenant = %self.tenant.name,
            "registration complete"
        );
        RegOutput::terminal(RegisterState::Complete {
            uri: self.tenant.portal_uri.clone(),
        })
    }
}
