//! The authentication state machine. One value of [`AuthSession`] is the
//! complete suspended state of a login attempt between round trips; every
//! step consumes the current snapshot and produces a fresh one (or a
//! terminal outcome), so a transition can never observe or create a
//! half-mutated attempt.
//!
//! When a tenant mandates both second factors, the security key is always
//! challenged or enrolled before TOTP. Factors the account has enrolled
//! are challenged even when the tenant does not mandate them.

use std::mem;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use webauthn_rs_proto::{PublicKeyCredential, RegisterPublicKeyCredential};

use vigil_proto::v1::{AuthState, TenantCandidate};

use crate::be::AccountStore;
use crate::credential::totp::{Totp, TOTP_DEFAULT_STEP};
use crate::credential::CryptoPolicy;
use crate::idm::account::{Account, PasswordVerdict};
use crate::idm::challenge::MfaChallengeEngine;
use crate::idm::delayed::{DelayedAction, PasswordUpgrade, SecurityKeyCounterIncrement};
use crate::idm::token::SessionTokenKind;
use crate::prelude::*;
use crate::tenant::{Tenant, TenantPolicyResolver};
use crate::utils::opaque_token_from_random;

const MINIMUM_USERNAME_LENGTH: usize = 3;
const PORTAL_ACCESS_TOKEN_EXPIRY_SECS: u64 = 3600;

/// Everything a transition may consult or notify. Borrowed per step so the
/// state machine itself owns no shared resources.
pub struct AuthSessionContext<'a> {
    pub accounts: &'a dyn AccountStore,
    pub resolver: &'a dyn TenantPolicyResolver,
    pub challenges: &'a MfaChallengeEngine,
    pub crypto_policy: &'a CryptoPolicy,
    pub async_tx: &'a UnboundedSender<DelayedAction>,
    pub ct: Duration,
}

/// A step input with the session token already stripped by the caller.
pub enum AuthInput {
    SelectTenant { tenant_id: Uuid },
    Password { password: String },
    RotatePassword { new_password: String },
    TotpGenerate,
    TotpVerify { totp: u32 },
    SecurityKeyRegister {
        label: String,
        response: Box<RegisterPublicKeyCredential>,
    },
    SecurityKeyAssert { response: Box<PublicKeyCredential> },
}

#[derive(Clone)]
enum AuthSessionState {
    SelectTenant { candidates: Vec<Arc<Tenant>> },
    EnterPassword,
    RotatePassword,
    ConfigureTotp { pending: Option<Totp> },
    ValidateTotp,
    ConfigureSecurityKey { challenge_id: Uuid },
    ValidateSecurityKey { challenge_id: Uuid },
}

/// The result of one transition: the replacement snapshot when the attempt
/// continues, the wire state to announce, and retryable feedback if any.
pub struct AuthOutput {
    pub session: Option<AuthSession>,
    pub state: AuthState,
    pub error: Option<OperationError>,
}

impl AuthOutput {
    fn terminal(state: AuthState) -> Self {
        AuthOutput {
            session: None,
            state,
            error: None,
        }
    }

    fn denied(error: OperationError) -> Self {
        Self::terminal(AuthState::Denied { error })
    }

    fn along(session: AuthSession, state: AuthState) -> Self {
        AuthOutput {
            session: Some(session),
            state,
            error: None,
        }
    }

    fn retry(session: AuthSession, state: AuthState, error: OperationError) -> Self {
        AuthOutput {
            session: Some(session),
            state,
            error: Some(error),
        }
    }
}

#[derive(Clone)]
pub struct AuthSession {
    username: String,
    pre_auth_token: Option<String>,
    /// Policy snapshot taken when the tenant was resolved.
    tenant: Option<Arc<Tenant>>,
    account_id: Option<Uuid>,
    /// The presented credential was the duress password. The flow must
    /// stay externally indistinguishable from an ordinary success.
    duress: bool,
    security_key_done: bool,
    totp_done: bool,
    state: AuthSessionState,
}

impl AuthSession {
    /// Open an attempt from a submitted username. Resolves the candidate
    /// tenants and either asks for disambiguation, hands off to a
    /// federated provider, bounces to registration, or asks for the
    /// password.
    pub fn begin(
        username: &str,
        tenant_hint: Option<Uuid>,
        pre_auth_token: Option<String>,
        ctx: &AuthSessionContext<'_>,
    ) -> AuthOutput {
        let username = username.trim();
        if username.chars().count() < MINIMUM_USERNAME_LENGTH {
            security_info!("authentication init rejected, username below minimum length");
            return AuthOutput::denied(OperationError::InvalidCredential);
        }

        let pool: Vec<Arc<Tenant>> = match tenant_hint {
            Some(id) => ctx.resolver.resolve(id).into_iter().collect(),
            None => ctx.resolver.tenants(),
        };

        let mut candidates = Vec::new();
        for tenant in pool {
            if !tenant.enabled {
                continue;
            }
            let has_account = match ctx.accounts.get_by_username(tenant.tenant_id, username) {
                Ok(maybe) => maybe.map(|a| a.enabled).unwrap_or(false),
                Err(e) => return AuthOutput::denied(e),
            };
            if tenant.federated_uri_for(username).is_some()
                || has_account
                || tenant.allow_self_registration
            {
                candidates.push(tenant);
            }
        }
        candidates.sort_by(|a, b| a.name.cmp(&b.name));

        match candidates.len() {
            0 => {
                security_info!(%username, "no candidate tenant for authentication init");
                AuthOutput::denied(OperationError::InvalidCredential)
            }
            1 => {
                let tenant = candidates.swap_remove(0);
                Self::proceed_for_tenant(username, pre_auth_token, tenant, ctx)
            }
            _ => {
                let wire: Vec<TenantCandidate> = candidates
                    .iter()
                    .map(|t| TenantCandidate {
                        tenant_id: t.tenant_id,
                        name: t.name.clone(),
                    })
                    .collect();
                let session = AuthSession {
                    username: username.to_string(),
                    pre_auth_token,
                    tenant: None,
                    account_id: None,
                    duress: false,
                    security_key_done: false,
                    totp_done: false,
                    state: AuthSessionState::SelectTenant { candidates },
                };
                AuthOutput::along(session, AuthState::SelectTenant { candidates: wire })
            }
        }
    }

    fn proceed_for_tenant(
        username: &str,
        pre_auth_token: Option<String>,
        tenant: Arc<Tenant>,
        ctx: &AuthSessionContext<'_>,
    ) -> AuthOutput {
        if let Some(uri) = tenant.federated_uri_for(username) {
            security_info!(%username, tenant = %tenant.name, "handing off to federated provider");
            return AuthOutput::terminal(AuthState::AuthWithFederatedOidc { uri: uri.clone() });
        }

        let account = match ctx.accounts.get_by_username(tenant.tenant_id, username) {
            Ok(maybe) => maybe,
            Err(e) => return AuthOutput::denied(e),
        };

        match account {
            Some(account) if account.enabled => {
                let session = AuthSession {
                    username: username.to_string(),
                    pre_auth_token,
                    tenant: Some(tenant),
                    account_id: Some(account.uuid),
                    duress: false,
                    security_key_done: false,
                    totp_done: false,
                    state: AuthSessionState::EnterPassword,
                };
                AuthOutput::along(session, AuthState::EnterPassword)
            }
            _ if tenant.allow_self_registration => AuthOutput::terminal(AuthState::Register),
            _ => {
                security_info!(%username, tenant = %tenant.name, "unknown or disabled account");
                AuthOutput::denied(OperationError::InvalidCredential)
            }
        }
    }

    /// Advance the attempt by one step. The snapshot is consumed whether
    /// the step is accepted or not - the caller already spent the session
    /// token that redeemed it.
    pub fn step(mut self, input: AuthInput, ctx: &AuthSessionContext<'_>) -> AuthOutput {
        let state = mem::replace(&mut self.state, AuthSessionState::EnterPassword);
        match (state, input) {
            (
                AuthSessionState::SelectTenant { candidates },
                AuthInput::SelectTenant { tenant_id },
            ) => match candidates.into_iter().find(|t| t.tenant_id == tenant_id) {
                Some(tenant) => Self::proceed_for_tenant(
                    &self.username,
                    self.pre_auth_token.clone(),
                    tenant,
                    ctx,
                ),
                None => {
                    security_info!("selected tenant was not a candidate");
                    AuthOutput::denied(OperationError::InvalidRequestState)
                }
            },
            (AuthSessionState::EnterPassword, AuthInput::Password { password }) => {
                self.handle_password(&password, ctx)
            }
            (AuthSessionState::RotatePassword, AuthInput::RotatePassword { new_password }) => {
                self.handle_rotation(&new_password, ctx)
            }
            (AuthSessionState::ConfigureTotp { .. }, AuthInput::TotpGenerate) => {
                self.handle_totp_generate(ctx)
            }
            (
                AuthSessionState::ConfigureTotp { pending: Some(pending) },
                AuthInput::TotpVerify { totp },
            ) => self.handle_totp_enrol(pending, totp, ctx),
            (AuthSessionState::ValidateTotp, AuthInput::TotpVerify { totp }) => {
                self.handle_totp_verify(totp, ctx)
            }
            (
                AuthSessionState::ConfigureSecurityKey { challenge_id },
                AuthInput::SecurityKeyRegister { label, response },
            ) => self.handle_securitykey_register(challenge_id, &label, &response, ctx),
            (
                AuthSessionState::ValidateSecurityKey { challenge_id },
                AuthInput::SecurityKeyAssert { response },
            ) => self.handle_securitykey_assert(challenge_id, &response, ctx),
            (_, _) => {
                security_error!("authentication step out of sequence");
                AuthOutput::denied(OperationError::InvalidRequestState)
            }
        }
    }

    fn tenant(&self) -> Result<Arc<Tenant>, OperationError> {
        self.tenant.clone().ok_or(OperationError::InvalidState)
    }

    fn load_account(&self, ctx: &AuthSessionContext<'_>) -> Result<Account, OperationError> {
        let account_id = self.account_id.ok_or(OperationError::InvalidState)?;
        ctx.accounts
            .get_by_uuid(account_id)?
            .filter(|a| a.enabled)
            .ok_or(OperationError::InvalidState)
    }

    fn handle_password(mut self, password: &str, ctx: &AuthSessionContext<'_>) -> AuthOutput {
        let tenant = match self.tenant() {
            Ok(t) => t,
            Err(e) => return AuthOutput::denied(e),
        };
        let account = match self.load_account(ctx) {
            Ok(a) => a,
            Err(e) => return AuthOutput::denied(e),
        };

        match account.verify_password(password) {
            Ok(PasswordVerdict::Accept {
                duress,
                upgrade_required,
            }) => {
                if duress {
                    security_critical!(
                        username = %self.username,
                        tenant = %tenant.name,
                        "duress credential presented, continuing with flagged attempt"
                    );
                    self.duress = true;
                } else if upgrade_required {
                    let action = DelayedAction::PwUpgrade(PasswordUpgrade {
                        account_id: account.uuid,
                        existing_password: password.to_string(),
                    });
                    if ctx.async_tx.send(action).is_err() {
                        admin_warn!("delayed action queue unavailable, skipping password upgrade");
                    }
                }

                if account.must_rotate_password {
                    self.state = AuthSessionState::RotatePassword;
                    let policy = tenant.password.to_view();
                    AuthOutput::along(self, AuthState::RotatePassword { policy })
                } else {
                    self.next_mfa_step(account, ctx)
                }
            }
            Ok(PasswordVerdict::Reject) => {
                security_info!(username = %self.username, "credential verification failed");
                AuthOutput::denied(OperationError::InvalidCredential)
            }
            Err(e) => {
                security_error!(?e, "unable to verify credential");
                AuthOutput::denied(e)
            }
        }
    }

    fn handle_rotation(mut self, new_password: &str, ctx: &AuthSessionContext<'_>) -> AuthOutput {
        let tenant = match self.tenant() {
            Ok(t) => t,
            Err(e) => return AuthOutput::denied(e),
        };

        if let Err(feedback) = tenant.password.check_password(new_password) {
            security_info!("rotation candidate rejected by tenant policy");
            self.state = AuthSessionState::RotatePassword;
            let policy = tenant.password.to_view();
            return AuthOutput::retry(
                self,
                AuthState::RotatePassword { policy },
                OperationError::PasswordQuality(feedback),
            );
        }

        let mut account = match self.load_account(ctx) {
            Ok(a) => a,
            Err(e) => return AuthOutput::denied(e),
        };
        if let Err(e) = account.set_password(ctx.crypto_policy, new_password) {
            security_error!(?e, "unable to derive replacement credential");
            return AuthOutput::denied(e);
        }
        // Clearing the flag rides the same put as the new credential, so
        // the pair can never be observed half-applied.
        account.must_rotate_password = false;
        if let Err(e) = ctx.accounts.put(account.clone()) {
            return AuthOutput::denied(e);
        }
        security_info!(username = %self.username, "password rotated");
        self.next_mfa_step(account, ctx)
    }

    fn handle_totp_generate(mut self, _ctx: &AuthSessionContext<'_>) -> AuthOutput {
        let tenant = match self.tenant() {
            Ok(t) => t,
            Err(e) => return AuthOutput::denied(e),
        };
        let totp = Totp::generate_secure(TOTP_DEFAULT_STEP);
        let secret = totp.to_proto(&self.username, &tenant.name);
        self.state = AuthSessionState::ConfigureTotp {
            pending: Some(totp),
        };
        AuthOutput::along(
            self,
            AuthState::ValidateTotp {
                secret: Some(secret),
            },
        )
    }

    fn handle_totp_enrol(
        mut self,
        pending: Totp,
        totp: u32,
        ctx: &AuthSessionContext<'_>,
    ) -> AuthOutput {
        if pending.verify(totp, ctx.ct) {
            let mut account = match self.load_account(ctx) {
                Ok(a) => a,
                Err(e) => return AuthOutput::denied(e),
            };
            account.set_totp(pending);
            if let Err(e) = ctx.accounts.put(account.clone()) {
                return AuthOutput::denied(e);
            }
            self.totp_done = true;
            security_info!(username = %self.username, "totp enrolled during authentication");
            self.next_mfa_step(account, ctx)
        } else {
            // The enrolment secret stays pending - the user may simply
            // have typed ahead of their authenticator app.
            security_info!("totp enrolment code incorrect");
            self.state = AuthSessionState::ConfigureTotp {
                pending: Some(pending),
            };
            AuthOutput::retry(
                self,
                AuthState::ValidateTotp { secret: None },
                OperationError::InvalidCredential,
            )
        }
    }

    fn handle_totp_verify(mut self, totp: u32, ctx: &AuthSessionContext<'_>) -> AuthOutput {
        let account = match self.load_account(ctx) {
            Ok(a) => a,
            Err(e) => return AuthOutput::denied(e),
        };
        if account.verify_totp(totp, ctx.ct) {
            self.totp_done = true;
            self.next_mfa_step(account, ctx)
        } else {
            security_info!(username = %self.username, "totp verification failed");
            AuthOutput::denied(OperationError::InvalidCredential)
        }
    }

    fn handle_securitykey_register(
        mut self,
        challenge_id: Uuid,
        label: &str,
        response: &RegisterPublicKeyCredential,
        ctx: &AuthSessionContext<'_>,
    ) -> AuthOutput {
        let mut account = match self.load_account(ctx) {
            Ok(a) => a,
            Err(e) => return AuthOutput::denied(e),
        };
        match ctx.challenges.finish_securitykey_registration(
            challenge_id,
            account.uuid,
            SessionTokenKind::Authentication,
            response,
            ctx.ct,
        ) {
            Ok(key) => {
                account.add_security_key(label, key);
                if let Err(e) = ctx.accounts.put(account.clone()) {
                    return AuthOutput::denied(e);
                }
                // The registration ceremony proved possession, so the key
                // counts as validated for this attempt.
                self.security_key_done = true;
                security_info!(username = %self.username, "security key enrolled during authentication");
                self.next_mfa_step(account, ctx)
            }
            Err(e) => AuthOutput::denied(e),
        }
    }

    fn handle_securitykey_assert(
        mut self,
        challenge_id: Uuid,
        response: &PublicKeyCredential,
        ctx: &AuthSessionContext<'_>,
    ) -> AuthOutput {
        let account = match self.load_account(ctx) {
            Ok(a) => a,
            Err(e) => return AuthOutput::denied(e),
        };
        match ctx.challenges.finish_securitykey_authentication(
            challenge_id,
            account.uuid,
            SessionTokenKind::Authentication,
            response,
            ctx.ct,
        ) {
            Ok(auth_result) => {
                if auth_result.needs_update() {
                    let action =
                        DelayedAction::SecurityKeyCounterIncrement(SecurityKeyCounterIncrement {
                            account_id: account.uuid,
                            auth_result,
                        });
                    if ctx.async_tx.send(action).is_err() {
                        admin_warn!("delayed action queue unavailable, skipping counter update");
                    }
                }
                self.security_key_done = true;
                self.next_mfa_step(account, ctx)
            }
            Err(e) => AuthOutput::denied(e),
        }
    }

    /// Decide the next factor after the password (or after a completed
    /// factor). Security key strictly precedes TOTP.
    fn next_mfa_step(mut self, account: Account, ctx: &AuthSessionContext<'_>) -> AuthOutput {
        let tenant = match self.tenant() {
            Ok(t) => t,
            Err(e) => return AuthOutput::denied(e),
        };

        if !self.security_key_done && account.has_security_keys() {
            match ctx.challenges.begin_securitykey_authentication(
                &account,
                SessionTokenKind::Authentication,
                ctx.ct,
            ) {
                Ok((challenge_id, rcr)) => {
                    self.state = AuthSessionState::ValidateSecurityKey { challenge_id };
                    AuthOutput::along(
                        self,
                        AuthState::ValidateSecurityKey {
                            challenge: Box::new(rcr),
                        },
                    )
                }
                Err(e) => AuthOutput::denied(e),
            }
        } else if !self.security_key_done && tenant.mfa.require_security_key {
            match ctx.challenges.begin_securitykey_registration(
                &account,
                SessionTokenKind::Authentication,
                ctx.ct,
            ) {
                Ok((challenge_id, ccr)) => {
                    self.state = AuthSessionState::ConfigureSecurityKey { challenge_id };
                    AuthOutput::along(
                        self,
                        AuthState::ConfigureSecurityKey {
                            challenge: Box::new(ccr),
                        },
                    )
                }
                Err(e) => AuthOutput::denied(e),
            }
        } else if !self.totp_done && account.has_totp() {
            self.state = AuthSessionState::ValidateTotp;
            AuthOutput::along(self, AuthState::ValidateTotp { secret: None })
        } else if !self.totp_done && tenant.mfa.require_totp {
            self.state = AuthSessionState::ConfigureTotp { pending: None };
            AuthOutput::along(self, AuthState::ConfigureTotp)
        } else {
            self.success(&tenant)
        }
    }

    fn success(self, tenant: &Tenant) -> AuthOutput {
        if self.duress {
            security_critical!(
                username = %self.username,
                tenant = %tenant.name,
                "authentication completed under duress"
            );
        } else {
            security_info!(
                username = %self.username,
                tenant = %tenant.name,
                "authentication success"
            );
        }
        match &self.pre_auth_token {
            Some(_) => AuthOutput::terminal(AuthState::RedirectBackToApplication {
                uri: tenant.application_uri.clone(),
            }),
            None => AuthOutput::terminal(AuthState::RedirectToIamPortal {
                uri: tenant.portal_uri.clone(),
                access_token: opaque_token_from_random(),
                expiry_secs: PORTAL_ACCESS_TOKEN_EXPIRY_SECS,
            }),
        }
    }
}
