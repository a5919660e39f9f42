//! The server-side owner of the protocol core. `IdmServer` maps wire
//! steps onto the state machines, spending and reissuing a session token
//! on every transition, and normalises every error before it crosses the
//! boundary. `IdmServerDelayed` is the drain side of the delayed action
//! queue.

use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use vigil_proto::v1::{
    AuthCancelRequest, AuthResponse, AuthState, AuthStep, RegisterCancelRequest, RegisterResponse,
    RegisterState, RegisterStep,
};

use crate::be::{AccountStore, EmailSender};
use crate::credential::CryptoPolicy;
use crate::idm::authsession::{AuthInput, AuthOutput, AuthSession, AuthSessionContext};
use crate::idm::challenge::MfaChallengeEngine;
use crate::idm::delayed::DelayedAction;
use crate::idm::regsession::{RegInput, RegOutput, RegSession, RegSessionContext};
use crate::idm::token::{SessionTokenKind, SessionTokenStore};
use crate::prelude::*;
use crate::tenant::TenantPolicyResolver;

/// A suspended attempt of either flavour, as held by the token store.
#[derive(Clone)]
pub enum SessionValue {
    Auth(Box<AuthSession>),
    Reg(Box<RegSession>),
}

pub struct IdmServer {
    accounts: Arc<dyn AccountStore>,
    resolver: Arc<dyn TenantPolicyResolver>,
    email: Arc<dyn EmailSender>,
    challenges: MfaChallengeEngine,
    crypto_policy: CryptoPolicy,
    sessions: SessionTokenStore<SessionValue>,
    async_tx: UnboundedSender<DelayedAction>,
}

/// Receiver half of the delayed action queue. Owned by the background
/// drain task, never by request handlers.
pub struct IdmServerDelayed {
    async_rx: UnboundedReceiver<DelayedAction>,
}

impl IdmServerDelayed {
    pub async fn next(&mut self) -> Option<DelayedAction> {
        self.async_rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DelayedAction> {
        self.async_rx.try_recv().ok()
    }
}

impl IdmServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        resolver: Arc<dyn TenantPolicyResolver>,
        email: Arc<dyn EmailSender>,
        rp_name: &str,
        rp_id: &str,
        origin: &Url,
        session_ttl: Duration,
        crypto_policy: CryptoPolicy,
    ) -> Result<(Self, IdmServerDelayed), OperationError> {
        let challenges = MfaChallengeEngine::new(rp_name, rp_id, origin)?;
        let (async_tx, async_rx) = unbounded_channel();
        Ok((
            IdmServer {
                accounts,
                resolver,
                email,
                challenges,
                crypto_policy,
                sessions: SessionTokenStore::new(session_ttl),
                async_tx,
            },
            IdmServerDelayed { async_rx },
        ))
    }

    fn auth_ctx(&self, ct: Duration) -> AuthSessionContext<'_> {
        AuthSessionContext {
            accounts: self.accounts.as_ref(),
            resolver: self.resolver.as_ref(),
            challenges: &self.challenges,
            crypto_policy: &self.crypto_policy,
            async_tx: &self.async_tx,
            ct,
        }
    }

    fn reg_ctx(&self, ct: Duration) -> RegSessionContext<'_> {
        RegSessionContext {
            accounts: self.accounts.as_ref(),
            resolver: self.resolver.as_ref(),
            challenges: &self.challenges,
            crypto_policy: &self.crypto_policy,
            email: self.email.as_ref(),
            ct,
        }
    }

    /// Apply one authentication step and seal the outcome into a wire
    /// response, reissuing the session token when the attempt continues.
    pub fn auth(&self, step: AuthStep, ct: Duration) -> AuthResponse {
        let ctx = self.auth_ctx(ct);
        let out = match step {
            AuthStep::Init {
                username,
                tenant_id,
                pre_auth_token,
            } => AuthSession::begin(&username, tenant_id, pre_auth_token, &ctx),
            AuthStep::SelectTenant {
                session_token,
                tenant_id,
            } => self.resume_auth(&session_token, AuthInput::SelectTenant { tenant_id }, &ctx),
            AuthStep::Password {
                session_token,
                password,
            } => self.resume_auth(&session_token, AuthInput::Password { password }, &ctx),
            AuthStep::RotatePassword {
                session_token,
                new_password,
            } => self.resume_auth(
                &session_token,
                AuthInput::RotatePassword { new_password },
                &ctx,
            ),
            AuthStep::TotpGenerate { session_token } => {
                self.resume_auth(&session_token, AuthInput::TotpGenerate, &ctx)
            }
            AuthStep::TotpVerify {
                session_token,
                totp,
            } => self.resume_auth(&session_token, AuthInput::TotpVerify { totp }, &ctx),
            AuthStep::SecurityKeyRegister {
                session_token,
                label,
                response,
            } => self.resume_auth(
                &session_token,
                AuthInput::SecurityKeyRegister { label, response },
                &ctx,
            ),
            AuthStep::SecurityKeyAssert {
                session_token,
                response,
            } => self.resume_auth(
                &session_token,
                AuthInput::SecurityKeyAssert { response },
                &ctx,
            ),
        };

        let AuthOutput {
            session,
            state,
            error,
        } = out;
        let session_token = session.map(|s| {
            self.sessions.issue(
                SessionTokenKind::Authentication,
                SessionValue::Auth(Box::new(s)),
                ct,
            )
        });
        let state = match state {
            AuthState::Denied { error } => AuthState::Denied {
                error: error.normalise(),
            },
            s => s,
        };
        AuthResponse {
            session_token,
            state,
            error: error.map(OperationError::normalise),
        }
    }

    fn resume_auth(
        &self,
        token: &str,
        input: AuthInput,
        ctx: &AuthSessionContext<'_>,
    ) -> AuthOutput {
        match self
            .sessions
            .consume(token, SessionTokenKind::Authentication, ctx.ct)
        {
            Ok(SessionValue::Auth(session)) => session.step(input, ctx),
            Ok(SessionValue::Reg(_)) | Err(_) => AuthOutput {
                session: None,
                state: AuthState::Denied {
                    error: OperationError::InvalidOrExpiredSession,
                },
                error: None,
            },
        }
    }

    /// Cancellation is idempotent and accepts anything the client still
    /// holds, valid or not.
    pub fn auth_cancel(&self, req: &AuthCancelRequest) -> AuthResponse {
        self.sessions.invalidate(&req.session_token);
        security_info!("authentication attempt cancelled");
        AuthResponse {
            session_token: None,
            state: AuthState::Cancelled,
            error: None,
        }
    }

    pub fn register(&self, step: RegisterStep, ct: Duration) -> RegisterResponse {
        let ctx = self.reg_ctx(ct);
        let out = match step {
            RegisterStep::Init {
                username,
                displayname,
                email,
                tenant_id,
            } => RegSession::begin(&username, &displayname, &email, tenant_id, &ctx),
            RegisterStep::SetPassword {
                session_token,
                password,
            } => self.resume_reg(&session_token, RegInput::SetPassword { password }, &ctx),
            RegisterStep::BackupEmail {
                session_token,
                email,
                skip,
            } => self.resume_reg(&session_token, RegInput::BackupEmail { email, skip }, &ctx),
            RegisterStep::DuressPassword {
                session_token,
                password,
                skip,
            } => self.resume_reg(
                &session_token,
                RegInput::DuressPassword { password, skip },
                &ctx,
            ),
            RegisterStep::VerifyEmail {
                session_token,
                code,
            } => self.resume_reg(&session_token, RegInput::VerifyEmail { code }, &ctx),
            RegisterStep::TotpGenerate {
                session_token,
                skip,
            } => self.resume_reg(&session_token, RegInput::TotpGenerate { skip }, &ctx),
            RegisterStep::TotpVerify {
                session_token,
                totp,
            } => self.resume_reg(&session_token, RegInput::TotpVerify { totp }, &ctx),
            RegisterStep::SecurityKeyRegister {
                session_token,
                label,
                response,
                skip,
            } => self.resume_reg(
                &session_token,
                RegInput::SecurityKeyRegister {
                    label,
                    response,
                    skip,
                },
                &ctx,
            ),
        };

        let RegOutput {
            session,
            state,
            error,
        } = out;
        let session_token = session.map(|s| {
            self.sessions.issue(
                SessionTokenKind::Registration,
                SessionValue::Reg(Box::new(s)),
                ct,
            )
        });
        let state = match state {
            RegisterState::Denied { error } => RegisterState::Denied {
                error: error.normalise(),
            },
            s => s,
        };
        RegisterResponse {
            session_token,
            state,
            error: error.map(OperationError::normalise),
        }
    }

    fn resume_reg(&self, token: &str, input: RegInput, ctx: &RegSessionContext<'_>) -> RegOutput {
        match self
            .sessions
            .consume(token, SessionTokenKind::Registration, ctx.ct)
        {
            Ok(SessionValue::Reg(session)) => session.step(input, ctx),
            Ok(SessionValue::Auth(_)) | Err(_) => RegOutput {
                session: None,
                state: RegisterState::Denied {
                    error: OperationError::InvalidOrExpiredSession,
                },
                error: None,
            },
        }
    }

    pub fn register_cancel(&self, req: &RegisterCancelRequest) -> RegisterResponse {
        self.sessions.invalidate(&req.session_token);
        security_info!("registration attempt cancelled");
        RegisterResponse {
            session_token: None,
            state: RegisterState::Cancelled,
            error: None,
        }
    }

    /// Apply one queued action. Failures are logged and swallowed - a lost
    /// delayed action never affects a completed authentication.
    pub fn process_delayed_action(&self, action: DelayedAction) {
        let r = match action {
            DelayedAction::PwUpgrade(pw) => self.process_pw_upgrade(pw),
            DelayedAction::SecurityKeyCounterIncrement(ski) => {
                self.process_sk_counter_increment(ski)
            }
        };
        if let Err(e) = r {
            admin_warn!(?e, "delayed action was not applied");
        }
    }

    fn process_pw_upgrade(
        &self,
        pw: crate::idm::delayed::PasswordUpgrade,
    ) -> Result<(), OperationError> {
        let mut account = match self.accounts.get_by_uuid(pw.account_id)? {
            Some(a) => a,
            None => return Ok(()),
        };
        // Only upgrade if the material is still the one we verified and
        // still tagged legacy - the user may have rotated in between.
        match account.verify_password(&pw.existing_password)? {
            crate::idm::account::PasswordVerdict::Accept {
                duress: false,
                upgrade_required: true,
            } => {
                account.set_password(&self.crypto_policy, &pw.existing_password)?;
                self.accounts.put(account)?;
                admin_info!("credential re-derived under the current scheme");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn process_sk_counter_increment(
        &self,
        ski: crate::idm::delayed::SecurityKeyCounterIncrement,
    ) -> Result<(), OperationError> {
        let mut account = match self.accounts.get_by_uuid(ski.account_id)? {
            Some(a) => a,
            None => return Ok(()),
        };
        if account.update_security_key_counter(&ski.auth_result) {
            self.accounts.put(account)?;
        }
        Ok(())
    }

    /// Housekeeping sweep for expired sessions and abandoned challenges.
    pub fn purge_expired(&self, ct: Duration) {
        self.sessions.purge_expired(ct);
        self.challenges.purge_expired(ct);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::be::{LoggingEmailSender, MemoryAccountStore};
    use crate::idm::account::{Account, PasswordVerdict};
    use crate::tenant::{test_tenant, StaticTenantResolver, Tenant};

    const TEST_PASSWORD: &str = "ntaoeuntnaoeuhraohuercaoeu";
    const TEST_CT: Duration = Duration::from_secs(1585369780);
    const TEST_TTL: Duration = Duration::from_secs(300);

    fn test_server(tenants: Vec<Tenant>) -> (IdmServer, IdmServerDelayed, Arc<MemoryAccountStore>) {
        let accounts = Arc::new(MemoryAccountStore::new());
        let resolver = Arc::new(StaticTenantResolver::new(tenants));
        let email = Arc::new(LoggingEmailSender);
        let origin = Url::parse("https://idm.example.com").expect("invalid origin");
        let (idms, delayed) = IdmServer::new(
            accounts.clone(),
            resolver,
            email,
            "Example",
            "idm.example.com",
            &origin,
            TEST_TTL,
            CryptoPolicy::minimum(),
        )
        .expect("failed to build idm server");
        (idms, delayed, accounts)
    }

    fn seed_account(accounts: &MemoryAccountStore, tenant_id: Uuid, username: &str) -> Account {
        let mut account = Account::new(tenant_id, username, "Alice", username);
        account
            .set_password(&CryptoPolicy::minimum(), TEST_PASSWORD)
            .expect("failed to set password");
        accounts.put(account.clone()).expect("failed to seed");
        account
    }

    #[test]
    fn test_idm_auth_wire_flow_and_replay() {
        let tenant = test_tenant();
        let (idms, _delayed, accounts) = test_server(vec![tenant.clone()]);
        seed_account(&accounts, tenant.tenant_id, "alice@example.com");

        let r = idms.auth(
            AuthStep::Init {
                username: "alice@example.com".to_string(),
                tenant_id: None,
                pre_auth_token: None,
            },
            TEST_CT,
        );
        assert!(matches!(r.state, AuthState::EnterPassword));
        let token = r.session_token.expect("expected a session token");

        let r = idms.auth(
            AuthStep::Password {
                session_token: token.clone(),
                password: TEST_PASSWORD.to_string(),
            },
            TEST_CT,
        );
        assert!(matches!(r.state, AuthState::RedirectToIamPortal { .. }));
        assert!(r.session_token.is_none());

        // The spent token no longer redeems anything.
        let r = idms.auth(
            AuthStep::Password {
                session_token: token,
                password: TEST_PASSWORD.to_string(),
            },
            TEST_CT,
        );
        assert!(matches!(
            r.state,
            AuthState::Denied {
                error: OperationError::InvalidOrExpiredSession
            }
        ));
    }

    #[test]
    fn test_idm_auth_cancel_idempotent() {
        let tenant = test_tenant();
        let (idms, _delayed, accounts) = test_server(vec![tenant.clone()]);
        seed_account(&accounts, tenant.tenant_id, "alice@example.com");

        let r = idms.auth(
            AuthStep::Init {
                username: "alice@example.com".to_string(),
                tenant_id: None,
                pre_auth_token: None,
            },
            TEST_CT,
        );
        let token = r.session_token.expect("expected a session token");

        let cancel = AuthCancelRequest {
            session_token: token.clone(),
            pre_auth_token: None,
        };
        let r = idms.auth_cancel(&cancel);
        assert!(matches!(r.state, AuthState::Cancelled));
        // Again, and with garbage - still the neutral outcome.
        let r = idms.auth_cancel(&cancel);
        assert!(matches!(r.state, AuthState::Cancelled));
        let r = idms.auth_cancel(&AuthCancelRequest {
            session_token: "never-issued".to_string(),
            pre_auth_token: None,
        });
        assert!(matches!(r.state, AuthState::Cancelled));

        // The cancelled token is dead.
        let r = idms.auth(
            AuthStep::Password {
                session_token: token,
                password: TEST_PASSWORD.to_string(),
            },
            TEST_CT,
        );
        assert!(matches!(
            r.state,
            AuthState::Denied {
                error: OperationError::InvalidOrExpiredSession
            }
        ));
    }

    #[test]
    fn test_idm_register_token_rejected_by_auth_flow() {
        let mut tenant = test_tenant();
        tenant.allow_self_registration = true;
        let (idms, _delayed, _accounts) = test_server(vec![tenant]);

        let r = idms.register(
            RegisterStep::Init {
                username: "alice@example.com".to_string(),
                displayname: "Alice".to_string(),
                email: "alice@example.com".to_string(),
                tenant_id: None,
            },
            TEST_CT,
        );
        assert!(matches!(r.state, RegisterState::SetPassword { .. }));
        let token = r.session_token.expect("expected a session token");

        // A registration token presented to the authentication flow is a
        // session error, and is spent by the attempt.
        let r = idms.auth(
            AuthStep::Password {
                session_token: token.clone(),
                password: TEST_PASSWORD.to_string(),
            },
            TEST_CT,
        );
        assert!(matches!(
            r.state,
            AuthState::Denied {
                error: OperationError::InvalidOrExpiredSession
            }
        ));
        let r = idms.register(
            RegisterStep::SetPassword {
                session_token: token,
                password: TEST_PASSWORD.to_string(),
            },
            TEST_CT,
        );
        assert!(matches!(
            r.state,
            RegisterState::Denied {
                error: OperationError::InvalidOrExpiredSession
            }
        ));
    }

    #[test]
    fn test_idm_session_inactivity_expiry() {
        let tenant = test_tenant();
        let (idms, _delayed, accounts) = test_server(vec![tenant.clone()]);
        seed_account(&accounts, tenant.tenant_id, "alice@example.com");

        let r = idms.auth(
            AuthStep::Init {
                username: "alice@example.com".to_string(),
                tenant_id: None,
                pre_auth_token: None,
            },
            TEST_CT,
        );
        let token = r.session_token.expect("expected a session token");

        let r = idms.auth(
            AuthStep::Password {
                session_token: token,
                password: TEST_PASSWORD.to_string(),
            },
            TEST_CT + TEST_TTL,
        );
        assert!(matches!(
            r.state,
            AuthState::Denied {
                error: OperationError::InvalidOrExpiredSession
            }
        ));
    }

    #[test]
    fn test_idm_delayed_pw_upgrade_applied() {
        let tenant = test_tenant();
        let (idms, mut delayed, accounts) = test_server(vec![tenant.clone()]);
        let mut account = Account::new(
            tenant.tenant_id,
            "legacy@example.com",
            "Legacy",
            "legacy@example.com",
        );
        let im_pw = "{SSHA512}JwrSUHkI7FTAfHRVR6KoFlSN0E3dmaQWARjZ+/UsShYlENOqDtFVU77HJLLrY2MuSp0jve52+pwtdVl2QUAHukQ0XUf5LDtM";
        account.import_password(im_pw).expect("failed to import");
        accounts.put(account).expect("failed to seed");

        let r = idms.auth(
            AuthStep::Init {
                username: "legacy@example.com".to_string(),
                tenant_id: None,
                pre_auth_token: None,
            },
            TEST_CT,
        );
        let token = r.session_token.expect("expected a session token");
        let r = idms.auth(
            AuthStep::Password {
                session_token: token,
                password: "password".to_string(),
            },
            TEST_CT,
        );
        assert!(matches!(r.state, AuthState::RedirectToIamPortal { .. }));

        let action = delayed.try_recv().expect("expected a queued action");
        idms.process_delayed_action(action);
        assert!(delayed.try_recv().is_none());

        // The stored material is now under the current scheme.
        let stored = accounts
            .get_by_username(tenant.tenant_id, "legacy@example.com")
            .expect("store failed")
            .expect("account vanished");
        assert_eq!(
            stored.verify_password("password").expect("verify failed"),
            PasswordVerdict::Accept {
                duress: false,
                upgrade_required: false
            }
        );
    }
}
