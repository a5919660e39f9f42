//! FIDO2 ceremony management. Challenges are bound to an account and to
//! the flow kind that requested them, live for five minutes, and are
//! consumed by being presented. Granular ceremony failures stay in the
//! security log; callers only ever see `InvalidOrExpiredChallenge`.

use concread::bptree::BptreeMap;

use webauthn_rs::prelude::{
    AuthenticationResult, CreationChallengeResponse, PublicKeyCredential,
    RegisterPublicKeyCredential, RequestChallengeResponse, SecurityKey, SecurityKeyAuthentication,
    SecurityKeyRegistration, Webauthn, WebauthnBuilder,
};

use crate::idm::account::Account;
use crate::idm::token::SessionTokenKind;
use crate::prelude::*;

pub const CHALLENGE_TTL: Duration = Duration::from_secs(300);

#[derive(Clone)]
enum CeremonyState {
    Registration(SecurityKeyRegistration),
    Authentication(SecurityKeyAuthentication),
}

#[derive(Clone)]
struct Fido2Challenge {
    account_id: Uuid,
    kind: SessionTokenKind,
    expires_at: Duration,
    state: CeremonyState,
}

pub struct MfaChallengeEngine {
    webauthn: Webauthn,
    pending: BptreeMap<Uuid, Fido2Challenge>,
}

impl MfaChallengeEngine {
    pub fn new(rp_name: &str, rp_id: &str, origin: &Url) -> Result<Self, OperationError> {
        let webauthn = WebauthnBuilder::new(rp_id, origin)
            .map_err(|e| {
                admin_error!(?e, "invalid relying party configuration");
                OperationError::InvalidState
            })?
            .rp_name(rp_name)
            .build()
            .map_err(|e| {
                admin_error!(?e, "failed to construct webauthn context");
                OperationError::InvalidState
            })?;
        Ok(MfaChallengeEngine {
            webauthn,
            pending: BptreeMap::new(),
        })
    }

    pub fn get_allowed_origins(&self) -> &[Url] {
        self.webauthn.get_allowed_origins()
    }

    fn store(&self, account_id: Uuid, kind: SessionTokenKind, ct: Duration, state: CeremonyState) -> Uuid {
        let challenge_id = Uuid::new_v4();
        let chal = Fido2Challenge {
            account_id,
            kind,
            expires_at: ct + CHALLENGE_TTL,
            state,
        };
        let mut txn = self.pending.write();
        txn.insert(challenge_id, chal);
        txn.commit();
        challenge_id
    }

    /// Remove and validate the binding of a pending challenge. Presenting
    /// spends it regardless of what the checks then find.
    fn take(
        &self,
        challenge_id: Uuid,
        account_id: Uuid,
        kind: SessionTokenKind,
        ct: Duration,
    ) -> Result<CeremonyState, OperationError> {
        let mut txn = self.pending.write();
        let chal = txn.remove(&challenge_id);
        txn.commit();

        let chal = chal.ok_or(OperationError::InvalidOrExpiredChallenge)?;
        if ct >= chal.expires_at {
            security_info!("fido2 challenge expired");
            return Err(OperationError::InvalidOrExpiredChallenge);
        }
        if chal.account_id != account_id {
            security_error!("fido2 challenge presented for a different account");
            return Err(OperationError::InvalidOrExpiredChallenge);
        }
        if chal.kind != kind {
            security_error!("fido2 challenge presented against the wrong flow");
            return Err(OperationError::InvalidOrExpiredChallenge);
        }
        Ok(chal.state)
    }

    pub fn begin_securitykey_registration(
        &self,
        account: &Account,
        kind: SessionTokenKind,
        ct: Duration,
    ) -> Result<(Uuid, CreationChallengeResponse), OperationError> {
        let (ccr, reg_state) = self
            .webauthn
            .start_securitykey_registration(
                account.uuid,
                &account.username,
                &account.displayname,
                None,
                None,
                None,
            )
            .map_err(|e| {
                security_error!(?e, "unable to start security key registration");
                OperationError::InvalidOrExpiredChallenge
            })?;
        let challenge_id = self.store(
            account.uuid,
            kind,
            ct,
            CeremonyState::Registration(reg_state),
        );
        Ok((challenge_id, ccr))
    }

    pub fn finish_securitykey_registration(
        &self,
        challenge_id: Uuid,
        account_id: Uuid,
        kind: SessionTokenKind,
        response: &RegisterPublicKeyCredential,
        ct: Duration,
    ) -> Result<SecurityKey, OperationError> {
        let state = match self.take(challenge_id, account_id, kind, ct)? {
            CeremonyState::Registration(state) => state,
            CeremonyState::Authentication(_) => {
                security_error!("registration response presented for an assertion challenge");
                return Err(OperationError::InvalidOrExpiredChallenge);
            }
        };
        self.webauthn
            .finish_securitykey_registration(response, &state)
            .map_err(|e| {
                security_error!(?e, "security key attestation failed");
                OperationError::InvalidOrExpiredChallenge
            })
    }

    pub fn begin_securitykey_authentication(
        &self,
        account: &Account,
        kind: SessionTokenKind,
        ct: Duration,
    ) -> Result<(Uuid, RequestChallengeResponse), OperationError> {
        let creds = account.security_keys();
        let (rcr, auth_state) = self
            .webauthn
            .start_securitykey_authentication(&creds)
            .map_err(|e| {
                security_error!(?e, "unable to start security key authentication");
                OperationError::InvalidOrExpiredChallenge
            })?;
        let challenge_id = self.store(
            account.uuid,
            kind,
            ct,
            CeremonyState::Authentication(auth_state),
        );
        Ok((challenge_id, rcr))
    }

    pub fn finish_securitykey_authentication(
        &self,
        challenge_id: Uuid,
        account_id: Uuid,
        kind: SessionTokenKind,
        response: &PublicKeyCredential,
        ct: Duration,
    ) -> Result<AuthenticationResult, OperationError> {
        let state = match self.take(challenge_id, account_id, kind, ct)? {
            CeremonyState::Authentication(state) => state,
            CeremonyState::Registration(_) => {
                security_error!("assertion response presented for a registration challenge");
                return Err(OperationError::InvalidOrExpiredChallenge);
            }
        };
        self.webauthn
            .finish_securitykey_authentication(response, &state)
            .map_err(|e| {
                security_error!(?e, "security key assertion failed");
                OperationError::InvalidOrExpiredChallenge
            })
    }

    /// Abandoned ceremonies time out on their own; this reclaims memory.
    pub fn purge_expired(&self, ct: Duration) {
        let mut txn = self.pending.write();
        let stale: Vec<Uuid> = txn
            .iter()
            .filter(|(_k, c)| ct >= c.expires_at)
            .map(|(k, _c)| *k)
            .collect();
        for k in &stale {
            txn.remove(k);
        }
        txn.commit();
    }
}
