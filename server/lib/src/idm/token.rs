//! Single-use session tokens. Every state machine transition consumes the
//! presented token and issues a replacement, so a client holding a stale
//! token can never replay or reorder a step. Unknown, expired, replayed
//! and wrong-kind tokens are all reported identically.

use concread::bptree::BptreeMap;

use crate::prelude::*;
use crate::utils::opaque_token_from_random;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTokenKind {
    Authentication,
    Registration,
}

#[derive(Clone)]
struct SessionEntry<V: Clone + Send + Sync + 'static> {
    kind: SessionTokenKind,
    expires_at: Duration,
    value: V,
}

/// The server side token map. Keys are the opaque bearer strings, values
/// the suspended state machine snapshot awaiting the next step.
pub struct SessionTokenStore<V: Clone + Send + Sync + 'static> {
    inner: BptreeMap<String, SessionEntry<V>>,
    ttl: Duration,
}

impl<V: Clone + Send + Sync + 'static> SessionTokenStore<V> {
    pub fn new(ttl: Duration) -> Self {
        SessionTokenStore {
            inner: BptreeMap::new(),
            ttl,
        }
    }

    /// Store a snapshot and hand back the token that will redeem it.
    pub fn issue(&self, kind: SessionTokenKind, value: V, ct: Duration) -> String {
        let token = opaque_token_from_random();
        let entry = SessionEntry {
            kind,
            expires_at: ct + self.ttl,
            value,
        };
        let mut txn = self.inner.write();
        txn.insert(token.clone(), entry);
        txn.commit();
        token
    }

    /// Atomically remove and return the snapshot behind a token. The
    /// removal happens before any check, so a token is spent by being
    /// presented - even presented wrongly.
    pub fn consume(
        &self,
        token: &str,
        kind: SessionTokenKind,
        ct: Duration,
    ) -> Result<V, OperationError> {
        let mut txn = self.inner.write();
        let entry = txn.remove(&token.to_string());
        txn.commit();

        let entry = entry.ok_or(OperationError::InvalidOrExpiredSession)?;
        if ct >= entry.expires_at {
            security_info!("session token expired");
            return Err(OperationError::InvalidOrExpiredSession);
        }
        if entry.kind != kind {
            security_info!("session token presented against the wrong flow");
            return Err(OperationError::InvalidOrExpiredSession);
        }
        Ok(entry.value)
    }

    /// Drop a token if it still exists. Used by cancellation, which must
    /// succeed no matter what the client presents.
    pub fn invalidate(&self, token: &str) {
        let mut txn = self.inner.write();
        txn.remove(&token.to_string());
        txn.commit();
    }

    /// Sweep entries whose expiry has passed. Expired entries already
    /// behave as absent; this just reclaims the memory.
    pub fn purge_expired(&self, ct: Duration) {
        let mut txn = self.inner.write();
        let stale: Vec<String> = txn
            .iter()
            .filter(|(_k, e)| ct >= e.expires_at)
            .map(|(k, _e)| k.clone())
            .collect();
        for k in &stale {
            txn.remove(k);
        }
        txn.commit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_TTL: Duration = Duration::from_secs(300);

    #[test]
    fn test_token_single_use() {
        let store: SessionTokenStore<u32> = SessionTokenStore::new(TEST_TTL);
        let ct = Duration::from_secs(1000);

        let token = store.issue(SessionTokenKind::Authentication, 7, ct);
        assert_eq!(
            store.consume(&token, SessionTokenKind::Authentication, ct),
            Ok(7)
        );
        // Replay of the consumed token.
        assert_eq!(
            store.consume(&token, SessionTokenKind::Authentication, ct),
            Err(OperationError::InvalidOrExpiredSession)
        );
    }

    #[test]
    fn test_token_expiry_is_indistinguishable_from_unknown() {
        let store: SessionTokenStore<u32> = SessionTokenStore::new(TEST_TTL);
        let ct = Duration::from_secs(1000);

        let token = store.issue(SessionTokenKind::Authentication, 7, ct);
        let late = ct + TEST_TTL;
        assert_eq!(
            store.consume(&token, SessionTokenKind::Authentication, late),
            Err(OperationError::InvalidOrExpiredSession)
        );
        assert_eq!(
            store.consume("no-such-token", SessionTokenKind::Authentication, ct),
            Err(OperationError::InvalidOrExpiredSession)
        );
    }

    #[test]
    fn test_token_kind_is_checked() {
        let store: SessionTokenStore<u32> = SessionTokenStore::new(TEST_TTL);
        let ct = Duration::from_secs(1000);

        let token = store.issue(SessionTokenKind::Registration, 7, ct);
        assert_eq!(
            store.consume(&token, SessionTokenKind::Authentication, ct),
            Err(OperationError::InvalidOrExpiredSession)
        );
        // The wrong-kind presentation spent the token.
        assert_eq!(
            store.consume(&token, SessionTokenKind::Registration, ct),
            Err(OperationError::InvalidOrExpiredSession)
        );
    }

    #[test]
    fn test_token_invalidate_idempotent() {
        let store: SessionTokenStore<u32> = SessionTokenStore::new(TEST_TTL);
        let ct = Duration::from_secs(1000);

        let token = store.issue(SessionTokenKind::Authentication, 7, ct);
        store.invalidate(&token);
        store.invalidate(&token);
        store.invalidate("never-issued");
        assert_eq!(
            store.consume(&token, SessionTokenKind::Authentication, ct),
            Err(OperationError::InvalidOrExpiredSession)
        );
    }

    #[test]
    fn test_token_store_is_shareable() {
        // The store lives behind an Arc in the server and is hit from
        // every request task concurrently.
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SessionTokenStore<u32>>();
    }

    #[test]
    fn test_token_purge_expired() {
        let store: SessionTokenStore<u32> = SessionTokenStore::new(TEST_TTL);
        let ct = Duration::from_secs(1000);

        let stale = store.issue(SessionTokenKind::Authentication, 1, ct);
        let fresh = store.issue(SessionTokenKind::Authentication, 2, ct + TEST_TTL / 2);
        store.purge_expired(ct + TEST_TTL);

        assert_eq!(
            store.consume(&stale, SessionTokenKind::Authentication, ct + TEST_TTL),
            Err(OperationError::InvalidOrExpiredSession)
        );
        assert_eq!(
            store.consume(&fresh, SessionTokenKind::Authentication, ct + TEST_TTL),
            Ok(2)
        );
    }
}
