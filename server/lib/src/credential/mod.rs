//! Stored credential material and the policy controlling how new material
//! is generated. Multiple key-derivation algorithms are supported at once,
//! selected by the tag stored with each credential, so that historical
//! credentials keep verifying across an algorithm upgrade. Verification of
//! a legacy tag flags the credential for an asynchronous re-hash.

use openssl::hash::MessageDigest;
use openssl::memcmp;
use openssl::pkcs5::pbkdf2_hmac;
use openssl::sha::Sha512;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::time::{Duration, Instant};

use crate::prelude::*;

pub mod totp;

// NIST 800-63b - salt should be at least 112 bits.
const PBKDF2_SALT_LEN: usize = 24;
const PBKDF2_MIN_NIST_SALT_LEN: usize = 14;
// Min number of rounds for a pbkdf2.
pub const PBKDF2_MIN_NIST_COST: usize = 10000;
// 64 * u8 -> 512 bits of out.
const PBKDF2_KEY_LEN: usize = 64;
const PBKDF2_MIN_NIST_KEY_LEN: usize = 32;

const DS_SSHA512_SALT_LEN: usize = 8;
const DS_SSHA512_HASH_LEN: usize = 64;

/// How expensive new password hashes are. Tuned once at startup, either to
/// a fixed floor (tests) or to a wall-clock target on this hardware.
#[derive(Debug, Clone)]
pub struct CryptoPolicy {
    pub(crate) pbkdf2_cost: usize,
}

impl CryptoPolicy {
    pub fn minimum() -> Self {
        CryptoPolicy {
            pbkdf2_cost: PBKDF2_MIN_NIST_COST,
        }
    }

    /// Measure how many rounds fit in `target_time` on this machine, never
    /// dropping below the NIST floor.
    pub fn time_target(target_time: Duration) -> Self {
        let step = 2500;
        let mut cost = PBKDF2_MIN_NIST_COST;
        loop {
            let start = Instant::now();
            if Password::bench_pbkdf2(cost + step).is_err() {
                // Failure to derive is a failure to bench - stay at the floor.
                break;
            }
            let elapsed = start.elapsed();
            if elapsed >= target_time {
                break;
            }
            cost += step;
        }
        CryptoPolicy { pbkdf2_cost: cost }
    }
}

/// The stored key material, tagged by derivation algorithm.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
enum Kdf {
    /// cost, salt, hash - hmac over sha256.
    PBKDF2(usize, Vec<u8>, Vec<u8>),
    /// cost, salt, hash - hmac over sha512. The current scheme.
    PBKDF2_SHA512(usize, Vec<u8>, Vec<u8>),
    /// Salted sha512, an import format from legacy directory servers.
    SSHA512(Vec<u8>, Vec<u8>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Password {
    material: Kdf,
}

impl TryFrom<&str> for Password {
    type Error = ();

    /// Import from a directory-server style marked string. Only used for
    /// migrations; new material never takes this path.
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if let Some(ds_ssha512) = value.strip_prefix("{SSHA512}") {
            let sh = openssl::base64::decode_block(ds_ssha512).map_err(|_| ())?;
            if sh.len() != DS_SSHA512_HASH_LEN + DS_SSHA512_SALT_LEN {
                return Err(());
            }
            let (h, s) = sh.split_at(DS_SSHA512_HASH_LEN);
            Ok(Password {
                material: Kdf::SSHA512(s.to_vec(), h.to_vec()),
            })
        } else {
            Err(())
        }
    }
}

impl Password {
    fn bench_pbkdf2(pbkdf2_cost: usize) -> Result<(), OperationError> {
        let mut rng = rand::thread_rng();
        let salt: Vec<u8> = (0..PBKDF2_SALT_LEN).map(|_| rng.gen()).collect();
        let input: Vec<u8> = (0..PBKDF2_SALT_LEN).map(|_| rng.gen()).collect();
        let mut key: Vec<u8> = (0..PBKDF2_KEY_LEN).map(|_| 0).collect();
        pbkdf2_hmac(
            input.as_slice(),
            salt.as_slice(),
            pbkdf2_cost,
            MessageDigest::sha512(),
            key.as_mut_slice(),
        )
        .map_err(|_| OperationError::CryptographyError)
    }

    fn new_pbkdf2_sha512(pbkdf2_cost: usize, cleartext: &str) -> Result<Kdf, OperationError> {
        let mut rng = rand::thread_rng();
        let salt: Vec<u8> = (0..PBKDF2_SALT_LEN).map(|_| rng.gen()).collect();
        let mut key: Vec<u8> = (0..PBKDF2_KEY_LEN).map(|_| 0).collect();
        pbkdf2_hmac(
            cleartext.as_bytes(),
            salt.as_slice(),
            pbkdf2_cost,
            MessageDigest::sha512(),
            key.as_mut_slice(),
        )
        .map(|()| Kdf::PBKDF2_SHA512(pbkdf2_cost, salt, key))
        .map_err(|_| OperationError::CryptographyError)
    }

    pub fn new(policy: &CryptoPolicy, cleartext: &str) -> Result<Self, OperationError> {
        Self::new_pbkdf2_sha512(policy.pbkdf2_cost, cleartext)
            .map(|material| Password { material })
    }

    pub fn verify(&self, cleartext: &str) -> Result<bool, OperationError> {
        match &self.material {
            Kdf::PBKDF2(cost, salt, key) => {
                // Historical imports may carry shorter keys - derive to the
                // stored length so the comparison is meaningful.
                let key_len = key.len();
                debug_assert!(key_len >= PBKDF2_MIN_NIST_KEY_LEN);
                debug_assert!(salt.len() >= PBKDF2_MIN_NIST_SALT_LEN);
                let mut chal_key: Vec<u8> = (0..key_len).map(|_| 0).collect();
                pbkdf2_hmac(
                    cleartext.as_bytes(),
                    salt.as_slice(),
                    *cost,
                    MessageDigest::sha256(),
                    chal_key.as_mut_slice(),
                )
                .map_err(|_| OperationError::CryptographyError)
                .map(|()| memcmp::eq(chal_key.as_slice(), key.as_slice()))
            }
            Kdf::PBKDF2_SHA512(cost, salt, key) => {
                let key_len = key.len();
                let mut chal_key: Vec<u8> = (0..key_len).map(|_| 0).collect();
                pbkdf2_hmac(
                    cleartext.as_bytes(),
                    salt.as_slice(),
                    *cost,
                    MessageDigest::sha512(),
                    chal_key.as_mut_slice(),
                )
                .map_err(|_| OperationError::CryptographyError)
                .map(|()| memcmp::eq(chal_key.as_slice(), key.as_slice()))
            }
            Kdf::SSHA512(salt, key) => {
                let mut hasher = Sha512::new();
                hasher.update(cleartext.as_bytes());
                hasher.update(salt);
                let r = hasher.finish();
                if key.len() != r.len() {
                    return Ok(false);
                }
                Ok(memcmp::eq(key.as_slice(), r.as_slice()))
            }
        }
    }

    /// True when the stored tag is not the current scheme and the material
    /// should be re-derived on next successful verification.
    pub fn requires_upgrade(&self) -> bool {
        !matches!(&self.material, Kdf::PBKDF2_SHA512(cost, salt, key)
            if *cost >= PBKDF2_MIN_NIST_COST
                && salt.len() >= PBKDF2_MIN_NIST_SALT_LEN
                && key.len() >= PBKDF2_MIN_NIST_KEY_LEN)
    }
}
