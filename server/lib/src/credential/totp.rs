//! RFC 6238 time based one time passwords, used as the second factor for
//! accounts that enrol an authenticator app.

use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use vigil_proto::v1::{TotpAlgo as ProtoTotpAlgo, TotpSecret as ProtoTotpSecret};

// Secrets are ephemeral in the enrolment flow so 160 bits is plenty.
const SECRET_SIZE_BYTES: usize = 20;
pub const TOTP_DEFAULT_STEP: u64 = 30;

#[derive(Debug, PartialEq)]
pub enum TotpError {
    OpenSSLError,
    HmacError,
    TimeError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TotpAlgo {
    Sha1,
    Sha256,
    Sha512,
}

impl TotpAlgo {
    pub(crate) fn digest(&self, key: &[u8], counter: u64) -> Result<Vec<u8>, TotpError> {
        let key = PKey::hmac(key).map_err(|_e| TotpError::OpenSSLError)?;
        let mut signer = match self {
            TotpAlgo::Sha1 => Signer::new(MessageDigest::sha1(), &key),
            TotpAlgo::Sha256 => Signer::new(MessageDigest::sha256(), &key),
            TotpAlgo::Sha512 => Signer::new(MessageDigest::sha512(), &key),
        }
        .map_err(|_e| TotpError::OpenSSLError)?;
        signer
            .update(&counter.to_be_bytes())
            .map_err(|_e| TotpError::OpenSSLError)?;
        let hmac = signer.sign_to_vec().map_err(|_e| TotpError::OpenSSLError)?;

        let expect = match self {
            TotpAlgo::Sha1 => 20,
            TotpAlgo::Sha256 => 32,
            TotpAlgo::Sha512 => 64,
        };
        if hmac.len() != expect {
            return Err(TotpError::HmacError);
        }
        Ok(hmac)
    }
}

/// An enrolled time based one time password. The secret never leaves this
/// type except through `to_proto` during the initial enrolment exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Totp {
    secret: Vec<u8>,
    pub(crate) step: u64,
    algo: TotpAlgo,
}

impl Totp {
    pub fn new(secret: Vec<u8>, step: u64, algo: TotpAlgo) -> Self {
        Totp { secret, step, algo }
    }

    pub fn generate_secure(step: u64) -> Self {
        let mut rng = rand::thread_rng();
        let secret: Vec<u8> = (0..SECRET_SIZE_BYTES).map(|_| rng.gen()).collect();
        let algo = TotpAlgo::Sha256;
        Totp { secret, step, algo }
    }

    /// The shape shown to the client exactly once, at enrolment.
    pub fn to_proto(&self, accountname: &str, issuer: &str) -> ProtoTotpSecret {
        ProtoTotpSecret {
            accountname: accountname.to_string(),
            issuer: issuer.to_string(),
            secret: self.secret.clone(),
            step: self.step,
            algo: match self.algo {
                TotpAlgo::Sha1 => ProtoTotpAlgo::Sha1,
                TotpAlgo::Sha256 => ProtoTotpAlgo::Sha256,
                TotpAlgo::Sha512 => ProtoTotpAlgo::Sha512,
            },
            digits: 6,
        }
    }

    fn digest(&self, counter: u64) -> Result<u32, TotpError> {
        let hmac = self.algo.digest(&self.secret, counter)?;
        // Dynamic truncation, RFC 4226 section 5.4.
        let offset = hmac
            .last()
            .map(|v| (v & 0xf) as usize)
            .ok_or(TotpError::HmacError)?;
        let bytes: [u8; 4] = hmac[offset..offset + 4]
            .try_into()
            .map_err(|_| TotpError::HmacError)?;
        let otp = u32::from_be_bytes(bytes);
        Ok((otp & 0x7fff_ffff) % 1_000_000)
    }

    pub fn do_totp_duration_from_epoch(&self, time: &Duration) -> Result<u32, TotpError> {
        let secs = time.as_secs();
        // step of 0 would panic on the div.
        if self.step == 0 {
            return Err(TotpError::TimeError);
        }
        let counter = secs / self.step;
        self.digest(counter)
    }

    /// Check a candidate code against the current window and one step either
    /// side, absorbing clock drift between the server and the authenticator.
    pub fn verify(&self, chal: u32, time: Duration) -> bool {
        let secs = time.as_secs();
        if self.step == 0 {
            return false;
        }
        let counter = secs / self.step;
        let range = if counter == 0 {
            counter..=counter + 1
        } else {
            counter - 1..=counter + 1
        };
        range.filter_map(|c| self.digest(c).ok()).any(|e| e == chal)
    }
}

#[cfg(test)]
mod tests {
    use super::{Totp, TotpAlgo, TotpError, TOTP_DEFAULT_STEP};
    use std::time::Duration;

    fn do_test(key: Vec<u8>, algo: TotpAlgo, secs: u64, step: u64, expect: Result<u32, TotpError>) {
        let otp = Totp::new(key.clone(), step, algo.clone());
        let d = Duration::from_secs(secs);
        let r = otp.do_totp_duration_from_epoch(&d);
        println!(
            "key: {:?}, algo: {:?}, time: {:?}, step: {:?}, expect: {:?} == {:?}",
            key, algo, secs, step, expect, r
        );
        assert_eq!(expect, r);
    }

    #[test]
    fn totp_sha1_vectors() {
        do_test(
            vec![0x00, 0x00, 0x00, 0x00],
            TotpAlgo::Sha1,
            1585368920,
            TOTP_DEFAULT_STEP,
            Ok(728926),
        );
        do_test(
            vec![0x00, 0xaa, 0xbb, 0xcc],
            TotpAlgo::Sha1,
            1585369498,
            TOTP_DEFAULT_STEP,
            Ok(985074),
        );
    }

    #[test]
    fn totp_sha256_vectors() {
        do_test(
            vec![0x00, 0x00, 0x00, 0x00],
            TotpAlgo::Sha256,
            1585369682,
            TOTP_DEFAULT_STEP,
            Ok(795483),
        );
        do_test(
            vec![0x00, 0xaa, 0xbb, 0xcc],
            TotpAlgo::Sha256,
            1585369689,
            TOTP_DEFAULT_STEP,
            Ok(728402),
        );
    }

    #[test]
    fn totp_sha512_vectors() {
        do_test(
            vec![0x00, 0x00, 0x00, 0x00],
            TotpAlgo::Sha512,
            1585369775,
            TOTP_DEFAULT_STEP,
            Ok(587735),
        );
        do_test(
            vec![0x00, 0xaa, 0xbb, 0xcc],
            TotpAlgo::Sha512,
            1585369780,
            TOTP_DEFAULT_STEP,
            Ok(952181),
        );
    }

    #[test]
    fn totp_allow_one_step_of_drift() {
        let otp = Totp::new(vec![0x00, 0xaa, 0xbb, 0xcc], TOTP_DEFAULT_STEP, TotpAlgo::Sha256);
        let t = Duration::from_secs(1585369689);
        let code = otp
            .do_totp_duration_from_epoch(&t)
            .expect("failed to generate code");

        // Same window.
        assert!(otp.verify(code, t));
        // One step behind and ahead still accept.
        assert!(otp.verify(code, t + Duration::from_secs(TOTP_DEFAULT_STEP)));
        assert!(otp.verify(
            code,
            t.checked_sub(Duration::from_secs(TOTP_DEFAULT_STEP))
                .expect("duration underflow")
        ));
        // Two steps out does not.
        assert!(!otp.verify(code, t + Duration::from_secs(2 * TOTP_DEFAULT_STEP)));
    }

    #[test]
    fn totp_zero_step_is_rejected() {
        let otp = Totp::new(vec![0x00], 0, TotpAlgo::Sha256);
        let t = Duration::from_secs(1585369689);
        assert_eq!(
            otp.do_totp_duration_from_epoch(&t),
            Err(TotpError::TimeError)
        );
        assert!(!otp.verify(123456, t));
    }
}
