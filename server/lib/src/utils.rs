use rand::distributions::Distribution;
use rand::{thread_rng, Rng};
use std::time::{Duration, SystemTime};

#[derive(Debug)]
pub struct DistinctAlpha;

pub fn duration_from_epoch_now() -> Duration {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        // A clock before the epoch is not a recoverable condition.
        .unwrap_or(Duration::ZERO)
}

/// A high-entropy opaque bearer value. 48 chars over a 55 symbol alphabet
/// is ~278 bits, comfortably beyond guessing range for a short-lived token.
pub fn opaque_token_from_random() -> String {
    thread_rng().sample_iter(&DistinctAlpha).take(48).collect()
}

/// A code a person can transcribe from an email. Grouped for readability,
/// 2^46 possibilities against a 60 minute window.
pub fn verification_code_from_random() -> String {
    let mut trng = thread_rng();
    format!(
        "{}-{}",
        (&mut trng)
            .sample_iter(&DistinctAlpha)
            .take(4)
            .collect::<String>(),
        (&mut trng)
            .sample_iter(&DistinctAlpha)
            .take(4)
            .collect::<String>(),
    )
}

impl Distribution<char> for DistinctAlpha {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> char {
        const RANGE: u32 = 55;
        // Ambiguous glyphs (I, l, O, o, 1, 0 lookalikes) removed.
        const GEN_ASCII_STR_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ\
                abcdefghjkpqrstuvwxyz\
                0123456789";
        loop {
            let var = rng.next_u32() >> (32 - 6);
            if var < RANGE {
                return GEN_ASCII_STR_CHARSET[var as usize] as char;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opaque_token_shape() {
        let ta = opaque_token_from_random();
        let tb = opaque_token_from_random();
        assert_eq!(ta.len(), 48);
        assert!(ta.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(ta, tb);
    }

    #[test]
    fn test_verification_code_shape() {
        let code = verification_code_from_random();
        assert_eq!(code.len(), 9);
        assert_eq!(code.chars().filter(|c| *c == '-').count(), 1);
    }
}
