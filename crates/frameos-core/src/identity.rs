//! Credential generation and log-safe fingerprints.

use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};

use crate::error::{FrameError, FrameResult};

/// Short SHA-256 fingerprint of a credential, safe to log.
pub fn fingerprint(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..6])
}

/// `n` random bytes, hex encoded.
pub fn random_hex(n: usize) -> FrameResult<String> {
    let rng = SystemRandom::new();
    let mut buf = vec![0u8; n];
    rng.fill(&mut buf)
        .map_err(|_| FrameError::Other("system RNG failure".into()))?;
    Ok(hex::encode(buf))
}

/// Handshake challenge with 256 bits of entropy.
pub fn generate_challenge() -> FrameResult<String> {
    random_hex(32)
}

/// Fresh server-issued API key.
pub fn generate_api_key() -> FrameResult<String> {
    random_hex(32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_is_256_bits() {
        let c = generate_challenge().unwrap();
        assert_eq!(c.len(), 64);
        assert_ne!(c, generate_challenge().unwrap());
    }

    #[test]
    fn fingerprint_is_short_and_stable() {
        assert_eq!(fingerprint("k1"), fingerprint("k1"));
        assert_eq!(fingerprint("k1").len(), 12);
        assert_ne!(fingerprint("k1"), fingerprint("k2"));
    }
}
