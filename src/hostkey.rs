//! Deterministic SSH host key derivation.
//!
//! Every gateway replica derives its Ed25519 host key from a shared seed
//! string, so the fleet presents a single host identity behind a load
//! balancer. No other source of randomness is involved.

use anyhow::{bail, Result};
use ed25519_dalek::SigningKey;
use russh::keys::ssh_key::private::{Ed25519Keypair, Ed25519PrivateKey};
use russh::keys::ssh_key::public::Ed25519PublicKey;
use russh::keys::PrivateKey;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::auth::fingerprint;

/// Resolve the host key seed and derive the key, logging the resulting
/// fingerprint so operators can verify all replicas agree.
pub fn load(seed: &str) -> Result<PrivateKey> {
    if seed.is_empty() {
        bail!("host key seed must not be empty");
    }

    let key = derive(seed);
    info!(
        "Host key fingerprint: {}",
        fingerprint(key.public_key())
    );
    Ok(key)
}

/// Derive an Ed25519 private key from a seed string.
///
/// SHA-256 of the seed becomes the 32-byte Ed25519 seed, so the same seed
/// string always yields a byte-identical key pair.
pub fn derive(seed: &str) -> PrivateKey {
    let digest: [u8; 32] = Sha256::digest(seed.as_bytes()).into();

    let signing_key = SigningKey::from_bytes(&digest);
    let keypair = Ed25519Keypair {
        public: Ed25519PublicKey(signing_key.verifying_key().to_bytes()),
        private: Ed25519PrivateKey::from_bytes(&digest),
    };

    PrivateKey::from(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_key() {
        let a = derive("S");
        let b = derive("S");
        assert_eq!(
            a.public_key().to_openssh().unwrap(),
            b.public_key().to_openssh().unwrap()
        );
        assert_eq!(fingerprint(a.public_key()), fingerprint(b.public_key()));
    }

    #[test]
    fn test_different_seed_different_key() {
        let a = derive("seed-one");
        let b = derive("seed-two");
        assert_ne!(
            a.public_key().to_openssh().unwrap(),
            b.public_key().to_openssh().unwrap()
        );
    }

    #[test]
    fn test_fingerprint_format() {
        let key = derive("sealos-devbox");
        let fp = fingerprint(key.public_key());
        assert!(fp.starts_with("SHA256:"));
        // SHA256 fingerprints are base64 without padding
        assert!(!fp.ends_with('='));
    }

    #[test]
    fn test_empty_seed_rejected() {
        assert!(load("").is_err());
    }
}
