//! Deterministic ECDSA-based verifiable randomness and the node's
//! transaction-signing identity. One signing key, two consumers (this
//! module and the Tx Manager), per the shared-resource policy: the key
//! itself is held once, here, and never logged.

use crate::errors::OracleError;
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha2::{Digest, Sha256};
use sha3::Keccak256;

pub const RANDOMNESS_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct VrfOutput {
    pub randomness: [u8; RANDOMNESS_LEN],
    pub proof_bytes: Vec<u8>,
    pub public_key: Vec<u8>,
}

pub struct Signer {
    key: SigningKey,
    domain_separator: &'static [u8],
}

impl Signer {
    pub fn new(key: SigningKey) -> Self {
        Self {
            key,
            domain_separator: b"oracle-node/vrf/v1",
        }
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        VerifyingKey::from(&self.key)
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }

    /// Deterministic VRF: RFC 6979 nonce generation (`k256`'s default
    /// signing behavior, not an opt-in) over `hash(domain || seed)`
    /// guarantees the same `(seed, key)` always yields the same
    /// signature, hence the same `randomness` digest.
    pub fn vrf(&self, seed: &[u8]) -> Result<VrfOutput, OracleError> {
        let mut hasher = Keccak256::new();
        hasher.update(self.domain_separator);
        hasher.update(seed);
        let message = hasher.finalize();

        let signature: Signature = self
            .key
            .sign_prehash(&message)
            .map_err(|e| OracleError::Signing(format!("signing failed: {e}")))?;
        let proof_bytes = signature.to_bytes().to_vec();

        let signature_bytes = signature.to_bytes();
        let r = &signature_bytes[..32];
        let mut digest_hasher = Sha256::new();
        digest_hasher.update(r);
        let digest = digest_hasher.finalize();

        let mut randomness = [0u8; RANDOMNESS_LEN];
        randomness.copy_from_slice(&digest);

        Ok(VrfOutput {
            randomness,
            proof_bytes,
            public_key: self.public_key_bytes(),
        })
    }
}

/// Verifies a VRF output against a `(seed, public_key)` pair, without
/// needing the signing key: recomputes the expected digest from the
/// signature and the seed, and accepts iff it matches.
pub fn verify_vrf(
    seed: &[u8],
    domain_separator: &[u8],
    public_key: &[u8],
    proof_bytes: &[u8],
    expected_randomness: &[u8; RANDOMNESS_LEN],
) -> Result<bool, OracleError> {
    let verifying_key = VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|e| OracleError::Signing(format!("invalid public key: {e}")))?;
    let signature = Signature::from_slice(proof_bytes)
        .map_err(|e| OracleError::Signing(format!("invalid signature bytes: {e}")))?;

    let mut hasher = Keccak256::new();
    hasher.update(domain_separator);
    hasher.update(seed);
    let message = hasher.finalize();

    if verifying_key.verify_prehash(&message, &signature).is_err() {
        return Ok(false);
    }

    let signature_bytes = signature.to_bytes();
    let r = &signature_bytes[..32];
    let mut digest_hasher = Sha256::new();
    digest_hasher.update(r);
    let digest = digest_hasher.finalize();

    Ok(digest.as_slice() == expected_randomness)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32].into()).unwrap()
    }

    #[test]
    fn vrf_is_deterministic() {
        let signer = Signer::new(test_key());
        let a = signer.vrf(b"seed-1").unwrap();
        let b = signer.vrf(b"seed-1").unwrap();
        assert_eq!(a.randomness, b.randomness);
        assert_eq!(a.proof_bytes, b.proof_bytes);
    }

    #[test]
    fn different_seeds_yield_different_randomness() {
        let signer = Signer::new(test_key());
        let a = signer.vrf(b"seed-1").unwrap();
        let b = signer.vrf(b"seed-2").unwrap();
        assert_ne!(a.randomness, b.randomness);
    }

    #[test]
    fn verification_accepts_genuine_output() {
        let signer = Signer::new(test_key());
        let out = signer.vrf(b"seed-1").unwrap();
        let ok = verify_vrf(
            b"seed-1",
            b"oracle-node/vrf/v1",
            &out.public_key,
            &out.proof_bytes,
            &out.randomness,
        )
        .unwrap();
        assert!(ok);
    }

    #[test]
    fn verification_rejects_tampered_randomness() {
        let signer = Signer::new(test_key());
        let mut out = signer.vrf(b"seed-1").unwrap();
        out.randomness[0] ^= 0xFF;
        let ok = verify_vrf(
            b"seed-1",
            b"oracle-node/vrf/v1",
            &out.public_key,
            &out.proof_bytes,
            &out.randomness,
        )
        .unwrap();
        assert!(!ok);
    }
}
