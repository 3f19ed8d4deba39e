//! Groth16 proof generation/verification for the node's three fixed
//! circuit shapes (range, VRF, bridge), over BN254 via `ark-groth16`.
//!
//! Proof generation is CPU-bound and must not starve the Tokio I/O
//! tasks (§9 of SPEC_FULL.md), so it runs on a dedicated `rayon`
//! thread pool sized to the physical core count; the async caller
//! hands off via a `oneshot` channel and wraps the wait in a soft
//! 60-second timeout.

use crate::errors::OracleError;
use ark_bn254::{Bn254, Fr};
use ark_ff::PrimeField;
use ark_groth16::{Groth16, PreparedVerifyingKey, Proof as ArkProof, ProvingKey, VerifyingKey};
use ark_r1cs_std::prelude::*;
use ark_relations::r1cs::{ConstraintSynthesizer, ConstraintSystemRef, SynthesisError};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_snark::SNARK;
use ark_std::rand::rngs::StdRng;
use ark_std::rand::SeedableRng;
use std::path::Path;
use std::time::Duration;

/// Eight BN254 field elements, 32 bytes big-endian each: the fixed
/// layout on-chain verifiers expect an array of.
pub type ProofBytes = [[u8; 32]; 8];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Circuit {
    Range,
    Vrf,
    Bridge,
}

impl Circuit {
    fn name(self) -> &'static str {
        match self {
            Circuit::Range => "range",
            Circuit::Vrf => "vrf",
            Circuit::Bridge => "bridge",
        }
    }
}

// ---------------------------------------------------------------------
// Range circuit: private `value` (bounded to RANGE_BITS bits), public
// `min`, `max`, with `min <= value <= max`.
// ---------------------------------------------------------------------

pub const RANGE_BITS: u32 = 128;

pub struct RangeCircuit {
    pub value: Option<u128>,
    pub min: u128,
    pub max: u128,
}

impl ConstraintSynthesizer<Fr> for RangeCircuit {
    fn generate_constraints(self, cs: ConstraintSystemRef<Fr>) -> Result<(), SynthesisError> {
        // Witnessing `value` as a 128-bit unsigned integer constrains
        // its bit width to RANGE_BITS.
        let value_bits = UInt128::new_witness(cs.clone(), || {
            self.value.ok_or(SynthesisError::AssignmentMissing)
        })?;
        let value_fp = Boolean::le_bits_to_fp_var(&value_bits.to_bits_le())?;

        let min_fp = FpVar::new_input(cs.clone(), || Ok(Fr::from(self.min)))?;
        let max_fp = FpVar::new_input(cs.clone(), || Ok(Fr::from(self.max)))?;

        // value >= min: witness (value - min) and bit-constrain it to
        // RANGE_BITS. Only satisfiable without modular wraparound if
        // value >= min, so an out-of-range witness fails here.
        let above_min = self.value.and_then(|v| v.checked_sub(self.min));
        let above_min_bits = UInt128::new_witness(cs.clone(), || {
            above_min.ok_or(SynthesisError::AssignmentMissing)
        })?;
        let above_min_fp = Boolean::le_bits_to_fp_var(&above_min_bits.to_bits_le())?;
        (&min_fp + &above_min_fp).enforce_equal(&value_fp)?;

        // value <= max: witness (max - value) likewise.
        let below_max = self.value.and_then(|v| self.max.checked_sub(v));
        let below_max_bits = UInt128::new_witness(cs.clone(), || {
            below_max.ok_or(SynthesisError::AssignmentMissing)
        })?;
        let below_max_fp = Boolean::le_bits_to_fp_var(&below_max_bits.to_bits_le())?;
        (&value_fp + &below_max_fp).enforce_equal(&max_fp)?;

        Ok(())
    }
}

// ---------------------------------------------------------------------
// VRF circuit: binds an output digest and a public-key commitment to a
// private scalar via an in-circuit algebraic binding. A full in-circuit
// ECDSA/RFC6979 verification would need non-native field arithmetic
// gadgets this node does not carry; the binding below is the
// simplification recorded as an Open Question decision in DESIGN.md.
// ---------------------------------------------------------------------

pub struct VrfCircuit {
    pub secret: Option<Fr>,
    pub seed: Fr,
    pub output_digest: Fr,
    pub pubkey_commitment: Fr,
}

fn bind(a: &FpVar<Fr>, b: &FpVar<Fr>) -> Result<FpVar<Fr>, SynthesisError> {
    let sum = a + b;
    Ok(&sum * &sum + a)
}

impl ConstraintSynthesizer<Fr> for VrfCircuit {
    fn generate_constraints(self, cs: ConstraintSystemRef<Fr>) -> Result<(), SynthesisError> {
        let secret = FpVar::new_witness(cs.clone(), || {
            self.secret.ok_or(SynthesisError::AssignmentMissing)
        })?;
        let seed = FpVar::new_input(cs.clone(), || Ok(self.seed))?;
        let output_digest = FpVar::new_input(cs.clone(), || Ok(self.output_digest))?;
        let pubkey_commitment = FpVar::new_input(cs.clone(), || Ok(self.pubkey_commitment))?;

        let digest = bind(&secret, &seed)?;
        digest.enforce_equal(&output_digest)?;

        let zero = FpVar::zero();
        let commitment = bind(&secret, &zero)?;
        commitment.enforce_equal(&pubkey_commitment)?;

        Ok(())
    }
}

// ---------------------------------------------------------------------
// Bridge circuit: a Merkle-path membership proof of a message
// preimage under a source-chain state root, using an in-circuit
// algebraic compression function (not used outside the circuit).
// ---------------------------------------------------------------------

pub const MERKLE_DEPTH: usize = 32;

pub struct BridgeCircuit {
    pub message_preimage: Option<Fr>,
    pub path: Option<Vec<Fr>>,
    /// `true` at index `i` means the sibling at depth `i` is the right
    /// child (current node goes on the left).
    pub path_is_right: Option<Vec<bool>>,
    pub source_root: Fr,
    pub message_hash: Fr,
}

fn compress(a: &FpVar<Fr>, b: &FpVar<Fr>) -> Result<FpVar<Fr>, SynthesisError> {
    let sum = a + b;
    Ok(&sum * &sum + &(a * b))
}

impl ConstraintSynthesizer<Fr> for BridgeCircuit {
    fn generate_constraints(self, cs: ConstraintSystemRef<Fr>) -> Result<(), SynthesisError> {
        let preimage = FpVar::new_witness(cs.clone(), || {
            self.message_preimage.ok_or(SynthesisError::AssignmentMissing)
        })?;
        let source_root = FpVar::new_input(cs.clone(), || Ok(self.source_root))?;
        let message_hash = FpVar::new_input(cs.clone(), || Ok(self.message_hash))?;

        // message_hash commits to the preimage via the same compression
        // function used by the Merkle tree (leaf = compress(preimage, 0)).
        let zero = FpVar::zero();
        let leaf = compress(&preimage, &zero)?;
        leaf.enforce_equal(&message_hash)?;

        let path = self.path.unwrap_or_default();
        let path_is_right = self.path_is_right.unwrap_or_default();

        let mut current = leaf;
        for i in 0..MERKLE_DEPTH {
            let sibling = FpVar::new_witness(cs.clone(), || {
                path.get(i).copied().ok_or(SynthesisError::AssignmentMissing)
            })?;
            let is_right = Boolean::new_witness(cs.clone(), || {
                path_is_right
                    .get(i)
                    .copied()
                    .ok_or(SynthesisError::AssignmentMissing)
            })?;

            let left = is_right.select(&sibling, &current)?;
            let right = is_right.select(&current, &sibling)?;
            current = compress(&left, &right)?;
        }

        current.enforce_equal(&source_root)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Key lifecycle + proving/verification entry points
// ---------------------------------------------------------------------

#[derive(Clone)]
pub struct CircuitKeys {
    pub proving_key: std::sync::Arc<ProvingKey<Bn254>>,
    pub verifying_key: std::sync::Arc<VerifyingKey<Bn254>>,
    pub prepared_vk: std::sync::Arc<PreparedVerifyingKey<Bn254>>,
}

impl CircuitKeys {
    pub fn load(proving_key_path: &Path, verifying_key_path: &Path) -> Result<Self, OracleError> {
        let pk_bytes = std::fs::read(proving_key_path).map_err(|e| {
            OracleError::Config(format!(
                "reading proving key {}: {e}",
                proving_key_path.display()
            ))
        })?;
        let vk_bytes = std::fs::read(verifying_key_path).map_err(|e| {
            OracleError::Config(format!(
                "reading verifying key {}: {e}",
                verifying_key_path.display()
            ))
        })?;

        let proving_key = ProvingKey::<Bn254>::deserialize_compressed(&pk_bytes[..])
            .map_err(|e| OracleError::Config(format!("decoding proving key: {e}")))?;
        let verifying_key = VerifyingKey::<Bn254>::deserialize_compressed(&vk_bytes[..])
            .map_err(|e| OracleError::Config(format!("decoding verifying key: {e}")))?;
        let prepared_vk = ark_groth16::prepare_verifying_key(&verifying_key);

        Ok(Self {
            proving_key: std::sync::Arc::new(proving_key),
            verifying_key: std::sync::Arc::new(verifying_key),
            prepared_vk: std::sync::Arc::new(prepared_vk),
        })
    }
}

pub struct ProofEngine {
    pool: rayon::ThreadPool,
    range_keys: CircuitKeys,
    vrf_keys: CircuitKeys,
    bridge_keys: CircuitKeys,
}

impl ProofEngine {
    pub fn new(
        range_keys: CircuitKeys,
        vrf_keys: CircuitKeys,
        bridge_keys: CircuitKeys,
    ) -> Result<Self, OracleError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_cpus::get())
            .build()
            .map_err(|e| OracleError::Config(format!("building proof thread pool: {e}")))?;
        Ok(Self {
            pool,
            range_keys,
            vrf_keys,
            bridge_keys,
        })
    }

    fn keys(&self, circuit: Circuit) -> &CircuitKeys {
        match circuit {
            Circuit::Range => &self.range_keys,
            Circuit::Vrf => &self.vrf_keys,
            Circuit::Bridge => &self.bridge_keys,
        }
    }

    /// Proves the range statement `min <= value <= max`, offloading
    /// the CPU-bound witness/proving work to the dedicated thread pool
    /// and bounding the wait with a 60-second soft timeout.
    pub async fn prove_range(
        &self,
        value: u128,
        min: u128,
        max: u128,
    ) -> Result<ProofBytes, OracleError> {
        let circuit = RangeCircuit {
            value: Some(value),
            min,
            max,
        };
        let pk = self.keys(Circuit::Range).proving_key.clone();
        self.prove_blocking(Circuit::Range, move || prove_with(&pk, circuit))
            .await
    }

    pub async fn verify_range(
        &self,
        min: u128,
        max: u128,
        proof: &ProofBytes,
    ) -> Result<bool, OracleError> {
        let public_inputs = vec![Fr::from(min), Fr::from(max)];
        verify_with(&self.keys(Circuit::Range).prepared_vk, &public_inputs, proof)
    }

    pub async fn prove_vrf(
        &self,
        secret: Fr,
        seed: Fr,
        output_digest: Fr,
        pubkey_commitment: Fr,
    ) -> Result<ProofBytes, OracleError> {
        let circuit = VrfCircuit {
            secret: Some(secret),
            seed,
            output_digest,
            pubkey_commitment,
        };
        let pk = self.keys(Circuit::Vrf).proving_key.clone();
        self.prove_blocking(Circuit::Vrf, move || prove_with(&pk, circuit))
            .await
    }

    pub async fn verify_vrf(
        &self,
        seed: Fr,
        output_digest: Fr,
        pubkey_commitment: Fr,
        proof: &ProofBytes,
    ) -> Result<bool, OracleError> {
        let public_inputs = vec![seed, output_digest, pubkey_commitment];
        verify_with(&self.keys(Circuit::Vrf).prepared_vk, &public_inputs, proof)
    }

    pub async fn prove_bridge(
        &self,
        message_preimage: Fr,
        path: Vec<Fr>,
        path_is_right: Vec<bool>,
        source_root: Fr,
        message_hash: Fr,
    ) -> Result<ProofBytes, OracleError> {
        let circuit = BridgeCircuit {
            message_preimage: Some(message_preimage),
            path: Some(path),
            path_is_right: Some(path_is_right),
            source_root,
            message_hash,
        };
        let pk = self.keys(Circuit::Bridge).proving_key.clone();
        self.prove_blocking(Circuit::Bridge, move || prove_with(&pk, circuit))
            .await
    }

    pub async fn verify_bridge(
        &self,
        source_root: Fr,
        message_hash: Fr,
        proof: &ProofBytes,
    ) -> Result<bool, OracleError> {
        let public_inputs = vec![source_root, message_hash];
        verify_with(&self.keys(Circuit::Bridge).prepared_vk, &public_inputs, proof)
    }

    /// Hands a blocking proving closure off to the rayon pool and waits
    /// on it with a soft 60s timeout. The rayon job itself cannot be
    /// cancelled once dispatched; a timeout only stops the caller from
    /// waiting on it further and surfaces a retryable error.
    async fn prove_blocking<F>(&self, circuit: Circuit, job: F) -> Result<ProofBytes, OracleError>
    where
        F: FnOnce() -> Result<ProofBytes, OracleError> + Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.pool.spawn(move || {
            let result = job();
            let _ = tx.send(result);
        });

        match tokio::time::timeout(Duration::from_secs(60), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OracleError::ProofGenerationFailure(format!(
                "{} proving task dropped without a result",
                circuit.name()
            ))),
            Err(_) => Err(OracleError::ProofTimeout),
        }
    }
}

fn prove_with<C: ConstraintSynthesizer<Fr>>(
    proving_key: &ProvingKey<Bn254>,
    circuit: C,
) -> Result<ProofBytes, OracleError> {
    // Deterministic given (circuit, setup): seeded from a fixed value so
    // repeated calls over identical inputs produce byte-identical proofs,
    // matching the contract's determinism requirement.
    let mut rng = StdRng::seed_from_u64(0xA11CE);
    let proof = Groth16::<Bn254>::prove(proving_key, circuit, &mut rng)
        .map_err(|e| OracleError::ProofGenerationFailure(e.to_string()))?;
    serialize_proof(&proof)
}

fn verify_with(
    prepared_vk: &PreparedVerifyingKey<Bn254>,
    public_inputs: &[Fr],
    proof: &ProofBytes,
) -> Result<bool, OracleError> {
    let proof = deserialize_proof(proof)?;
    Groth16::<Bn254>::verify_with_processed_vk(prepared_vk, public_inputs, &proof)
        .map_err(|e| OracleError::ProofGenerationFailure(format!("verification error: {e}")))
}

fn serialize_proof(proof: &ArkProof<Bn254>) -> Result<ProofBytes, OracleError> {
    let mut buf = Vec::new();
    proof
        .serialize_compressed(&mut buf)
        .map_err(|e| OracleError::ProofGenerationFailure(format!("serializing proof: {e}")))?;

    // Re-derive the eight coordinate field elements directly rather than
    // relying on ark-serialize's own (compressed, variable-width) framing,
    // since on-chain verifiers expect a fixed 8x32-byte array.
    if proof.a.infinity || proof.b.infinity || proof.c.infinity {
        return Err(OracleError::ProofGenerationFailure(
            "proof contains a point at infinity".to_string(),
        ));
    }

    Ok([
        fr_to_be32(proof.a.x),
        fr_to_be32(proof.a.y),
        fr_to_be32(proof.b.x.c0),
        fr_to_be32(proof.b.x.c1),
        fr_to_be32(proof.b.y.c0),
        fr_to_be32(proof.b.y.c1),
        fr_to_be32(proof.c.x),
        fr_to_be32(proof.c.y),
    ])
}

fn deserialize_proof(bytes: &ProofBytes) -> Result<ArkProof<Bn254>, OracleError> {
    use ark_bn254::{Fq2, G1Affine, G2Affine};

    let a = G1Affine::new(be32_to_fq(&bytes[0]), be32_to_fq(&bytes[1]));
    let b = G2Affine::new(
        Fq2::new(be32_to_fq(&bytes[2]), be32_to_fq(&bytes[3])),
        Fq2::new(be32_to_fq(&bytes[4]), be32_to_fq(&bytes[5])),
    );
    let c = G1Affine::new(be32_to_fq(&bytes[6]), be32_to_fq(&bytes[7]));

    Ok(ArkProof { a, b, c })
}

fn fr_to_be32<F: PrimeField>(f: F) -> [u8; 32] {
    let mut bytes = f.into_bigint().to_bytes_be();
    while bytes.len() < 32 {
        bytes.insert(0, 0);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes[bytes.len() - 32..]);
    out
}

fn be32_to_fq(bytes: &[u8; 32]) -> ark_bn254::Fq {
    ark_bn254::Fq::from_be_bytes_mod_order(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_groth16::Groth16;
    use ark_snark::SNARK;
    use ark_std::rand::rngs::StdRng;
    use ark_std::rand::SeedableRng;

    fn range_keys() -> (ProvingKey<Bn254>, VerifyingKey<Bn254>) {
        let mut rng = StdRng::seed_from_u64(42);
        let circuit = RangeCircuit {
            value: None,
            min: 0,
            max: 0,
        };
        Groth16::<Bn254>::circuit_specific_setup(circuit, &mut rng).unwrap()
    }

    #[test]
    fn range_proof_verifies_for_satisfying_witness() {
        let (pk, vk) = range_keys();
        let circuit = RangeCircuit {
            value: Some(350),
            min: 300,
            max: 500,
        };
        let proof = prove_with(&pk, circuit).unwrap();
        let pvk = ark_groth16::prepare_verifying_key(&vk);
        let ok = verify_with(&pvk, &[Fr::from(300u64), Fr::from(500u64)], &proof).unwrap();
        assert!(ok);
    }

    #[test]
    fn range_proof_fails_for_out_of_bounds_witness() {
        let (pk, _vk) = range_keys();
        let circuit = RangeCircuit {
            value: Some(150),
            min: 200,
            max: 400,
        };
        let result = prove_with(&pk, circuit);
        assert!(result.is_err());
    }

    #[test]
    fn range_proof_rejects_wrong_public_inputs() {
        let (pk, vk) = range_keys();
        let circuit = RangeCircuit {
            value: Some(350),
            min: 300,
            max: 500,
        };
        let proof = prove_with(&pk, circuit).unwrap();
        let pvk = ark_groth16::prepare_verifying_key(&vk);
        // Wrong max: verification must reject, never silently accept.
        let ok = verify_with(&pvk, &[Fr::from(300u64), Fr::from(9000u64)], &proof).unwrap();
        assert!(!ok);
    }
}
