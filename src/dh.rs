//! Pairwise Diffie-Hellman over secp256k1, plus the proof-of-shared-secret
//! used by the rebuttal step of the blame protocol.
//!
//! A rebutting client must convince every server of the value of the secret
//! it shares with one specific server, without that server's cooperation.
//! The proof is a Chaum-Pedersen discrete-log-equality sigma protocol: the
//! client shows that the same exponent links its public key to the generator
//! and the published shared point to the accused server's public key.

use k256::elliptic_curve::{
    bigint::U256,
    ops::Reduce,
    sec1::{FromEncodedPoint, ToEncodedPoint},
    PrimeField,
};
use k256::{AffinePoint, EncodedPoint, NonZeroScalar, ProjectivePoint, Scalar};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use serde_encoded_bytes::{Base64, SliceLike};
use zeroize::Zeroizing;

use crate::tools::hashing::{Chain, Hash};

const HASH_TAG: &[u8] = b"DhSharedSecret";

/// Byte encoding of a pairwise shared secret (a compressed curve point).
pub(crate) type SharedSecret = Zeroizing<Vec<u8>>;

/// The secret half of a Diffie-Hellman key.
pub struct DhSecret(Zeroizing<NonZeroScalar>);

/// The public half of a Diffie-Hellman key.
#[derive(Debug, Clone, Copy)]
pub struct DhPublic(ProjectivePoint);

impl DhSecret {
    /// Generates a fresh key.
    pub fn random(rng: &mut impl CryptoRngCore) -> Self {
        Self(Zeroizing::new(NonZeroScalar::random(rng)))
    }

    fn scalar(&self) -> Scalar {
        *(*self.0).as_ref()
    }

    /// The public half of this key.
    pub fn public(&self) -> DhPublic {
        DhPublic(ProjectivePoint::GENERATOR * self.scalar())
    }

    /// The shared secret between this key and a peer's public key.
    ///
    /// Symmetric: both sides of a pairing derive the same bytes.
    pub(crate) fn shared_secret(&self, peer: &DhPublic) -> SharedSecret {
        Zeroizing::new(encode_point(&(peer.0 * self.scalar())))
    }

    /// Produces a publicly verifiable proof of the shared secret between
    /// this key and `peer`.
    pub(crate) fn prove_shared_secret(
        &self,
        rng: &mut impl CryptoRngCore,
        peer: &DhPublic,
    ) -> DhProof {
        let x = self.scalar();
        let r = *NonZeroScalar::random(rng).as_ref();
        let shared = peer.0 * x;
        let commitment_base = ProjectivePoint::GENERATOR * r;
        let commitment_peer = peer.0 * r;
        let challenge = challenge(
            &self.public().0,
            &peer.0,
            &shared,
            &commitment_base,
            &commitment_peer,
        );
        let response = r + challenge * x;
        DhProof {
            shared: encode_point(&shared).into(),
            commitment_base: encode_point(&commitment_base).into(),
            commitment_peer: encode_point(&commitment_peer).into(),
            response: response.to_bytes().as_slice().into(),
        }
    }
}

/// A Chaum-Pedersen proof that `shared` is the Diffie-Hellman secret between
/// the prover's key and a specific peer key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DhProof {
    #[serde(with = "SliceLike::<Base64>")]
    shared: Box<[u8]>,
    #[serde(with = "SliceLike::<Base64>")]
    commitment_base: Box<[u8]>,
    #[serde(with = "SliceLike::<Base64>")]
    commitment_peer: Box<[u8]>,
    #[serde(with = "SliceLike::<Base64>")]
    response: Box<[u8]>,
}

/// Checks `proof` against the prover's and the peer's public keys and, if it
/// holds, returns the proven shared secret bytes.
pub(crate) fn verify_shared_secret(
    prover: &DhPublic,
    peer: &DhPublic,
    proof: &DhProof,
) -> Option<SharedSecret> {
    let shared = decode_point(&proof.shared)?;
    let commitment_base = decode_point(&proof.commitment_base)?;
    let commitment_peer = decode_point(&proof.commitment_peer)?;
    let response = decode_scalar(&proof.response)?;
    let challenge = challenge(&prover.0, &peer.0, &shared, &commitment_base, &commitment_peer);

    let base_ok = ProjectivePoint::GENERATOR * response == commitment_base + prover.0 * challenge;
    let peer_ok = peer.0 * response == commitment_peer + shared * challenge;
    if base_ok && peer_ok {
        Some(Zeroizing::new(proof.shared.to_vec()))
    } else {
        None
    }
}

fn challenge(
    prover: &ProjectivePoint,
    peer: &ProjectivePoint,
    shared: &ProjectivePoint,
    commitment_base: &ProjectivePoint,
    commitment_peer: &ProjectivePoint,
) -> Scalar {
    let digest = Hash::new_with_dst(HASH_TAG)
        .chain_bytes(&encode_point(prover))
        .chain_bytes(&encode_point(peer))
        .chain_bytes(&encode_point(shared))
        .chain_bytes(&encode_point(commitment_base))
        .chain_bytes(&encode_point(commitment_peer))
        .finalize();
    <Scalar as Reduce<U256>>::reduce_bytes(&digest.0.into())
}

fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

fn decode_point(bytes: &[u8]) -> Option<ProjectivePoint> {
    let encoded = EncodedPoint::from_bytes(bytes).ok()?;
    Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .map(ProjectivePoint::from)
}

fn decode_scalar(bytes: &[u8]) -> Option<Scalar> {
    let array: [u8; 32] = bytes.try_into().ok()?;
    Option::from(Scalar::from_repr(array.into()))
}
