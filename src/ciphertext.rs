//! The DC-net ciphertext engine: pairwise pad streams, the slot message
//! layout, and the Randomize envelope.
//!
//! A participant's base ciphertext for a phase is the XOR of one
//! pseudorandom pad per pairing, each pad derived from the pair's shared
//! seed, the phase number and the round nonce. A slot owner additionally
//! XORs its slot message over the pad at the slot's byte offset; everyone
//! else contributes pads only, so the XOR of all ciphertexts cancels the
//! pads and leaves the slot messages.

use rand_chacha::ChaCha20Rng;
use rand_core::{CryptoRngCore, RngCore, SeedableRng};

use crate::config::SLOT_FIXED_BYTES;
use crate::messages::Nonce;
use crate::tools::bitvec::bit_at;
use crate::tools::hashing::{Chain, Hash, HashOutput};

/// Length of the fresh seed prepended by the Randomize envelope.
pub(crate) const SEED_BYTES: usize = 32;

/// Length of a slot authenticator: an ECDSA signature under the anonymous
/// key, or a digest in the degraded configuration.
pub(crate) fn auth_length(sign_slots: bool) -> usize {
    if sign_slots {
        64
    } else {
        32
    }
}

/// Total overhead of one slot message: fixed header, authenticator, and the
/// Randomize seed. A freshly opened slot reserves exactly this much.
pub(crate) fn slot_header_length(sign_slots: bool) -> usize {
    SLOT_FIXED_BYTES + auth_length(sign_slots) + SEED_BYTES
}

pub(crate) fn xor_into(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// The PRNG seed a pairing uses in one phase.
fn phase_seed(base_seed: &[u8], phase: u32, nonce: &Nonce) -> HashOutput {
    Hash::new_with_dst(b"PhasePad")
        .chain_bytes(base_seed)
        .chain(&phase)
        .chain(nonce)
        .finalize()
}

/// `length` pad bytes for one pairing in one phase.
pub(crate) fn generate_pad(base_seed: &[u8], phase: u32, nonce: &Nonce, length: usize) -> Vec<u8> {
    let mut rng = ChaCha20Rng::from_seed(phase_seed(base_seed, phase, nonce).0);
    let mut pad = vec![0; length];
    rng.fill_bytes(&mut pad);
    pad
}

/// The single pad bit a pairing contributes at cleartext bit `bit_idx`.
///
/// Used during blame to replay a contribution without materializing the
/// whole pad.
pub(crate) fn pad_bit(base_seed: &[u8], phase: u32, nonce: &Nonce, bit_idx: usize) -> bool {
    let pad = generate_pad(base_seed, phase, nonce, bit_idx / 8 + 1);
    bit_at(&pad, bit_idx)
}

/// Wraps a slot message so that observers cannot tell a transmitting slot
/// from one merely reserving bandwidth: prepend a fresh non-zero seed, XOR
/// the message with the seed's PRNG stream.
pub(crate) fn randomize(rng: &mut impl CryptoRngCore, msg: &[u8]) -> Vec<u8> {
    let mut seed = [0; SEED_BYTES];
    loop {
        rng.fill_bytes(&mut seed);
        if seed != [0; SEED_BYTES] {
            break;
        }
    }

    let mut out = vec![0; SEED_BYTES + msg.len()];
    out[..SEED_BYTES].copy_from_slice(&seed);
    ChaCha20Rng::from_seed(seed).fill_bytes(&mut out[SEED_BYTES..]);
    xor_into(&mut out[SEED_BYTES..], msg);
    out
}

/// Inverts [`randomize`]. An all-zero seed decodes to the empty byte string,
/// signalling that the slot carried no message this phase.
pub(crate) fn derandomize(randomized: &[u8]) -> Vec<u8> {
    if randomized.len() < SEED_BYTES {
        return Vec::new();
    }
    let (seed, body) = randomized.split_at(SEED_BYTES);
    if seed.iter().all(|&byte| byte == 0) {
        return Vec::new();
    }

    let seed: [u8; SEED_BYTES] = seed.try_into().expect("fixed split");
    let mut out = vec![0; body.len()];
    ChaCha20Rng::from_seed(seed).fill_bytes(&mut out);
    xor_into(&mut out, body);
    out
}

/// The plain (pre-authenticator) part of a slot message.
pub(crate) fn encode_slot(accuse: bool, phase: u32, next_length: u32, data: &[u8]) -> Vec<u8> {
    let mut out = vec![0; SLOT_FIXED_BYTES + data.len()];
    if accuse {
        out[0] = 0xFF;
    }
    out[1..5].copy_from_slice(&phase.to_be_bytes());
    out[5..9].copy_from_slice(&next_length.to_be_bytes());
    out[SLOT_FIXED_BYTES..].copy_from_slice(data);
    out
}

pub(crate) struct ParsedSlot<'a> {
    pub accuse: bool,
    pub phase: u32,
    pub next_length: u32,
    pub data: &'a [u8],
}

pub(crate) fn parse_slot(plain: &[u8]) -> Option<ParsedSlot<'_>> {
    if plain.len() < SLOT_FIXED_BYTES {
        return None;
    }
    Some(ParsedSlot {
        accuse: plain[0] != 0,
        phase: u32::from_be_bytes(plain[1..5].try_into().expect("fixed split")),
        next_length: u32::from_be_bytes(plain[5..9].try_into().expect("fixed split")),
        data: &plain[SLOT_FIXED_BYTES..],
    })
}

/// The digest a slot authenticator commits to (signed in the normal
/// configuration, used verbatim in the degraded one).
pub(crate) fn slot_digest(plain: &[u8]) -> HashOutput {
    Hash::new_with_dst(b"Slot").chain_bytes(plain).finalize()
}

/// The digest an accusation record's anonymous signature commits to.
pub(crate) fn accusation_digest(record: &[u8]) -> HashOutput {
    Hash::new_with_dst(b"Accusation").chain_bytes(record).finalize()
}

/// The commitment a server publishes before revealing its ciphertext.
pub(crate) fn commit_hash(ciphertext: &[u8]) -> HashOutput {
    Hash::new_with_dst(b"Commit").chain_bytes(ciphertext).finalize()
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{
        derandomize, generate_pad, pad_bit, parse_slot, randomize, SEED_BYTES,
    };
    use crate::messages::Nonce;
    use crate::tools::bitvec::bit_at;

    #[test]
    fn randomize_roundtrip() {
        let msg = b"the quick brown fox";
        let wrapped = randomize(&mut OsRng, msg);
        assert_eq!(wrapped.len(), SEED_BYTES + msg.len());
        assert_eq!(derandomize(&wrapped), msg);
    }

    #[test]
    fn null_seed_decodes_to_nothing() {
        let mut wrapped = vec![0; SEED_BYTES];
        wrapped.extend_from_slice(b"whatever follows");
        assert!(derandomize(&wrapped).is_empty());
        assert!(derandomize(b"short").is_empty());
    }

    #[test]
    fn pads_are_deterministic_and_phase_bound() {
        let nonce = Nonce::new(*b"round-nonce");
        let seed = b"shared secret bytes";
        let p1 = generate_pad(seed, 4, &nonce, 64);
        assert_eq!(p1, generate_pad(seed, 4, &nonce, 64));
        assert_ne!(p1, generate_pad(seed, 5, &nonce, 64));
        assert_ne!(p1, generate_pad(b"other secret", 4, &nonce, 64));
    }

    #[test]
    fn pad_bit_matches_full_pad() {
        let nonce = Nonce::new(*b"round-nonce");
        let pad = generate_pad(b"seed", 1, &nonce, 8);
        for idx in 0..64 {
            assert_eq!(pad_bit(b"seed", 1, &nonce, idx), bit_at(&pad, idx));
        }
    }

    #[test]
    fn slot_encoding_roundtrip() {
        let plain = super::encode_slot(true, 7, 123, b"payload");
        let parsed = parse_slot(&plain).unwrap();
        assert!(parsed.accuse);
        assert_eq!(parsed.phase, 7);
        assert_eq!(parsed.next_length, 123);
        assert_eq!(parsed.data, b"payload");
        assert!(parse_slot(b"tiny").is_none());
    }
}
