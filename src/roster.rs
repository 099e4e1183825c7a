use core::fmt;
use std::collections::BTreeMap;

use k256::ecdsa::{SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

use crate::dh::{DhPublic, DhSecret};
use crate::tools::hashing::{Chain, Hashable};

/// An opaque overlay-level identifier of a participant.
///
/// Assigned by the host; the rosters map it to the participant's keys. It is
/// deliberately not derived from any key so that key rotation does not change
/// addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 16]);

impl PeerId {
    /// Wraps raw identifier bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Hashable for PeerId {
    fn chain<C: Chain>(&self, digest: C) -> C {
        digest.chain_constant_sized_bytes(&self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// The public half of a participant's identity: its long-term signing key
/// and its Diffie-Hellman key, both known to every other participant.
#[derive(Debug, Clone)]
pub struct PublicIdentity {
    id: PeerId,
    signing_key: VerifyingKey,
    dh_key: DhPublic,
}

impl PublicIdentity {
    /// Bundles an identifier with the participant's advertised keys.
    pub fn new(id: PeerId, signing_key: VerifyingKey, dh_key: DhPublic) -> Self {
        Self {
            id,
            signing_key,
            dh_key,
        }
    }

    /// The overlay identifier.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// The long-term signature verification key.
    pub fn signing_key(&self) -> &VerifyingKey {
        &self.signing_key
    }

    /// The Diffie-Hellman key.
    pub fn dh_key(&self) -> &DhPublic {
        &self.dh_key
    }
}

/// The local participant's identity, holding the secret halves of both keys.
pub struct PrivateIdentity {
    id: PeerId,
    signing_key: SigningKey,
    dh_key: DhSecret,
}

impl PrivateIdentity {
    /// Generates a fresh identity.
    pub fn random(rng: &mut impl CryptoRngCore, id: PeerId) -> Self {
        Self {
            id,
            signing_key: SigningKey::random(rng),
            dh_key: DhSecret::random(rng),
        }
    }

    /// Assembles an identity from existing keys.
    pub fn new(id: PeerId, signing_key: SigningKey, dh_key: DhSecret) -> Self {
        Self {
            id,
            signing_key,
            dh_key,
        }
    }

    /// The overlay identifier.
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub(crate) fn dh_key(&self) -> &DhSecret {
        &self.dh_key
    }

    /// The public half of this identity, as it appears in a roster.
    pub fn public(&self) -> PublicIdentity {
        PublicIdentity {
            id: self.id,
            signing_key: *self.signing_key.verifying_key(),
            dh_key: self.dh_key.public(),
        }
    }
}

/// A fixed, ordered list of participant identities.
///
/// Every participant of a round receives the same two rosters (clients and
/// servers) as input; a participant's position in its roster is its index in
/// every wire message and bit vector for the whole round.
#[derive(Debug, Clone)]
pub struct Roster {
    entries: Vec<PublicIdentity>,
    by_id: BTreeMap<PeerId, usize>,
}

impl Roster {
    /// Builds a roster from an ordered identity list.
    ///
    /// Fails if two entries share a `PeerId`.
    pub fn new(entries: Vec<PublicIdentity>) -> Result<Self, crate::LocalError> {
        let mut by_id = BTreeMap::new();
        for (idx, entry) in entries.iter().enumerate() {
            if by_id.insert(entry.id(), idx).is_some() {
                return Err(crate::LocalError::new(format!(
                    "duplicate roster entry {}",
                    entry.id()
                )));
            }
        }
        Ok(Self { entries, by_id })
    }

    /// The number of participants in this roster.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the roster is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `id` belongs to this roster.
    pub fn contains(&self, id: &PeerId) -> bool {
        self.by_id.contains_key(id)
    }

    /// The roster index of `id`.
    pub fn index_of(&self, id: &PeerId) -> Option<usize> {
        self.by_id.get(id).copied()
    }

    /// The identity at roster index `idx`.
    pub fn get(&self, idx: usize) -> Option<&PublicIdentity> {
        self.entries.get(idx)
    }

    /// Iterates the identities in roster order.
    pub fn iter(&self) -> impl Iterator<Item = &PublicIdentity> {
        self.entries.iter()
    }
}
