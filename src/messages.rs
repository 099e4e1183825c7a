//! Wire model: the signed envelope and the inner bulk messages.
//!
//! Every inter-participant packet starts with a one-byte sub-protocol tag
//! routing it to the bulk state machine or to one of the nested shuffles.
//! Bulk payloads are a [`SignedMessage`]: the serialized inner [`Message`]
//! plus the sender's signature over its hash. The inner message carries the
//! round nonce and the phase, both checked before any state mutates.

use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_encoded_bytes::{Base64, SliceLike};
use signature::hazmat::{PrehashSigner, PrehashVerifier};

use crate::dh::DhProof;
use crate::error::{Fault, LocalError};
use crate::roster::PeerId;
use crate::tools::bitvec::BitVec;
use crate::tools::hashing::{Chain, Hash, HashOutput, Hashable};

/// Sub-protocol tag: bulk state-machine payload.
pub(crate) const TAG_BULK: u8 = 0;
/// Sub-protocol tag: bootstrap (key) shuffle payload.
pub(crate) const TAG_BOOTSTRAP_SHUFFLE: u8 = 1;
/// Sub-protocol tag: blame shuffle payload.
pub(crate) const TAG_BLAME_SHUFFLE: u8 = 2;

/// The per-round byte string binding every message and derived value to one
/// round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nonce(#[serde(with = "SliceLike::<Base64>")] Box<[u8]>);

impl Nonce {
    /// Wraps the round's nonce bytes.
    pub fn new(bytes: impl Into<Box<[u8]>>) -> Self {
        Self(bytes.into())
    }
}

impl AsRef<[u8]> for Nonce {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Hashable for Nonce {
    fn chain<C: Chain>(&self, digest: C) -> C {
        digest.chain_bytes(&self.0)
    }
}

/// Fields common to every inner message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Header {
    pub nonce: Nonce,
    pub phase: u32,
}

/// The blame triple: accused slot owner, bit position in that phase's
/// cleartext, and the phase to audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Accusation {
    pub owner_idx: u32,
    pub accuse_idx: u32,
    pub phase: u32,
}

impl Accusation {
    /// The fixed 12-byte encoding submitted through the blame shuffle.
    pub fn to_bytes(self) -> [u8; 12] {
        let mut out = [0; 12];
        out[0..4].copy_from_slice(&self.owner_idx.to_be_bytes());
        out[4..8].copy_from_slice(&self.accuse_idx.to_be_bytes());
        out[8..12].copy_from_slice(&self.phase.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; 12] = bytes.try_into().ok()?;
        Some(Self {
            owner_idx: u32::from_be_bytes(bytes[0..4].try_into().expect("fixed split")),
            accuse_idx: u32::from_be_bytes(bytes[4..8].try_into().expect("fixed split")),
            phase: u32::from_be_bytes(bytes[8..12].try_into().expect("fixed split")),
        })
    }
}

impl Hashable for Accusation {
    fn chain<C: Chain>(&self, digest: C) -> C {
        digest
            .chain(&self.owner_idx)
            .chain(&self.accuse_idx)
            .chain(&self.phase)
    }
}

/// A detached ECDSA signature in wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct WireSignature(#[serde(with = "SliceLike::<Base64>")] Box<[u8]>);

impl WireSignature {
    pub fn sign(signer: &SigningKey, prehash: &HashOutput) -> Result<Self, LocalError> {
        let signature: Signature = signer
            .sign_prehash(prehash.as_ref())
            .map_err(|err| LocalError::new(format!("signing failed: {err}")))?;
        Ok(Self(signature.to_vec().into()))
    }

    pub fn verify(&self, verifier: &VerifyingKey, prehash: &HashOutput) -> bool {
        let Ok(signature) = Signature::from_slice(&self.0) else {
            return false;
        };
        verifier.verify_prehash(prehash.as_ref(), &signature).is_ok()
    }
}

/// A rebuttal request or the final verdict, both server-to-client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum RebuttalOrVerdict {
    /// The receiver's pad bits are in dispute; it must answer with a
    /// [`Message::ClientRebuttal`].
    Rebuttal {
        blame_phase: u32,
        accuse_idx: u32,
        server_bits: BitVec,
    },
    /// The signed outcome of the blame protocol.
    Verdict {
        accusation: Accusation,
        bad_dude: PeerId,
        signatures: Vec<WireSignature>,
    },
}

/// An inner bulk message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Message {
    /// Client to its server: this phase's DC-net ciphertext.
    ClientCiphertext {
        hdr: Header,
        #[serde(with = "SliceLike::<Base64>")]
        ciphertext: Box<[u8]>,
    },
    /// Server to servers: bitmap of the clients it accepted this phase.
    ServerClientList { hdr: Header, clients: BitVec },
    /// Server to servers: hash commitment to its aggregate ciphertext.
    ServerCommit { hdr: Header, commit: HashOutput },
    /// Server to servers: the revealed aggregate ciphertext.
    ServerCiphertext {
        hdr: Header,
        #[serde(with = "SliceLike::<Base64>")]
        ciphertext: Box<[u8]>,
    },
    /// Server to servers: signature over the cleartext and inclusion set.
    ServerValidation { hdr: Header, signature: WireSignature },
    /// Server to its clients: the validated phase cleartext.
    ServerCleartext {
        hdr: Header,
        signatures: Vec<WireSignature>,
        #[serde(with = "SliceLike::<Base64>")]
        cleartext: Box<[u8]>,
        included: BitVec,
    },
    /// Server to servers: replayed pad and submission bits for the accused
    /// position.
    ServerBlameBits {
        hdr: Header,
        submitted: BitVec,
        pads: BitVec,
    },
    /// Server to one client or to all clients: rebuttal request or verdict.
    ServerRebuttalOrVerdict { hdr: Header, body: RebuttalOrVerdict },
    /// Client to servers: which server it claims lied, with a DH proof.
    ClientRebuttal {
        hdr: Header,
        claimed: u32,
        proof: DhProof,
    },
    /// Server to servers: signature over the verdict hash.
    ServerVerdictSignature { hdr: Header, signature: WireSignature },
}

/// The tag of an inner message, used to match messages against the state
/// machine's expectations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum MessageType {
    ClientCiphertext,
    ServerClientList,
    ServerCommit,
    ServerCiphertext,
    ServerValidation,
    ServerCleartext,
    ServerBlameBits,
    ServerRebuttalOrVerdict,
    ClientRebuttal,
    ServerVerdictSignature,
}

impl Message {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Self::ClientCiphertext { .. } => MessageType::ClientCiphertext,
            Self::ServerClientList { .. } => MessageType::ServerClientList,
            Self::ServerCommit { .. } => MessageType::ServerCommit,
            Self::ServerCiphertext { .. } => MessageType::ServerCiphertext,
            Self::ServerValidation { .. } => MessageType::ServerValidation,
            Self::ServerCleartext { .. } => MessageType::ServerCleartext,
            Self::ServerBlameBits { .. } => MessageType::ServerBlameBits,
            Self::ServerRebuttalOrVerdict { .. } => MessageType::ServerRebuttalOrVerdict,
            Self::ClientRebuttal { .. } => MessageType::ClientRebuttal,
            Self::ServerVerdictSignature { .. } => MessageType::ServerVerdictSignature,
        }
    }

    pub fn header(&self) -> &Header {
        match self {
            Self::ClientCiphertext { hdr, .. }
            | Self::ServerClientList { hdr, .. }
            | Self::ServerCommit { hdr, .. }
            | Self::ServerCiphertext { hdr, .. }
            | Self::ServerValidation { hdr, .. }
            | Self::ServerCleartext { hdr, .. }
            | Self::ServerBlameBits { hdr, .. }
            | Self::ServerRebuttalOrVerdict { hdr, .. }
            | Self::ClientRebuttal { hdr, .. }
            | Self::ServerVerdictSignature { hdr, .. } => hdr,
        }
    }
}

fn message_hash(payload: &[u8]) -> HashOutput {
    Hash::new_with_dst(b"SignedMessage").chain_bytes(payload).finalize()
}

/// A (yet) unverified inner message with the sender's payload signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SignedMessage {
    #[serde(with = "SliceLike::<Base64>")]
    payload: Box<[u8]>,
    signature: WireSignature,
}

impl SignedMessage {
    // The signed payload already contains the nonce and the phase, so the
    // signature binds the message to this round and cannot be replayed into
    // another one.
    pub fn new(signer: &SigningKey, message: &Message) -> Result<Self, LocalError> {
        let payload: Box<[u8]> = bincode::serialize(message)
            .map_err(|err| LocalError::new(format!("cannot serialize message: {err}")))?
            .into();
        let signature = WireSignature::sign(signer, &message_hash(&payload))?;
        Ok(Self { payload, signature })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn verify(self, verifier: &VerifyingKey) -> Result<Message, Fault> {
        if !self.signature.verify(verifier, &message_hash(&self.payload)) {
            return Err(Fault::reject("invalid message signature"));
        }
        bincode::deserialize(&self.payload)
            .map_err(|err| Fault::reject(format!("cannot deserialize message: {err}")))
    }

    /// Frames this message as an outer bulk packet.
    pub fn to_wire(&self) -> Result<Vec<u8>, LocalError> {
        let mut out = vec![TAG_BULK];
        out.extend(
            bincode::serialize(self)
                .map_err(|err| LocalError::new(format!("cannot serialize envelope: {err}")))?,
        );
        Ok(out)
    }

    pub fn from_wire(data: &[u8]) -> Result<Self, Fault> {
        bincode::deserialize(data)
            .map_err(|err| Fault::reject(format!("cannot deserialize envelope: {err}")))
    }
}
