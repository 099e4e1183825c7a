//! The blame subprotocol: anonymous accusation intake, blame-bit replay and
//! cross-validation, the client rebuttal, and the signed verdict.

use k256::ecdsa::Signature;
use rand_core::CryptoRngCore;
use signature::hazmat::{PrehashSigner, PrehashVerifier};
use tracing::debug;

use super::{DcNetRound, Entry};
use crate::ciphertext::{accusation_digest, pad_bit};
use crate::config::ACCUSATION_BYTES;
use crate::dh::{verify_shared_secret, DhProof};
use crate::error::Fault;
use crate::messages::{Accusation, Message, RebuttalOrVerdict, WireSignature};
use crate::roster::PeerId;
use crate::tools::bitvec::BitVec;
use crate::tools::hashing::{Chain, Hash, HashOutput};

/// The hash every server signs under the verdict: the accusation that was
/// audited and the party found guilty.
pub(crate) fn verdict_hash(accusation: &Accusation, bad_dude: &PeerId) -> HashOutput {
    Hash::new_with_dst(b"Verdict")
        .chain(accusation)
        .chain(bad_dude)
        .finalize()
}

impl DcNetRound {
    /// This participant's blame-shuffle input: the signed accusation record
    /// if it has one to make, an empty payload otherwise.
    pub(crate) fn blame_shuffle_input(&self) -> Result<Vec<u8>, Fault> {
        if !self.state.my_accuse {
            return Ok(Vec::new());
        }
        debug!("writing blame data");
        let accusation = Accusation {
            owner_idx: self
                .state
                .my_idx
                .ok_or_else(|| Fault::stop("accusing without a slot"))? as u32,
            accuse_idx: self.state.accuse_idx,
            phase: self.state.blame_phase,
        };
        let record = accusation.to_bytes();
        let key = self
            .state
            .anonymous_key
            .as_ref()
            .ok_or_else(|| Fault::stop("accusing without an anonymous key"))?;
        let signature: Signature = key
            .sign_prehash(accusation_digest(&record).as_ref())
            .map_err(|err| Fault::stop(format!("accusation signing failed: {err}")))?;

        let mut out = record.to_vec();
        out.extend(signature.to_vec());
        Ok(out)
    }

    /// Validates the shuffled accusation records and selects the first good
    /// one as the blame to audit. Clients have nothing to do here.
    pub(crate) fn process_blame_shuffle(&mut self) -> Result<Entry, Fault> {
        if !self.is_server {
            return Ok(Entry::Complete);
        }
        let records = self.blame_shuffle.output().to_vec();
        let anonymous_keys = &self.state.anonymous_keys;
        let server = self
            .server
            .as_mut()
            .ok_or_else(|| Fault::reject("Not a server"))?;

        for record in &records {
            if record.len() < ACCUSATION_BYTES {
                debug!("Found invalid blame material");
                continue;
            }
            let (msg, sig_bytes) = record.split_at(ACCUSATION_BYTES);
            let accusation = Accusation::from_bytes(msg).expect("length checked");

            if !server.logs.contains(accusation.phase) {
                debug!("Phase too old {}", accusation.phase);
                continue;
            }
            let owner = accusation.owner_idx as usize;
            if owner >= anonymous_keys.len() {
                debug!("Invalid idx claimed");
                continue;
            }
            // The accused bit must fall inside the owner's slot as laid out
            // in the audited phase.
            let log = server.logs.get(accusation.phase).expect("checked above");
            let start = log.message_offsets.get(owner).copied().unwrap_or(0);
            let end = log
                .message_offsets
                .get(owner + 1)
                .copied()
                .unwrap_or(log.message_length);
            let byte = accusation.accuse_idx as usize / 8;
            if byte < start || byte >= end {
                debug!("Invalid offset claimed: {}", accusation.accuse_idx);
                continue;
            }
            let Ok(signature) = Signature::from_slice(sig_bytes) else {
                debug!("Invalid accusation {owner}");
                continue;
            };
            if anonymous_keys[owner]
                .verify_prehash(accusation_digest(msg).as_ref(), &signature)
                .is_err()
            {
                debug!("Invalid accusation {owner}");
                continue;
            }

            debug!(
                "Found a valid accusation for {owner} {} {}",
                accusation.accuse_idx, accusation.phase
            );
            if server.current_blame.is_none() {
                server.current_blame = Some(accusation);
            }
        }

        if server.current_blame.is_some() {
            Ok(Entry::Complete)
        } else {
            Err(Fault::stop("Missing accusation"))
        }
    }

    /// Replays this server's bits at the accused position to its peers.
    pub(crate) fn transmit_blame_bits(&mut self) -> Result<Entry, Fault> {
        let hdr = self.header();
        let (submitted, pads) = {
            let server = self.server_state()?;
            let blame = server
                .current_blame
                .ok_or_else(|| Fault::stop("no accusation selected"))?;
            let log = server
                .logs
                .get(blame.phase)
                .ok_or_else(|| Fault::stop("blame phase log evicted"))?;
            log.bits_at_index(blame.accuse_idx as usize)
        };
        self.broadcast_to_servers(&Message::ServerBlameBits {
            hdr,
            submitted,
            pads,
        })?;
        Ok(Entry::Complete)
    }

    /// Collects a peer's replayed bits, cross-checking them against the
    /// ciphertext that peer revealed in the audited phase.
    pub(crate) fn handle_blame_bits(
        &mut self,
        rng: &mut impl CryptoRngCore,
        from: &PeerId,
        submitted: BitVec,
        pads: BitVec,
    ) -> Result<(), Fault> {
        let sidx = self.server_index(from)?;
        let client_count = self.clients.len();
        let server_count = self.servers.len();
        let server = self.server_state()?;

        if server.blame_bits.contains_key(&sidx) {
            return Err(Fault::reject("Already have blame bits."));
        }
        if submitted.len() != client_count || pads.len() != client_count {
            return Err(Fault::interrupt(format!(
                "blame bits from {from} have the wrong length"
            )));
        }
        let blame = server
            .current_blame
            .ok_or_else(|| Fault::reject("no accusation selected"))?;
        let expected = server
            .logs
            .get(blame.phase)
            .and_then(|log| log.bit_at_index(sidx, blame.accuse_idx as usize))
            .ok_or_else(|| {
                Fault::interrupt(format!("no logged ciphertext bit for server {from}"))
            })?;

        let mut actual = false;
        for idx in 0..client_count {
            actual ^= submitted.get(idx);
            actual ^= pads.get(idx);
        }
        if actual != expected {
            return Err(Fault::interrupt(format!(
                "Blame bits from {from} do not match what was sent"
            )));
        }

        server.blame_bits.insert(sidx, (submitted, pads));
        let have = server.blame_bits.len();
        debug!("received blame bits from {sidx} ({from}); have {have} expecting {server_count}");
        if have == server_count {
            self.advance(rng);
        }
        Ok(())
    }

    /// XORs the replayed bit vectors across servers. Honest clients cancel
    /// out; the surviving bit names the client whose submission disagrees
    /// with the pads the servers generated for it.
    fn find_mismatch(&mut self) -> Result<(usize, BitVec), Fault> {
        let client_count = self.clients.len();
        let server_count = self.servers.len();
        let server = self.server_state()?;

        let mut actual = BitVec::new(client_count);
        let mut expected = BitVec::new(client_count);
        for (submitted, pads) in server.blame_bits.values() {
            actual ^= submitted;
            expected ^= pads;
        }
        if actual == expected {
            return Err(Fault::stop("False accusation"));
        }

        let mismatch = &actual ^ &expected;
        let first = mismatch.first_set().expect("the vectors differ");
        debug!("Found a mismatch at {first}");

        // What each server claims to have padded against the mismatched
        // client; its rebuttal either names a dissenting entry or concedes.
        let mut server_bits = BitVec::new(server_count);
        for (sidx, (_submitted, pads)) in &server.blame_bits {
            server_bits.set(*sidx, pads.get(first));
        }
        Ok((first, server_bits))
    }

    pub(crate) fn request_rebuttal(&mut self) -> Result<Entry, Fault> {
        let (mismatch_idx, server_bits) = self.find_mismatch()?;
        let client = self
            .clients
            .get(mismatch_idx)
            .ok_or_else(|| Fault::stop("mismatch index outside the client roster"))?
            .id();

        let (blame_phase, accuse_idx) = {
            let server = self.server_state()?;
            let blame = server
                .current_blame
                .ok_or_else(|| Fault::stop("no accusation selected"))?;
            server.expected_rebuttal = Some(client);
            server.server_bits = Some(server_bits.clone());
            (blame.phase, blame.accuse_idx)
        };

        let hdr = self.header();
        self.send_to(
            &client,
            &Message::ServerRebuttalOrVerdict {
                hdr,
                body: RebuttalOrVerdict::Rebuttal {
                    blame_phase,
                    accuse_idx,
                    server_bits,
                },
            },
        )?;
        Ok(Entry::Complete)
    }

    /// Client side: answer a rebuttal request, or verify and accept the
    /// verdict.
    pub(crate) fn handle_rebuttal_or_verdict(
        &mut self,
        rng: &mut impl CryptoRngCore,
        from: &PeerId,
        body: RebuttalOrVerdict,
    ) -> Result<(), Fault> {
        if self.is_server {
            return Err(Fault::reject("Not a client"));
        }
        self.server_index(from)?;

        match body {
            RebuttalOrVerdict::Rebuttal {
                blame_phase,
                accuse_idx,
                server_bits,
            } => {
                let (claimed, proof) =
                    self.get_rebuttal(rng, blame_phase, accuse_idx, &server_bits)?;
                let hdr = self.header();
                self.send_to(from, &Message::ClientRebuttal { hdr, claimed, proof })
            }
            RebuttalOrVerdict::Verdict {
                accusation,
                bad_dude,
                signatures,
            } => {
                if signatures.len() != self.servers.len() {
                    return Err(Fault::reject("wrong verdict signature count"));
                }
                let hash = verdict_hash(&accusation, &bad_dude);
                for (idx, signature) in signatures.iter().enumerate() {
                    let key = self.servers.get(idx).expect("length checked").signing_key();
                    if !signature.verify(key, &hash) {
                        return Err(Fault::reject("Invalid verdict signature"));
                    }
                }
                debug!("Client done, bad guy: {bad_dude}");
                self.report_bad_member(bad_dude);
                Ok(())
            }
        }
    }

    /// Recomputes the own pad bit against every server and names the first
    /// one whose claim disagrees, with a DH proof the servers can check.
    ///
    /// If nobody disagrees the claims are consistent with what was actually
    /// sent, which means the rebutting client is itself the liar; it names
    /// an arbitrary server and the proof convicts it.
    fn get_rebuttal(
        &mut self,
        rng: &mut impl CryptoRngCore,
        blame_phase: u32,
        accuse_idx: u32,
        server_bits: &BitVec,
    ) -> Result<(u32, DhProof), Fault> {
        let mut dissenting = None;
        for (idx, seed) in self.state.base_seeds.iter().enumerate() {
            if idx >= server_bits.len() {
                break;
            }
            if pad_bit(seed, blame_phase, &self.nonce, accuse_idx as usize)
                != server_bits.get(idx)
            {
                dissenting = Some(idx);
                break;
            }
        }

        let claimed = match dissenting {
            Some(idx) => {
                debug!("Found the mismatch! {idx}");
                idx
            }
            None => {
                let idx = blame_phase as usize % self.servers.len();
                debug!("no dissenting pad bit, naming {idx}");
                idx
            }
        };

        let peer = self
            .servers
            .get(claimed)
            .ok_or_else(|| Fault::stop("server index out of range"))?
            .dh_key();
        let proof = self.local.dh_key().prove_shared_secret(rng, peer);
        Ok((claimed as u32, proof))
    }

    /// Server side: judge the rebuttal. The DH proof pins down the pad bit
    /// the client and the named server share; whichever of the two it
    /// contradicts is the liar.
    pub(crate) fn handle_rebuttal(
        &mut self,
        rng: &mut impl CryptoRngCore,
        from: &PeerId,
        claimed: u32,
        proof: &DhProof,
    ) -> Result<(), Fault> {
        let (expected_rebuttal, blame, server_bits) = {
            let server = self.server_state()?;
            (
                server.expected_rebuttal,
                server.current_blame,
                server.server_bits.clone(),
            )
        };
        if expected_rebuttal != Some(*from) {
            return Err(Fault::reject("Not expecting rebuttal from client"));
        }
        let blame = blame.ok_or_else(|| Fault::stop("no accusation selected"))?;
        let server_bits = server_bits.ok_or_else(|| Fault::stop("no server bits recorded"))?;
        let client_idx = self
            .clients
            .index_of(from)
            .ok_or_else(|| Fault::reject("Not a client"))?;

        let bad_dude = 'deduce: {
            let Some(accused) = self.servers.get(claimed as usize) else {
                debug!("Invalid server selected: {from}");
                break 'deduce *from;
            };
            let client_dh = self.clients.get(client_idx).expect("index from roster").dh_key();
            let Some(shared) = verify_shared_secret(client_dh, accused.dh_key(), proof) else {
                debug!("Invalid shared secret: {from}");
                break 'deduce *from;
            };
            if claimed as usize >= server_bits.len() {
                debug!("Invalid server claim: {from}");
                break 'deduce *from;
            }
            let bit = pad_bit(&shared, blame.phase, &self.nonce, blame.accuse_idx as usize);
            if bit == server_bits.get(claimed as usize) {
                debug!("Client misbehaves: {from}");
                *from
            } else {
                debug!("Server misbehaves: {}", accused.id());
                accused.id()
            }
        };

        self.server_state()?.bad_dude = Some(bad_dude);
        self.advance(rng);
        Ok(())
    }

    pub(crate) fn submit_verdict_signature(&mut self) -> Result<Entry, Fault> {
        let hash = {
            let server = self.server_state()?;
            let blame = server
                .current_blame
                .ok_or_else(|| Fault::stop("no accusation selected"))?;
            let bad_dude = server
                .bad_dude
                .ok_or_else(|| Fault::stop("no verdict reached"))?;
            let hash = verdict_hash(&blame, &bad_dude);
            server.verdict_hash = Some(hash);
            hash
        };

        let signature = WireSignature::sign(self.local.signing_key(), &hash)?;
        let hdr = self.header();
        self.broadcast_to_servers(&Message::ServerVerdictSignature { hdr, signature })?;
        Ok(Entry::Complete)
    }

    pub(crate) fn handle_verdict_signature(
        &mut self,
        rng: &mut impl CryptoRngCore,
        from: &PeerId,
        signature: WireSignature,
    ) -> Result<(), Fault> {
        let sidx = self.server_index(from)?;
        let key = *self.servers.get(sidx).expect("index from roster").signing_key();
        let server_count = self.servers.len();
        let server = self.server_state()?;

        if server.verdict_signatures.contains_key(&sidx) {
            return Err(Fault::reject("Already have signature."));
        }
        let hash = server
            .verdict_hash
            .ok_or_else(|| Fault::reject("no local verdict hash yet"))?;
        if !signature.verify(&key, &hash) {
            return Err(Fault::interrupt(format!(
                "verdict signature from {from} doesn't match"
            )));
        }

        server.verdict_signatures.insert(sidx, signature);
        let have = server.verdict_signatures.len();
        debug!("received verdict signature from {sidx} ({from}); have {have} expecting {server_count}");
        if have == server_count {
            self.advance(rng);
        }
        Ok(())
    }

    pub(crate) fn push_verdict(&mut self) -> Result<Entry, Fault> {
        let hdr = self.header();
        let server_count = self.servers.len();
        let (accusation, bad_dude, signatures) = {
            let server = self.server_state()?;
            let accusation = server
                .current_blame
                .ok_or_else(|| Fault::stop("no accusation selected"))?;
            let bad_dude = server
                .bad_dude
                .ok_or_else(|| Fault::stop("no verdict reached"))?;
            let mut signatures = Vec::with_capacity(server_count);
            for idx in 0..server_count {
                signatures.push(
                    server
                        .verdict_signatures
                        .get(&idx)
                        .cloned()
                        .ok_or_else(|| Fault::stop("missing verdict signature"))?,
                );
            }
            (accusation, bad_dude, signatures)
        };

        self.broadcast_to_clients(&Message::ServerRebuttalOrVerdict {
            hdr,
            body: RebuttalOrVerdict::Verdict {
                accusation,
                bad_dude,
                signatures,
            },
        })?;

        debug!("Verdict shared, bad guy: {bad_dude}");
        self.report_bad_member(bad_dude);
        Ok(Entry::Stopped)
    }
}
