//! The bulk phase protocol: client submit, server collect / commit / reveal
//! / validate / push, and the shared cleartext processing that closes every
//! phase.

use std::collections::BTreeMap;

use k256::ecdsa::Signature;
use rand_core::CryptoRngCore;
use signature::hazmat::{PrehashSigner, PrehashVerifier};
use tracing::debug;

use super::{DcNetRound, Entry};
use crate::ciphertext::{
    auth_length, commit_hash, derandomize, encode_slot, generate_pad, parse_slot, randomize,
    slot_digest, slot_header_length, xor_into,
};
use crate::config::SLOT_FIXED_BYTES;
use crate::error::Fault;
use crate::messages::{Message, WireSignature};
use crate::roster::PeerId;
use crate::state::State;
use crate::tools::bitvec::{bit_at, BitVec};
use crate::tools::hashing::{Chain, Hash, HashOutput};

/// The hash every server signs to validate a phase: the cleartext and the
/// inclusion set it was reconstructed from.
pub(crate) fn cleartext_hash(cleartext: &[u8], included: &BitVec) -> HashOutput {
    Hash::new_with_dst(b"Cleartext")
        .chain_bytes(cleartext)
        .chain(included)
        .finalize()
}

/// The first bit position (relative to the slot start) where `received`
/// differs from `sent` with the sent bit clear.
///
/// A 0-to-1 flip is the disruptor's signature in a pad-XOR scheme; a 1-to-0
/// difference cannot be pinned on anyone and is skipped.
fn first_blamable_flip(sent: &[u8], received: &[u8]) -> Option<usize> {
    for (pidx, (&expected, &actual)) in sent.iter().zip(received).enumerate() {
        if expected == actual {
            continue;
        }
        for bidx in 0..8 {
            let mask = 1u8 << bidx;
            if actual & mask == expected & mask {
                continue;
            }
            if expected & mask != 0 {
                debug!("Bit flipped, but expected bit isn't 0");
                continue;
            }
            return Some(pidx * 8 + bidx);
        }
    }
    None
}

impl DcNetRound {
    // ---- client side ----

    pub(crate) fn submit_client_ciphertext(
        &mut self,
        rng: &mut impl CryptoRngCore,
    ) -> Result<(), Fault> {
        let ciphertext = self.generate_ciphertext(rng)?.into_boxed_slice();
        let hdr = self.header();
        let my_server = self
            .my_server
            .ok_or_else(|| Fault::reject("no designated server"))?;
        self.send_to(&my_server, &Message::ClientCiphertext { hdr, ciphertext })
    }

    pub(crate) fn handle_server_cleartext(
        &mut self,
        rng: &mut impl CryptoRngCore,
        from: &PeerId,
        signatures: Vec<WireSignature>,
        cleartext: &[u8],
        included: BitVec,
    ) -> Result<(), Fault> {
        if self.is_server {
            return Err(Fault::reject("Not a client"));
        }
        if self.my_server != Some(*from) {
            return Err(Fault::reject("Not a server"));
        }
        if cleartext.len() != self.state.msg_length {
            return Err(Fault::reject(format!(
                "Cleartext size mismatch: {} :: {}",
                cleartext.len(),
                self.state.msg_length
            )));
        }
        if signatures.len() != self.servers.len() {
            return Err(Fault::reject("wrong validation signature count"));
        }
        if included.len() != self.clients.len() {
            return Err(Fault::reject("wrong inclusion bitmap length"));
        }

        let hash = cleartext_hash(cleartext, &included);
        for (idx, signature) in signatures.iter().enumerate() {
            let key = self.servers.get(idx).expect("length checked").signing_key();
            if !signature.verify(key, &hash) {
                return Err(Fault::stop("Failed to verify signatures"));
            }
        }

        self.state.cleartext = cleartext.to_vec();
        self.process_cleartext()?;

        if self.state.start_accuse {
            self.before_transition();
            self.sm.set_state(State::StartingBlameShuffle);
            self.run_entries(rng);
        } else {
            self.advance(rng);
        }
        Ok(())
    }

    // ---- server side ----

    pub(crate) fn set_online_clients(&mut self) -> Result<Entry, Fault> {
        let percentage = self.config.client_percentage;
        let window = self.config.client_submission_window;
        let now = self.scheduler.now();
        let server = self
            .server
            .as_mut()
            .ok_or_else(|| Fault::reject("Not a server"))?;
        if server.allowed_clients.is_empty() {
            return Ok(Entry::Complete);
        }
        server.start_of_phase = now;
        server.expected_clients =
            (server.allowed_clients.len() as f64 * percentage).ceil() as usize;
        // the hard deadline; the flex deadline may replace it later
        server.submission_timer = Some(self.scheduler.schedule(window));
        Ok(Entry::Wait)
    }

    pub(crate) fn handle_client_ciphertext(
        &mut self,
        rng: &mut impl CryptoRngCore,
        from: &PeerId,
        ciphertext: &[u8],
    ) -> Result<(), Fault> {
        let msg_length = self.state.msg_length;
        let client_idx = self
            .clients
            .index_of(from)
            .ok_or_else(|| Fault::reject("Not a client"))?;
        let server = self
            .server
            .as_mut()
            .ok_or_else(|| Fault::reject("Not a server"))?;

        if !server.allowed_clients.contains(from) {
            return Err(Fault::reject("Not allowed to submit a ciphertext"));
        }
        if server.handled_clients.get(client_idx) {
            return Err(Fault::reject("Already have ciphertext"));
        }
        if ciphertext.len() != msg_length {
            return Err(Fault::reject(format!(
                "Incorrect message length, got {} expected {}",
                ciphertext.len(),
                msg_length
            )));
        }

        server.handled_clients.set(client_idx, true);
        server.client_ciphertexts.push((client_idx, ciphertext.to_vec()));
        server
            .logs
            .current_mut()
            .messages
            .insert(client_idx, ciphertext.to_vec());

        let have = server.client_ciphertexts.len();
        let allowed = server.allowed_clients.len();
        debug!("received client ciphertext from {client_idx} ({from}); have {have} expecting {allowed}");

        if have == allowed {
            self.advance(rng);
        } else if have == server.expected_clients {
            // Enough clients made it; shrink the window to the time they
            // took, so one straggler cannot hold the phase open.
            if let Some(mut timer) = server.submission_timer.take() {
                timer.stop();
            }
            let window = self.scheduler.now().saturating_sub(server.start_of_phase);
            server.submission_timer = Some(self.scheduler.schedule(window));
            debug!("setting client submission flex-deadline: {window:?}");
        }
        Ok(())
    }

    pub(crate) fn submit_client_list(&mut self) -> Result<(), Fault> {
        let hdr = self.header();
        let clients = self.server_state()?.handled_clients.clone();
        debug!("sharing a client list with {} entries", clients.count_ones());
        self.broadcast_to_servers(&Message::ServerClientList { hdr, clients })
    }

    pub(crate) fn handle_server_client_list(
        &mut self,
        rng: &mut impl CryptoRngCore,
        from: &PeerId,
        clients: BitVec,
    ) -> Result<(), Fault> {
        self.server_index(from)?;
        let client_count = self.clients.len();
        let server_count = self.servers.len();
        let server = self.server_state()?;

        if server.handled_servers.contains(from) {
            return Err(Fault::reject("Already have client list"));
        }
        if clients.len() != client_count {
            return Err(Fault::interrupt(format!(
                "client list from {from} has {} entries, expected {client_count}",
                clients.len()
            )));
        }

        server.handled_clients |= &clients;
        server.handled_servers.insert(*from);

        let have = server.handled_servers.len();
        debug!("received client list from {from}; have {have} expecting {server_count}");
        if have == server_count {
            self.advance(rng);
        }
        Ok(())
    }

    pub(crate) fn submit_commit(&mut self, rng: &mut impl CryptoRngCore) -> Result<(), Fault> {
        self.generate_server_ciphertext(rng)?;
        let hdr = self.header();
        let commit = self
            .server_state()?
            .my_commit
            .ok_or_else(|| Fault::stop("no commitment to submit"))?;
        self.broadcast_to_servers(&Message::ServerCommit { hdr, commit })
    }

    fn generate_server_ciphertext(&mut self, rng: &mut impl CryptoRngCore) -> Result<(), Fault> {
        let mut ciphertext = self.generate_ciphertext(rng)?;
        let server = self.server_state()?;
        for (idx, text) in &server.client_ciphertexts {
            if server.handled_clients.get(*idx) {
                xor_into(&mut ciphertext, text);
            }
        }
        server.my_commit = Some(commit_hash(&ciphertext));
        server.my_ciphertext = ciphertext;
        Ok(())
    }

    pub(crate) fn handle_server_commit(
        &mut self,
        rng: &mut impl CryptoRngCore,
        from: &PeerId,
        commit: HashOutput,
    ) -> Result<(), Fault> {
        let sidx = self.server_index(from)?;
        let server_count = self.servers.len();
        let server = self.server_state()?;

        if server.handled_servers.contains(from) {
            return Err(Fault::reject("Already have commit"));
        }
        server.handled_servers.insert(*from);
        server.server_commits.insert(sidx, commit);

        let have = server.handled_servers.len();
        debug!("received commit from {sidx} ({from}); have {have} expecting {server_count}");
        if have == server_count {
            self.advance(rng);
        }
        Ok(())
    }

    pub(crate) fn submit_server_ciphertext(&mut self) -> Result<(), Fault> {
        let hdr = self.header();
        let ciphertext = self.server_state()?.my_ciphertext.clone().into_boxed_slice();
        self.broadcast_to_servers(&Message::ServerCiphertext { hdr, ciphertext })
    }

    pub(crate) fn handle_server_ciphertext(
        &mut self,
        rng: &mut impl CryptoRngCore,
        from: &PeerId,
        ciphertext: &[u8],
    ) -> Result<(), Fault> {
        let sidx = self.server_index(from)?;
        let msg_length = self.state.msg_length;
        let server_count = self.servers.len();
        let server = self.server_state()?;

        if server.handled_servers.contains(from) {
            return Err(Fault::reject("Already have ciphertext"));
        }
        if ciphertext.len() != msg_length {
            return Err(Fault::interrupt(format!(
                "Incorrect message length, got {} expected {}",
                ciphertext.len(),
                msg_length
            )));
        }
        if server.server_commits.get(&sidx) != Some(&commit_hash(ciphertext)) {
            return Err(Fault::stop("Does not match commit."));
        }

        server.handled_servers.insert(*from);
        server.server_ciphertexts.insert(sidx, ciphertext.to_vec());
        server
            .logs
            .current_mut()
            .server_messages
            .insert(sidx, ciphertext.to_vec());

        let have = server.handled_servers.len();
        debug!("received ciphertext from {sidx} ({from}); have {have} expecting {server_count}");
        if have == server_count {
            self.advance(rng);
        }
        Ok(())
    }

    pub(crate) fn submit_validation(&mut self) -> Result<(), Fault> {
        let msg_length = self.state.msg_length;
        let (cleartext, hash) = {
            let server = self.server_state()?;
            let mut cleartext = vec![0; msg_length];
            for ciphertext in server.server_ciphertexts.values() {
                xor_into(&mut cleartext, ciphertext);
            }
            let hash = cleartext_hash(&cleartext, &server.handled_clients);
            server.signed_hash = Some(hash);
            (cleartext, hash)
        };
        self.state.cleartext = cleartext;

        let signature = WireSignature::sign(self.local.signing_key(), &hash)?;
        let hdr = self.header();
        self.broadcast_to_servers(&Message::ServerValidation { hdr, signature })
    }

    pub(crate) fn handle_server_validation(
        &mut self,
        rng: &mut impl CryptoRngCore,
        from: &PeerId,
        signature: WireSignature,
    ) -> Result<(), Fault> {
        let sidx = self.server_index(from)?;
        let key = *self.servers.get(sidx).expect("index from roster").signing_key();
        let server_count = self.servers.len();
        let server = self.server_state()?;

        if server.handled_servers.contains(from) {
            return Err(Fault::reject("Already have signature."));
        }
        let signed_hash = server
            .signed_hash
            .ok_or_else(|| Fault::reject("no local validation hash yet"))?;
        if !signature.verify(&key, &signed_hash) {
            return Err(Fault::interrupt(format!(
                "validation signature from {from} doesn't match"
            )));
        }

        server.handled_servers.insert(*from);
        server.signatures.insert(sidx, signature);

        let have = server.handled_servers.len();
        debug!("received validation from {sidx} ({from}); have {have} expecting {server_count}");
        if have == server_count {
            self.advance(rng);
        }
        Ok(())
    }

    pub(crate) fn push_cleartext(&mut self) -> Result<Entry, Fault> {
        let hdr = self.header();
        let server_count = self.servers.len();
        let (signatures, included) = {
            let server = self.server_state()?;
            let mut signatures = Vec::with_capacity(server_count);
            for idx in 0..server_count {
                signatures.push(
                    server
                        .signatures
                        .get(&idx)
                        .cloned()
                        .ok_or_else(|| Fault::stop("missing validation signature"))?,
                );
            }
            (signatures, server.handled_clients.clone())
        };
        let cleartext = self.state.cleartext.clone().into_boxed_slice();
        self.broadcast_to_clients(&Message::ServerCleartext {
            hdr,
            signatures,
            cleartext,
            included,
        })?;

        self.process_cleartext()?;
        if self.state.start_accuse {
            Ok(Entry::Goto(State::StartingBlameShuffle))
        } else {
            Ok(Entry::Complete)
        }
    }

    // ---- ciphertext generation (both roles) ----

    pub(crate) fn generate_ciphertext(
        &mut self,
        rng: &mut impl CryptoRngCore,
    ) -> Result<Vec<u8>, Fault> {
        let length = self.state.msg_length;
        let phase = self.sm.phase();
        let mut xor_msg = vec![0u8; length];

        if let Some(server) = self.server.as_mut() {
            let included: Vec<usize> = (0..self.clients.len())
                .filter(|idx| server.handled_clients.get(*idx))
                .collect();
            debug!(
                "generating ciphertext for {} out of {}",
                included.len(),
                self.clients.len()
            );
            for idx in included {
                let pad = generate_pad(&self.state.base_seeds[idx], phase, &self.nonce, length);
                xor_into(&mut xor_msg, &pad);
                server.logs.current_mut().my_sub_ciphertexts.insert(idx, pad);
            }
        } else {
            for seed in &self.state.base_seeds {
                xor_into(&mut xor_msg, &generate_pad(seed, phase, &self.nonce, length));
            }
        }

        let Some(my_idx) = self.state.my_idx else {
            return Ok(xor_msg);
        };
        if self.state.slot_open {
            let mut slot_offset = self.state.base_msg_length;
            for (&owner, &len) in &self.state.next_messages {
                if owner == my_idx {
                    break;
                }
                slot_offset += len;
            }
            let my_msg = self.generate_slot_message(rng)?;
            debug!(
                "Writing ciphertext into my slot {my_idx} starting at {slot_offset} for {} bytes.",
                my_msg.len()
            );
            let end = slot_offset + my_msg.len();
            if end > xor_msg.len() {
                return Err(Fault::stop("slot write out of bounds"));
            }
            xor_into(&mut xor_msg[slot_offset..end], &my_msg);
        } else if self.check_data() {
            debug!("Opening my slot {my_idx}");
            xor_msg[my_idx / 8] ^= 1 << (my_idx % 8);
            self.state.read = false;
            self.state.slot_open = true;
        }
        Ok(xor_msg)
    }

    fn check_data(&mut self) -> bool {
        if !self.state.next_msg.is_empty() {
            return true;
        }
        let (data, _more) = self.source.get_data(self.config.max_get);
        if !data.is_empty() {
            debug!("Found a message of {}", data.len());
        }
        self.state.next_msg = data;
        self.state.last_msg.clear();
        !self.state.next_msg.is_empty()
    }

    fn generate_slot_message(&mut self, rng: &mut impl CryptoRngCore) -> Result<Vec<u8>, Fault> {
        let phase = self.sm.phase();
        let msg = if self.state.read {
            self.state.last_msg = std::mem::take(&mut self.state.next_msg);
            let (data, _more) = self.source.get_data(self.config.max_get);
            self.state.next_msg = data;
            self.state.last_msg.clone()
        } else {
            self.state.read = !self.state.accuse;
            self.state.last_msg.clone()
        };

        let header_len = slot_header_length(self.config.sign_slots);
        let mut next_length = self.state.next_msg.len() + header_len;
        if self.config.close_empty_slot && self.state.next_msg.is_empty() {
            self.state.slot_open = false;
            next_length = 0;
        }

        let plain = if self.state.accuse {
            // An accusing message sacrifices its payload: same size, all
            // zeros, flag set, and the slot stays at header length.
            encode_slot(true, phase, header_len as u32, &vec![0; msg.len()])
        } else {
            encode_slot(false, phase, next_length as u32, &msg)
        };

        let digest = slot_digest(&plain);
        let auth: Vec<u8> = if self.config.sign_slots {
            let key = self
                .state
                .anonymous_key
                .as_ref()
                .ok_or_else(|| Fault::stop("no anonymous key to sign the slot with"))?;
            let signature: Signature = key
                .sign_prehash(digest.as_ref())
                .map_err(|err| Fault::stop(format!("slot signing failed: {err}")))?;
            signature.to_vec()
        } else {
            digest.as_ref().to_vec()
        };

        let mut plain_with_auth = plain;
        plain_with_auth.extend_from_slice(&auth);
        self.state.last_ciphertext = randomize(rng, &plain_with_auth);
        Ok(self.state.last_ciphertext.clone())
    }

    // ---- cleartext processing (both roles) ----

    pub(crate) fn process_cleartext(&mut self) -> Result<(), Fault> {
        let client_count = self.clients.len();
        let phase = self.sm.phase();
        let sign_slots = self.config.sign_slots;
        let header_len = slot_header_length(sign_slots);
        let auth_len = auth_length(sign_slots);
        let cleartext = self.state.cleartext.clone();
        let current_layout = self.state.next_messages.clone();

        let mut next_msgs: BTreeMap<usize, usize> = BTreeMap::new();
        let mut next_length = self.state.base_msg_length;
        for idx in 0..client_count {
            if bit_at(&cleartext, idx) {
                debug!("Opening slot {idx}");
                next_msgs.insert(idx, header_len);
                next_length += header_len;
            }
        }

        if let Some(server) = self.server.as_mut() {
            let log = server.logs.current_mut();
            log.message_offsets.clear();
            let mut calc = self.state.base_msg_length;
            for idx in 0..client_count {
                log.message_offsets.push(calc);
                calc += current_layout.get(&idx).copied().unwrap_or(0);
            }
        }

        let mut offset = self.state.base_msg_length;
        for (&owner, &length) in &current_layout {
            if length == 0 {
                continue;
            }
            let slot_start = offset;
            offset += length;
            if offset > cleartext.len() {
                return Err(Fault::stop("cleartext shorter than its slot layout"));
            }
            let slot_bytes = &cleartext[slot_start..offset];

            let plain_with_auth = derandomize(slot_bytes);
            if plain_with_auth.is_empty() {
                debug!("No message at {owner}");
                next_msgs.insert(owner, length);
                next_length += length;
                if self.state.my_idx == Some(owner) {
                    self.state.read = false;
                    self.state.slot_open = true;
                    debug!("My message didn't make it in time.");
                }
                continue;
            }

            if plain_with_auth.len() < SLOT_FIXED_BYTES + auth_len {
                debug!("Unable to verify message for peer at {owner}");
                next_msgs.insert(owner, length);
                next_length += length;
                if self.state.my_idx == Some(owner) && !self.state.accuse {
                    self.note_own_slot_corruption(slot_start, slot_bytes, phase);
                }
                continue;
            }

            let (plain, auth) = plain_with_auth.split_at(plain_with_auth.len() - auth_len);
            let verified = if sign_slots {
                match Signature::from_slice(auth) {
                    Ok(signature) => self.state.anonymous_keys[owner]
                        .verify_prehash(slot_digest(plain).as_ref(), &signature)
                        .is_ok(),
                    Err(_) => false,
                }
            } else {
                slot_digest(plain).as_ref() == auth
            };

            let mut bad_message = false;
            if !verified {
                debug!("Unable to verify message for peer at {owner}");
                next_msgs.insert(owner, length);
                next_length += length;
                if self.state.my_idx == Some(owner) && !self.state.accuse {
                    self.note_own_slot_corruption(slot_start, slot_bytes, phase);
                }
                bad_message = true;
            }

            let parsed = parse_slot(plain).expect("length checked above");
            if parsed.accuse {
                self.state.start_accuse = true;
                self.state.accuser = owner;
                if self.state.my_idx == Some(owner) {
                    // Only submit an accusation if we actually found one.
                    self.state.my_accuse = self.state.accuse;
                }
                debug!("Accusation generated by {owner}");
            }

            if bad_message {
                continue;
            }

            if parsed.phase != phase {
                debug!("Incorrect phase, skipping message");
                next_msgs.insert(owner, length);
                next_length += length;
                continue;
            }

            let next = parsed.next_length as usize;
            if next != 0 && next < header_len {
                debug!("Invalid next message size, skipping message");
                next_msgs.insert(owner, length);
                next_length += length;
                continue;
            }
            if next > 0 {
                debug!("Slot {owner} next message length: {next}");
                next_msgs.insert(owner, next);
                next_length += next;
            } else {
                debug!("Slot {owner} closing");
            }

            if !parsed.data.is_empty() {
                debug!("received a valid message in slot {owner}");
                self.sink.push_data(owner, parsed.data);
            }
        }

        if let Some(server) = self.server.as_mut() {
            server.logs.current_mut().message_length = offset;
        }
        self.state.next_messages = next_msgs;
        self.state.msg_length = next_length;
        Ok(())
    }

    /// The owner's own slot failed to decode: reopen it for retransmission
    /// and look for a blamable flip against the envelope that was sent.
    fn note_own_slot_corruption(&mut self, slot_start: usize, slot_bytes: &[u8], phase: u32) {
        self.state.read = false;
        self.state.slot_open = true;
        match first_blamable_flip(&self.state.last_ciphertext, slot_bytes) {
            Some(bit) => {
                self.state.accuse_idx = (slot_start * 8 + bit) as u32;
                self.state.accuse = true;
                self.state.blame_phase = phase;
                debug!(
                    "My message got corrupted, blaming {} {}",
                    self.state.accuse_idx, phase
                );
            }
            None => debug!("My message got corrupted, cannot blame"),
        }
    }
}
