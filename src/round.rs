//! The round object: one state machine driving a client or server through
//! the bulk cycle and, when an accusation surfaces, the blame subprotocol.

use core::time::Duration;
use std::collections::{BTreeMap, BTreeSet};

use k256::ecdsa::{SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use tracing::{debug, warn};

use crate::config::Config;
use crate::dh::SharedSecret;
use crate::error::{Fault, LocalError};
use crate::host::{DataSink, DataSource, Overlay, Scheduler, ShuffleRound, TimerHandle};
use crate::messages::{
    Accusation, Header, Message, Nonce, SignedMessage, WireSignature, TAG_BLAME_SHUFFLE,
    TAG_BOOTSTRAP_SHUFFLE, TAG_BULK,
};
use crate::phase_log::PhaseLogs;
use crate::roster::{PeerId, PrivateIdentity, PublicIdentity, Roster};
use crate::state::{State, StateMachine};
use crate::tools::bitvec::BitVec;
use crate::tools::hashing::HashOutput;

mod blame;
mod bulk;
#[cfg(test)]
mod tests;

/// The host-provided services a round runs against.
pub struct Collaborators {
    /// Byte transport to the other participants.
    pub overlay: Box<dyn Overlay>,
    /// The bootstrap shuffle assigning anonymous keys to slots.
    pub shuffle: Box<dyn ShuffleRound>,
    /// The shuffle delivering accusation records anonymously.
    pub blame_shuffle: Box<dyn ShuffleRound>,
    /// Supplies the payloads this participant publishes.
    pub source: Box<dyn DataSource>,
    /// Receives the payloads recovered from each cleartext.
    pub sink: Box<dyn DataSink>,
    /// Monotonic time and one-shot timers.
    pub scheduler: Box<dyn Scheduler>,
}

/// State shared by both roles.
pub(crate) struct SharedState {
    /// The anonymous slot-signing key (clients only).
    pub anonymous_key: Option<SigningKey>,
    /// This participant's bootstrap shuffle input (the encoded anonymous
    /// public key), kept to locate the own slot in the shuffle output.
    pub shuffle_data: Vec<u8>,
    /// The shuffled anonymous keys, in slot order.
    pub anonymous_keys: Vec<VerifyingKey>,
    /// The slot this participant owns (clients only).
    pub my_idx: Option<usize>,
    /// Pairwise DH secrets: per server for a client, per client for a server.
    pub base_seeds: Vec<SharedSecret>,
    /// Length of the current phase's cleartext.
    pub msg_length: usize,
    /// Length of the open-slot bitmap prefix.
    pub base_msg_length: usize,
    /// The last validated cleartext.
    pub cleartext: Vec<u8>,
    /// Slot owner index to that slot's length in the next phase.
    pub next_messages: BTreeMap<usize, usize>,
    pub slot_open: bool,
    /// Whether the next slot write consumes fresh data (as opposed to
    /// retransmitting `last_msg` after a disrupted phase).
    pub read: bool,
    pub next_msg: Vec<u8>,
    pub last_msg: Vec<u8>,
    /// The randomized slot envelope as last sent, compared byte-for-byte
    /// against the cleartext to locate a disruptor's bit flip.
    pub last_ciphertext: Vec<u8>,
    /// A pending accusation detected in the own slot.
    pub accuse: bool,
    pub accuse_idx: u32,
    pub blame_phase: u32,
    /// Whether this participant submits its accusation to the blame shuffle.
    pub my_accuse: bool,
    /// Whether any slot carried the accusation flag this phase.
    pub start_accuse: bool,
    /// The slot that carried the accusation flag.
    pub accuser: usize,
}

impl SharedState {
    fn new(anonymous_key: Option<SigningKey>, shuffle_data: Vec<u8>) -> Self {
        Self {
            anonymous_key,
            shuffle_data,
            anonymous_keys: Vec::new(),
            my_idx: None,
            base_seeds: Vec::new(),
            msg_length: 0,
            base_msg_length: 0,
            cleartext: Vec::new(),
            next_messages: BTreeMap::new(),
            slot_open: false,
            read: true,
            next_msg: Vec::new(),
            last_msg: Vec::new(),
            last_ciphertext: Vec::new(),
            accuse: false,
            accuse_idx: 0,
            blame_phase: 0,
            my_accuse: false,
            start_accuse: false,
            accuser: 0,
        }
    }
}

/// State a server keeps on top of [`SharedState`].
pub(crate) struct ServerState {
    pub allowed_clients: BTreeSet<PeerId>,
    /// Submission count that arms the flex deadline.
    pub expected_clients: usize,
    pub start_of_phase: Duration,
    pub submission_timer: Option<Box<dyn TimerHandle>>,
    /// Clients included this phase (own submissions plus peer lists).
    pub handled_clients: BitVec,
    pub client_ciphertexts: Vec<(usize, Vec<u8>)>,
    /// Servers heard from in the current collection state.
    pub handled_servers: BTreeSet<PeerId>,
    pub server_commits: BTreeMap<usize, HashOutput>,
    pub server_ciphertexts: BTreeMap<usize, Vec<u8>>,
    pub signatures: BTreeMap<usize, WireSignature>,
    pub signed_hash: Option<HashOutput>,
    pub my_ciphertext: Vec<u8>,
    pub my_commit: Option<HashOutput>,
    pub logs: PhaseLogs,
    // blame
    pub blame_bits: BTreeMap<usize, (BitVec, BitVec)>,
    pub current_blame: Option<Accusation>,
    pub server_bits: Option<BitVec>,
    pub expected_rebuttal: Option<PeerId>,
    pub bad_dude: Option<PeerId>,
    pub verdict_hash: Option<HashOutput>,
    pub verdict_signatures: BTreeMap<usize, WireSignature>,
}

impl ServerState {
    fn new(clients: &Roster) -> Self {
        Self {
            allowed_clients: clients.iter().map(|c| c.id()).collect(),
            expected_clients: 0,
            start_of_phase: Duration::ZERO,
            submission_timer: None,
            handled_clients: BitVec::new(clients.len()),
            client_ciphertexts: Vec::new(),
            handled_servers: BTreeSet::new(),
            server_commits: BTreeMap::new(),
            server_ciphertexts: BTreeMap::new(),
            signatures: BTreeMap::new(),
            signed_hash: None,
            my_ciphertext: Vec::new(),
            my_commit: None,
            logs: PhaseLogs::new(clients.len()),
            blame_bits: BTreeMap::new(),
            current_blame: None,
            server_bits: None,
            expected_rebuttal: None,
            bad_dude: None,
            verdict_hash: None,
            verdict_signatures: BTreeMap::new(),
        }
    }
}

/// What an entry action leaves the state machine doing.
pub(crate) enum Entry {
    /// The state waits for messages, a timer, or a nested round.
    Wait,
    /// The entry action finished; follow the transition table.
    Complete,
    /// Jump off the transition table (the accusation fork).
    Goto(State),
    /// The entry action terminated the round.
    Stopped,
}

/// One accountable-anonymity bulk round, client or server role.
pub struct DcNetRound {
    pub(crate) clients: Roster,
    pub(crate) servers: Roster,
    pub(crate) local: PrivateIdentity,
    pub(crate) is_server: bool,
    pub(crate) my_server: Option<PeerId>,
    pub(crate) nonce: Nonce,
    pub(crate) config: Config,

    pub(crate) overlay: Box<dyn Overlay>,
    pub(crate) shuffle: Box<dyn ShuffleRound>,
    pub(crate) blame_shuffle: Box<dyn ShuffleRound>,
    pub(crate) source: Box<dyn DataSource>,
    pub(crate) sink: Box<dyn DataSink>,
    pub(crate) scheduler: Box<dyn Scheduler>,

    pub(crate) sm: StateMachine,
    pub(crate) state: SharedState,
    pub(crate) server: Option<ServerState>,

    shuffle_handled: bool,
    blame_shuffle_handled: bool,
    stop_next: bool,
    finished: bool,
    successful: bool,
    interrupted: bool,
    stop_reason: Option<String>,
    bad_members: Vec<PeerId>,
}

impl DcNetRound {
    /// Creates a round for the local participant.
    ///
    /// The role follows from which roster contains the local identity.
    /// A client must name the server it submits through (`my_server`).
    pub fn new(
        rng: &mut impl CryptoRngCore,
        clients: Roster,
        servers: Roster,
        local: PrivateIdentity,
        my_server: Option<PeerId>,
        nonce: Nonce,
        config: Config,
        collaborators: Collaborators,
    ) -> Result<Self, LocalError> {
        if clients.is_empty() || servers.is_empty() {
            return Err(LocalError::new("both rosters must be non-empty"));
        }
        let is_server = servers.contains(&local.id());
        if !is_server && !clients.contains(&local.id()) {
            return Err(LocalError::new("the local identity is in neither roster"));
        }
        if !is_server {
            let my_server =
                my_server.ok_or_else(|| LocalError::new("a client must name its server"))?;
            if !servers.contains(&my_server) {
                return Err(LocalError::new("my_server is not in the server roster"));
            }
        }

        let (anonymous_key, shuffle_data) = if is_server {
            (None, Vec::new())
        } else {
            let key = SigningKey::random(rng);
            let encoded = key.verifying_key().to_encoded_point(true).as_bytes().to_vec();
            (Some(key), encoded)
        };

        let mut sm = StateMachine::new();
        sm.add_transition(State::Offline, State::Shuffling);
        sm.add_transition(State::Shuffling, State::ProcessBootstrap);
        sm.add_transition(State::ProcessBootstrap, State::PrepareForBulk);
        sm.add_transition(State::StartingBlameShuffle, State::WaitingForBlameShuffle);
        if is_server {
            Self::init_server(&mut sm);
        } else {
            Self::init_client(&mut sm);
        }

        let server = is_server.then(|| ServerState::new(&clients));

        Ok(Self {
            clients,
            servers,
            local,
            is_server,
            my_server: if is_server { None } else { my_server },
            nonce,
            config,
            overlay: collaborators.overlay,
            shuffle: collaborators.shuffle,
            blame_shuffle: collaborators.blame_shuffle,
            source: collaborators.source,
            sink: collaborators.sink,
            scheduler: collaborators.scheduler,
            sm,
            state: SharedState::new(anonymous_key, shuffle_data),
            server,
            shuffle_handled: false,
            blame_shuffle_handled: false,
            stop_next: false,
            finished: false,
            successful: true,
            interrupted: false,
            stop_reason: None,
            bad_members: Vec::new(),
        })
    }

    fn init_client(sm: &mut StateMachine) {
        use crate::messages::MessageType as M;

        sm.expect(State::ClientWaitForCleartext, M::ServerCleartext);
        sm.expect(State::WaitingForDataRequestOrVerdict, M::ServerRebuttalOrVerdict);

        sm.add_transition(State::PrepareForBulk, State::ClientWaitForCleartext);
        sm.add_transition(State::ClientWaitForCleartext, State::ClientWaitForCleartext);
        sm.set_cycle_state(State::ClientWaitForCleartext);

        sm.add_transition(
            State::WaitingForBlameShuffle,
            State::WaitingForDataRequestOrVerdict,
        );
    }

    fn init_server(sm: &mut StateMachine) {
        use crate::messages::MessageType as M;

        sm.expect(State::ServerWaitForClientCiphertext, M::ClientCiphertext);
        sm.expect(State::ServerWaitForClientLists, M::ServerClientList);
        sm.expect(State::ServerWaitForServerCommits, M::ServerCommit);
        sm.expect(State::ServerWaitForServerCiphertext, M::ServerCiphertext);
        sm.expect(State::ServerWaitForServerValidation, M::ServerValidation);
        sm.expect(State::ServerWaitingForBlameBits, M::ServerBlameBits);
        sm.expect(State::ServerWaitForClientRebuttal, M::ClientRebuttal);
        sm.expect(State::ServerWaitForVerdictSignature, M::ServerVerdictSignature);

        sm.add_transition(State::PrepareForBulk, State::ServerWaitForClientCiphertext);
        sm.add_transition(
            State::ServerWaitForClientCiphertext,
            State::ServerWaitForClientLists,
        );
        sm.add_transition(
            State::ServerWaitForClientLists,
            State::ServerWaitForServerCommits,
        );
        sm.add_transition(
            State::ServerWaitForServerCommits,
            State::ServerWaitForServerCiphertext,
        );
        sm.add_transition(
            State::ServerWaitForServerCiphertext,
            State::ServerWaitForServerValidation,
        );
        sm.add_transition(
            State::ServerWaitForServerValidation,
            State::ServerPushCleartext,
        );
        sm.add_transition(
            State::ServerPushCleartext,
            State::ServerWaitForClientCiphertext,
        );
        sm.set_cycle_state(State::ServerPushCleartext);

        sm.add_transition(State::WaitingForBlameShuffle, State::ServerTransmitBlameBits);
        sm.add_transition(
            State::ServerTransmitBlameBits,
            State::ServerWaitingForBlameBits,
        );
        sm.add_transition(
            State::ServerWaitingForBlameBits,
            State::ServerRequestClientRebuttal,
        );
        sm.add_transition(
            State::ServerRequestClientRebuttal,
            State::ServerWaitForClientRebuttal,
        );
        sm.add_transition(
            State::ServerWaitForClientRebuttal,
            State::ServerExchangeVerdictSignature,
        );
        sm.add_transition(
            State::ServerExchangeVerdictSignature,
            State::ServerWaitForVerdictSignature,
        );
        sm.add_transition(State::ServerWaitForVerdictSignature, State::ServerShareVerdict);
    }

    /// Starts the round: kicks off the bootstrap shuffle.
    pub fn start(&mut self, rng: &mut impl CryptoRngCore) -> Result<(), LocalError> {
        if self.sm.current() != State::Offline {
            return Err(LocalError::new("the round was already started"));
        }
        self.advance(rng);
        self.check_shuffles(rng);
        Ok(())
    }

    /// Feeds the round one inbound packet (outer sub-protocol framing
    /// included).
    pub fn process_packet(&mut self, rng: &mut impl CryptoRngCore, from: &PeerId, data: &[u8]) {
        if self.finished {
            return;
        }
        let Some((&tag, rest)) = data.split_first() else {
            warn!("Invalid data");
            return;
        };
        match tag {
            TAG_BULK => {
                if let Err(fault) = self.process_bulk(rng, from, rest) {
                    self.apply_fault(Some(from), fault);
                }
            }
            TAG_BOOTSTRAP_SHUFFLE => self.shuffle.process_packet(from, rest),
            TAG_BLAME_SHUFFLE => self.blame_shuffle.process_packet(from, rest),
            other => warn!("Unknown packet type: {other}"),
        }
        self.check_shuffles(rng);
    }

    /// Signals that a nested shuffle may have completed.
    ///
    /// Idempotent; the host calls this when a shuffle it drives out-of-band
    /// finishes. Shuffles fed through [`Self::process_packet`] are also
    /// checked after every packet.
    pub fn operation_finished(&mut self, rng: &mut impl CryptoRngCore) {
        if !self.finished {
            self.check_shuffles(rng);
        }
    }

    /// Signals that the client-submission deadline fired.
    ///
    /// Ignored outside the ciphertext collection state, so a stale timer the
    /// host failed to cancel is harmless.
    pub fn submission_window_closed(&mut self, rng: &mut impl CryptoRngCore) {
        if self.finished || self.sm.current() != State::ServerWaitForClientCiphertext {
            return;
        }
        debug!("Client window has closed, unfortunately some client may not have transmitted in time.");
        self.advance(rng);
    }

    /// Signals a lost connection.
    pub fn handle_disconnect(&mut self, id: &PeerId) {
        if self.finished {
            return;
        }
        if !self.servers.contains(id) && !self.clients.contains(id) {
            return;
        }
        if self.clients.contains(id) {
            if let Some(server) = self.server.as_mut() {
                server.allowed_clients.remove(id);
            }
        }
        match self.sm.current() {
            State::Offline | State::Shuffling => self.shuffle.handle_disconnect(id),
            _ if self.servers.contains(id) => {
                debug!("A server ({id}) disconnected.");
                self.interrupted = true;
                self.successful = false;
                self.stop_inner(format!("A server ({id}) disconnected."));
            }
            _ => debug!("A client ({id}) disconnected, ignoring."),
        }
    }

    /// Requests a graceful stop at the next cycle boundary.
    pub fn stop_at_cycle_end(&mut self) {
        self.stop_next = true;
    }

    /// Stops the round immediately.
    pub fn stop(&mut self, reason: impl Into<String>) {
        self.stop_inner(reason);
    }

    /// Whether the round has terminated.
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Whether the round terminated without identifying bad members or
    /// hitting a fatal protocol failure.
    pub fn successful(&self) -> bool {
        self.successful
    }

    /// Whether the round was cut short (disconnection, stop-for-join).
    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    /// Misbehaving participants identified by this round.
    pub fn bad_members(&self) -> &[PeerId] {
        &self.bad_members
    }

    /// Why the round stopped, if it did.
    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }

    /// The current phase number.
    pub fn phase(&self) -> u32 {
        self.sm.phase()
    }

    /// Whether the local participant plays the server role.
    pub fn is_server(&self) -> bool {
        self.is_server
    }

    // ---- internal machinery ----

    fn process_bulk(
        &mut self,
        rng: &mut impl CryptoRngCore,
        from: &PeerId,
        data: &[u8],
    ) -> Result<(), Fault> {
        let signed = SignedMessage::from_wire(data)?;
        let sender_key = *self
            .identity_of(from)
            .ok_or_else(|| Fault::reject(format!("sender {from} is in neither roster")))?
            .signing_key();
        let message = signed.verify(&sender_key)?;

        let hdr = message.header();
        if hdr.nonce != self.nonce {
            return Err(Fault::reject("wrong nonce"));
        }
        if hdr.phase != self.sm.phase() {
            return Err(Fault::reject(format!(
                "wrong phase: got {} expected {}",
                hdr.phase,
                self.sm.phase()
            )));
        }
        match self.sm.expected_message() {
            Some(expected) if expected == message.msg_type() => {}
            _ => {
                return Err(Fault::reject(format!(
                    "unexpected {:?} in state {:?}",
                    message.msg_type(),
                    self.sm.current()
                )))
            }
        }

        match message {
            Message::ClientCiphertext { ciphertext, .. } => {
                self.handle_client_ciphertext(rng, from, &ciphertext)
            }
            Message::ServerClientList { clients, .. } => {
                self.handle_server_client_list(rng, from, clients)
            }
            Message::ServerCommit { commit, .. } => self.handle_server_commit(rng, from, commit),
            Message::ServerCiphertext { ciphertext, .. } => {
                self.handle_server_ciphertext(rng, from, &ciphertext)
            }
            Message::ServerValidation { signature, .. } => {
                self.handle_server_validation(rng, from, signature)
            }
            Message::ServerCleartext {
                signatures,
                cleartext,
                included,
                ..
            } => self.handle_server_cleartext(rng, from, signatures, &cleartext, included),
            Message::ServerBlameBits {
                submitted, pads, ..
            } => self.handle_blame_bits(rng, from, submitted, pads),
            Message::ServerRebuttalOrVerdict { body, .. } => {
                self.handle_rebuttal_or_verdict(rng, from, body)
            }
            Message::ClientRebuttal { claimed, proof, .. } => {
                self.handle_rebuttal(rng, from, claimed, &proof)
            }
            Message::ServerVerdictSignature { signature, .. } => {
                self.handle_verdict_signature(rng, from, signature)
            }
        }
    }

    fn apply_fault(&mut self, from: Option<&PeerId>, fault: Fault) {
        match fault {
            Fault::Reject(reason) => match from {
                Some(from) => warn!("dropping message from {from}: {reason}"),
                None => warn!("{reason}"),
            },
            Fault::Interrupt(reason) => {
                warn!("{reason}");
                self.interrupted = true;
                self.successful = false;
                self.stop_inner(reason);
            }
            Fault::Stop(reason) => {
                warn!("{reason}");
                self.successful = false;
                self.stop_inner(reason);
            }
        }
    }

    fn identity_of(&self, id: &PeerId) -> Option<&PublicIdentity> {
        self.clients
            .index_of(id)
            .and_then(|idx| self.clients.get(idx))
            .or_else(|| self.servers.index_of(id).and_then(|idx| self.servers.get(idx)))
    }

    /// Cancels the pending timer and forgets per-state server bookkeeping.
    fn before_transition(&mut self) {
        if let Some(server) = self.server.as_mut() {
            if let Some(mut timer) = server.submission_timer.take() {
                timer.stop();
            }
            server.handled_servers.clear();
        }
    }

    /// Completes the current state and runs entry actions until the machine
    /// settles into a waiting state.
    pub(crate) fn advance(&mut self, rng: &mut impl CryptoRngCore) {
        if self.advance_once() {
            self.run_entries(rng);
        }
    }

    fn advance_once(&mut self) -> bool {
        self.before_transition();
        match self.sm.state_complete() {
            Ok(advance) => {
                if advance.cycled && !self.cycle_complete() {
                    return false;
                }
                true
            }
            Err(err) => {
                self.successful = false;
                self.stop_inner(err.0);
                false
            }
        }
    }

    fn run_entries(&mut self, rng: &mut impl CryptoRngCore) {
        while !self.finished {
            match self.entry_action(rng, self.sm.current()) {
                Ok(Entry::Wait) | Ok(Entry::Stopped) => break,
                Ok(Entry::Complete) => {
                    if !self.advance_once() {
                        break;
                    }
                }
                Ok(Entry::Goto(state)) => {
                    self.before_transition();
                    self.sm.set_state(state);
                }
                Err(fault) => {
                    self.apply_fault(None, fault);
                    break;
                }
            }
        }
    }

    fn entry_action(&mut self, rng: &mut impl CryptoRngCore, state: State) -> Result<Entry, Fault> {
        match state {
            State::Shuffling => {
                let input = self.state.shuffle_data.clone();
                self.shuffle.start(input);
                Ok(Entry::Wait)
            }
            State::ProcessBootstrap => self.process_bootstrap(),
            State::PrepareForBulk => self.prepare_for_bulk(),
            State::ClientWaitForCleartext => {
                self.submit_client_ciphertext(rng)?;
                Ok(Entry::Wait)
            }
            State::ServerWaitForClientCiphertext => self.set_online_clients(),
            State::ServerWaitForClientLists => {
                self.submit_client_list()?;
                Ok(Entry::Wait)
            }
            State::ServerWaitForServerCommits => {
                self.submit_commit(rng)?;
                Ok(Entry::Wait)
            }
            State::ServerWaitForServerCiphertext => {
                self.submit_server_ciphertext()?;
                Ok(Entry::Wait)
            }
            State::ServerWaitForServerValidation => {
                self.submit_validation()?;
                Ok(Entry::Wait)
            }
            State::ServerPushCleartext => self.push_cleartext(),
            State::StartingBlameShuffle => {
                debug!("starting the blame shuffle, accuser slot {}", self.state.accuser);
                let input = self.blame_shuffle_input()?;
                self.blame_shuffle.start(input);
                Ok(Entry::Wait)
            }
            State::WaitingForBlameShuffle => self.process_blame_shuffle(),
            State::ServerTransmitBlameBits => self.transmit_blame_bits(),
            State::ServerRequestClientRebuttal => self.request_rebuttal(),
            State::ServerExchangeVerdictSignature => self.submit_verdict_signature(),
            State::ServerShareVerdict => self.push_verdict(),
            _ => Ok(Entry::Wait),
        }
    }

    fn check_shuffles(&mut self, rng: &mut impl CryptoRngCore) {
        if self.finished {
            return;
        }
        if !self.shuffle_handled && self.shuffle.finished() {
            self.shuffle_handled = true;
            if !self.shuffle.successful() {
                self.bad_members = self.shuffle.bad_members();
                if self.shuffle.interrupted() {
                    self.interrupted = true;
                }
                self.successful = false;
                self.stop_inner("ShuffleRound failed");
                return;
            }
            if self.sm.current() == State::Shuffling {
                self.advance(rng);
            }
        }
        if self.finished {
            return;
        }
        if !self.blame_shuffle_handled && self.blame_shuffle.finished() {
            self.blame_shuffle_handled = true;
            if !self.blame_shuffle.successful() {
                self.bad_members = self.blame_shuffle.bad_members();
                if self.blame_shuffle.interrupted() {
                    self.interrupted = true;
                }
                self.successful = false;
                self.stop_inner("Blame shuffle failed");
                return;
            }
            if self.sm.current() == State::StartingBlameShuffle {
                self.advance(rng);
            }
        }
    }

    fn process_bootstrap(&mut self) -> Result<Entry, Fault> {
        let output = self.shuffle.output().to_vec();
        if output.len() != self.clients.len() {
            return Err(Fault::stop(format!(
                "bootstrap shuffle produced {} descriptors, expected {}",
                output.len(),
                self.clients.len()
            )));
        }

        let mut keys = Vec::with_capacity(output.len());
        for (idx, bytes) in output.iter().enumerate() {
            let Ok(key) = VerifyingKey::from_sec1_bytes(bytes) else {
                debug!("Invalid key in shuffle.");
                return Err(Fault::stop("invalid key in the bootstrap shuffle"));
            };
            if !self.is_server && *bytes == self.state.shuffle_data {
                self.state.my_idx = Some(idx);
            }
            keys.push(key);
        }
        self.state.anonymous_keys = keys;

        if !self.is_server && self.state.my_idx.is_none() {
            return Err(Fault::stop("own anonymous key missing from the shuffle output"));
        }
        Ok(Entry::Complete)
    }

    fn prepare_for_bulk(&mut self) -> Result<Entry, Fault> {
        let base = self.clients.len().div_ceil(8);
        self.state.msg_length = base;
        self.state.base_msg_length = base;
        self.setup_pairwise_seeds();
        debug!("beginning bulk");
        Ok(Entry::Complete)
    }

    fn setup_pairwise_seeds(&mut self) {
        let roster = if self.is_server {
            &self.clients
        } else {
            &self.servers
        };
        self.state.base_seeds = roster
            .iter()
            .map(|peer| self.local.dh_key().shared_secret(peer.dh_key()))
            .collect();
    }

    /// Server per-cycle bookkeeping: reset per-phase collections, rotate the
    /// phase log ring. Returns `false` when the round stops at this boundary.
    fn cycle_complete(&mut self) -> bool {
        let phase = self.sm.phase();
        if let Some(server) = self.server.as_mut() {
            server.handled_clients.clear();
            server.client_ciphertexts.clear();
            server.server_commits.clear();
            server.server_ciphertexts.clear();
            server.signatures.clear();
            server.signed_hash = None;
            server.my_commit = None;
            server.logs.begin_phase(phase, self.clients.len());
        }
        if self.stop_next {
            self.interrupted = true;
            self.stop_inner("Stopped for join");
            return false;
        }
        true
    }

    fn stop_inner(&mut self, reason: impl Into<String>) {
        if self.finished {
            return;
        }
        self.finished = true;
        let reason = reason.into();
        debug!("finished bulk: {reason}");
        self.stop_reason = Some(reason);
        if let Some(server) = self.server.as_mut() {
            if let Some(mut timer) = server.submission_timer.take() {
                timer.stop();
            }
        }
        self.sm.set_state(State::Finished);
    }

    // ---- send helpers ----

    pub(crate) fn header(&self) -> Header {
        Header {
            nonce: self.nonce.clone(),
            phase: self.sm.phase(),
        }
    }

    fn signed_wire(&self, message: &Message) -> Result<Vec<u8>, LocalError> {
        SignedMessage::new(self.local.signing_key(), message)?.to_wire()
    }

    pub(crate) fn send_to(&mut self, to: &PeerId, message: &Message) -> Result<(), Fault> {
        let data = self.signed_wire(message)?;
        self.overlay.send(to, data);
        Ok(())
    }

    pub(crate) fn broadcast_to_servers(&mut self, message: &Message) -> Result<(), Fault> {
        let data = self.signed_wire(message)?;
        self.overlay.broadcast_to_servers(data);
        Ok(())
    }

    pub(crate) fn broadcast_to_clients(&mut self, message: &Message) -> Result<(), Fault> {
        let data = self.signed_wire(message)?;
        self.overlay.broadcast_to_clients(data);
        Ok(())
    }

    pub(crate) fn server_state(&mut self) -> Result<&mut ServerState, Fault> {
        self.server.as_mut().ok_or_else(|| Fault::reject("Not a server"))
    }

    pub(crate) fn server_index(&self, id: &PeerId) -> Result<usize, Fault> {
        self.servers
            .index_of(id)
            .ok_or_else(|| Fault::reject("Not a server"))
    }

    /// Marks the round failed with the given culprit and stops it.
    pub(crate) fn report_bad_member(&mut self, bad_dude: PeerId) {
        self.successful = false;
        self.bad_members = vec![bad_dude];
        self.stop_inner("Bad member found and reported");
    }
}
