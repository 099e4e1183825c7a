//! Per-phase retained history, server side only.
//!
//! Blame happens after the fact: an accusation names a bit position in a
//! past phase's cleartext, and the servers must replay exactly what they
//! contributed and what each client delivered at that position. Every server
//! therefore keeps, for the last [`RETAINED_PHASES`] phases, the raw client
//! submissions it accepted, every server's revealed ciphertext, the pads it
//! generated against each included client, and the slot layout of the
//! cleartext. Older logs are dropped; an accusation that outlives its log
//! fails.

use std::collections::BTreeMap;

use crate::config::RETAINED_PHASES;
use crate::tools::bitvec::{bit_at, BitVec};

pub(crate) struct PhaseLog {
    client_count: usize,
    /// Client index to the ciphertext that client delivered to this server.
    pub messages: BTreeMap<usize, Vec<u8>>,
    /// Server index to the ciphertext that server revealed.
    pub server_messages: BTreeMap<usize, Vec<u8>>,
    /// Client index to the pad this server generated against that client.
    pub my_sub_ciphertexts: BTreeMap<usize, Vec<u8>>,
    /// Slot owner index to the byte offset of its slot in the cleartext.
    pub message_offsets: Vec<usize>,
    /// Total length of the cleartext this phase.
    pub message_length: usize,
}

impl PhaseLog {
    fn new(client_count: usize) -> Self {
        Self {
            client_count,
            messages: BTreeMap::new(),
            server_messages: BTreeMap::new(),
            my_sub_ciphertexts: BTreeMap::new(),
            message_offsets: Vec::new(),
            message_length: 0,
        }
    }

    /// Per-client bit vectors at cleartext bit `accuse_idx`:
    /// what each client actually delivered to this server, and the pad bit
    /// this server generated against each included client.
    ///
    /// The XOR of all bits in both vectors equals the bit of this server's
    /// revealed ciphertext, which is how peers cross-check a replay.
    pub fn bits_at_index(&self, accuse_idx: usize) -> (BitVec, BitVec) {
        let mut submitted = BitVec::new(self.client_count);
        let mut pads = BitVec::new(self.client_count);
        for (&client, message) in &self.messages {
            if accuse_idx / 8 < message.len() {
                submitted.set(client, bit_at(message, accuse_idx));
            }
        }
        for (&client, pad) in &self.my_sub_ciphertexts {
            if accuse_idx / 8 < pad.len() {
                pads.set(client, bit_at(pad, accuse_idx));
            }
        }
        (submitted, pads)
    }

    /// The bit that server `server_idx` revealed at cleartext bit
    /// `accuse_idx`, used to validate that server's replayed blame bits.
    pub fn bit_at_index(&self, server_idx: usize, accuse_idx: usize) -> Option<bool> {
        let message = self.server_messages.get(&server_idx)?;
        if accuse_idx / 8 >= message.len() {
            return None;
        }
        Some(bit_at(message, accuse_idx))
    }
}

/// The ring of retained phase logs, keyed by phase number.
pub(crate) struct PhaseLogs {
    logs: BTreeMap<u32, PhaseLog>,
    current: u32,
}

impl PhaseLogs {
    pub fn new(client_count: usize) -> Self {
        let mut logs = BTreeMap::new();
        logs.insert(0, PhaseLog::new(client_count));
        Self { logs, current: 0 }
    }

    /// Opens the log for `phase` and evicts the one that rolled off.
    pub fn begin_phase(&mut self, phase: u32, client_count: usize) {
        if phase >= RETAINED_PHASES {
            self.logs.remove(&(phase - RETAINED_PHASES));
        }
        self.logs.insert(phase, PhaseLog::new(client_count));
        self.current = phase;
    }

    pub fn current_mut(&mut self) -> &mut PhaseLog {
        self.logs
            .get_mut(&self.current)
            .expect("the current log always exists")
    }

    pub fn get(&self, phase: u32) -> Option<&PhaseLog> {
        self.logs.get(&phase)
    }

    pub fn contains(&self, phase: u32) -> bool {
        self.logs.contains_key(&phase)
    }
}

#[cfg(test)]
mod tests {
    use super::{PhaseLogs, RETAINED_PHASES};

    #[test]
    fn retention_window() {
        let mut logs = PhaseLogs::new(4);
        for phase in 1..20 {
            logs.begin_phase(phase, 4);
            assert!(logs.contains(phase));
            assert!(phase < RETAINED_PHASES || !logs.contains(phase - RETAINED_PHASES));
            if phase >= RETAINED_PHASES - 1 {
                assert!(logs.contains(phase - (RETAINED_PHASES - 1)));
            }
        }
    }

    #[test]
    fn bits_at_index_reflects_recorded_bytes() {
        let mut logs = PhaseLogs::new(3);
        let log = logs.current_mut();
        // Client 1 delivered a ciphertext with bit 9 set; the pad generated
        // against client 2 has bit 9 clear.
        log.messages.insert(1, vec![0x00, 0x02]);
        log.my_sub_ciphertexts.insert(2, vec![0xFF, 0xFD]);
        let (submitted, pads) = log.bits_at_index(9);
        assert!(submitted.get(1));
        assert!(!submitted.get(0) && !submitted.get(2));
        assert!(!pads.get(2));
        let (submitted, pads) = log.bits_at_index(8);
        assert!(!submitted.get(1));
        assert!(pads.get(2));

        log.server_messages.insert(0, vec![0x00, 0x02]);
        assert_eq!(log.bit_at_index(0, 9), Some(true));
        assert_eq!(log.bit_at_index(0, 8), Some(false));
        assert_eq!(log.bit_at_index(1, 0), None);
        assert_eq!(log.bit_at_index(0, 16), None);
    }
}
