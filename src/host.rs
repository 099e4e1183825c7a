//! Interfaces provided by the hosting round coordinator.
//!
//! The round itself performs no IO and keeps no clock: the host owns the
//! connection table, the nested shuffle rounds, the data callbacks and the
//! timers, and drives the round by calling its event methods. Everything the
//! round needs in the other direction goes through the traits below.

use core::time::Duration;

use crate::roster::PeerId;

/// Byte transport between participants.
///
/// Broadcasts must loop back to the local participant as well: every
/// server-to-servers exchange counts the local server's own message through
/// the same delivery path as its peers'.
pub trait Overlay {
    /// Sends `data` to one participant.
    fn send(&mut self, to: &PeerId, data: Vec<u8>);
    /// Sends `data` to every server, including the local one.
    fn broadcast_to_servers(&mut self, data: Vec<u8>);
    /// Sends `data` to every client this participant fronts for.
    fn broadcast_to_clients(&mut self, data: Vec<u8>);
}

/// A nested anonymizing shuffle round.
///
/// Used twice: the bootstrap shuffle that assigns anonymous keys to slots,
/// and the blame shuffle that delivers accusation records to the servers
/// without identifying the accuser. Packets for a shuffle arrive through the
/// outer round's sub-protocol framing and are forwarded verbatim; when the
/// shuffle signals completion, the host re-enters the round via
/// [`crate::DcNetRound::operation_finished`].
pub trait ShuffleRound {
    /// Starts the shuffle with this participant's input (possibly empty).
    fn start(&mut self, input: Vec<u8>);
    /// Feeds the shuffle one inbound packet.
    fn process_packet(&mut self, from: &PeerId, data: &[u8]);
    /// Notifies the shuffle of a lost connection.
    fn handle_disconnect(&mut self, id: &PeerId);
    /// Whether the shuffle has terminated.
    fn finished(&self) -> bool;
    /// Whether a finished shuffle produced its output.
    fn successful(&self) -> bool;
    /// Whether a finished shuffle was cut short by a disconnection.
    fn interrupted(&self) -> bool;
    /// Misbehaving participants identified by a failed shuffle.
    fn bad_members(&self) -> Vec<PeerId>;
    /// The shuffled payloads, in slot order. Empty inputs are dropped.
    fn output(&self) -> &[Vec<u8>];
}

/// Supplies the payload bytes this participant publishes in its slot.
pub trait DataSource {
    /// Returns up to `max` bytes and whether more are pending.
    fn get_data(&mut self, max: usize) -> (Vec<u8>, bool);
}

/// Receives every payload recovered from a cleartext.
pub trait DataSink {
    /// Delivers the payload published in slot `slot` this phase.
    fn push_data(&mut self, slot: usize, data: &[u8]);
}

/// A scheduled one-shot timer.
pub trait TimerHandle {
    /// Cancels the timer; a later firing must not be delivered.
    fn stop(&mut self);
}

/// Monotonic time and one-shot timers.
///
/// A timer scheduled here fires by the host calling
/// [`crate::DcNetRound::submission_window_closed`].
pub trait Scheduler {
    /// The current monotonic time.
    fn now(&self) -> Duration;
    /// Schedules a one-shot timer `after` from now.
    fn schedule(&mut self, after: Duration) -> Box<dyn TimerHandle>;
}
