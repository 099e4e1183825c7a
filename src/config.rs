use core::time::Duration;

/// How many phases of history a server retains for blame queries.
///
/// An accusation referencing an older phase is dropped.
pub(crate) const RETAINED_PHASES: u32 = 5;

/// Fixed part of every slot message: accusation flag (1 byte), phase
/// (big-endian u32), next slot length (big-endian u32).
pub(crate) const SLOT_FIXED_BYTES: usize = 9;

/// Length of the accusation record submitted through the blame shuffle:
/// owner index, bit index, phase, each a big-endian u32.
pub(crate) const ACCUSATION_BYTES: usize = 12;

/// Tunables of a round.
#[derive(Debug, Clone)]
pub struct Config {
    /// Hard deadline for client ciphertext submission, armed when a server
    /// starts collecting a phase.
    pub client_submission_window: Duration,
    /// Fraction of allowed clients whose submissions arm the flex deadline:
    /// once that many (rounded up to a whole client) have submitted, the
    /// collection window shrinks to the time elapsed so far.
    pub client_percentage: f64,
    /// Maximum bytes pulled from the data source per request.
    pub max_get: usize,
    /// Authenticate slot payloads with a signature under the anonymous key
    /// (`true`) or, in the degraded configuration, with a digest (`false`).
    pub sign_slots: bool,
    /// Automatically close the slot when the owner has no more data queued.
    pub close_empty_slot: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_submission_window: Duration::from_secs(60),
            client_percentage: 0.95,
            max_get: 4096,
            sign_slots: true,
            close_empty_slot: true,
        }
    }
}
