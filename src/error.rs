use displaydoc::Display;

/// An error on the local side: a bug in the host wiring or in this crate,
/// or an environment failure (e.g. a value that cannot be serialized).
#[derive(Debug, Clone, Display)]
#[displaydoc("Local error ({0})")]
pub struct LocalError(pub(crate) String);

impl LocalError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The outcome of handling one inbound message or one entry action.
///
/// `Reject` drops the message and keeps the round running (the sender may be
/// retrying, duplicated by the overlay, or plain misbehaving in a way the
/// round survives). The other two abort the round: `Interrupt` marks it
/// interrupted (a server is gone or unusable), `Stop` marks a protocol
/// failure such as a commit mismatch or a false accusation.
#[derive(Debug, Clone, Display)]
pub(crate) enum Fault {
    /// dropped message: {0}
    Reject(String),
    /// round interrupted: {0}
    Interrupt(String),
    /// round failed: {0}
    Stop(String),
}

impl Fault {
    pub fn reject(message: impl Into<String>) -> Self {
        Self::Reject(message.into())
    }

    pub fn interrupt(message: impl Into<String>) -> Self {
        Self::Interrupt(message.into())
    }

    pub fn stop(message: impl Into<String>) -> Self {
        Self::Stop(message.into())
    }
}

impl From<LocalError> for Fault {
    fn from(err: LocalError) -> Self {
        Self::Stop(err.0)
    }
}
