#![deny(unsafe_code)]
#![warn(
    clippy::mod_module_files,
    missing_docs,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unused_qualifications
)]

//! Client/server DC-net bulk rounds with accountability.
//!
//! Each phase, every client publishes an equal-length ciphertext built from
//! pairwise pseudorandom pads shared with the servers; the servers collect
//! the submissions, agree on the included client set, run a commit/reveal
//! exchange among themselves, and broadcast a jointly signed cleartext in
//! which every anonymous slot owner's payload appears without any observer
//! (including a minority of servers) being able to link it to its author.
//! When a participant disrupts the cleartext by flipping bits in someone
//! else's slot, the blame subprotocol reconstructs the disputed bit from
//! retained per-phase history, challenges the implicated client for a
//! Diffie-Hellman rebuttal, and produces a verdict signed by every server
//! that names the guilty party.
//!
//! The crate is a sans-IO protocol engine: the [`DcNetRound`] state machine
//! is advanced by inbound packets, timer firings and nested-shuffle
//! completion signals, all delivered by the hosting round coordinator
//! through the interfaces in [`host`].

mod ciphertext;
mod config;
mod dh;
mod error;
pub mod host;
mod messages;
mod phase_log;
mod roster;
mod round;
mod state;
mod tools;

// Some re-exports to avoid the need for version-matching
pub use k256;
pub use k256::ecdsa;
pub use signature;

pub use config::Config;
pub use dh::{DhPublic, DhSecret};
pub use error::LocalError;
pub use messages::Nonce;
pub use roster::{PeerId, PrivateIdentity, PublicIdentity, Roster};
pub use round::{Collaborators, DcNetRound};
