use digest::Digest;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// A digest object that takes byte slices or decomposable ([`Hashable`]) objects.
pub(crate) trait Chain: Sized {
    /// Hash raw bytes.
    ///
    /// Note: only for impls in specific types, do not use directly.
    fn chain_raw_bytes(self, bytes: &[u8]) -> Self;

    /// Hash a bytestring that is known to be constant-sized
    /// (e.g. byte representation of a built-in integer).
    fn chain_constant_sized_bytes(self, bytes: &(impl AsRef<[u8]> + ?Sized)) -> Self {
        self.chain_raw_bytes(bytes.as_ref())
    }

    /// Hash raw bytes in a collision-resistant way.
    fn chain_bytes(self, bytes: &(impl AsRef<[u8]> + ?Sized)) -> Self {
        // Hash the length too to prevent hash conflicts. (e.g. H(AB|CD) == H(ABC|D)).
        // Not strictly necessary for fixed-size arrays, but it's easier to just always do it.
        let len = (bytes.as_ref().len() as u64).to_be_bytes();
        self.chain_raw_bytes(&len).chain_raw_bytes(bytes.as_ref())
    }

    fn chain<T: Hashable>(self, hashable: &T) -> Self {
        hashable.chain(self)
    }
}

type BackendDigest = Sha256;

/// Wraps the fixed output hash for easier replacement, and standardizes the use of DST.
pub(crate) struct Hash(BackendDigest);

impl Chain for Hash {
    fn chain_raw_bytes(self, bytes: &[u8]) -> Self {
        Self(self.0.chain_update(bytes))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct HashOutput(
    // Length of the BackendDigest output. Unfortunately we can't get it in compile-time.
    pub(crate) [u8; 32],
);

impl AsRef<[u8]> for HashOutput {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Hash {
    fn new() -> Self {
        Self(BackendDigest::new())
    }

    pub fn new_with_dst(dst: &[u8]) -> Self {
        Self::new().chain_bytes(dst)
    }

    pub(crate) fn finalize(self) -> HashOutput {
        HashOutput(self.0.finalize().into())
    }
}

/// A trait allowing complex objects to give access to their contents for hashing purposes
/// without the need of a conversion to a new form (e.g. serialization).
pub(crate) trait Hashable {
    fn chain<C: Chain>(&self, digest: C) -> C;
}

impl Hashable for u32 {
    fn chain<C: Chain>(&self, digest: C) -> C {
        digest.chain_constant_sized_bytes(&self.to_be_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::{Chain, Hash};

    #[test]
    fn concatenation_is_not_ambiguous() {
        let h1 = Hash::new_with_dst(b"Test").chain_bytes(b"ab").chain_bytes(b"cd").finalize();
        let h2 = Hash::new_with_dst(b"Test").chain_bytes(b"abc").chain_bytes(b"d").finalize();
        assert_ne!(h1, h2);
    }

    #[test]
    fn dst_separates_domains() {
        let h1 = Hash::new_with_dst(b"One").chain_bytes(b"payload").finalize();
        let h2 = Hash::new_with_dst(b"Two").chain_bytes(b"payload").finalize();
        assert_ne!(h1, h2);
    }
}
