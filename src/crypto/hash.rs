//! BLAKE3-backed content hashing.
//!
//! `Digest` is used to derive a uid from the canonical public-key document
//! of an identity (see `identity::Identity::derive_uid`), and anywhere else
//! a fixed-size content hash is required.

use crate::error::*;

#[derive(Copy, Clone, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Digest([u8; Digest::LENGTH]);

impl Digest {
    pub const LENGTH: usize = 32;

    pub fn of(bytes: &[u8]) -> Self {
        let hash = blake3::hash(bytes);
        Self(*hash.as_bytes())
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != Self::LENGTH {
            return Err("digest has an invalid length").wrapped(ErrorKind::Crypto);
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(raw);
        Ok(Self(inner))
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..")
    }
}
