//! Cryptographic primitives consumed as pure functions by the rest of the
//! crate: Ed25519 signing/verification/keygen, and BLAKE3 content hashing.

pub mod hash;
pub mod signature;

pub use hash::Digest;
pub use signature::{derive_public_key, generate_keypair, sign, verify, PrivateKey, PublicKey, Signature};
