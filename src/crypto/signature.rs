//! Ed25519 signing and verification, plus keypair generation.
//!
//! Consumed as pure functions: nothing in this module retains state, and
//! the `identity` store is responsible for deciding who may call `sign`.

use rand_core::{OsRng, RngCore};
use ring::signature::{self, Ed25519KeyPair, KeyPair as _};

use crate::error::*;

#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct PublicKey([u8; PublicKey::LENGTH]);

#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct PrivateKey([u8; PrivateKey::LENGTH]);

#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct Signature([u8; Signature::LENGTH]);

impl PublicKey {
    pub const LENGTH: usize = 32;

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != Self::LENGTH {
            return Err("public key has an invalid length").wrapped(ErrorKind::Crypto);
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(raw);
        Ok(Self(inner))
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl PrivateKey {
    pub const LENGTH: usize = 32;

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != Self::LENGTH {
            return Err("private key has an invalid length").wrapped(ErrorKind::Crypto);
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(raw);
        Ok(Self(inner))
    }
}

impl AsRef<[u8]> for PrivateKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Signature {
    pub const LENGTH: usize = 64;

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != Self::LENGTH {
            return Err("signature has an invalid length").wrapped(ErrorKind::Crypto);
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(raw);
        Ok(Self(inner))
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Generates a new Ed25519 keypair using the system RNG.
pub fn generate_keypair() -> Result<(PublicKey, PrivateKey)> {
    let mut seed = [0u8; PrivateKey::LENGTH];
    OsRng.fill_bytes(&mut seed);
    let keypair = Ed25519KeyPair::from_seed_unchecked(&seed)
        .simple(ErrorKind::Crypto)?;
    let mut pubkey = [0u8; PublicKey::LENGTH];
    pubkey.copy_from_slice(keypair.public_key().as_ref());
    Ok((PublicKey(pubkey), PrivateKey(seed)))
}

/// Derives the public key matching a private key.
pub fn derive_public_key(privkey: &PrivateKey) -> Result<PublicKey> {
    let keypair = Ed25519KeyPair::from_seed_unchecked(privkey.as_ref())
        .simple(ErrorKind::Crypto)?;
    let mut pubkey = [0u8; PublicKey::LENGTH];
    pubkey.copy_from_slice(keypair.public_key().as_ref());
    Ok(PublicKey(pubkey))
}

/// Signs `msg` with `privkey`.
pub fn sign(privkey: &PrivateKey, msg: &[u8]) -> Result<Signature> {
    let keypair = Ed25519KeyPair::from_seed_unchecked(privkey.as_ref())
        .simple(ErrorKind::Crypto)?;
    let sig = keypair.sign(msg);
    Signature::from_bytes(sig.as_ref())
}

/// Verifies that `sig` is a valid Ed25519 signature of `msg` under `pubkey`.
pub fn verify(pubkey: &PublicKey, msg: &[u8], sig: &Signature) -> bool {
    let unparsed = signature::UnparsedPublicKey::new(&signature::ED25519, pubkey.as_ref());
    unparsed.verify(msg, sig.as_ref()).is_ok()
}
