//! Identity store: local identities (with private keys) and contacts
//! (without), keyed by a uid derived from the canonical public key
//! document.

use bson::{doc, Document};

use crate::crypto::{self, PrivateKey, PublicKey, Signature};
use crate::document;
use crate::error::*;
use crate::storage::BlobStore;

pub type Uid = [u8; 32];

/// Maximum size, in bytes, of the persisted identity blob (§6).
pub const MAX_STORE_BYTES: usize = 4096;

/// A single identity: a local identity if `privkey` is `Some`, a contact
/// otherwise.
#[derive(Clone)]
pub struct Identity {
    uid: Uid,
    alias: String,
    pubkey: PublicKey,
    privkey: Option<PrivateKey>,
}

impl Identity {
    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn pubkey(&self) -> &PublicKey {
        &self.pubkey
    }

    pub fn has_privkey(&self) -> bool {
        self.privkey.is_some()
    }

    /// Derives the uid of an identity from its canonical public-key
    /// document: `blake3(bson({pubkey: <binary>}))`.
    pub fn derive_uid(pubkey: &PublicKey) -> Result<Uid> {
        let canonical = doc! { "pubkey": bson::Bson::Binary(bson::Binary {
            subtype: bson::spec::BinarySubtype::Generic,
            bytes: pubkey.as_ref().to_vec(),
        }) };
        let bytes = document::encode(&canonical)?;
        let digest = crypto::Digest::of(&bytes);
        let mut uid = [0u8; 32];
        uid.copy_from_slice(digest.as_ref());
        Ok(uid)
    }

    /// Serializes this identity as the self-describing document stored
    /// on disk and returned by `identity.get`/`identity.list`/`export`.
    pub fn to_document(&self) -> Document {
        let mut d = Document::new();
        d.insert("uid", bin(&self.uid));
        d.insert("alias", self.alias.clone());
        d.insert("pubkey", bin(self.pubkey.as_ref()));
        if let Some(privkey) = &self.privkey {
            d.insert("privkey", bin(privkey.as_ref()));
        }
        d
    }

    /// Parses an identity back out of a document produced by
    /// `to_document` (or an externally supplied import document, which
    /// may lack `privkey`).
    pub fn from_document(doc: &Document) -> Result<Self> {
        let alias = document::get_str(doc, "alias")
            .ok_or("missing alias")
            .simple(ErrorKind::ArgumentShape)?
            .to_owned();
        let pubkey_bytes = document::get_binary(doc, "pubkey")
            .ok_or("missing pubkey")
            .simple(ErrorKind::ArgumentShape)?;
        let pubkey = PublicKey::from_bytes(pubkey_bytes)?;
        let privkey = document::get_binary(doc, "privkey")
            .map(PrivateKey::from_bytes)
            .transpose()?;
        let uid = match document::get_binary(doc, "uid") {
            Some(raw) if raw.len() == 32 => {
                let mut u = [0u8; 32];
                u.copy_from_slice(raw);
                u
            }
            _ => Self::derive_uid(&pubkey)?,
        };
        Ok(Identity {
            uid,
            alias,
            pubkey,
            privkey,
        })
    }
}

fn bin(bytes: &[u8]) -> bson::Bson {
    bson::Bson::Binary(bson::Binary {
        subtype: bson::spec::BinarySubtype::Generic,
        bytes: bytes.to_vec(),
    })
}

/// Persists and queries this node's local identities and contacts.
///
/// Backed by an append-only blob file whose first four bytes encode the
/// payload length (§4.B, §6). The store never exceeds `capacity` live
/// entries.
pub struct IdentityStore<S: BlobStore> {
    store: S,
    capacity: usize,
    identities: Vec<Identity>,
}

impl<S: BlobStore> IdentityStore<S> {
    /// Opens `store`, loading any existing identities. A corrupt or
    /// oversized blob is treated as a fatal config error for the stored
    /// bytes, but the store itself becomes empty and the blob is
    /// rewritten with a fresh empty document, per §4.B.
    pub fn open(mut store: S, capacity: usize) -> Result<Self> {
        store.open()?;
        let mut this = IdentityStore {
            store,
            capacity,
            identities: Vec::new(),
        };
        match this.load_from_disk() {
            Ok(identities) => this.identities = identities,
            Err(e) => {
                log::error!("identity store blob corrupt, starting empty: {}", e);
                this.identities.clear();
                this.save_to_disk()?;
            }
        }
        Ok(this)
    }

    fn load_from_disk(&mut self) -> Result<Vec<Identity>> {
        self.store.seek(0)?;
        let mut len_buf = [0u8; 4];
        let n = self.store.read(&mut len_buf)?;
        if n == 0 {
            return Ok(Vec::new());
        }
        if n != 4 {
            return Err("truncated length prefix").simple(ErrorKind::CorruptStore);
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len == 0 {
            return Ok(Vec::new());
        }
        if len > MAX_STORE_BYTES {
            return Err(format!("stored payload of {} bytes exceeds cap", len))
                .simple(ErrorKind::CorruptStore);
        }
        let mut payload = vec![0u8; len];
        let mut read = 0;
        while read < len {
            let n = self.store.read(&mut payload[read..])?;
            if n == 0 {
                return Err("truncated payload").simple(ErrorKind::CorruptStore);
            }
            read += n;
        }
        let doc = document::decode(&payload)?;
        let array = document::get_array(&doc, "identities").cloned().unwrap_or_default();
        let mut out = Vec::with_capacity(array.len());
        for item in array {
            if let bson::Bson::Document(d) = item {
                out.push(Identity::from_document(&d)?);
            }
        }
        Ok(out)
    }

    fn save_to_disk(&mut self) -> Result<()> {
        let array: Vec<bson::Bson> = self
            .identities
            .iter()
            .map(|id| bson::Bson::Document(id.to_document()))
            .collect();
        let mut doc = Document::new();
        doc.insert("version", 1i32);
        doc.insert("identities", array);
        let payload = document::encode(&doc)?;
        if payload.len() > MAX_STORE_BYTES {
            return Err("identity store would exceed the on-disk size cap")
                .simple(ErrorKind::CorruptStore);
        }
        self.store.truncate()?;
        self.store.write(&(payload.len() as u32).to_le_bytes())?;
        self.store.write(&payload)?;
        Ok(())
    }

    fn find_index(&self, uid: &Uid) -> Option<usize> {
        self.identities.iter().position(|id| &id.uid == uid)
    }

    /// Generates a new local identity with the given alias.
    pub fn create(&mut self, alias: &str) -> Result<Identity> {
        if self.identities.len() >= self.capacity {
            return Err("identity store is full").simple(ErrorKind::TooManyIdentities);
        }
        let (pubkey, privkey) = crypto::generate_keypair()?;
        let uid = Identity::derive_uid(&pubkey)?;
        let identity = Identity {
            uid,
            alias: alias.to_owned(),
            pubkey,
            privkey: Some(privkey),
        };
        self.identities.push(identity.clone());
        self.save_to_disk()?;
        Ok(identity)
    }

    /// Imports a contact from an externally supplied document (never
    /// carrying a private key). `_befriend_uid` is accepted for wire
    /// compatibility with `identity.import`'s second argument but is not
    /// otherwise acted upon by the store.
    pub fn import(&mut self, doc: &Document, _befriend_uid: Uid) -> Result<Identity> {
        let mut identity = Identity::from_document(doc)?;
        identity.privkey = None;
        if self.find_index(&identity.uid).is_some() {
            return Err("identity already known").simple(ErrorKind::Duplicate);
        }
        if self.identities.len() >= self.capacity {
            return Err("identity store is full").simple(ErrorKind::TooManyIdentities);
        }
        self.identities.push(identity.clone());
        self.save_to_disk()?;
        Ok(identity)
    }

    /// Loads the stored document for `uid` with the private key stripped.
    pub fn export(&self, uid: &Uid) -> Result<Document> {
        let identity = self.load(uid).ok_or("identity not found").simple(ErrorKind::NotFound)?;
        let mut doc = identity.to_document();
        doc.remove("privkey");
        Ok(doc)
    }

    /// Removes an identity or contact. Returns whether an entry was
    /// actually removed.
    pub fn remove(&mut self, uid: &Uid) -> Result<bool> {
        match self.find_index(uid) {
            Some(idx) => {
                self.identities.remove(idx);
                self.save_to_disk()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn load(&self, uid: &Uid) -> Option<&Identity> {
        self.find_index(uid).map(|idx| &self.identities[idx])
    }

    pub fn load_pubkey(&self, uid: &Uid) -> Option<&PublicKey> {
        self.load(uid).map(Identity::pubkey)
    }

    pub fn load_privkey(&self, uid: &Uid) -> Option<&PrivateKey> {
        self.load(uid).and_then(|id| id.privkey.as_ref())
    }

    /// Returns every known uid, in store (insertion) order.
    pub fn list(&self) -> Vec<Uid> {
        self.identities.iter().map(Identity::uid).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.identities.iter()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Number of contacts (identities with no private key) currently
    /// held, used by `FriendAcceptPolicy::AcceptIfEmpty` to decide
    /// whether this is the node's first friend.
    pub fn contact_count(&self) -> usize {
        self.identities.iter().filter(|id| !id.has_privkey()).count()
    }

    /// Signs `hash` (32 to 64 bytes) with the private key of `uid`.
    /// Fails with `ErrorKind::NoPrivateKey` if `uid` is a contact.
    pub fn sign(&self, uid: &Uid, hash: &[u8]) -> Result<Signature> {
        let privkey = self
            .load_privkey(uid)
            .ok_or("identity has no private key")
            .simple(ErrorKind::NoPrivateKey)?;
        crypto::sign(privkey, hash)
    }

    /// Verifies `sig` over `hash` using the public key of `uid`.
    pub fn verify(&self, uid: &Uid, sig: &Signature, hash: &[u8]) -> Result<bool> {
        let pubkey = self
            .load_pubkey(uid)
            .ok_or("identity not found")
            .simple(ErrorKind::NotFound)?;
        Ok(crypto::verify(pubkey, hash, sig))
    }
}
