//! Per-connection protocol state machine and wire framing (§4.D).
//!
//! Every byte on a connection is a length-prefixed document frame. The
//! state machine drives a connection through:
//!
//! ```text
//! Initial -> Handshake -> Authenticated -> [ReadFriendCert -> ReplyFriendReq]
//!     -> Closing -> Free
//! ```
//!
//! `ReadFriendCert`/`ReplyFriendReq` are entered only while a friend
//! request cert exchange (`wld.friendRequest`) is in flight on top of an
//! otherwise authenticated connection. Per §4.E step 5 the exchange ends
//! the connection rather than resuming ordinary framed messaging, so it
//! proceeds straight to `Closing`/`Free` instead of back to
//! `Authenticated`.

use rand_core::{OsRng, RngCore};

use crate::connection::{Connection, RxBuffer};
use crate::crypto::{self, PublicKey};
use crate::document::{self, DocumentBuilder};
use crate::error::*;
use crate::identity::{IdentityStore, Uid};
use crate::storage::BlobStore;
use crate::transport::ByteStream;

/// Length prefix size, in bytes, of every frame on the wire.
const LEN_PREFIX: usize = 4;

/// Default cap on a single frame's document payload (§6); larger framed
/// lengths are rejected with `ErrorKind::FrameTooLarge`.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1400;

const HANDSHAKE_FRAME_MAX: usize = 512;

/// The state of a single connection's protocol FSM.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Phase {
    Initial,
    Handshake,
    Authenticated,
    ReadFriendCert,
    ReplyFriendReq,
    Closing,
    Free,
}

/// Extracts at most one complete frame from `rx`, draining its bytes on
/// success. Returns `Ok(None)` if the buffer does not yet hold a full
/// frame, and `Err(FrameTooLarge)` if the declared length exceeds
/// `max_frame_len`.
pub fn try_extract_frame(rx: &mut RxBuffer, max_frame_len: usize) -> Result<Option<Vec<u8>>> {
    if rx.len() < LEN_PREFIX {
        return Ok(None);
    }
    let mut len_bytes = [0u8; LEN_PREFIX];
    len_bytes.copy_from_slice(&rx[..LEN_PREFIX]);
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > max_frame_len {
        return Err(format!("frame of {} bytes exceeds cap of {}", len, max_frame_len))
            .simple(ErrorKind::FrameTooLarge);
    }
    if rx.len() < LEN_PREFIX + len {
        return Ok(None);
    }
    let payload = rx[LEN_PREFIX..LEN_PREFIX + len].to_vec();
    rx.drain(..LEN_PREFIX + len);
    Ok(Some(payload))
}

/// Encodes a document payload as a length-prefixed frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LEN_PREFIX + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn random_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Begins the handshake on a freshly allocated connection: generates this
/// side's nonce and writes the initial `hello` frame.
pub fn begin_handshake<T, S>(
    conn: &mut Connection<T>,
    local_uid: Uid,
    host_id: [u8; 32],
    identities: &IdentityStore<S>,
) -> Result<()>
where
    T: ByteStream,
    S: BlobStore,
{
    let pubkey = identities
        .load_pubkey(&local_uid)
        .ok_or("local identity not found")
        .simple(ErrorKind::NotFound)?;
    conn.local_uid = Some(local_uid);
    conn.local_nonce = random_nonce();
    conn.phase = Phase::Handshake;

    let mut builder = DocumentBuilder::new(HANDSHAKE_FRAME_MAX);
    builder
        .append_str("type", "hello")
        .append_binary("uid", &local_uid)
        .append_binary("hostid", &host_id)
        .append_binary("pubkey", pubkey.as_ref())
        .append_binary("nonce", &conn.local_nonce);
    let frame = encode_frame(&builder.finish()?);
    conn.stream.write_all(&frame)
}

/// Feeds one already-extracted handshake frame into the FSM, possibly
/// writing a reply and/or completing authentication.
///
/// Returns `Ok(true)` once this call moves the connection into
/// `Phase::Authenticated` for the first time.
pub fn handle_handshake_frame<T, S>(
    conn: &mut Connection<T>,
    payload: &[u8],
    identities: &IdentityStore<S>,
) -> Result<bool>
where
    T: ByteStream,
    S: BlobStore,
{
    if conn.phase != Phase::Handshake {
        return Err("handshake frame received outside the handshake phase")
            .simple(ErrorKind::InvalidPhase);
    }
    let doc = document::decode(payload)?;
    let kind = document::get_str(&doc, "type")
        .ok_or("handshake frame missing type")
        .simple(ErrorKind::ArgumentShape)?;

    match kind {
        "hello" => {
            let peer_uid_bytes = document::get_binary(&doc, "uid")
                .ok_or("hello missing uid")
                .simple(ErrorKind::ArgumentShape)?;
            let peer_pubkey_bytes = document::get_binary(&doc, "pubkey")
                .ok_or("hello missing pubkey")
                .simple(ErrorKind::ArgumentShape)?;
            let peer_nonce = document::get_binary(&doc, "nonce")
                .ok_or("hello missing nonce")
                .simple(ErrorKind::ArgumentShape)?;
            let peer_hostid_bytes = document::get_binary(&doc, "hostid")
                .ok_or("hello missing hostid")
                .simple(ErrorKind::ArgumentShape)?;
            if peer_nonce.len() != 16 {
                return Err("nonce has the wrong length").simple(ErrorKind::ArgumentShape);
            }
            if peer_hostid_bytes.len() != 32 {
                return Err("hostid has the wrong length").simple(ErrorKind::ArgumentShape);
            }
            let peer_pubkey = PublicKey::from_bytes(peer_pubkey_bytes)?;
            let expected_uid = crate::identity::Identity::derive_uid(&peer_pubkey)?;
            if expected_uid.as_slice() != peer_uid_bytes {
                return Err("claimed uid does not match claimed public key")
                    .simple(ErrorKind::Crypto);
            }
            let mut uid = [0u8; 32];
            uid.copy_from_slice(peer_uid_bytes);
            let mut hostid = [0u8; 32];
            hostid.copy_from_slice(peer_hostid_bytes);

            let mut nonce = [0u8; 16];
            nonce.copy_from_slice(peer_nonce);
            conn.peer_nonce = Some(nonce);
            conn.peer_pubkey = Some(peer_pubkey);
            conn.remote_uid = Some(uid);
            conn.remote_host_id = Some(hostid);

            if !conn.sent_proof {
                let local_uid = conn
                    .local_uid
                    .ok_or("handshake proof requested before local identity was set")
                    .simple(ErrorKind::InvalidPhase)?;
                let sig = identities.sign(&local_uid, &nonce)?;
                let mut builder = DocumentBuilder::new(HANDSHAKE_FRAME_MAX);
                builder
                    .append_str("type", "proof")
                    .append_binary("uid", &local_uid)
                    .append_binary("sig", sig.as_ref());
                let frame = encode_frame(&builder.finish()?);
                conn.stream.write_all(&frame)?;
                conn.sent_proof = true;
            }
        }
        "proof" => {
            let sig_bytes = document::get_binary(&doc, "sig")
                .ok_or("proof missing sig")
                .simple(ErrorKind::ArgumentShape)?;
            let peer_pubkey = conn
                .peer_pubkey
                .ok_or("proof received before peer hello")
                .simple(ErrorKind::InvalidPhase)?;
            let sig = crypto::Signature::from_bytes(sig_bytes)?;
            if !crypto::verify(&peer_pubkey, &conn.local_nonce, &sig) {
                return Err("handshake signature did not verify").simple(ErrorKind::Crypto);
            }
            conn.verified_peer = true;
        }
        other => {
            return Err(format!("unknown handshake frame type {:?}", other))
                .simple(ErrorKind::ArgumentShape);
        }
    }

    if conn.verified_peer && conn.sent_proof && conn.phase == Phase::Handshake {
        conn.phase = Phase::Authenticated;
        return Ok(true);
    }
    Ok(false)
}

/// Begins a friend-request cert exchange on an already-authenticated
/// connection. The initiator has already decided to request this peer's
/// friendship, so unlike the acceptor side there is no decision left to
/// await: the connection moves straight to `Phase::ReplyFriendReq` to
/// send its own signed request.
pub fn send_friend_request<T: ByteStream>(conn: &mut Connection<T>, target_uid: Uid) -> Result<()> {
    if conn.phase != Phase::Authenticated {
        return Err("friend requests require an authenticated connection")
            .simple(ErrorKind::InvalidPhase);
    }
    conn.pending_friend_request = Some(target_uid);
    conn.phase = Phase::ReplyFriendReq;
    Ok(())
}

/// Marks a connection as reading an unsolicited inbound friend-request
/// cert, moving it from `Phase::Authenticated` to `Phase::ReadFriendCert`
/// while the decision to accept or reject it is pending.
pub fn begin_reading_friend_cert<T: ByteStream>(conn: &mut Connection<T>) -> Result<()> {
    if conn.phase != Phase::Authenticated {
        return Err("friend requests require an authenticated connection")
            .simple(ErrorKind::InvalidPhase);
    }
    conn.phase = Phase::ReadFriendCert;
    Ok(())
}

/// Advances a connection from `Phase::ReadFriendCert` to
/// `Phase::ReplyFriendReq`, once an accept decision (auto-policy or an
/// explicit operator action) has been made for its pending request.
pub fn accept_friend_request<T: ByteStream>(conn: &mut Connection<T>) -> Result<()> {
    if conn.phase != Phase::ReadFriendCert {
        return Err("no friend request cert is pending on this connection")
            .simple(ErrorKind::InvalidPhase);
    }
    conn.phase = Phase::ReplyFriendReq;
    Ok(())
}

/// Completes a friend-request cert exchange, whichever side initiated it.
/// Per §4.E step 5 (`REPLY_FRIEND_REQ` -> `CLOSING`) the connection closes
/// rather than resuming ordinary framed messaging; step 6 later frees the
/// slot once the pool reaps it.
pub fn finish_friend_request<T: ByteStream>(conn: &mut Connection<T>) -> Result<()> {
    if conn.phase != Phase::ReadFriendCert && conn.phase != Phase::ReplyFriendReq {
        return Err("no friend request is in flight on this connection")
            .simple(ErrorKind::InvalidPhase);
    }
    conn.pending_friend_request = None;
    conn.phase = Phase::Closing;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryBlobStore;
    use std::io::Cursor;

    fn identity_store() -> IdentityStore<InMemoryBlobStore> {
        IdentityStore::open(InMemoryBlobStore::new(), 4).unwrap()
    }

    #[test]
    fn frame_roundtrips_through_extract() {
        let frame = encode_frame(b"hello world");
        let mut rx = RxBuffer::from(frame);
        rx.extend_from_slice(b"trailing-partial");
        let extracted = try_extract_frame(&mut rx, 1400).unwrap().unwrap();
        assert_eq!(extracted, b"hello world");
        assert_eq!(&rx[..], b"trailing-partial");
    }

    #[test]
    fn extract_reports_incomplete_frame_as_none() {
        let mut rx = RxBuffer::from(vec![20, 0, 0, 0, b'a', b'b']);
        assert!(try_extract_frame(&mut rx, 1400).unwrap().is_none());
        assert_eq!(rx.len(), 6);
    }

    #[test]
    fn extract_rejects_oversized_declared_length() {
        let mut rx = RxBuffer::from(vec![0xff, 0xff, 0xff, 0x00]);
        let err = try_extract_frame(&mut rx, 1400).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FrameTooLarge);
    }

    #[test]
    fn accept_friend_request_requires_read_friend_cert_phase() {
        let mut conn = test_connection();
        conn.phase = Phase::Authenticated;
        let err = accept_friend_request(&mut conn).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPhase);

        conn.phase = Phase::ReadFriendCert;
        accept_friend_request(&mut conn).unwrap();
        assert_eq!(conn.phase, Phase::ReplyFriendReq);
    }

    #[test]
    fn mutual_handshake_authenticates_both_sides() {
        let mut alice_store = identity_store();
        let alice = alice_store.create("alice").unwrap();
        let mut bob_store = identity_store();
        let bob = bob_store.create("bob").unwrap();

        let mut alice_conn = test_connection();
        let mut bob_conn = test_connection();

        let alice_host = [0xaa; 32];
        let bob_host = [0xbb; 32];
        begin_handshake(&mut alice_conn, alice.uid(), alice_host, &alice_store).unwrap();
        begin_handshake(&mut bob_conn, bob.uid(), bob_host, &bob_store).unwrap();

        let alice_hello = drain_frame(&mut alice_conn);
        let bob_hello = drain_frame(&mut bob_conn);

        assert!(!handle_handshake_frame(&mut alice_conn, &bob_hello, &alice_store).unwrap());
        assert!(!handle_handshake_frame(&mut bob_conn, &alice_hello, &bob_store).unwrap());

        let alice_proof = drain_frame(&mut alice_conn);
        let bob_proof = drain_frame(&mut bob_conn);

        assert!(handle_handshake_frame(&mut alice_conn, &bob_proof, &alice_store).unwrap());
        assert!(handle_handshake_frame(&mut bob_conn, &alice_proof, &bob_store).unwrap());

        assert_eq!(alice_conn.phase, Phase::Authenticated);
        assert_eq!(bob_conn.phase, Phase::Authenticated);
        assert_eq!(alice_conn.remote_uid, Some(bob.uid()));
        assert_eq!(bob_conn.remote_uid, Some(alice.uid()));
        assert_eq!(alice_conn.remote_host_id, Some(bob_host));
        assert_eq!(bob_conn.remote_host_id, Some(alice_host));
    }

    fn test_connection() -> Connection<Cursor<Vec<u8>>> {
        Connection {
            stream: Cursor::new(Vec::new()),
            phase: Phase::Initial,
            role: crate::connection::Role::Initiator,
            kind: crate::connection::Kind::Core,
            local_uid: None,
            remote_uid: None,
            remote_host_id: None,
            service_id: [0; 32],
            rx: RxBuffer::new(),
            frame_ready: false,
            local_nonce: [0; 16],
            peer_nonce: None,
            peer_pubkey: None,
            sent_proof: false,
            verified_peer: false,
            pending_friend_request: None,
        }
    }

    fn drain_frame(conn: &mut Connection<Cursor<Vec<u8>>>) -> Vec<u8> {
        let bytes = conn.stream.get_ref().clone();
        conn.stream = Cursor::new(Vec::new());
        let mut rx = RxBuffer::from(bytes);
        try_extract_frame(&mut rx, HANDSHAKE_FRAME_MAX).unwrap().unwrap()
    }
}
