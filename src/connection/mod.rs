//! The connection pool: a fixed-size array of slots, each holding one
//! transport-level connection and its protocol state (§4.D).
//!
//! Slot identifiers (`ConnectionId`) double as the RPC fabric's routing
//! key for `services.send` and the core↔core wire: `rpc::peer` addresses
//! a remote uid by first resolving it to a connection id here.

use rand_core::{OsRng, RngCore};
use smallvec::SmallVec;

use crate::crypto::PublicKey;
use crate::error::*;
use crate::protocol::Phase;
use crate::transport::ByteStream;

/// Default number of simultaneous connections a node will hold (§6).
pub const DEFAULT_POOL_SIZE: usize = 3;

/// A connection's receive buffer: inline storage for the common case (up
/// to the default 1500-byte rx ring), spilling to the heap transparently
/// if a larger frame or a larger configured ring needs more.
pub type RxBuffer = SmallVec<[u8; 1500]>;

/// Index into a `ConnectionPool`. Stable for the lifetime of the slot it
/// names; reused only after the slot has gone through `Phase::Free`.
pub type ConnectionId = usize;

/// Whether a connection was initiated by this node (outbound) or accepted
/// from a listening socket (inbound). Used only for friend-request
/// simultaneous-connection tiebreaking (§9).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Role {
    Initiator,
    Acceptor,
}

/// Which RPC server a connection's frames are dispatched to once
/// authenticated: the app-facing fabric or the core↔core mesh fabric.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Kind {
    App,
    Core,
}

/// One live (or freed) connection slot.
pub struct Connection<T: ByteStream> {
    pub stream: T,
    pub phase: Phase,
    pub role: Role,
    pub kind: Kind,
    /// Local identity used to authenticate on this connection, once known.
    pub local_uid: Option<[u8; 32]>,
    /// Remote peer's uid, once the handshake has authenticated it.
    pub remote_uid: Option<[u8; 32]>,
    /// Remote peer's host id, learned from its handshake hello. For an App
    /// connection this is always the local node's own host id, since the
    /// "remote" side is a co-located local service, not another host.
    pub remote_host_id: Option<[u8; 32]>,
    /// This slot's local service id (`wsid`), used to address it as the
    /// target or origin of a `services.send` peer record. Generated once
    /// at allocation time; meaningful for `Kind::App` slots, unused for
    /// `Kind::Core` ones.
    pub service_id: [u8; 32],
    /// Accumulated inbound bytes not yet resolved into a complete frame.
    pub rx: RxBuffer,
    /// True once a length-prefixed frame has been fully buffered and is
    /// awaiting dispatch by the protocol layer.
    pub frame_ready: bool,

    /// The nonce this side generated and challenged the peer to sign.
    pub local_nonce: [u8; 16],
    /// The nonce the peer challenged us to sign, learned from its hello.
    pub peer_nonce: Option<[u8; 16]>,
    /// The peer's claimed public key, learned from its hello and checked
    /// against its claimed uid before being trusted for signature checks.
    pub peer_pubkey: Option<PublicKey>,
    /// Whether we have already sent our proof (signature over the peer's
    /// nonce) for this handshake.
    pub sent_proof: bool,
    /// Whether the peer's proof (signature over our nonce) has verified.
    pub verified_peer: bool,
    /// Set while a friend-request cert exchange is in flight on top of an
    /// otherwise authenticated connection (§4.D phase chain).
    pub pending_friend_request: Option<[u8; 32]>,
}

impl<T: ByteStream> Connection<T> {
    fn new(stream: T, role: Role, kind: Kind) -> Self {
        let mut service_id = [0u8; 32];
        OsRng.fill_bytes(&mut service_id);
        Connection {
            stream,
            phase: Phase::Initial,
            role,
            kind,
            local_uid: None,
            remote_uid: None,
            remote_host_id: None,
            service_id,
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
}

/// A fixed-size pool of connection slots. Exceeding `capacity` active
/// connections fails with `ErrorKind::PoolFull` rather than growing
/// (§4.D, §6).
pub struct ConnectionPool<T: ByteStream> {
    capacity: usize,
    slots: Vec<Option<Connection<T>>>,
}

impl<T: ByteStream> ConnectionPool<T> {
    pub fn new(capacity: usize) -> Self {
        ConnectionPool {
            capacity,
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Allocates a new slot for `stream`, returning its id. Fails if every
    /// slot is occupied by a connection that has not yet reached
    /// `Phase::Free`.
    pub fn allocate(&mut self, stream: T, role: Role, kind: Kind) -> Result<ConnectionId> {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            let vacant = match slot {
                None => true,
                Some(conn) => conn.phase == Phase::Free,
            };
            if vacant {
                *slot = Some(Connection::new(stream, role, kind));
                return Ok(idx);
            }
        }
        Err("connection pool is full").simple(ErrorKind::PoolFull)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection<T>> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection<T>> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    /// Marks a connection's phase as `Closing`. The actual slot is freed
    /// (and its rx buffer dropped) only once `reap` is called, giving the
    /// RPC layer a chance to cancel any contexts bound to it first.
    pub fn begin_close(&mut self, id: ConnectionId) -> Result<()> {
        let conn = self
            .get_mut(id)
            .ok_or("no such connection")
            .simple(ErrorKind::NotFound)?;
        if conn.phase != Phase::Free {
            conn.phase = Phase::Closing;
        }
        Ok(())
    }

    /// Finalizes the close of every slot currently in `Phase::Closing`,
    /// transitioning them to `Phase::Free` and clearing their buffers so
    /// the slot can be reused by a future `allocate`.
    pub fn reap(&mut self) -> Vec<ConnectionId> {
        let mut reaped = Vec::new();
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if let Some(conn) = slot {
                if conn.phase == Phase::Closing {
                    conn.phase = Phase::Free;
                    conn.rx.clear();
                    conn.frame_ready = false;
                    conn.remote_uid = None;
                    conn.remote_host_id = None;
                    reaped.push(idx);
                }
            }
        }
        reaped
    }

    /// Immediately frees a slot without waiting for a drain tick, used for
    /// `RequestConnectionAbort` where in-flight requests are cancelled
    /// rather than allowed to complete (§4.I).
    pub fn force_close(&mut self, id: ConnectionId) -> Result<()> {
        let conn = self
            .get_mut(id)
            .ok_or("no such connection")
            .simple(ErrorKind::NotFound)?;
        conn.phase = Phase::Free;
        conn.rx.clear();
        conn.frame_ready = false;
        conn.remote_uid = None;
        conn.remote_host_id = None;
        Ok(())
    }

    pub fn find_by_remote_uid(&self, uid: &[u8; 32]) -> Option<ConnectionId> {
        self.slots.iter().enumerate().find_map(|(idx, slot)| {
            slot.as_ref()
                .filter(|c| c.remote_uid.as_ref() == Some(uid) && c.phase != Phase::Free)
                .map(|_| idx)
        })
    }

    /// Resolves the peer-addressing triple `(luid, ruid, rhid)` to an
    /// authenticated connection slot (§4.D `lookup`).
    pub fn find_by_peer(&self, luid: &[u8; 32], ruid: &[u8; 32], rhid: &[u8; 32]) -> Option<ConnectionId> {
        self.slots.iter().enumerate().find_map(|(idx, slot)| {
            slot.as_ref()
                .filter(|c| {
                    c.phase == Phase::Authenticated
                        && c.local_uid.as_ref() == Some(luid)
                        && c.remote_uid.as_ref() == Some(ruid)
                        && c.remote_host_id.as_ref() == Some(rhid)
                })
                .map(|_| idx)
        })
    }

    /// Finds an occupied slot (of any phase) by its local service id,
    /// used to route a local `services.send` delivery to the right app
    /// connection.
    pub fn find_by_service_id(&self, kind: Kind, service_id: &[u8; 32]) -> Option<ConnectionId> {
        self.slots.iter().enumerate().find_map(|(idx, slot)| {
            slot.as_ref()
                .filter(|c| c.phase != Phase::Free && c.kind == kind && &c.service_id == service_id)
                .map(|_| idx)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnectionId, &Connection<T>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|c| (idx, c)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ConnectionId, &mut Connection<T>)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_mut().map(|c| (idx, c)))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active_count(&self) -> usize {
        self.iter().filter(|(_, c)| c.phase != Phase::Free).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn stream() -> Cursor<Vec<u8>> {
        Cursor::new(Vec::new())
    }

    #[test]
    fn allocate_fails_once_pool_is_full() {
        let mut pool: ConnectionPool<Cursor<Vec<u8>>> = ConnectionPool::new(2);
        pool.allocate(stream(), Role::Initiator, Kind::App).unwrap();
        pool.allocate(stream(), Role::Acceptor, Kind::App).unwrap();
        let err = pool.allocate(stream(), Role::Initiator, Kind::App).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PoolFull);
    }

    #[test]
    fn begin_close_then_reap_frees_the_slot_for_reuse() {
        let mut pool: ConnectionPool<Cursor<Vec<u8>>> = ConnectionPool::new(1);
        let id = pool.allocate(stream(), Role::Initiator, Kind::App).unwrap();
        pool.get_mut(id).unwrap().phase = Phase::Authenticated;

        pool.begin_close(id).unwrap();
        assert_eq!(pool.get(id).unwrap().phase, Phase::Closing);

        let reaped = pool.reap();
        assert_eq!(reaped, vec![id]);
        assert_eq!(pool.get(id).unwrap().phase, Phase::Free);

        let reused = pool.allocate(stream(), Role::Acceptor, Kind::App).unwrap();
        assert_eq!(reused, id);
    }

    #[test]
    fn find_by_remote_uid_ignores_freed_slots() {
        let mut pool: ConnectionPool<Cursor<Vec<u8>>> = ConnectionPool::new(1);
        let id = pool.allocate(stream(), Role::Initiator, Kind::Core).unwrap();
        pool.get_mut(id).unwrap().remote_uid = Some([7; 32]);
        pool.get_mut(id).unwrap().phase = Phase::Authenticated;
        assert_eq!(pool.find_by_remote_uid(&[7; 32]), Some(id));

        pool.begin_close(id).unwrap();
        pool.reap();
        assert_eq!(pool.find_by_remote_uid(&[7; 32]), None);
    }
}
