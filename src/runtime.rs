//! Wires `Node` together with both RPC servers and drives the
//! single-threaded cooperative event loop (§4.I).
//!
//! `Node` cannot hold its own RPC servers: a `Server<Node<..>>` handler
//! needs `&mut Node<..>`, and a server can't lend that out while being a
//! field of the very struct it's lent from. `Runtime` is the sibling
//! struct that closes the loop — it owns `Node` and both servers as
//! disjoint fields, so each dispatch borrows them independently instead of
//! reaching through a circular reference.

use bson::Document;

use crate::config::FriendAcceptPolicy;
use crate::connection::{ConnectionId, Kind};
use crate::error::*;
use crate::event::Event;
use crate::identity::Uid;
use crate::node::Node;
use crate::protocol::{self, Phase};
use crate::rpc::{self, Server};
use crate::storage::BlobStore;
use crate::transport::{ByteStream, DatagramSender};

pub struct Runtime<T: ByteStream, U: DatagramSender, S: BlobStore> {
    pub node: Node<T, U, S>,
    pub app_rpc: Server<Node<T, U, S>>,
    pub peer_rpc: Server<Node<T, U, S>>,
    /// Tracks requests this runtime itself initiated over a core
    /// connection (§4.F client half), so an inbound `ack`/`err`/`sig` can
    /// be routed back instead of being mistaken for a request.
    pub client: rpc::Client,
}

impl<T: ByteStream, U: DatagramSender, S: BlobStore> Runtime<T, U, S> {
    /// Assembles a fresh runtime around `node`, registering every app↔core
    /// and core↔core operation. The context pool sizes for both servers
    /// come from `node.config`.
    pub fn new(node: Node<T, U, S>) -> Self {
        let mut app_rpc = Server::new(node.config.rpc_context_pool_size, node.config.rpc_buffer_size);
        let mut peer_rpc = Server::new(node.config.rpc_context_pool_size, node.config.rpc_buffer_size);
        crate::rpc::app::register(&mut app_rpc);
        crate::rpc::peer::register(&mut peer_rpc);
        Runtime { node, app_rpc, peer_rpc, client: rpc::Client::new() }
    }

    /// Pops and processes exactly one event. Returns `false` once the
    /// queue was already dry, so an embedder's outer poll loop can decide
    /// whether to block for more I/O.
    pub fn tick(&mut self) -> bool {
        match self.node.events.pop() {
            Some(event) => {
                self.process_event(event);
                true
            }
            None => false,
        }
    }

    /// Processes every event currently queued, including ones pushed by
    /// handlers run earlier in the same drain.
    pub fn drain(&mut self) {
        while self.tick() {}
    }

    fn process_event(&mut self, event: Event) {
        match event {
            Event::Continue => {}
            Event::NewData(id) => self.pump_connection(id),
            Event::NewCoreConnection(id) => self.on_new_core_connection(id),
            Event::FriendRequest { connection_id, from_uid, to_uid } => {
                self.on_friend_request(connection_id, from_uid, to_uid)
            }
            Event::AcceptFriendRequest { connection_id, from_uid } => {
                self.on_accept_friend_request(connection_id, from_uid)
            }
            Event::RequestConnectionClosing(id) => {
                let _ = self.node.connections.begin_close(id);
            }
            Event::RequestConnectionAbort(id) => self.abort_connection(id),
        }
    }

    /// Feeds every complete frame currently buffered on `id` to the
    /// protocol FSM, dispatching authenticated frames to the matching RPC
    /// server and writing back whatever reply it produces. Aborts the
    /// connection on a malformed frame or a handshake failure (§4.E).
    fn pump_connection(&mut self, id: ConnectionId) {
        loop {
            let phase = match self.node.connections.get(id) {
                Some(conn) => conn.phase,
                None => return,
            };
            let max_frame_len = self.node.config.max_frame_len;
            let extracted = match self.node.connections.get_mut(id) {
                Some(conn) => protocol::try_extract_frame(&mut conn.rx, max_frame_len),
                None => return,
            };
            let payload = match extracted {
                Ok(Some(payload)) => payload,
                Ok(None) => return,
                Err(_) => {
                    self.abort_connection(id);
                    return;
                }
            };

            let outcome = match phase {
                Phase::Handshake => self.feed_handshake(id, &payload),
                Phase::Authenticated => {
                    self.feed_authenticated(id, &payload);
                    Ok(())
                }
                _ => Err(Error::simple(ErrorKind::InvalidPhase)),
            };
            if outcome.is_err() {
                self.abort_connection(id);
                return;
            }
        }
    }

    fn feed_handshake(&mut self, id: ConnectionId, payload: &[u8]) -> Result<()> {
        let conn = self
            .node
            .connections
            .get_mut(id)
            .ok_or("connection vanished")
            .simple(ErrorKind::NotFound)?;
        let completed = protocol::handle_handshake_frame(conn, payload, &self.node.identities)?;
        let is_core = self.node.connections.get(id).map(|c| c.kind) == Some(Kind::Core);
        if completed && is_core {
            self.node.events.push(Event::NewCoreConnection(id));
        }
        Ok(())
    }

    fn feed_authenticated(&mut self, id: ConnectionId, payload: &[u8]) {
        let kind = match self.node.connections.get(id) {
            Some(conn) => conn.kind,
            None => return,
        };
        let envelope = match rpc::decode_envelope(payload) {
            Ok(envelope) => envelope,
            Err(_) => {
                self.abort_connection(id);
                return;
            }
        };
        let request = match envelope {
            rpc::Envelope::Response(response) => {
                // A reply to a request this runtime sent earlier: route
                // it to the pending-callback table instead of dispatching
                // it as a new request. Nothing in this crate's scope yet
                // consumes the resolved value beyond freeing the slot.
                self.client.resolve(&response);
                self.flush_deliveries();
                return;
            }
            rpc::Envelope::Request(request) => request,
        };
        let reply = match kind {
            Kind::App => self.app_rpc.dispatch(&mut self.node, id, request),
            Kind::Core => self.peer_rpc.dispatch(&mut self.node, id, request),
        };
        if let Some(bytes) = reply {
            if let Some(conn) = self.node.connections.get_mut(id) {
                let _ = conn.stream.write_all(&protocol::encode_frame(&bytes));
            }
        }
        self.flush_deliveries();
    }

    /// Sends a fire-and-forget `peers` request down a freshly authenticated
    /// core connection, so this node immediately learns what the remote
    /// side has to offer (§4.I `NEW_CORE_CONNECTION`).
    fn on_new_core_connection(&mut self, id: ConnectionId) {
        let authenticated = matches!(self.node.connections.get(id), Some(conn) if conn.phase == Phase::Authenticated);
        if !authenticated {
            return;
        }
        let max_len = self.node.config.rpc_buffer_size;
        let request = match rpc::encode_request(0, "peers", Document::new(), max_len) {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        if let Some(conn) = self.node.connections.get_mut(id) {
            let _ = conn.stream.write_all(&protocol::encode_frame(&request));
        }
    }

    fn on_friend_request(&mut self, connection_id: ConnectionId, from_uid: Uid, to_uid: Uid) {
        log::debug!("friend request on connection {} from {:?} to {:?}", connection_id, from_uid, to_uid);
        let should_accept = match self.node.config.friend_accept_policy {
            FriendAcceptPolicy::AutoAccept => true,
            FriendAcceptPolicy::AcceptIfEmpty => self.node.identities.contact_count() == 0,
            FriendAcceptPolicy::Manual => false,
            FriendAcceptPolicy::Reject => {
                self.abort_connection(connection_id);
                return;
            }
        };
        if should_accept {
            self.node.events.push(Event::AcceptFriendRequest { connection_id, from_uid });
        }
        // Otherwise left pending in Phase::ReadFriendCert; an app-level
        // accept decision is expected to enqueue AcceptFriendRequest later.
    }

    fn on_accept_friend_request(&mut self, connection_id: ConnectionId, from_uid: Uid) {
        let advanced = match self.node.connections.get_mut(connection_id) {
            Some(conn) => protocol::accept_friend_request(conn).is_ok(),
            None => return,
        };
        if !advanced {
            self.abort_connection(connection_id);
            return;
        }
        if let Err(e) = self.import_friend_contact(connection_id, from_uid) {
            log::warn!("failed to import friend-request contact: {}", e);
            self.abort_connection(connection_id);
            return;
        }
        // Per §4.E step 5, completing the exchange closes the connection
        // rather than resuming ordinary framed messaging.
        if let Some(conn) = self.node.connections.get_mut(connection_id) {
            let _ = protocol::finish_friend_request(conn);
        }
    }

    /// Records the friend-request initiator as a contact (no private
    /// key) so `identity.list` reflects it once the cert exchange
    /// completes (§8 S5). The uid is re-derived from the connection's
    /// cryptographically verified peer public key rather than trusted
    /// from the RPC's `from_uid` argument; `Duplicate` (already a known
    /// contact) is not an error here.
    fn import_friend_contact(&mut self, connection_id: ConnectionId, from_uid: Uid) -> Result<()> {
        let conn = self
            .node
            .connections
            .get(connection_id)
            .ok_or("connection vanished")
            .simple(ErrorKind::InvalidPhase)?;
        let pubkey = conn
            .peer_pubkey
            .ok_or("friend request cert arrived with no verified peer public key")
            .simple(ErrorKind::InvalidPhase)?;
        let alias_uid = conn.remote_uid.unwrap_or(from_uid);

        let mut doc = Document::new();
        doc.insert(
            "alias",
            format!("friend-{:02x}{:02x}{:02x}{:02x}", alias_uid[0], alias_uid[1], alias_uid[2], alias_uid[3]),
        );
        doc.insert("pubkey", crate::rpc::app::bson_bin(pubkey.as_ref()));

        match self.node.identities.import(&doc, from_uid) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::Duplicate => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn abort_connection(&mut self, id: ConnectionId) {
        self.app_rpc.cancel_connection(id);
        self.peer_rpc.cancel_connection(id);
        self.client.cancel_connection(id);
        let _ = self.node.connections.force_close(id);
    }

    /// Writes out every frame queued via `Node::queue_delivery` this tick.
    fn flush_deliveries(&mut self) {
        for delivery in self.node.drain_deliveries() {
            if let Some(conn) = self.node.connections.get_mut(delivery.connection_id) {
                let _ = conn.stream.write_all(&delivery.frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::connection::Role;
    use crate::identity::IdentityStore;
    use crate::storage::InMemoryBlobStore;
    use std::io::Cursor;

    struct NoopSender;
    impl DatagramSender for NoopSender {
        fn send_to(&mut self, _buf: &[u8], _addr: &str) -> Result<()> {
            Ok(())
        }
    }

    fn fresh_runtime() -> Runtime<Cursor<Vec<u8>>, NoopSender, InMemoryBlobStore> {
        let identities = IdentityStore::open(InMemoryBlobStore::new(), 4).unwrap();
        let node = Node::new([1; 32], identities, Config::default(), None);
        Runtime::new(node)
    }

    #[test]
    fn pump_connection_dispatches_a_buffered_app_request_and_writes_a_reply() {
        let mut runtime = fresh_runtime();
        let id = runtime
            .node
            .connections
            .allocate(Cursor::new(Vec::new()), Role::Acceptor, Kind::App)
            .unwrap();
        runtime.node.connections.get_mut(id).unwrap().phase = Phase::Authenticated;

        let request = rpc::encode_request(7, "version", Document::new(), 1400).unwrap();
        let frame = protocol::encode_frame(&request);
        runtime.node.connections.get_mut(id).unwrap().rx.extend_from_slice(&frame);

        runtime.pump_connection(id);

        let written = runtime.node.connections.get(id).unwrap().stream.get_ref().clone();
        let mut rx = crate::connection::RxBuffer::from(written);
        let reply = protocol::try_extract_frame(&mut rx, 1400).unwrap().unwrap();
        let doc = crate::document::decode(&reply).unwrap();
        assert_eq!(crate::document::get_int(&doc, "ack"), Some(7));
    }

    #[test]
    fn new_core_connection_sends_a_peers_request() {
        let mut runtime = fresh_runtime();
        let id = runtime
            .node
            .connections
            .allocate(Cursor::new(Vec::new()), Role::Initiator, Kind::Core)
            .unwrap();
        runtime.node.connections.get_mut(id).unwrap().phase = Phase::Authenticated;

        runtime.on_new_core_connection(id);

        let written = runtime.node.connections.get(id).unwrap().stream.get_ref().clone();
        let mut rx = crate::connection::RxBuffer::from(written);
        let payload = protocol::try_extract_frame(&mut rx, 1400).unwrap().unwrap();
        let req = rpc::decode_request(&payload).unwrap();
        assert_eq!(req.op, "peers");
    }

    #[test]
    fn auto_accept_policy_advances_friend_request_to_closing() {
        let mut runtime = fresh_runtime();
        runtime.node.config.friend_accept_policy = FriendAcceptPolicy::AutoAccept;
        let (pubkey, _) = crate::crypto::generate_keypair().unwrap();
        let expected_uid = crate::identity::Identity::derive_uid(&pubkey).unwrap();
        let id = runtime
            .node
            .connections
            .allocate(Cursor::new(Vec::new()), Role::Acceptor, Kind::Core)
            .unwrap();
        {
            let conn = runtime.node.connections.get_mut(id).unwrap();
            conn.phase = Phase::ReadFriendCert;
            conn.remote_uid = Some(expected_uid);
            conn.peer_pubkey = Some(pubkey);
        }

        runtime.on_friend_request(id, expected_uid, [2; 32]);
        runtime.drain();

        assert_eq!(runtime.node.connections.get(id).unwrap().phase, Phase::Closing);
        assert_eq!(runtime.node.identities.list(), vec![expected_uid]);
    }

    #[test]
    fn accept_if_empty_policy_auto_accepts_only_while_no_contact_is_known() {
        let mut runtime = fresh_runtime();
        runtime.node.config.friend_accept_policy = FriendAcceptPolicy::AcceptIfEmpty;
        let (pubkey, _) = crate::crypto::generate_keypair().unwrap();
        let expected_uid = crate::identity::Identity::derive_uid(&pubkey).unwrap();
        let id = runtime
            .node
            .connections
            .allocate(Cursor::new(Vec::new()), Role::Acceptor, Kind::Core)
            .unwrap();
        {
            let conn = runtime.node.connections.get_mut(id).unwrap();
            conn.phase = Phase::ReadFriendCert;
            conn.remote_uid = Some(expected_uid);
            conn.peer_pubkey = Some(pubkey);
        }

        runtime.on_friend_request(id, expected_uid, [2; 32]);
        runtime.drain();

        assert_eq!(runtime.node.connections.get(id).unwrap().phase, Phase::Closing);
        assert_eq!(runtime.node.identities.list(), vec![expected_uid]);

        // A second inbound request, now that a contact exists, is no
        // longer auto-accepted: it stays pending in Phase::ReadFriendCert.
        let (pubkey2, _) = crate::crypto::generate_keypair().unwrap();
        let second_uid = crate::identity::Identity::derive_uid(&pubkey2).unwrap();
        let id2 = runtime
            .node
            .connections
            .allocate(Cursor::new(Vec::new()), Role::Acceptor, Kind::Core)
            .unwrap();
        {
            let conn = runtime.node.connections.get_mut(id2).unwrap();
            conn.phase = Phase::ReadFriendCert;
            conn.remote_uid = Some(second_uid);
            conn.peer_pubkey = Some(pubkey2);
        }

        runtime.on_friend_request(id2, second_uid, [2; 32]);
        runtime.drain();

        assert_eq!(runtime.node.connections.get(id2).unwrap().phase, Phase::ReadFriendCert);
    }

    #[test]
    fn reject_policy_aborts_the_connection() {
        let mut runtime = fresh_runtime();
        runtime.node.config.friend_accept_policy = FriendAcceptPolicy::Reject;
        let id = runtime
            .node
            .connections
            .allocate(Cursor::new(Vec::new()), Role::Acceptor, Kind::Core)
            .unwrap();
        runtime.node.connections.get_mut(id).unwrap().phase = Phase::ReadFriendCert;

        runtime.on_friend_request(id, [1; 32], [2; 32]);

        assert_eq!(runtime.node.connections.get(id).unwrap().phase, Phase::Free);
    }

    #[test]
    fn request_connection_abort_frees_the_slot_immediately() {
        let mut runtime = fresh_runtime();
        let id = runtime
            .node
            .connections
            .allocate(Cursor::new(Vec::new()), Role::Acceptor, Kind::App)
            .unwrap();
        runtime.node.connections.get_mut(id).unwrap().phase = Phase::Authenticated;

        runtime.node.events.push(Event::RequestConnectionAbort(id));
        runtime.drain();

        assert_eq!(runtime.node.connections.get(id).unwrap().phase, Phase::Free);
    }

    #[test]
    fn malformed_frame_aborts_the_connection_and_frees_the_slot() {
        let mut runtime = fresh_runtime();
        let id = runtime
            .node
            .connections
            .allocate(Cursor::new(Vec::new()), Role::Acceptor, Kind::App)
            .unwrap();
        runtime.node.connections.get_mut(id).unwrap().phase = Phase::Authenticated;

        // A frame declaring a length far beyond the configured max is
        // malformed per §4.E and must abort the connection outright rather
        // than wait for the rest of a frame that will never fit.
        let mut oversized = (u32::MAX).to_le_bytes().to_vec();
        oversized.extend_from_slice(b"short");
        runtime.node.connections.get_mut(id).unwrap().rx.extend_from_slice(&oversized);

        runtime.pump_connection(id);

        assert_eq!(runtime.node.connections.get(id).unwrap().phase, Phase::Free);
        assert!(runtime.node.connections.get(id).unwrap().rx.is_empty());

        let reused = runtime
            .node
            .connections
            .allocate(Cursor::new(Vec::new()), Role::Acceptor, Kind::App)
            .unwrap();
        assert_eq!(reused, id);
    }

    #[test]
    fn inbound_ack_for_a_sent_request_resolves_instead_of_aborting() {
        let mut runtime = fresh_runtime();
        let id = runtime
            .node
            .connections
            .allocate(Cursor::new(Vec::new()), Role::Initiator, Kind::Core)
            .unwrap();
        runtime.node.connections.get_mut(id).unwrap().phase = Phase::Authenticated;

        let request = runtime.client.build(id, "peers", Document::new(), true, 1400).unwrap();
        let req_doc = crate::document::decode(&request).unwrap();
        let req_id = crate::document::get_int(&req_doc, "req.id").unwrap();
        assert_eq!(runtime.client.pending_len(), 1);

        let ack = rpc::encode_response(req_id, bson::Bson::Boolean(true), 1400).unwrap();
        let frame = protocol::encode_frame(&ack);
        runtime.node.connections.get_mut(id).unwrap().rx.extend_from_slice(&frame);

        runtime.pump_connection(id);

        assert_eq!(runtime.node.connections.get(id).unwrap().phase, Phase::Authenticated);
        assert_eq!(runtime.client.pending_len(), 0);
    }

    #[test]
    fn aborting_a_connection_cancels_its_pending_client_requests() {
        let mut runtime = fresh_runtime();
        let id = runtime
            .node
            .connections
            .allocate(Cursor::new(Vec::new()), Role::Initiator, Kind::Core)
            .unwrap();
        runtime.node.connections.get_mut(id).unwrap().phase = Phase::Authenticated;
        runtime.client.build(id, "peers", Document::new(), true, 1400).unwrap();
        assert_eq!(runtime.client.pending_len(), 1);

        runtime.node.events.push(Event::RequestConnectionAbort(id));
        runtime.drain();

        assert_eq!(runtime.client.pending_len(), 0);
    }
}
