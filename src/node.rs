//! Node context: the single value every RPC handler and FSM-driving method
//! receives (§4.M). Owns the identity store, connection pool, discovery
//! table, event queue, local host id and active configuration; there is no
//! process-global mutable state anywhere else in this crate.
//!
//! The two RPC servers (`rpc::app`, `rpc::peer`) are deliberately *not*
//! fields of `Node` itself: a `Server<Node<..>>` handler takes `&mut
//! Node<..>`, and a server cannot hand out `&mut Node` to its own handlers
//! while also being a field of that same `Node` (Rust, rightly, has no
//! room for that kind of self-reference). Instead `runtime::Runtime` owns
//! `Node` and both servers as sibling fields, and dispatches by borrowing
//! them independently. See `DESIGN.md` for this call.

use crate::config::Config;
use crate::connection::{Connection, ConnectionId, ConnectionPool, Kind};
use crate::discovery::DiscoveryTable;
use crate::event::EventQueue;
use crate::identity::IdentityStore;
use crate::storage::BlobStore;
use crate::transport::{ByteStream, DatagramSender};

/// One `{type: "frame", peer, data}` envelope queued for delivery to a
/// specific local app connection, produced by `services.send`'s local
/// routing branch (§4.G) and drained by the runtime after each tick.
pub struct AppDelivery {
    pub connection_id: ConnectionId,
    pub frame: Vec<u8>,
}

pub struct Node<T: ByteStream, U: DatagramSender, S: BlobStore> {
    /// Stable identifier of this node for the lifetime of the process.
    pub host_id: [u8; 32],
    pub identities: IdentityStore<S>,
    pub connections: ConnectionPool<T>,
    pub discovery: DiscoveryTable,
    pub events: EventQueue,
    pub config: Config,
    /// LAN beacon broadcaster. `None` if the embedder disabled discovery.
    pub beacon: Option<U>,
    deliveries: Vec<AppDelivery>,
}

impl<T: ByteStream, U: DatagramSender, S: BlobStore> Node<T, U, S> {
    pub fn new(host_id: [u8; 32], identities: IdentityStore<S>, config: Config, beacon: Option<U>) -> Self {
        Node {
            host_id,
            connections: ConnectionPool::new(config.connection_pool_size),
            discovery: DiscoveryTable::new(config.discovery_capacity),
            events: EventQueue::new(),
            identities,
            config,
            beacon,
            deliveries: Vec::new(),
        }
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection<T>> {
        self.connections.get(id)
    }

    /// Queues a frame for direct delivery to `connection_id`'s app socket,
    /// bypassing the RPC request/response machinery (used for both
    /// `services.send`'s local-delivery branch and core-to-core `send`
    /// payload forwarding once it reaches the addressed app).
    pub fn queue_delivery(&mut self, connection_id: ConnectionId, frame: Vec<u8>) {
        self.deliveries.push(AppDelivery { connection_id, frame });
    }

    /// Drains every delivery queued this tick, for the runtime to write
    /// out to their target connections.
    pub fn drain_deliveries(&mut self) -> Vec<AppDelivery> {
        std::mem::take(&mut self.deliveries)
    }

    /// Finds the local app connection whose service id (`wsid`) is
    /// `service_id`, used to route a `services.send` call addressed to a
    /// co-located service.
    pub fn find_app_connection_by_service(&self, service_id: &[u8; 32]) -> Option<ConnectionId> {
        self.connections.find_by_service_id(Kind::App, service_id)
    }

    /// Broadcasts a LAN beacon advertising one of this node's local
    /// identities, if a beacon sender is configured (§6 "App TCP server"
    /// sibling knob; beacons are opt-in the same way).
    pub fn broadcast_beacon(&mut self, beacon: crate::transport::Beacon) -> crate::error::Result<()> {
        use crate::document::DocumentBuilder;

        let Some(sender) = self.beacon.as_mut() else {
            return Ok(());
        };
        let mut builder = DocumentBuilder::new(512);
        builder
            .append_str("alias", &beacon.alias)
            .append_binary("ruid", &beacon.ruid)
            .append_binary("rhid", &beacon.rhid)
            .append_binary("pubkey", &beacon.pubkey)
            .append_str("transport_addr", &beacon.transport_addr)
            .append_i32("transport_port", beacon.transport_port as i32);
        let payload = builder.finish()?;
        sender.send_to(&payload, &beacon.transport_addr)
    }

    /// Decodes a received LAN beacon broadcast and records it in the
    /// discovery table (§6 "LAN beacon").
    pub fn ingest_beacon(&mut self, bytes: &[u8]) -> crate::error::Result<()> {
        use crate::document;
        use crate::error::*;
        use crate::transport::Beacon;

        let doc = document::decode(bytes)?;
        let alias = document::get_str(&doc, "alias").unwrap_or_default().to_owned();
        let ruid = document::get_binary(&doc, "ruid")
            .ok_or("beacon missing ruid")
            .simple(ErrorKind::ArgumentShape)?;
        let rhid = document::get_binary(&doc, "rhid")
            .ok_or("beacon missing rhid")
            .simple(ErrorKind::ArgumentShape)?;
        let pubkey = document::get_binary(&doc, "pubkey")
            .ok_or("beacon missing pubkey")
            .simple(ErrorKind::ArgumentShape)?;
        let transport_addr = document::get_str(&doc, "transport_addr").unwrap_or_default().to_owned();
        let transport_port = document::get_int(&doc, "transport_port").unwrap_or(0) as u16;

        if ruid.len() != 32 || rhid.len() != 32 || pubkey.len() != 32 {
            return Err("beacon field has the wrong length").simple(ErrorKind::ArgumentShape);
        }
        let mut ruid_arr = [0u8; 32];
        ruid_arr.copy_from_slice(ruid);
        let mut rhid_arr = [0u8; 32];
        rhid_arr.copy_from_slice(rhid);
        let mut pubkey_arr = [0u8; 32];
        pubkey_arr.copy_from_slice(pubkey);

        self.discovery.insert(
            Beacon {
                alias,
                ruid: ruid_arr,
                rhid: rhid_arr,
                pubkey: pubkey_arr,
                transport_addr,
                transport_port,
            }
            .into(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryBlobStore;
    use crate::transport::Beacon;
    use std::io::Cursor;

    struct NoopSender;
    impl DatagramSender for NoopSender {
        fn send_to(&mut self, _buf: &[u8], _addr: &str) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn fresh_node() -> Node<Cursor<Vec<u8>>, NoopSender, InMemoryBlobStore> {
        let identities = IdentityStore::open(InMemoryBlobStore::new(), 4).unwrap();
        Node::new([7; 32], identities, Config::default(), Some(NoopSender))
    }

    #[test]
    fn ingest_beacon_populates_discovery_table() {
        let mut node = fresh_node();
        let mut builder = crate::document::DocumentBuilder::new(512);
        builder
            .append_str("alias", "kitchen-hub")
            .append_binary("ruid", &[9; 32])
            .append_binary("rhid", &[8; 32])
            .append_binary("pubkey", &[1; 32])
            .append_str("transport_addr", "192.0.2.5")
            .append_i32("transport_port", 4242);
        let bytes = builder.finish().unwrap();

        node.ingest_beacon(&bytes).unwrap();

        let found = node.discovery.find(&[9; 32], &[8; 32]).unwrap();
        assert_eq!(found.alias, "kitchen-hub");
        assert_eq!(found.transport_port, 4242);
    }

    #[test]
    fn broadcast_beacon_is_a_noop_without_a_sender() {
        let identities = IdentityStore::open(InMemoryBlobStore::new(), 4).unwrap();
        let mut node: Node<Cursor<Vec<u8>>, NoopSender, InMemoryBlobStore> =
            Node::new([7; 32], identities, Config::default(), None);
        let beacon = Beacon {
            alias: "a".into(),
            ruid: [1; 32],
            rhid: [2; 32],
            pubkey: [3; 32],
            transport_addr: "192.0.2.1".into(),
            transport_port: 1,
        };
        assert!(node.broadcast_beacon(beacon).is_ok());
    }

    #[test]
    fn deliveries_drain_once() {
        let mut node = fresh_node();
        node.queue_delivery(0, vec![1, 2, 3]);
        node.queue_delivery(1, vec![4, 5]);
        let drained = node.drain_deliveries();
        assert_eq!(drained.len(), 2);
        assert!(node.drain_deliveries().is_empty());
    }
}
