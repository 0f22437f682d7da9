//! The closed set of operations a local application service may call
//! against the core (§4.G). Each handler is a thin translation between the
//! wire document and the underlying `Node` state — identity store,
//! connection pool, discovery table — with routing/side-effect rules
//! grounded in `wish_core_app_rpc_func.c`'s dispatch table.

use bson::{Bson, Document};
use either::Either;

use crate::connection::{ConnectionId, Kind};
use crate::document::{self, DocumentBuilder};
use crate::error::*;
use crate::event::Event;
use crate::identity::{Identity, Uid};
use crate::node::Node;
use crate::protocol;
use crate::rpc::Server;
use crate::storage::BlobStore;
use crate::transport::{ByteStream, DatagramSender};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub(crate) fn uid_arg(args: &Document, key: &str) -> Result<Uid> {
    let raw = document::get_binary(args, key)
        .ok_or_else(|| format!("missing {} argument", key))
        .simple(ErrorKind::ArgumentShape)?;
    if raw.len() != 32 {
        return Err(format!("{} must be 32 bytes", key)).simple(ErrorKind::ArgumentShape);
    }
    let mut uid = [0u8; 32];
    uid.copy_from_slice(raw);
    Ok(uid)
}

fn identity_summary(identity: &Identity) -> Document {
    let mut doc = Document::new();
    doc.insert("uid", bson_bin(&identity.uid()));
    doc.insert("alias", identity.alias());
    doc.insert("privkey", identity.has_privkey());
    doc
}

pub(crate) fn bson_bin(bytes: &[u8]) -> Bson {
    Bson::Binary(bson::Binary {
        subtype: bson::spec::BinarySubtype::Generic,
        bytes: bytes.to_vec(),
    })
}

/// Registers every app↔core operation against `server`. Called once, while
/// assembling a `Runtime`.
pub fn register<T, U, S>(server: &mut Server<Node<T, U, S>>)
where
    T: ByteStream,
    U: DatagramSender,
    S: BlobStore,
{
    let op_names: Vec<String> = vec![
        "methods",
        "version",
        "host.config",
        "identity.list",
        "identity.get",
        "identity.create",
        "identity.import",
        "identity.export",
        "identity.remove",
        "identity.sign",
        "identity.verify",
        "services.send",
        "services.list",
        "connections.list",
        "connections.disconnect",
        "connections.checkConnections",
        "wld.list",
        "wld.clear",
        "wld.friendRequest",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect();

    server.register("methods", move |_node, _cid, _args| {
        Ok(Bson::Array(op_names.iter().cloned().map(Bson::String).collect()))
    });

    server.register("version", |_node, _cid, _args| Ok(Bson::String(VERSION.to_owned())));

    server.register("host.config", |_node, _cid, _args| {
        let mut doc = Document::new();
        doc.insert("version", VERSION);
        Ok(Bson::Document(doc))
    });

    server.register("identity.list", |node, _cid, _args| {
        let list: Vec<Bson> = node.identities.iter().map(|id| Bson::Document(identity_summary(id))).collect();
        Ok(Bson::Array(list))
    });

    server.register("identity.get", |node, _cid, args| {
        let uid = uid_arg(args, "uid")?;
        let identity = node.identities.load(&uid).ok_or("identity not found").simple(ErrorKind::NotFound)?;
        let mut doc = identity_summary(identity);
        doc.insert("pubkey", bson_bin(identity.pubkey().as_ref()));
        Ok(Bson::Document(doc))
    });

    server.register("identity.create", |node, _cid, args| {
        let alias = document::get_str(args, "alias")
            .ok_or("missing alias argument")
            .simple(ErrorKind::ArgumentShape)?;
        let created = node.identities.create(alias)?;
        notify_app_connections(node, "identity.created", Bson::Document(identity_summary(&created)))?;
        let mut doc = identity_summary(&created);
        doc.insert("pubkey", bson_bin(created.pubkey().as_ref()));
        Ok(Bson::Document(doc))
    });

    server.register("identity.import", |node, _cid, args| {
        let doc_bytes = document::get_binary(args, "doc")
            .ok_or("missing doc argument")
            .simple(ErrorKind::ArgumentShape)?;
        let befriend_uid = uid_arg(args, "befriend_uid")?;
        let parsed = document::decode(doc_bytes)?;
        let imported = node.identities.import(&parsed, befriend_uid)?;
        let mut doc = Document::new();
        doc.insert("alias", imported.alias());
        doc.insert("uid", bson_bin(&imported.uid()));
        Ok(Bson::Document(doc))
    });

    server.register("identity.export", |node, _cid, args| {
        let uid = uid_arg(args, "uid")?;
        let exported = node.identities.export(&uid)?;
        let bytes = document::encode(&exported)?;
        Ok(bson_bin(&bytes))
    });

    server.register("identity.remove", |node, _cid, args| {
        let uid = uid_arg(args, "uid")?;
        let removed = node.identities.remove(&uid)?;
        if removed {
            notify_app_connections(node, "identity.removed", bson_bin(&uid))?;
        }
        Ok(Bson::Boolean(removed))
    });

    server.register("identity.sign", |node, _cid, args| {
        let uid = uid_arg(args, "uid")?;
        let hash = document::get_binary(args, "hash")
            .ok_or("missing hash argument")
            .simple(ErrorKind::ArgumentShape)?;
        let sig = node.identities.sign(&uid, hash)?;
        Ok(bson_bin(sig.as_ref()))
    });

    server.register("identity.verify", |node, _cid, args| {
        let uid = uid_arg(args, "uid")?;
        let sig_bytes = document::get_binary(args, "sig")
            .ok_or("missing sig argument")
            .simple(ErrorKind::ArgumentShape)?;
        let hash = document::get_binary(args, "hash")
            .ok_or("missing hash argument")
            .simple(ErrorKind::ArgumentShape)?;
        let sig = crate::crypto::Signature::from_bytes(sig_bytes)?;
        Ok(Bson::Boolean(node.identities.verify(&uid, &sig, hash)?))
    });

    server.register("services.send", services_send);

    server.register("services.list", |_node, _cid, _args| Ok(Bson::Array(Vec::new())));

    server.register("connections.list", |node, _cid, _args| {
        let list: Vec<Bson> = node
            .connections
            .iter()
            .map(|(id, conn)| {
                let mut d = Document::new();
                d.insert("cid", id as i64);
                d.insert("luid", conn.local_uid.map(|u| bson_bin(&u)).unwrap_or(Bson::Null));
                d.insert("ruid", conn.remote_uid.map(|u| bson_bin(&u)).unwrap_or(Bson::Null));
                d.insert("rhid", conn.remote_host_id.map(|u| bson_bin(&u)).unwrap_or(Bson::Null));
                d.insert("outgoing", conn.role == crate::connection::Role::Initiator);
                Bson::Document(d)
            })
            .collect();
        Ok(Bson::Array(list))
    });

    server.register("connections.disconnect", |node, _cid, args| {
        let cid = document::get_int(args, "cid")
            .ok_or("missing cid argument")
            .simple(ErrorKind::ArgumentShape)? as ConnectionId;
        node.connections.begin_close(cid)?;
        Ok(Bson::Boolean(true))
    });

    server.register("connections.checkConnections", |_node, _cid, _args| {
        // Opening sockets to known contacts is the embedder's job (the core
        // never touches a transport directly); this just acknowledges the
        // request so the app can treat it as fire-and-forget.
        Ok(Bson::Boolean(true))
    });

    server.register("wld.list", |node, _cid, _args| {
        let list: Vec<Bson> = node
            .discovery
            .list()
            .iter()
            .map(|p| {
                let mut d = Document::new();
                d.insert("alias", p.alias.clone());
                d.insert("ruid", bson_bin(&p.ruid));
                d.insert("rhid", bson_bin(&p.rhid));
                d.insert("pubkey", bson_bin(&p.pubkey));
                Bson::Document(d)
            })
            .collect();
        Ok(Bson::Array(list))
    });

    server.register("wld.clear", |node, _cid, _args| {
        node.discovery.clear();
        Ok(Bson::Boolean(true))
    });

    server.register("wld.friendRequest", |node, _cid, args| {
        let luid = uid_arg(args, "luid")?;
        let ruid = uid_arg(args, "ruid")?;
        let rhid = uid_arg(args, "rhid")?;
        let conn_id = node
            .connections
            .find_by_peer(&luid, &ruid, &rhid)
            .ok_or("no authenticated connection to that peer")
            .simple(ErrorKind::Unreachable)?;
        let conn = node.connections.get_mut(conn_id).ok_or("connection vanished").simple(ErrorKind::Unreachable)?;
        protocol::send_friend_request(conn, ruid)?;
        let mut doc = Document::new();
        doc.insert("status", "wait");
        Ok(Bson::Document(doc))
    });
}

/// Resolves a `services.send` call to its routing target: `Left` for a
/// local app connection addressed by service id, `Right` for a remote
/// core↔core connection addressed by the (luid, ruid, rhid) triple (§4.G
/// "services.send routing").
fn resolve_send_route<T, U, S>(
    node: &Node<T, U, S>,
    luid: &Uid,
    ruid: &Uid,
    rhid: &Uid,
    rsid: &[u8; 32],
) -> Result<Either<ConnectionId, ConnectionId>>
where
    T: ByteStream,
    U: DatagramSender,
    S: BlobStore,
{
    if *rhid == node.host_id {
        node.find_app_connection_by_service(rsid)
            .map(Either::Left)
            .ok_or("no local service bound to that peer record")
            .simple(ErrorKind::Unreachable)
    } else {
        node.connections
            .find_by_peer(luid, ruid, rhid)
            .map(Either::Right)
            .ok_or("no authenticated connection to that peer")
            .simple(ErrorKind::Unreachable)
    }
}

/// Routes a `services.send` call: local delivery if the target host id is
/// this node's own, otherwise a `send` frame forwarded over the matching
/// core↔core connection (§4.G "services.send routing").
fn services_send<T, U, S>(node: &mut Node<T, U, S>, connection_id: ConnectionId, args: &Document) -> Result<Bson>
where
    T: ByteStream,
    U: DatagramSender,
    S: BlobStore,
{
    let luid = uid_arg(args, "peer.luid")?;
    let ruid = uid_arg(args, "peer.ruid")?;
    let rhid = uid_arg(args, "peer.rhid")?;
    let rsid = document::get_binary(args, "peer.rsid")
        .ok_or("missing peer.rsid argument")
        .simple(ErrorKind::ArgumentShape)?;
    if rsid.len() != 32 {
        return Err("peer.rsid must be 32 bytes").simple(ErrorKind::ArgumentShape);
    }
    let mut target_service_id = [0u8; 32];
    target_service_id.copy_from_slice(rsid);
    let payload = document::get_binary(args, "payload")
        .ok_or("missing payload argument")
        .simple(ErrorKind::ArgumentShape)?;
    let max_len = node_rpc_buffer_size(node);

    match resolve_send_route(node, &luid, &ruid, &rhid, &target_service_id)? {
        Either::Left(target) => {
            let caller_service_id = node
                .connections
                .get(connection_id)
                .ok_or("originating connection vanished")
                .simple(ErrorKind::Unreachable)?
                .service_id;

            let mut builder = DocumentBuilder::new(max_len);
            let mut peer = Document::new();
            peer.insert("luid", bson_bin(&ruid));
            peer.insert("ruid", bson_bin(&luid));
            peer.insert("rhid", bson_bin(&node.host_id));
            peer.insert("rsid", bson_bin(&caller_service_id));
            builder.append_str("type", "frame").append_document("peer", peer).append_binary("data", payload);
            let frame = protocol::encode_frame(&builder.finish()?);
            node.queue_delivery(target, frame);
        }
        Either::Right(conn_id) => {
            let mut peer_args = Document::new();
            peer_args.insert("luid", bson_bin(&ruid));
            peer_args.insert("ruid", bson_bin(&luid));
            peer_args.insert("rhid", bson_bin(&node.host_id));
            peer_args.insert("rsid", bson_bin(&target_service_id));
            let mut req_args = Document::new();
            req_args.insert("peer", peer_args);
            req_args.insert("payload", bson_bin(payload));
            let request = crate::rpc::encode_request(0, "send", req_args, max_len)?;
            let conn = node.connections.get_mut(conn_id).ok_or("connection vanished").simple(ErrorKind::Unreachable)?;
            conn.stream.write_all(&protocol::encode_frame(&request)).wrapped(ErrorKind::Unreachable)?;
        }
    }
    Ok(Bson::Boolean(true))
}

fn node_rpc_buffer_size<T: ByteStream, U: DatagramSender, S: BlobStore>(node: &Node<T, U, S>) -> usize {
    node.config.rpc_buffer_size
}

/// Pushes an unsolicited `{sig, data}` envelope to every authenticated app
/// connection, used by `identity.create`/`identity.remove` to let locally
/// connected services keep their identity list in sync without polling.
fn notify_app_connections<T, U, S>(node: &mut Node<T, U, S>, sig: &str, data: Bson) -> Result<()>
where
    T: ByteStream,
    U: DatagramSender,
    S: BlobStore,
{
    let max_len = node.config.rpc_buffer_size;
    let payload = crate::rpc::encode_emit(sig, data, max_len)?;
    let frame = protocol::encode_frame(&payload);
    let targets: Vec<ConnectionId> = node
        .connections
        .iter()
        .filter(|(_, c)| c.kind == Kind::App && c.phase == crate::protocol::Phase::Authenticated)
        .map(|(id, _)| id)
        .collect();
    for id in targets {
        if let Some(conn) = node.connections.get_mut(id) {
            conn.stream.write_all(&frame).wrapped(ErrorKind::Io)?;
        }
    }
    Ok(())
}

/// Records a `FriendRequest` event for the run loop to apply the configured
/// policy to, called from `rpc::peer`'s inbound friend-request handler once
/// a connection has moved to `Phase::ReadFriendCert`.
pub fn queue_friend_request_event<T, U, S>(node: &mut Node<T, U, S>, connection_id: ConnectionId, from_uid: Uid, to_uid: Uid)
where
    T: ByteStream,
    U: DatagramSender,
    S: BlobStore,
{
    node.events.push(Event::FriendRequest { connection_id, from_uid, to_uid });
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

    fn fresh_node() -> Node<Cursor<Vec<u8>>, NoopSender, InMemoryBlobStore> {
        let identities = IdentityStore::open(InMemoryBlobStore::new(), 4).unwrap();
        Node::new([1; 32], identities, Config::default(), None)
    }

    fn fresh_server() -> Server<Node<Cursor<Vec<u8>>, NoopSender, InMemoryBlobStore>> {
        let mut server = Server::new(10, 1400);
        register(&mut server);
        server
    }

    fn dispatch(server: &mut Server<Node<Cursor<Vec<u8>>, NoopSender, InMemoryBlobStore>>, node: &mut Node<Cursor<Vec<u8>>, NoopSender, InMemoryBlobStore>, op: &str, args: Document) -> Document {
        let reply = server.dispatch(node, 0, crate::rpc::Request { id: 1, op: op.into(), args }).unwrap();
        document::decode(&reply).unwrap()
    }

    #[test]
    fn methods_lists_every_registered_op() {
        let mut server = fresh_server();
        let mut node = fresh_node();
        let reply = dispatch(&mut server, &mut node, "methods", Document::new());
        let data = document::get_array(&reply, "data").unwrap();
        assert!(data.iter().any(|b| b.as_str() == Some("identity.create")));
    }

    #[test]
    fn identity_create_then_list_then_get() {
        let mut server = fresh_server();
        let mut node = fresh_node();
        let mut args = Document::new();
        args.insert("alias", "Alice");
        let created = dispatch(&mut server, &mut node, "identity.create", args);
        let uid = document::get_binary(&created, "data.uid").unwrap().to_vec();

        let listed = dispatch(&mut server, &mut node, "identity.list", Document::new());
        assert_eq!(document::get_array(&listed, "data").unwrap().len(), 1);

        let mut get_args = Document::new();
        get_args.insert("uid", bson_bin(&uid));
        let fetched = dispatch(&mut server, &mut node, "identity.get", get_args);
        assert_eq!(document::get_str(&fetched, "data.alias"), Some("Alice"));
    }

    #[test]
    fn identity_get_missing_uid_is_not_found() {
        let mut server = fresh_server();
        let mut node = fresh_node();
        let mut args = Document::new();
        args.insert("uid", bson_bin(&[9u8; 32]));
        let reply = dispatch(&mut server, &mut node, "identity.get", args);
        assert_eq!(document::get_int(&reply, "data.code"), Some(ErrorKind::NotFound.code() as i64));
    }

    #[test]
    fn identity_export_then_import_roundtrips() {
        let mut server = fresh_server();
        let mut node = fresh_node();
        let mut create_args = Document::new();
        create_args.insert("alias", "Alice");
        let created = dispatch(&mut server, &mut node, "identity.create", create_args);
        let uid = document::get_binary(&created, "data.uid").unwrap().to_vec();

        let mut export_args = Document::new();
        export_args.insert("uid", bson_bin(&uid));
        let exported = dispatch(&mut server, &mut node, "identity.export", export_args);
        let exported_doc = document::get_binary(&exported, "data").unwrap().to_vec();

        let mut remove_args = Document::new();
        remove_args.insert("uid", bson_bin(&uid));
        dispatch(&mut server, &mut node, "identity.remove", remove_args);

        let mut import_args = Document::new();
        import_args.insert("doc", bson_bin(&exported_doc));
        import_args.insert("befriend_uid", bson_bin(&[0u8; 32]));
        let imported = dispatch(&mut server, &mut node, "identity.import", import_args);
        assert_eq!(document::get_str(&imported, "data.alias"), Some("Alice"));
    }

    #[test]
    fn services_send_delivers_locally_when_rhid_matches_this_host() {
        let mut server = fresh_server();
        let mut node = fresh_node();
        let sender_id = node.connections.allocate(Cursor::new(Vec::new()), Role::Acceptor, Kind::App).unwrap();
        let target_id = node.connections.allocate(Cursor::new(Vec::new()), Role::Acceptor, Kind::App).unwrap();
        let target_service_id = node.connections.get(target_id).unwrap().service_id;

        let mut peer = Document::new();
        peer.insert("luid", bson_bin(&[1; 32]));
        peer.insert("ruid", bson_bin(&[2; 32]));
        peer.insert("rhid", bson_bin(&node.host_id));
        peer.insert("rsid", bson_bin(&target_service_id));
        let mut args = Document::new();
        args.insert("peer", peer);
        args.insert("payload", bson_bin(b"hello"));

        let reply = server
            .dispatch(&mut node, sender_id, crate::rpc::Request { id: 1, op: "services.send".into(), args })
            .unwrap();
        let doc = document::decode(&reply).unwrap();
        assert_eq!(document::get_bool(&doc, "data"), Some(true));

        let deliveries = node.drain_deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].connection_id, target_id);
    }

    #[test]
    fn services_send_reports_unreachable_when_no_local_target_is_bound() {
        let mut server = fresh_server();
        let mut node = fresh_node();
        let sender_id = node.connections.allocate(Cursor::new(Vec::new()), Role::Acceptor, Kind::App).unwrap();

        let mut peer = Document::new();
        peer.insert("luid", bson_bin(&[1; 32]));
        peer.insert("ruid", bson_bin(&[2; 32]));
        peer.insert("rhid", bson_bin(&node.host_id));
        peer.insert("rsid", bson_bin(&[0xee; 32]));
        let mut args = Document::new();
        args.insert("peer", peer);
        args.insert("payload", bson_bin(b"hello"));

        let reply = server
            .dispatch(&mut node, sender_id, crate::rpc::Request { id: 1, op: "services.send".into(), args })
            .unwrap();
        let doc = document::decode(&reply).unwrap();
        assert_eq!(document::get_int(&doc, "data.code"), Some(ErrorKind::Unreachable.code() as i64));
    }

    #[test]
    fn connections_disconnect_marks_the_slot_closing() {
        let mut server = fresh_server();
        let mut node = fresh_node();
        let id = node.connections.allocate(Cursor::new(Vec::new()), Role::Acceptor, Kind::App).unwrap();
        let mut args = Document::new();
        args.insert("cid", id as i64);
        dispatch(&mut server, &mut node, "connections.disconnect", args);
        assert_eq!(node.connections.get(id).unwrap().phase, crate::protocol::Phase::Closing);
    }

    #[test]
    fn wld_list_then_clear() {
        let mut server = fresh_server();
        let mut node = fresh_node();
        node.discovery.insert(crate::discovery::DiscoveredPeer {
            alias: "bob".into(),
            ruid: [2; 32],
            rhid: [3; 32],
            pubkey: [4; 32],
            transport_addr: "192.0.2.1".into(),
            transport_port: 1,
        });
        let listed = dispatch(&mut server, &mut node, "wld.list", Document::new());
        assert_eq!(document::get_array(&listed, "data").unwrap().len(), 1);
        dispatch(&mut server, &mut node, "wld.clear", Document::new());
        assert!(node.discovery.is_empty());
    }
}
