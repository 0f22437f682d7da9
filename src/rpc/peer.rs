//! Core↔core operations, exchanged between remote nodes over an
//! authenticated mesh connection (§4.H). The handler set is deliberately
//! small: forwarding a service payload, advertising local identities as
//! reachable services, and the friend-request cert handshake.

use bson::{Bson, Document};

use crate::connection::{ConnectionId, Kind};
use crate::document;
use crate::error::*;
use crate::node::Node;
use crate::protocol;
use crate::rpc::app::{bson_bin, queue_friend_request_event, uid_arg};
use crate::rpc::Server;
use crate::storage::BlobStore;
use crate::transport::{ByteStream, DatagramSender};

/// Registers every core↔core operation against `server`.
pub fn register<T, U, S>(server: &mut Server<Node<T, U, S>>)
where
    T: ByteStream,
    U: DatagramSender,
    S: BlobStore,
{
    server.register("send", |node, _cid, args| {
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

        let target = node
            .find_app_connection_by_service(&target_service_id)
            .ok_or("no local service bound to that peer record")
            .simple(ErrorKind::Unreachable)?;

        let peer = document::get_document(args, "peer").cloned().unwrap_or_default();
        let mut builder = crate::document::DocumentBuilder::new(node.config.rpc_buffer_size);
        builder.append_str("type", "frame").append_document("peer", peer).append_binary("data", payload);
        let frame = protocol::encode_frame(&builder.finish()?);
        node.queue_delivery(target, frame);
        Ok(Bson::Boolean(true))
    });

    server.register("peers", |node, _cid, _args| {
        let list: Vec<Bson> = node
            .identities
            .iter()
            .map(|id| {
                let mut d = Document::new();
                d.insert("uid", bson_bin(&id.uid()));
                d.insert("alias", id.alias());
                d.insert("pubkey", bson_bin(id.pubkey().as_ref()));
                Bson::Document(d)
            })
            .collect();
        Ok(Bson::Array(list))
    });

    server.register("friendRequest", |node, connection_id, args| {
        let from_uid = uid_arg(args, "from_uid")?;
        let to_uid = uid_arg(args, "to_uid")?;
        let conn = node
            .connections
            .get_mut(connection_id)
            .ok_or("originating connection vanished")
            .simple(ErrorKind::Unreachable)?;
        protocol::begin_reading_friend_cert(conn)?;
        queue_friend_request_event(node, connection_id, from_uid, to_uid);
        Ok(Bson::Null)
    });
}
