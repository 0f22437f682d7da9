//! The request/response/emit RPC fabric shared by the app-facing server
//! (`rpc::app`) and the core-to-core server (`rpc::peer`) (§4.E).
//!
//! Both servers are instances of the same generic machinery: a table of
//! named operations, a fixed-size pool of in-flight request contexts, and
//! a small document-based wire envelope. Handlers are plain functions of
//! `(&mut N, &Document) -> Result<Bson>`; the server takes care of
//! encoding replies, routing errors, and bounding memory use.

pub mod app;
pub mod peer;

use std::collections::HashMap;

use bson::{Bson, Document};

use crate::connection::ConnectionId;
use crate::document::{self, DocumentBuilder};
use crate::error::*;

/// Identifies one in-flight request, chosen by the caller (the app client
/// or the remote core) and echoed back in the response.
pub type RequestId = i64;

/// Default capacity of a server's request-context pool (§6).
pub const DEFAULT_CONTEXT_POOL_SIZE: usize = 10;

/// Default cap, in bytes, on an encoded RPC document (§6).
pub const DEFAULT_RPC_BUFFER_SIZE: usize = 1400;

/// Bookkeeping for a single in-flight request, kept only long enough to
/// know which connection to cancel it against if that connection closes.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub id: RequestId,
    pub op: String,
    pub connection_id: ConnectionId,
}

/// A fixed-size pool of `RequestContext` slots. A dispatch that would
/// exceed the pool's capacity fails with `ErrorKind::RequestPoolFull`
/// rather than growing (§4.E, §6).
#[derive(Default)]
pub struct RequestContextPool {
    capacity: usize,
    slots: Vec<Option<RequestContext>>,
}

impl RequestContextPool {
    pub fn new(capacity: usize) -> Self {
        RequestContextPool {
            capacity,
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn alloc(&mut self, ctx: RequestContext) -> Result<usize> {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(ctx);
                return Ok(idx);
            }
        }
        Err("request context pool is full").simple(ErrorKind::RequestPoolFull)
    }

    pub fn free(&mut self, idx: usize) -> Option<RequestContext> {
        self.slots.get_mut(idx).and_then(Option::take)
    }

    pub fn get(&self, idx: usize) -> Option<&RequestContext> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    /// Cancels (frees) every context bound to `connection_id`, called when
    /// that connection begins closing so no reply is ever sent on it.
    pub fn cancel_for_connection(&mut self, connection_id: ConnectionId) -> Vec<RequestContext> {
        let mut cancelled = Vec::new();
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(ctx) if ctx.connection_id == connection_id) {
                if let Some(ctx) = slot.take() {
                    cancelled.push(ctx);
                }
            }
        }
        cancelled
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One decoded incoming request envelope: `{req: {op, args, id?}}` (§6).
pub struct Request {
    pub id: RequestId,
    pub op: String,
    pub args: Document,
}

fn parse_request(req: &Document) -> Result<Request> {
    let id = document::get_int(req, "id").unwrap_or(0);
    let op = document::get_str(req, "op")
        .ok_or("request missing op")
        .simple(ErrorKind::ArgumentShape)?
        .to_owned();
    let args = document::get_document(req, "args").cloned().unwrap_or_default();
    Ok(Request { id, op, args })
}

/// Parses a `{req: {...}}` envelope off the wire.
pub fn decode_request(bytes: &[u8]) -> Result<Request> {
    let doc = document::decode(bytes)?;
    let req = document::get_document(&doc, "req")
        .ok_or("frame is not a request envelope")
        .simple(ErrorKind::ArgumentShape)?;
    parse_request(req)
}

/// Encodes an outgoing request envelope: `{req: {op, args, id}}` (§6).
pub fn encode_request(id: RequestId, op: &str, args: Document, max_len: usize) -> Result<Vec<u8>> {
    let mut req = Document::new();
    req.insert("op", op);
    req.insert("args", args);
    req.insert("id", id);
    let mut builder = DocumentBuilder::new(max_len);
    builder.append_document("req", req);
    builder.finish()
}

/// Encodes a successful response envelope: `{ack: id, data}`.
pub fn encode_response(id: RequestId, data: Bson, max_len: usize) -> Result<Vec<u8>> {
    let mut builder = DocumentBuilder::new(max_len);
    builder.append_i64("ack", id);
    builder.document_mut().insert("data", data);
    builder.finish().map_err(|e| e.swap_kind(ErrorKind::ReplyOverflow))
}

/// Encodes an error response envelope: `{err: id, data: {code, msg}}`.
pub fn encode_error(id: RequestId, err: &Error, max_len: usize) -> Result<Vec<u8>> {
    let mut builder = DocumentBuilder::new(max_len);
    builder.append_i64("err", id);
    let mut data = Document::new();
    data.insert("code", err.kind().code());
    data.insert("msg", err.to_string());
    builder.append_document("data", data);
    builder.finish()
}

/// Encodes an unsolicited signal envelope, used for `services.send`'s
/// push side and similar core->app notifications: `{sig, data}`.
pub fn encode_emit(sig: &str, data: Bson, max_len: usize) -> Result<Vec<u8>> {
    let mut builder = DocumentBuilder::new(max_len);
    builder.append_str("sig", sig);
    builder.document_mut().insert("data", data);
    builder.finish()
}

/// A decoded response envelope: `{ack: id, data}`, `{err: id, data}` or
/// `{sig: id, data}` (§4.F, §6).
pub enum Response {
    Ack { id: RequestId, data: Bson },
    Err { id: RequestId, code: i32, msg: String },
    Sig { id: RequestId, data: Bson },
}

impl Response {
    pub fn id(&self) -> RequestId {
        match self {
            Response::Ack { id, .. } | Response::Err { id, .. } | Response::Sig { id, .. } => *id,
        }
    }
}

/// Either half of what can arrive on an authenticated connection: a
/// request this side must serve, or a response to a request this side
/// sent earlier.
pub enum Envelope {
    Request(Request),
    Response(Response),
}

/// Parses whichever of the two envelope shapes `bytes` holds.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    let doc = document::decode(bytes)?;
    if let Some(req) = document::get_document(&doc, "req") {
        return parse_request(req).map(Envelope::Request);
    }
    if let Some(id) = document::get_int(&doc, "ack") {
        let data = doc.get("data").cloned().unwrap_or(Bson::Null);
        return Ok(Envelope::Response(Response::Ack { id, data }));
    }
    if let Some(id) = document::get_int(&doc, "err") {
        let code = document::get_int(&doc, "data.code").unwrap_or(0) as i32;
        let msg = document::get_str(&doc, "data.msg").unwrap_or_default().to_owned();
        return Ok(Envelope::Response(Response::Err { id, code, msg }));
    }
    if let Some(id) = document::get_int(&doc, "sig") {
        let data = doc.get("data").cloned().unwrap_or(Bson::Null);
        return Ok(Envelope::Response(Response::Sig { id, data }));
    }
    Err("frame is neither a request nor a response envelope").simple(ErrorKind::ArgumentShape)
}

/// Bookkeeping for a request this side sent, kept so a later `ack`/`err`
/// (and any `sig` in between) can be routed back to the right caller.
#[derive(Clone, Debug)]
pub struct PendingRequest {
    pub op: String,
    pub connection_id: ConnectionId,
}

/// The §4.F RPC **client** half: assigns the 31-bit wrapping request id
/// and tracks which connection each outstanding request belongs to, so a
/// late `ack`/`err`/`sig` (or a connection that closes mid-flight) can be
/// routed or cancelled correctly. Counterpart to `Server`, which serves
/// the other direction.
#[derive(Default)]
pub struct Client {
    next_id: RequestId,
    pending: HashMap<RequestId, PendingRequest>,
}

impl Client {
    pub fn new() -> Self {
        Client { next_id: 1, pending: HashMap::new() }
    }

    fn next_request_id(&mut self) -> RequestId {
        let id = self.next_id;
        self.next_id = if self.next_id >= 0x7fff_ffff { 1 } else { self.next_id + 1 };
        id
    }

    /// Encodes a request frame on `connection_id`. When `want_reply` is
    /// true the request is assigned a fresh nonzero id and tracked in the
    /// pending table; otherwise it's encoded fire-and-forget (`id: 0`)
    /// and nothing is tracked.
    pub fn build(
        &mut self,
        connection_id: ConnectionId,
        op: &str,
        args: Document,
        want_reply: bool,
        max_len: usize,
    ) -> Result<Vec<u8>> {
        let id = if want_reply { self.next_request_id() } else { 0 };
        let bytes = encode_request(id, op, args, max_len)?;
        if id != 0 {
            self.pending.insert(id, PendingRequest { op: op.to_owned(), connection_id });
        }
        Ok(bytes)
    }

    /// Routes a decoded response to its pending request, if any is still
    /// tracked. `Ack`/`Err` are terminal and remove the entry; `Sig` is a
    /// non-terminal reply and leaves it in place.
    pub fn resolve(&mut self, response: &Response) -> Option<PendingRequest> {
        match response {
            Response::Sig { id, .. } => self.pending.get(id).cloned(),
            Response::Ack { id, .. } | Response::Err { id, .. } => self.pending.remove(id),
        }
    }

    /// Drops every pending request bound to a connection that's closing,
    /// so a late reply on a reused connection id can never be mistaken
    /// for one.
    pub fn cancel_connection(&mut self, connection_id: ConnectionId) -> Vec<(RequestId, PendingRequest)> {
        let ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter_map(|id| self.pending.remove(&id).map(|p| (id, p))).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

type Handler<N> = Box<dyn Fn(&mut N, ConnectionId, &Document) -> Result<Bson>>;

/// A named table of operations plus the fixed-size context pool tracking
/// requests currently being served against it.
pub struct Server<N> {
    handlers: HashMap<String, Handler<N>>,
    contexts: RequestContextPool,
    max_len: usize,
}

impl<N> Server<N> {
    pub fn new(context_pool_size: usize, max_len: usize) -> Self {
        Server {
            handlers: HashMap::new(),
            contexts: RequestContextPool::new(context_pool_size),
            max_len,
        }
    }

    pub fn register<F>(&mut self, op: &str, handler: F)
    where
        F: Fn(&mut N, ConnectionId, &Document) -> Result<Bson> + 'static,
    {
        self.handlers.insert(op.to_owned(), Box::new(handler));
    }

    pub fn ops(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Dispatches one already-decoded request, allocating a context for
    /// it (so it can be cancelled if `connection_id` closes mid-flight),
    /// running its handler, and encoding the resulting reply frame.
    ///
    /// Returns `None` for a fire-and-forget request (`id == 0`): the
    /// handler still runs for its side effects, but per §4.F nobody is
    /// listening for a reply, so none is written to the wire.
    pub fn dispatch(&mut self, node: &mut N, connection_id: ConnectionId, req: Request) -> Option<Vec<u8>> {
        let fire_and_forget = req.id == 0;
        let ctx_idx = match self.contexts.alloc(RequestContext {
            id: req.id,
            op: req.op.clone(),
            connection_id,
        }) {
            Ok(idx) => idx,
            Err(e) => {
                return if fire_and_forget {
                    None
                } else {
                    Some(encode_error(req.id, &e, self.max_len).unwrap_or_default())
                };
            }
        };

        let handler = self.handlers.get(&req.op);
        let result = match handler {
            Some(handler) => handler(node, connection_id, &req.args),
            None => Err("no handler registered for this op").simple(ErrorKind::UnknownOp),
        };

        self.contexts.free(ctx_idx);

        if fire_and_forget {
            return None;
        }

        Some(match result {
            Ok(data) => encode_response(req.id, data, self.max_len)
                .unwrap_or_else(|e| encode_error(req.id, &e, self.max_len).unwrap_or_default()),
            Err(e) => encode_error(req.id, &e, self.max_len).unwrap_or_default(),
        })
    }

    /// Cancels every request context bound to a closing connection,
    /// called from the connection pool's reap step.
    pub fn cancel_connection(&mut self, connection_id: ConnectionId) -> Vec<RequestContext> {
        self.contexts.cancel_for_connection(connection_id)
    }

    pub fn emit(&self, sig: &str, data: Bson) -> Result<Vec<u8>> {
        encode_emit(sig, data, self.max_len)
    }
}
