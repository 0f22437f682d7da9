//! `wishmesh`: an embedded peer-to-peer mesh node runtime.
//!
//! A node maintains a small set of local identities and contacts
//! ([`identity`]), discovers other nodes on the LAN via broadcast beacons
//! ([`discovery`]), opens authenticated connections to them over a fixed
//! pool of slots ([`connection`], [`protocol`]), and multiplexes framed
//! messages between local application services and remote services over
//! those connections via a request/response RPC fabric ([`rpc`]).
//!
//! [`node::Node`] is the single value aggregating all of this state; it
//! holds no references into process-global statics, so an embedder is free
//! to run more than one node per process. [`runtime::Runtime`] wraps a
//! `Node` together with both its RPC servers and drives the single
//! threaded, cooperative event loop described in [`event`].
//!
//! Everything outside this crate's control — socket I/O, file I/O,
//! signature math, content hashing — is reached only through the traits in
//! [`transport`], [`storage`], and [`crypto`].

pub mod config;
pub mod connection;
pub mod crypto;
pub mod discovery;
pub mod document;
pub mod error;
pub mod event;
pub mod identity;
pub mod node;
pub mod protocol;
pub mod rpc;
pub mod runtime;
pub mod storage;
pub mod transport;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use node::Node;
pub use runtime::Runtime;
