//! Node configuration: every bounded-size knob named in §6, with
//! `Default` matching the documented defaults and optional TOML loading.

use serde::Deserialize;

use crate::connection::DEFAULT_POOL_SIZE;
use crate::discovery::DEFAULT_CAPACITY as DEFAULT_DISCOVERY_CAPACITY;
use crate::error::*;
use crate::protocol::DEFAULT_MAX_FRAME_LEN;
use crate::rpc::{DEFAULT_CONTEXT_POOL_SIZE, DEFAULT_RPC_BUFFER_SIZE};

/// Default capacity of the identity store (local identities + contacts).
pub const DEFAULT_IDENTITY_CAPACITY: usize = 4;

/// Policy governing whether an inbound friend request is accepted
/// automatically or left for an operator/app to approve explicitly.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendAcceptPolicy {
    /// Accept every inbound friend request automatically.
    AutoAccept,
    /// Accept automatically only while the identity store holds no
    /// contact yet; once the first contact exists, later requests fall
    /// back to manual approval. This is the documented default (§6).
    AcceptIfEmpty,
    /// Require an explicit `wld.friendRequest` accept call from the app.
    Manual,
    /// Reject every inbound friend request outright.
    Reject,
}

impl Default for FriendAcceptPolicy {
    fn default() -> Self {
        FriendAcceptPolicy::AcceptIfEmpty
    }
}

/// Top-level node configuration. Every field has a sensible default
/// (`Config::default()`), so an embedder only needs to override what it
/// cares about.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Size of a connection's receive ring, in bytes.
    pub rx_ring_size: usize,
    /// Number of simultaneous connections the connection pool will hold.
    pub connection_pool_size: usize,
    /// Cap on one encoded RPC document, in bytes.
    pub rpc_buffer_size: usize,
    /// Cap on one encoded protocol frame's document payload, in bytes.
    pub max_frame_len: usize,
    /// Number of peers the local discovery table remembers at once.
    pub discovery_capacity: usize,
    /// Number of local identities plus contacts the identity store holds.
    pub identity_capacity: usize,
    /// Size of the app-facing and core-facing request-context pools.
    pub rpc_context_pool_size: usize,
    /// How inbound friend requests are handled.
    pub friend_accept_policy: FriendAcceptPolicy,
    /// This node's human-readable alias, advertised in LAN beacons.
    pub alias: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rx_ring_size: 1500,
            connection_pool_size: DEFAULT_POOL_SIZE,
            rpc_buffer_size: DEFAULT_RPC_BUFFER_SIZE,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            discovery_capacity: DEFAULT_DISCOVERY_CAPACITY,
            identity_capacity: DEFAULT_IDENTITY_CAPACITY,
            rpc_context_pool_size: DEFAULT_CONTEXT_POOL_SIZE,
            friend_accept_policy: FriendAcceptPolicy::default(),
            alias: String::from("wishmesh-node"),
        }
    }
}

impl Config {
    /// Parses a `Config` from a TOML document, filling in any field it
    /// omits from `Config::default()`.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).wrapped(ErrorKind::Config)
    }

    /// Loads and parses a `Config` from a file on disk.
    pub fn load_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).wrapped(ErrorKind::Io)?;
        Self::from_toml_str(&contents)
    }

    /// Rejects configurations with knobs too small to do anything useful,
    /// since a zero-sized pool or buffer would make the node unable to
    /// ever hold a connection or encode a reply.
    pub fn validate(&self) -> Result<()> {
        if self.connection_pool_size == 0 {
            return Err("connection_pool_size must be at least 1").simple(ErrorKind::Config);
        }
        if self.rpc_context_pool_size == 0 {
            return Err("rpc_context_pool_size must be at least 1").simple(ErrorKind::Config);
        }
        if self.rpc_buffer_size < 64 {
            return Err("rpc_buffer_size is too small to hold any useful reply")
                .simple(ErrorKind::Config);
        }
        if self.identity_capacity == 0 {
            return Err("identity_capacity must be at least 1").simple(ErrorKind::Config);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn toml_overrides_merge_over_defaults() {
        let cfg = Config::from_toml_str("alias = \"kitchen-hub\"\nconnection_pool_size = 8\n").unwrap();
        assert_eq!(cfg.alias, "kitchen-hub");
        assert_eq!(cfg.connection_pool_size, 8);
        assert_eq!(cfg.rpc_buffer_size, DEFAULT_RPC_BUFFER_SIZE);
    }

    #[test]
    fn validate_rejects_zero_sized_pools() {
        let mut cfg = Config::default();
        cfg.connection_pool_size = 0;
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
