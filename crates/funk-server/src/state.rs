//! Shared server state: the peer registry, authenticated sessions, the
//! auth oracle and the traffic counters.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use funk_protocol::types::ChannelId;

use crate::auth::AuthOracle;
use crate::registry::ClientRegistry;
use crate::store::{Store, StoreUserId};

/// What a successful AUTH established for an address.
#[derive(Debug, Clone)]
pub struct PeerAuth {
    pub user_id: StoreUserId,
    pub username: String,
    pub allowed: HashSet<ChannelId>,
}

pub struct ServerState {
    pub registry: ClientRegistry,
    pub auth: AuthOracle,
    /// Address → authenticated identity. One row per peer regardless of
    /// how many channels it joined.
    pub sessions: DashMap<SocketAddr, PeerAuth>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl ServerState {
    pub fn new(store: Arc<dyn Store>, stale_after: Duration, auth_cache_ttl: Duration) -> Self {
        Self {
            registry: ClientRegistry::new(stale_after),
            auth: AuthOracle::new(store, auth_cache_ttl),
            sessions: DashMap::new(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    pub fn count_in(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn count_out(&self, bytes: usize) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Take and reset the traffic counters.
    pub fn take_traffic(&self) -> (u64, u64) {
        (
            self.bytes_in.swap(0, Ordering::Relaxed),
            self.bytes_out.swap(0, Ordering::Relaxed),
        )
    }
}
