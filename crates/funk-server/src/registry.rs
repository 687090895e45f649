//! Live peer registry: who is reachable at which address and which
//! channels they are listening on.
//!
//! The forward map (address → session) and the reverse index
//! (channel → addresses) are mutated under one lock so they can never
//! drift apart.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use funk_protocol::types::{ChannelId, UserId};

/// Peers silent for longer than this are reaped.
pub const STALE_AFTER: Duration = Duration::from_secs(30);

struct PeerEntry {
    user: UserId,
    channels: HashSet<ChannelId>,
    last_seen: Instant,
}

#[derive(Default)]
struct Inner {
    peers: HashMap<SocketAddr, PeerEntry>,
    by_channel: HashMap<ChannelId, HashSet<SocketAddr>>,
}

pub struct ClientRegistry {
    inner: Mutex<Inner>,
    stale_after: Duration,
}

impl ClientRegistry {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            stale_after,
        }
    }

    /// Create or refresh a peer and add it to the channel's fan-out set.
    pub fn register(&self, addr: SocketAddr, channel: ChannelId, user: UserId, now: Instant) {
        let mut inner = self.inner.lock();

        let entry = inner.peers.entry(addr).or_insert_with(|| PeerEntry {
            user,
            channels: HashSet::new(),
            last_seen: now,
        });
        entry.user = user;
        entry.channels.insert(channel);
        entry.last_seen = now;

        inner.by_channel.entry(channel).or_default().insert(addr);
    }

    /// Refresh last-seen without touching memberships.
    pub fn touch(&self, addr: SocketAddr, now: Instant) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.peers.get_mut(&addr) {
            entry.last_seen = now;
        }
    }

    /// Addresses listening on `channel`, excluding the sender.
    pub fn recipients(&self, channel: ChannelId, exclude: SocketAddr) -> Vec<SocketAddr> {
        let inner = self.inner.lock();
        let Some(members) = inner.by_channel.get(&channel) else {
            return Vec::new();
        };
        members
            .iter()
            .filter(|&&addr| addr != exclude && inner.peers.contains_key(&addr))
            .copied()
            .collect()
    }

    /// Drop peers not seen within the staleness window, cleaning their
    /// channel memberships. Returns each removed address with the channels
    /// it was a member of.
    pub fn reap(&self, now: Instant) -> Vec<(SocketAddr, Vec<ChannelId>)> {
        let mut inner = self.inner.lock();

        let stale: Vec<SocketAddr> = inner
            .peers
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_seen) > self.stale_after)
            .map(|(&addr, _)| addr)
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for addr in stale {
            if let Some(entry) = inner.peers.remove(&addr) {
                for &channel in &entry.channels {
                    if let Some(members) = inner.by_channel.get_mut(&channel) {
                        members.remove(&addr);
                        if members.is_empty() {
                            inner.by_channel.remove(&channel);
                        }
                    }
                }
                let mut channels: Vec<ChannelId> = entry.channels.into_iter().collect();
                channels.sort_unstable();
                removed.push((addr, channels));
            }
        }

        removed
    }

    /// Remove one peer outright (failed re-authentication).
    pub fn remove(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.peers.remove(&addr) {
            for channel in entry.channels {
                if let Some(members) = inner.by_channel.get_mut(&channel) {
                    members.remove(&addr);
                    if members.is_empty() {
                        inner.by_channel.remove(&channel);
                    }
                }
            }
        }
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.inner.lock().peers.contains_key(&addr)
    }

    pub fn peer_count(&self) -> usize {
        self.inner.lock().peers.len()
    }

    /// The channels a peer is currently a member of.
    pub fn channels_of(&self, addr: SocketAddr) -> Vec<ChannelId> {
        let inner = self.inner.lock();
        inner
            .peers
            .get(&addr)
            .map(|entry| entry.channels.iter().copied().collect())
            .unwrap_or_default()
    }
}
