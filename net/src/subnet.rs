//! Per-address and per-subnet connection accounting for the listener.
//!
//! Accepted connections are tracked through weak references so that the
//! bookkeeping never keeps a connection alive. Entries whose connection has
//! been dropped are purged by [`AddressConnections::evict_dead`] before each
//! admission decision.
//!
//! Addresses are kept in an ordered map, so counting the members of a subnet
//! is a range scan between the first and last address of that subnet.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::{Arc, Weak},
};

/// Normalise IPv4-mapped IPv6 addresses to plain IPv4.
pub fn canonical_ip(addr: IpAddr) -> IpAddr {
    addr.to_canonical()
}

fn ipv4_mask(prefix: u8) -> u32 {
    let host_bits = 32u32.saturating_sub(u32::from(prefix.min(32)));
    u32::MAX.checked_shl(host_bits).unwrap_or(0)
}

fn ipv6_mask(prefix: u8) -> u128 {
    let host_bits = 128u32.saturating_sub(u32::from(prefix.min(128)));
    u128::MAX.checked_shl(host_bits).unwrap_or(0)
}

/// First and last address of the subnet containing `addr`.
///
/// IPv4 addresses are grouped with `ipv4_prefix`, IPv6 with `ipv6_prefix`.
pub fn subnet_bounds(addr: IpAddr, ipv4_prefix: u8, ipv6_prefix: u8) -> (IpAddr, IpAddr) {
    match canonical_ip(addr) {
        IpAddr::V4(v4) => {
            let mask = ipv4_mask(ipv4_prefix);
            let bits = u32::from(v4);
            (
                IpAddr::V4(Ipv4Addr::from(bits & mask)),
                IpAddr::V4(Ipv4Addr::from(bits | !mask)),
            )
        }
        IpAddr::V6(v6) => {
            let mask = ipv6_mask(ipv6_prefix);
            let bits = u128::from(v6);
            (
                IpAddr::V6(Ipv6Addr::from(bits & mask)),
                IpAddr::V6(Ipv6Addr::from(bits | !mask)),
            )
        }
    }
}

/// Multi-valued map from remote address to the connections accepted from it.
#[derive(Debug)]
pub struct AddressConnections<T> {
    entries: BTreeMap<IpAddr, Vec<Weak<T>>>,
}

impl<T> Default for AddressConnections<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> AddressConnections<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection accepted from `addr`.
    pub fn insert(&mut self, addr: IpAddr, connection: &Arc<T>) {
        self.entries
            .entry(canonical_ip(addr))
            .or_default()
            .push(Arc::downgrade(connection));
    }

    /// Drop every entry whose connection no longer exists.
    ///
    /// Returns the number of entries removed.
    pub fn evict_dead(&mut self) -> usize {
        let mut evicted = 0usize;
        self.entries.retain(|_, connections| {
            let before = connections.len();
            connections.retain(|weak| weak.strong_count() > 0);
            evicted = evicted.saturating_add(before.saturating_sub(connections.len()));
            !connections.is_empty()
        });
        evicted
    }

    /// Total number of tracked entries.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live connections from exactly `addr`.
    pub fn count_ip(&self, addr: IpAddr) -> usize {
        self.entries
            .get(&canonical_ip(addr))
            .map(|connections| live(connections))
            .unwrap_or(0)
    }

    /// Live connections from the subnet containing `addr`.
    pub fn count_subnet(&self, addr: IpAddr, ipv4_prefix: u8, ipv6_prefix: u8) -> usize {
        let (first, last) = subnet_bounds(addr, ipv4_prefix, ipv6_prefix);
        self.entries
            .range(first..=last)
            .map(|(_, connections)| live(connections))
            .sum()
    }
}

fn live<T>(connections: &[Weak<T>]) -> usize {
    connections
        .iter()
        .filter(|weak| weak.strong_count() > 0)
        .count()
}
