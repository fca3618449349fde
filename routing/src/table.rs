//! Route table keyed by destination MAC.

use std::collections::HashMap;
use tapmesh_wire::MacAddr;
use tracing::debug;

/// Outcome of observing an announce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// The announce was strictly newer and the table was updated
    Accepted,
    /// The announce was as old as or older than the stored entry
    Stale,
}

/// One learned route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    /// MAC of the directly-linked peer to forward through
    pub next_hop: MacAddr,
    /// Stamp of the freshest announce accepted for this destination
    pub stamp: i64,
}

/// In-memory route table: destination MAC to next hop
///
/// Owned and mutated exclusively by the mesh controller; entries are created
/// and refreshed by announces and never expire. Liveness of a next hop is
/// checked against the peer registry at forwarding time, not here.
#[derive(Debug)]
pub struct RouteTable {
    local_mac: MacAddr,
    routes: HashMap<MacAddr, RouteEntry>,
}

impl RouteTable {
    /// Create an empty table for a node.
    pub fn new(local_mac: MacAddr) -> Self {
        Self {
            local_mac,
            routes: HashMap::new(),
        }
    }

    /// Observe an announce for `origin` received via the linked peer `via`.
    ///
    /// Strictly newer stamps overwrite; everything else is reported stale so
    /// the caller can suppress the re-flood. The local MAC is never admitted.
    pub fn observe(&mut self, origin: MacAddr, via: MacAddr, stamp: i64) -> Observation {
        if origin == self.local_mac {
            return Observation::Stale;
        }

        match self.routes.get_mut(&origin) {
            Some(entry) if entry.stamp >= stamp => {
                debug!(
                    "Ignoring stale announce for {} (stamp {} <= {})",
                    origin, stamp, entry.stamp
                );
                Observation::Stale
            }
            Some(entry) => {
                entry.next_hop = via;
                entry.stamp = stamp;
                debug!("Refreshed route to {} via {} (stamp {})", origin, via, stamp);
                Observation::Accepted
            }
            None => {
                self.routes.insert(origin, RouteEntry { next_hop: via, stamp });
                debug!("Learned route to {} via {} (stamp {})", origin, via, stamp);
                Observation::Accepted
            }
        }
    }

    /// Look up the route for a destination.
    pub fn lookup(&self, dst: MacAddr) -> Option<&RouteEntry> {
        self.routes.get(&dst)
    }

    /// Number of learned routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no routes have been learned yet.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
