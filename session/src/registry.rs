//! Registry of known peers and their links.

use bytes::Bytes;
use std::collections::HashMap;
use tapmesh_wire::MacAddr;
use tokio::sync::mpsc;

/// Sending half of one link's outbound queue
///
/// Frames pushed here are transmitted in order by the link task. The id
/// distinguishes successive links to the same peer so that a late link-down
/// notification cannot detach a replacement link.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    tx: mpsc::UnboundedSender<Bytes>,
    id: u64,
}

impl LinkHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Bytes>, id: u64) -> Self {
        Self { tx, id }
    }

    /// Enqueue a complete wire frame for transmission.
    ///
    /// Returns `false` when the link task has already terminated.
    pub fn push(&self, frame_bytes: Bytes) -> bool {
        self.tx.send(frame_bytes).is_ok()
    }

    /// The id of this link instance.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// A known remote identity, possibly currently linked
#[derive(Debug)]
pub struct Peer {
    mac: MacAddr,
    link: Option<LinkHandle>,
}

impl Peer {
    /// The peer's MAC identity.
    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    /// The active link, if any.
    pub fn link(&self) -> Option<&LinkHandle> {
        self.link.as_ref()
    }

    /// Whether the peer currently has a live link.
    pub fn is_linked(&self) -> bool {
        self.link.is_some()
    }
}

/// All peers this node has ever completed a handshake with
///
/// Owned and mutated exclusively by the mesh controller. Peers are created
/// on first handshake and persist for the life of the process; links come
/// and go underneath them. At most one link per peer is live at a time.
#[derive(Debug)]
pub struct PeerRegistry {
    local_mac: MacAddr,
    peers: HashMap<MacAddr, Peer>,
}

impl PeerRegistry {
    /// Create an empty registry for a node.
    pub fn new(local_mac: MacAddr) -> Self {
        Self {
            local_mac,
            peers: HashMap::new(),
        }
    }

    /// Look up or create the peer for `mac`.
    pub fn get_or_create(&mut self, mac: MacAddr) -> &mut Peer {
        self.peers.entry(mac).or_insert(Peer { mac, link: None })
    }

    /// Whether `mac` currently has a live link.
    pub fn is_linked(&self, mac: MacAddr) -> bool {
        self.peers.get(&mac).is_some_and(|p| p.is_linked())
    }

    /// Attach a link to a peer.
    ///
    /// Refuses the local MAC and peers that already have a link; the caller
    /// must close the rejected stream.
    pub fn attach_link(&mut self, mac: MacAddr, link: LinkHandle) -> bool {
        if mac == self.local_mac {
            return false;
        }
        let peer = self.get_or_create(mac);
        if peer.link.is_some() {
            return false;
        }
        peer.link = Some(link);
        true
    }

    /// Detach the link with id `link_id` from a peer.
    ///
    /// Returns `false` when the peer is unknown, unlinked, or already
    /// carries a newer link.
    pub fn detach_link(&mut self, mac: MacAddr, link_id: u64) -> bool {
        match self.peers.get_mut(&mac) {
            Some(peer) if peer.link.as_ref().is_some_and(|l| l.id == link_id) => {
                peer.link = None;
                true
            }
            _ => false,
        }
    }

    /// The live link for `mac`, if any.
    pub fn link(&self, mac: MacAddr) -> Option<&LinkHandle> {
        self.peers.get(&mac).and_then(|p| p.link.as_ref())
    }

    /// Iterate over peers that currently have a live link.
    pub fn iter_linked(&self) -> impl Iterator<Item = (MacAddr, &LinkHandle)> {
        self.peers
            .values()
            .filter_map(|p| p.link.as_ref().map(|l| (p.mac, l)))
    }

    /// Number of peers with a live link.
    pub fn linked_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_linked()).count()
    }

    /// Number of peers ever seen.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peer has completed a handshake yet.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
