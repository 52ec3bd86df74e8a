//! Peer identities and wire frames for the membership overlay.
//!
//! All frames are serialized with bincode for compact wire representation.
//! The [`OverlayMessage`] enum is the top-level wire type — every byte
//! sequence on an overlay connection is a length-prefixed bincode encoding
//! of this enum, preceded once per connection by a [`PeerSpec`] preamble
//! identifying the dialer.

use {
    crate::error::{PeerServiceError, Result},
    serde::{Deserialize, Serialize},
    std::{
        fmt,
        hash::{Hash, Hasher},
        net::SocketAddr,
    },
};

/// Symbolic label for a reserved active-view slot (e.g. `storage`).
pub type Tag = String;

// ── Peer identity ───────────────────────────────────────────────────────────

/// Identity of a peer on the overlay.
///
/// Equality and hashing are by `name` alone: a peer that reappears on a
/// different address is the same peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSpec {
    /// Unique node name.
    pub name: String,
    /// Address the peer's overlay listener is reachable on.
    pub addr: SocketAddr,
}

impl PeerSpec {
    /// Create a new peer spec.
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
        }
    }
}

impl PartialEq for PeerSpec {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for PeerSpec {}

impl Hash for PeerSpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for PeerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.addr)
    }
}

// ── Disconnect ordering ─────────────────────────────────────────────────────

/// Ordered `(epoch, counter)` pair identifying a disconnect notification.
///
/// The derived ordering is lexicographic: all ids from a later epoch sort
/// after every id of an earlier one. Used to discard stale JOIN,
/// DISCONNECT, and NEIGHBOR traffic that overtook newer frames.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DisconnectId {
    /// Sender's restart epoch when the disconnect was emitted.
    pub epoch: u64,
    /// Per-peer counter within that epoch.
    pub counter: u64,
}

impl DisconnectId {
    /// Create a new disconnect id.
    pub fn new(epoch: u64, counter: u64) -> Self {
        Self { epoch, counter }
    }
}

impl fmt::Display for DisconnectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.epoch, self.counter)
    }
}

/// Priority of a neighbor request. `High` requests are always accepted,
/// bypassing the fullness check; they repair a starved active view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    High,
    Low,
}

/// Opaque handle identifying an injected partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionRef(pub u64);

impl fmt::Display for PartitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:016x}", self.0)
    }
}

// ── Forwarding ──────────────────────────────────────────────────────────────

/// Options attached to a forwarded application message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardOptions {
    /// Allow transitive relay through broadcast-tree out-links when no
    /// direct connection to the target exists.
    pub transitive: bool,
    /// Out-link names of the last relay hop; filled in when a relay
    /// terminates with a direct delivery.
    pub out_links: Vec<String>,
}

impl ForwardOptions {
    /// Options requesting transitive relay fallback.
    pub fn transitive() -> Self {
        Self {
            transitive: true,
            out_links: Vec::new(),
        }
    }
}

/// An application message handed up by the peer service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Label of the application mailbox the sender addressed.
    pub server_ref: String,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Whether the message arrived through a tree relay.
    pub transitive: bool,
}

// ── Wire frames ─────────────────────────────────────────────────────────────

/// Top-level overlay wire frame.
///
/// Every frame on an overlay connection carries exactly one of these
/// variants, length-prefixed and bincode-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OverlayMessage {
    /// A node asks to enter the overlay through the receiver.
    Join {
        /// The joining peer.
        peer: PeerSpec,
        /// The joiner's tag label, if any.
        tag: Option<Tag>,
        /// The joiner's current restart epoch.
        epoch: u64,
    },

    /// Random walk propagating a join through the active views.
    ForwardJoin {
        /// The joining peer.
        peer: PeerSpec,
        /// The joiner's tag label, if any.
        tag: Option<Tag>,
        /// The joiner's restart epoch.
        epoch: u64,
        /// Remaining walk length; 0 terminates as an active admission.
        ttl: u32,
        /// The hop that forwarded this frame.
        sender: PeerSpec,
    },

    /// Active-view confirmation sent back to an admitted peer.
    Neighbor {
        /// The confirming peer (the sender of this frame).
        peer: PeerSpec,
        /// The confirmer's tag label, if any.
        tag: Option<Tag>,
        /// The last disconnect id the confirmer received from the target,
        /// echoed so the target can validate freshness.
        last_disconnect_id: Option<DisconnectId>,
        /// Name of the peer being confirmed.
        target: String,
    },

    /// A request to become an active-view neighbor.
    NeighborRequest {
        /// The requesting peer.
        peer: PeerSpec,
        /// High priority bypasses the fullness check.
        priority: Priority,
        /// The requester's tag label, if any.
        tag: Option<Tag>,
        /// The last disconnect id the requester received from the
        /// receiver, proving its view of the link is current.
        disconnect_id: Option<DisconnectId>,
        /// Peer sample accompanying the request.
        exchange: Vec<PeerSpec>,
    },

    /// Positive reply to a neighbor request.
    NeighborAccepted {
        /// The accepting peer.
        peer: PeerSpec,
        /// The acceptor's tag label, if any.
        tag: Option<Tag>,
        /// The last disconnect id the acceptor received from the
        /// requester.
        last_disconnect_id: Option<DisconnectId>,
        /// Peer sample accompanying the acceptance.
        exchange: Vec<PeerSpec>,
    },

    /// Negative reply to a neighbor request.
    NeighborRejected {
        /// The rejecting peer.
        peer: PeerSpec,
        /// Peer sample accompanying the rejection.
        exchange: Vec<PeerSpec>,
    },

    /// Notification that the sender dropped the receiver from its active
    /// view.
    Disconnect {
        /// The disconnecting peer.
        peer: PeerSpec,
        /// Ordering id; stale ids are discarded by the receiver.
        disconnect_id: DisconnectId,
    },

    /// Periodic passive-view exchange walking the active views.
    Shuffle {
        /// Sampled peers offered by the originator.
        exchange: Vec<PeerSpec>,
        /// Remaining walk length.
        ttl: u32,
        /// The originator of the shuffle; replies go directly to it.
        sender: PeerSpec,
    },

    /// Reply to a terminated shuffle walk.
    ShuffleReply {
        /// Passive-view sample returned to the originator.
        exchange: Vec<PeerSpec>,
        /// The replying peer.
        sender: PeerSpec,
    },

    /// Transitive relay of a frame toward a peer outside the sender's
    /// active view, routed along broadcast-tree out-links.
    RelayMessage {
        /// Name of the final recipient.
        target: String,
        /// The relayed frame.
        message: Box<OverlayMessage>,
        /// Remaining relay hops; 0 drops silently.
        ttl: u32,
    },

    /// Test-only fault injection: partition the receiver from its active
    /// peers.
    InjectPartition {
        /// Handle identifying this partition.
        reference: PartitionRef,
        /// The node that initiated the injection.
        origin: PeerSpec,
        /// Remaining propagation hops.
        ttl: u32,
    },

    /// Lift an injected partition.
    ResolvePartition {
        /// Handle of the partition to lift.
        reference: PartitionRef,
    },

    /// An application message addressed to a named peer.
    ForwardMessage {
        /// Name of the destination peer.
        target: String,
        /// Label of the application mailbox on the destination.
        server_ref: String,
        /// Opaque payload bytes.
        payload: Vec<u8>,
        /// Delivery options.
        options: ForwardOptions,
    },
}

// ── Serialisation helpers ───────────────────────────────────────────────────

impl OverlayMessage {
    /// Serialize this frame to bytes using bincode.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(PeerServiceError::Serialization)
    }

    /// Deserialize a frame from bytes.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(PeerServiceError::Serialization)
    }

    /// Serialize with a 4-byte little-endian length prefix.
    ///
    /// Wire format: `[len: u32-le][payload: len bytes]`
    pub fn serialize_framed(&self, max_size: usize) -> Result<Vec<u8>> {
        let payload = self.serialize()?;
        if payload.len() > max_size {
            return Err(PeerServiceError::MessageTooLarge {
                size: payload.len(),
                max: max_size,
            });
        }
        let len = payload.len() as u32;
        let mut buf = Vec::with_capacity(4usize.saturating_add(payload.len()));
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Read the length prefix from a 4-byte buffer.
    pub fn read_frame_len(header: &[u8; 4]) -> usize {
        u32::from_le_bytes(*header) as usize
    }

    /// Return a human-readable tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::ForwardJoin { .. } => "forward_join",
            Self::Neighbor { .. } => "neighbor",
            Self::NeighborRequest { .. } => "neighbor_request",
            Self::NeighborAccepted { .. } => "neighbor_accepted",
            Self::NeighborRejected { .. } => "neighbor_rejected",
            Self::Disconnect { .. } => "disconnect",
            Self::Shuffle { .. } => "shuffle",
            Self::ShuffleReply { .. } => "shuffle_reply",
            Self::RelayMessage { .. } => "relay_message",
            Self::InjectPartition { .. } => "inject_partition",
            Self::ResolvePartition { .. } => "resolve_partition",
            Self::ForwardMessage { .. } => "forward_message",
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> PeerSpec {
        PeerSpec::new(name, "127.0.0.1:9000".parse().unwrap())
    }

    #[test]
    fn test_peer_equality_by_name() {
        let a1 = PeerSpec::new("a", "127.0.0.1:1000".parse().unwrap());
        let a2 = PeerSpec::new("a", "10.0.0.9:2000".parse().unwrap());
        let b = PeerSpec::new("b", "127.0.0.1:1000".parse().unwrap());
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[test]
    fn test_disconnect_id_lexicographic_order() {
        assert!(DisconnectId::new(1, 9) < DisconnectId::new(2, 0));
        assert!(DisconnectId::new(3, 4) < DisconnectId::new(3, 5));
        assert_eq!(DisconnectId::new(3, 5), DisconnectId::new(3, 5));
    }

    #[test]
    fn test_framed_roundtrip() {
        let msg = OverlayMessage::Join {
            peer: spec("a"),
            tag: Some("storage".into()),
            epoch: 7,
        };
        let framed = msg.serialize_framed(1_048_576).unwrap();
        let len = OverlayMessage::read_frame_len(framed[..4].try_into().unwrap());
        let decoded = OverlayMessage::deserialize(&framed[4..4 + len]).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_relay_roundtrip_nests_inner_frame() {
        let inner = OverlayMessage::ForwardMessage {
            target: "c".into(),
            server_ref: "app".into(),
            payload: vec![1, 2, 3],
            options: ForwardOptions::transitive(),
        };
        let msg = OverlayMessage::RelayMessage {
            target: "c".into(),
            message: Box::new(inner),
            ttl: 4,
        };
        let bytes = msg.serialize().unwrap();
        let decoded = OverlayMessage::deserialize(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_message_too_large() {
        let msg = OverlayMessage::ForwardMessage {
            target: "b".into(),
            server_ref: "app".into(),
            payload: vec![0u8; 64],
            options: ForwardOptions::default(),
        };
        assert!(matches!(
            msg.serialize_framed(8),
            Err(PeerServiceError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_kind_tags() {
        let msg = OverlayMessage::ShuffleReply {
            exchange: vec![],
            sender: spec("a"),
        };
        assert_eq!(msg.kind(), "shuffle_reply");
    }
}
