//! Configuration for the peer service manager.

use {
    crate::{
        error::{PeerServiceError, Result},
        message::Tag,
    },
    std::{net::SocketAddr, path::PathBuf},
};

/// Configuration for the HyParView peer service.
///
/// Controls view sizes, random-walk lengths, timer periods, and transport
/// behavior for the membership overlay. All values are read once at init.
#[derive(Debug, Clone)]
pub struct PeerServiceConfig {
    /// Unique name of the local node. Peer identity is keyed by name.
    pub name: String,

    /// Local address to bind the overlay listener on. Port 0 binds an
    /// ephemeral port; the advertised address reflects the bound port.
    pub bind_addr: SocketAddr,

    /// Optional tag label advertised with joins and neighbor requests,
    /// matched against peers' reserved slots.
    pub tag: Option<Tag>,

    /// Tags to reserve active-view slots for at startup.
    /// Must not exceed `max_active_size`; a violation is fatal at init.
    pub reservations: Vec<Tag>,

    /// Active-view cap, counting unfilled reserved slots as occupied.
    /// Default: 6.
    pub max_active_size: usize,

    /// Target the random-promotion timer tries to keep the active view at.
    /// Default: 3.
    pub min_active_size: usize,

    /// Passive-view cap. Default: 30.
    pub max_passive_size: usize,

    /// Active random walk length: TTL on FORWARD_JOIN and SHUFFLE walks.
    /// Default: 6.
    pub arwl: u32,

    /// Passive random walk length: the FORWARD_JOIN TTL at which the
    /// walked peer is also deposited into the passive view. Default: 6.
    pub prwl: u32,

    /// Whether the random-promotion timer runs. Default: true.
    pub random_promotion: bool,

    /// Period of the random-promotion timer in milliseconds.
    /// Default: 5000.
    pub random_promotion_period_ms: u64,

    /// Period of the passive-view shuffle timer in milliseconds.
    /// Default: 10_000.
    pub passive_view_shuffle_period_ms: u64,

    /// Period of the broadcast-tree out-link refresh in milliseconds.
    /// Only runs when `broadcast` is set. Default: 1000.
    pub tree_refresh_period_ms: u64,

    /// How long to wait for the broadcast-tree collaborator before
    /// treating the refresh as "no out-links" (ms). Default: 1000.
    pub out_link_timeout_ms: u64,

    /// TTL for tree-forwarded relay frames. Default: 5.
    pub relay_ttl: u32,

    /// Enable transitive relay through broadcast-tree out-links when a
    /// direct dispatch fails. Default: false.
    pub broadcast: bool,

    /// When false, inbound `forward_message` frames addressed to this node
    /// are delivered to the application straight from the connection
    /// driver, bypassing the coordinator. Default: true.
    pub disable_fast_receive: bool,

    /// Directory for the persisted epoch counter. When unset the epoch is
    /// volatile and restarts from zero.
    pub data_dir: Option<PathBuf>,

    /// Maximum size of a single serialized frame in bytes.
    /// Membership frames are small; 1 MB leaves room for forwarded
    /// application payloads. Default: 1 MB.
    pub max_message_size: usize,

    /// Per-connection outbound buffer and coordinator queue depth.
    /// Default: 1024.
    pub channel_buffer_size: usize,
}

impl PeerServiceConfig {
    /// Create a config with protocol defaults for the given identity.
    pub fn new(name: impl Into<String>, bind_addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            bind_addr,
            tag: None,
            reservations: Vec::new(),
            max_active_size: 6,
            min_active_size: 3,
            max_passive_size: 30,
            arwl: 6,
            prwl: 6,
            random_promotion: true,
            random_promotion_period_ms: 5_000,
            passive_view_shuffle_period_ms: 10_000,
            tree_refresh_period_ms: 1_000,
            out_link_timeout_ms: 1_000,
            relay_ttl: 5,
            broadcast: false,
            disable_fast_receive: true,
            data_dir: None,
            max_message_size: 1_048_576,
            channel_buffer_size: 1_024,
        }
    }

    /// Validate configuration parameters.
    ///
    /// A reservation list larger than the active view is fatal: the
    /// reserved slots alone would exceed the view's capacity.
    pub fn validate(&self) -> Result<()> {
        if self.reservations.len() > self.max_active_size {
            return Err(PeerServiceError::ReservationLimitExceeded {
                count: self.reservations.len(),
                max: self.max_active_size,
            });
        }
        Ok(())
    }

    /// Create a config suitable for local testing: loopback ephemeral
    /// port and short timer periods.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default(name: impl Into<String>) -> Self {
        let mut config = Self::new(name, "127.0.0.1:0".parse().expect("valid dev bind addr"));
        config.random_promotion_period_ms = 200;
        config.passive_view_shuffle_period_ms = 300;
        config.tree_refresh_period_ms = 100;
        config.out_link_timeout_ms = 200;
        config.channel_buffer_size = 256;
        config
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PeerServiceConfig::new("a", "127.0.0.1:0".parse().unwrap());
        assert_eq!(config.max_active_size, 6);
        assert_eq!(config.min_active_size, 3);
        assert_eq!(config.max_passive_size, 30);
        assert_eq!(config.arwl, 6);
        assert_eq!(config.prwl, 6);
        assert!(config.random_promotion);
        assert!(!config.broadcast);
        assert!(config.disable_fast_receive);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_reservation_limit() {
        let mut config = PeerServiceConfig::dev_default("a");
        config.max_active_size = 2;
        config.reservations = vec!["x".into(), "y".into(), "z".into()];
        assert!(matches!(
            config.validate(),
            Err(PeerServiceError::ReservationLimitExceeded { count: 3, max: 2 })
        ));
    }
}
