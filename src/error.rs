//! Error types for the peer service layer.

use thiserror::Error;

/// Errors that can occur in the peer service layer.
#[derive(Error, Debug)]
pub enum PeerServiceError {
    /// Failed to serialize or deserialize a wire frame.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Frame exceeds the maximum allowed size.
    #[error("message too large: {size} bytes (max {max} bytes)")]
    MessageTooLarge {
        /// Actual frame size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The requested operation is deliberately unsupported.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// Every active-view slot is already reserved.
    #[error("no available slots for reservation")]
    NoAvailableSlots,

    /// More reservations were configured than the active view can hold.
    #[error("reservation limit exceeded: {count} reservations for {max} active slots")]
    ReservationLimitExceeded {
        /// Number of configured reservations.
        count: usize,
        /// Active-view capacity.
        max: usize,
    },

    /// The target peer is behind an injected partition.
    #[error("peer {0} is partitioned")]
    Partitioned(String),

    /// No connection to the peer has been opened yet.
    #[error("not yet connected to {0}")]
    NotYetConnected(String),

    /// The connection to the peer has gone away.
    #[error("disconnected from {0}")]
    Disconnected(String),

    /// The connection driver's outbound buffer is full.
    #[error("send buffer full for {0}")]
    SendBufferFull(String),

    /// Transport-level I/O error.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The channel to the coordinator or the application is closed.
    #[error("peer service channel closed")]
    ChannelClosed,
}

/// Convenience result type for peer service operations.
pub type Result<T> = std::result::Result<T, PeerServiceError>;
