//! HyParView membership overlay and peer service manager.
//!
//! This crate maintains a probabilistic partial-mesh overlay among cluster
//! peers. Each node keeps two bounded views:
//!
//! - **Active view** — a small set of live neighbors forming a connected
//!   random graph used for message exchange.
//! - **Passive view** — a larger standby pool the active view is repaired
//!   from under churn.
//!
//! Nodes converge toward a single connected component and tolerate churn
//! up to a few thousand peers. Delivery is best-effort and probabilistic;
//! views are eventually consistent.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────────────────────────────────────────┐
//!  │  application                                     │
//!  │  ← Delivery (mpsc)                               │
//!  │  → PeerServiceHandle (join / forward / reserve)  │
//!  └───────────────┬──────────────────────────────────┘
//!                  │ serialized queue
//!  ┌───────────────▼──────────────────────────────────┐
//!  │  coordinator task (service.rs)                   │
//!  │  • ProtocolState: views, ids, partitions, links  │
//!  │  • timers: shuffle / promotion / tree refresh    │
//!  └──────┬───────────────────────────────┬───────────┘
//!         │                               │
//!  ┌──────▼──────┐                 ┌──────▼───────┐
//!  │  ViewSet    │                 │ BroadcastTree│
//!  │ (act/pass)  │                 │ (out-links)  │
//!  └──────┬──────┘                 └──────────────┘
//!         │
//!  ┌──────▼───────────────────────────────────────────┐
//!  │  PeerConnections (TCP, length-prefixed frames)   │
//!  └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`]    | `PeerServiceConfig` defaults and dev overrides |
//! | [`error`]     | Crate-wide error enum |
//! | [`message`]   | Peer identities, wire frames, bincode framing |
//! | [`epoch`]     | Durable restart-epoch counter |
//! | [`ids`]       | Sent/received disconnect-id bookkeeping |
//! | [`view`]      | Bounded active/passive views with reserved slots |
//! | [`transport`] | TCP connection registry and drivers |
//! | [`partition`] | Injected-partition table (test fault injection) |
//! | [`relay`]     | Broadcast-tree collaborator for transitive relay |
//! | [`handlers`]  | Protocol-message handlers over the views |
//! | [`service`]   | Coordinator event loop and public handle |

pub mod config;
pub mod epoch;
pub mod error;
pub mod handlers;
pub mod ids;
pub mod message;
pub mod partition;
pub mod relay;
pub mod service;
pub mod transport;
pub mod view;
