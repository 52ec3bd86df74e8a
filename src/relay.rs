//! Broadcast-tree collaborator interface.
//!
//! When transitive relay is enabled, frames for peers outside the active
//! view travel along the eager out-links of an external broadcast tree.
//! The tree is queried periodically on the coordinator's refresh timer and
//! the result cached; a slow or wedged collaborator degrades to "no
//! out-links" rather than stalling membership.

use {
    crate::message::PeerSpec,
    log::warn,
    std::{sync::Arc, time::Duration},
};

/// Supplies this node's eager out-links for transitive relay fan-out.
///
/// Implementations are queried off the coordinator task and must not call
/// back into the peer service.
pub trait BroadcastTree: Send + Sync {
    /// Current eager out-links of the local node.
    fn eager_out_links(&self) -> Vec<PeerSpec>;
}

/// Query the tree with a bounded wait. A timeout or a panicked
/// collaborator yields an empty link set and the previous cache is
/// replaced on the next successful refresh.
pub async fn query_out_links(tree: Arc<dyn BroadcastTree>, timeout_ms: u64) -> Vec<PeerSpec> {
    let task = tokio::task::spawn_blocking(move || tree.eager_out_links());
    match tokio::time::timeout(Duration::from_millis(timeout_ms), task).await {
        Ok(Ok(links)) => links,
        Ok(Err(e)) => {
            warn!("broadcast-tree query failed: {}", e);
            Vec::new()
        }
        Err(_) => {
            warn!("broadcast-tree query timed out after {}ms", timeout_ms);
            Vec::new()
        }
    }
}

/// A fixed out-link set, for wiring tests and static topologies.
#[derive(Debug, Clone, Default)]
pub struct StaticTree {
    links: Vec<PeerSpec>,
}

impl StaticTree {
    /// Create a tree that always returns `links`.
    pub fn new(links: Vec<PeerSpec>) -> Self {
        Self { links }
    }
}

impl BroadcastTree for StaticTree {
    fn eager_out_links(&self) -> Vec<PeerSpec> {
        self.links.clone()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> PeerSpec {
        PeerSpec::new(name, "127.0.0.1:9000".parse().unwrap())
    }

    #[tokio::test]
    async fn test_static_tree_links_returned() {
        let tree: Arc<dyn BroadcastTree> = Arc::new(StaticTree::new(vec![spec("a"), spec("b")]));
        let links = query_out_links(tree, 1_000).await;
        assert_eq!(links.len(), 2);
    }

    #[tokio::test]
    async fn test_slow_tree_times_out_to_empty() {
        struct SlowTree;
        impl BroadcastTree for SlowTree {
            fn eager_out_links(&self) -> Vec<PeerSpec> {
                std::thread::sleep(Duration::from_millis(500));
                vec![spec("a")]
            }
        }
        let links = query_out_links(Arc::new(SlowTree), 50).await;
        assert!(links.is_empty());
    }
}
