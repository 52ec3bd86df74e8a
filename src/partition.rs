//! Injected-partition bookkeeping.
//!
//! Partitions are a test-only fault: an injected partition marks a set of
//! active peers unreachable for `forward_message` until resolved. The
//! table is written only by the coordinator; the handle's fast path reads
//! a shared snapshot, mirroring the shared-registry arrangement of the
//! transport.

use {
    crate::message::{PartitionRef, PeerSpec},
    rand::{rngs::SmallRng, Rng},
    std::sync::{Arc, RwLock},
};

/// Shared table of `(reference, peer)` partition entries.
#[derive(Debug, Clone, Default)]
pub struct PartitionTable {
    entries: Arc<RwLock<Vec<(PartitionRef, PeerSpec)>>>,
}

impl PartitionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw a fresh opaque partition reference.
    pub fn fresh_reference(rng: &mut SmallRng) -> PartitionRef {
        PartitionRef(rng.random())
    }

    /// Whether any partition entry names `peer`.
    pub fn is_partitioned(&self, peer: &str) -> bool {
        self.entries
            .read()
            .expect("partition table lock poisoned")
            .iter()
            .any(|(_, p)| p.name == peer)
    }

    /// Record a partition entry. Duplicate `(reference, peer)` pairs are
    /// kept out.
    pub fn insert(&self, reference: PartitionRef, peer: PeerSpec) {
        let mut entries = self.entries.write().expect("partition table lock poisoned");
        if !entries
            .iter()
            .any(|(r, p)| *r == reference && p.name == peer.name)
        {
            entries.push((reference, peer));
        }
    }

    /// Drop every entry carrying `reference`. Returns whether anything
    /// was removed.
    pub fn remove_reference(&self, reference: PartitionRef) -> bool {
        let mut entries = self.entries.write().expect("partition table lock poisoned");
        let before = entries.len();
        entries.retain(|(r, _)| *r != reference);
        entries.len() != before
    }

    /// Snapshot of `(reference, peer name)` entries.
    pub fn entries(&self) -> Vec<(PartitionRef, String)> {
        self.entries
            .read()
            .expect("partition table lock poisoned")
            .iter()
            .map(|(r, p)| (*r, p.name.clone()))
            .collect()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {super::*, rand::SeedableRng};

    fn spec(name: &str) -> PeerSpec {
        PeerSpec::new(name, "127.0.0.1:9000".parse().unwrap())
    }

    #[test]
    fn test_insert_and_resolve() {
        let table = PartitionTable::new();
        let mut rng = SmallRng::seed_from_u64(1);
        let reference = PartitionTable::fresh_reference(&mut rng);

        table.insert(reference, spec("a"));
        table.insert(reference, spec("b"));
        table.insert(reference, spec("a")); // duplicate
        assert!(table.is_partitioned("a"));
        assert!(table.is_partitioned("b"));
        assert!(!table.is_partitioned("c"));
        assert_eq!(table.entries().len(), 2);

        assert!(table.remove_reference(reference));
        assert!(!table.is_partitioned("a"));
        assert!(!table.remove_reference(reference));
    }

    #[test]
    fn test_references_are_independent() {
        let table = PartitionTable::new();
        let mut rng = SmallRng::seed_from_u64(2);
        let r1 = PartitionTable::fresh_reference(&mut rng);
        let r2 = PartitionTable::fresh_reference(&mut rng);
        assert_ne!(r1, r2);

        table.insert(r1, spec("a"));
        table.insert(r2, spec("a"));
        assert!(table.remove_reference(r1));
        // Still partitioned through the other reference.
        assert!(table.is_partitioned("a"));
    }
}
