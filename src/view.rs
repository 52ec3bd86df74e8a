//! Bounded active and passive membership views.
//!
//! The [`ViewSet`] is the single source of truth for "who are we peered
//! with?" and "who could we peer with?". The active view is a small set of
//! live overlay neighbors; the passive view is a larger standby pool the
//! active view is repaired from under churn. The two are disjoint and never
//! contain the local node.
//!
//! Reserved slots hold active-view capacity for peers bearing a matching
//! tag: an unfilled reservation counts against the active cap, so a view
//! can be "full" with fewer live neighbors than `max_active_size`.

use {
    crate::message::{PeerSpec, Tag},
    log::info,
    rand::{rngs::SmallRng, seq::IteratorRandom},
    std::collections::HashMap,
};

/// Bounded peer views with reserved-tag slots.
#[derive(Debug)]
pub struct ViewSet {
    /// Local node name; never present in either view.
    local_name: String,
    /// Active view, keyed by peer name.
    active: HashMap<String, PeerSpec>,
    /// Passive view, keyed by peer name. Disjoint from `active`.
    passive: HashMap<String, PeerSpec>,
    /// Reserved slots: tag → the peer filling it, if any.
    reserved: HashMap<Tag, Option<PeerSpec>>,
    /// Active-view cap, counting unfilled reservations.
    max_active_size: usize,
    /// Passive-view cap.
    max_passive_size: usize,
}

impl ViewSet {
    /// Create empty views for the given local identity.
    pub fn new(local_name: impl Into<String>, max_active_size: usize, max_passive_size: usize) -> Self {
        Self {
            local_name: local_name.into(),
            active: HashMap::new(),
            passive: HashMap::new(),
            reserved: HashMap::new(),
            max_active_size,
            max_passive_size,
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Whether `name` is in the active view.
    pub fn is_active(&self, name: &str) -> bool {
        self.active.contains_key(name)
    }

    /// Whether `name` is in the passive view.
    pub fn is_passive(&self, name: &str) -> bool {
        self.passive.contains_key(name)
    }

    /// Number of peers in the active view (the local node not counted).
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Number of peers in the passive view.
    pub fn passive_len(&self) -> usize {
        self.passive.len()
    }

    /// True when no remote peer is active.
    pub fn active_is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Reserved slots with no peer in them.
    pub fn unfilled_reserved(&self) -> usize {
        self.reserved.values().filter(|slot| slot.is_none()).count()
    }

    /// Occupied active capacity: live peers plus unfilled reservations.
    pub fn occupied_slots(&self) -> usize {
        self.active.len().saturating_add(self.unfilled_reserved())
    }

    /// Whether the active view has no capacity left.
    pub fn is_active_full(&self) -> bool {
        self.occupied_slots() >= self.max_active_size
    }

    /// Whether `tag` names a reservation that is still unfilled.
    pub fn has_unfilled_reservation(&self, tag: &str) -> bool {
        matches!(self.reserved.get(tag), Some(None))
    }

    /// Snapshot of active peer specs.
    pub fn active_peers(&self) -> Vec<PeerSpec> {
        self.active.values().cloned().collect()
    }

    /// Snapshot of active peer names.
    pub fn active_names(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    /// Snapshot of passive peer names.
    pub fn passive_names(&self) -> Vec<String> {
        self.passive.keys().cloned().collect()
    }

    /// Look up a peer spec in the active view.
    pub fn active_get(&self, name: &str) -> Option<PeerSpec> {
        self.active.get(name).cloned()
    }

    /// Look up a peer spec in either view, active first.
    pub fn find(&self, name: &str) -> Option<PeerSpec> {
        self.active
            .get(name)
            .or_else(|| self.passive.get(name))
            .cloned()
    }

    // ── Reservations ────────────────────────────────────────────────────

    /// Reserve an active-view slot for `tag`. Idempotent for an existing
    /// tag. Returns false when every slot is already reserved.
    pub fn reserve(&mut self, tag: &str) -> bool {
        if self.reserved.contains_key(tag) {
            return true;
        }
        if self.reserved.len() >= self.max_active_size {
            return false;
        }
        self.reserved.insert(tag.to_string(), None);
        true
    }

    /// If `tag` names an unfilled reservation, fill it with `peer`.
    pub fn fill_reserved_slot(&mut self, tag: Option<&str>, peer: &PeerSpec) {
        if let Some(tag) = tag {
            match self.reserved.get_mut(tag) {
                Some(slot) if slot.is_none() => {
                    info!("peer {} fills reserved slot '{}'", peer, tag);
                    *slot = Some(peer.clone());
                }
                _ => {}
            }
        }
    }

    // ── Mutation ────────────────────────────────────────────────────────

    /// Insert a peer into the active view. The caller is responsible for
    /// capacity; this only maintains disjointness.
    pub fn insert_active(&mut self, peer: PeerSpec) {
        if peer.name == self.local_name {
            return;
        }
        self.passive.remove(&peer.name);
        self.active.insert(peer.name.clone(), peer);
    }

    /// Remove a peer from the active view, vacating any reserved slot it
    /// was filling.
    pub fn remove_from_active(&mut self, name: &str) -> Option<PeerSpec> {
        let removed = self.active.remove(name)?;
        for slot in self.reserved.values_mut() {
            if slot.as_ref().is_some_and(|p| p.name == name) {
                *slot = None;
            }
        }
        Some(removed)
    }

    /// Remove a peer from the passive view.
    pub fn remove_from_passive(&mut self, name: &str) -> Option<PeerSpec> {
        self.passive.remove(name)
    }

    /// Add a peer to the passive view, evicting a random standby when the
    /// view is full. No-op for the local node or a peer already in either
    /// view.
    pub fn add_to_passive(&mut self, peer: PeerSpec, rng: &mut SmallRng) {
        if peer.name == self.local_name
            || self.active.contains_key(&peer.name)
            || self.passive.contains_key(&peer.name)
        {
            return;
        }
        if self.passive.len() >= self.max_passive_size {
            if let Some(victim) = self.passive.keys().cloned().choose(rng) {
                self.passive.remove(&victim);
            }
        }
        self.passive.insert(peer.name.clone(), peer);
    }

    /// Remove and return a uniformly random active peer that is not
    /// filling a reserved slot. `None` when every active peer is pinned.
    pub fn drop_random_active(&mut self, rng: &mut SmallRng) -> Option<PeerSpec> {
        let pinned: Vec<&str> = self
            .reserved
            .values()
            .filter_map(|slot| slot.as_ref().map(|p| p.name.as_str()))
            .collect();
        let victim = self
            .active
            .keys()
            .filter(|name| !pinned.contains(&name.as_str()))
            .cloned()
            .choose(rng)?;
        self.active.remove(&victim)
    }

    // ── Random selection ────────────────────────────────────────────────

    /// Uniform random draw from the active view minus `exclude`.
    /// Never panics on an empty candidate set.
    pub fn random_active(&self, exclude: &[&str], rng: &mut SmallRng) -> Option<PeerSpec> {
        self.active
            .values()
            .filter(|p| !exclude.contains(&p.name.as_str()))
            .choose(rng)
            .cloned()
    }

    /// Uniform random draw from the passive view minus `exclude`.
    pub fn random_passive(&self, exclude: &[&str], rng: &mut SmallRng) -> Option<PeerSpec> {
        self.passive
            .values()
            .filter(|p| !exclude.contains(&p.name.as_str()))
            .choose(rng)
            .cloned()
    }

    /// Up to `k` distinct random peers from the active view.
    pub fn sample_active(&self, k: usize, rng: &mut SmallRng) -> Vec<PeerSpec> {
        self.active
            .values()
            .choose_multiple(rng, k)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Up to `k` distinct random peers from the passive view.
    pub fn sample_passive(&self, k: usize, rng: &mut SmallRng) -> Vec<PeerSpec> {
        self.passive
            .values()
            .choose_multiple(rng, k)
            .into_iter()
            .cloned()
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

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(7)
    }

    #[test]
    fn test_views_stay_disjoint() {
        let mut views = ViewSet::new("self", 4, 8);
        let mut rng = rng();
        views.add_to_passive(spec("a"), &mut rng);
        assert!(views.is_passive("a"));
        views.insert_active(spec("a"));
        assert!(views.is_active("a"));
        assert!(!views.is_passive("a"));
    }

    #[test]
    fn test_self_never_enters_views() {
        let mut views = ViewSet::new("self", 4, 8);
        let mut rng = rng();
        views.insert_active(spec("self"));
        views.add_to_passive(spec("self"), &mut rng);
        assert!(!views.is_active("self"));
        assert!(!views.is_passive("self"));
    }

    #[test]
    fn test_passive_bound_evicts_random() {
        let mut views = ViewSet::new("self", 4, 3);
        let mut rng = rng();
        for name in ["a", "b", "c", "d", "e"] {
            views.add_to_passive(spec(name), &mut rng);
        }
        assert_eq!(views.passive_len(), 3);
    }

    #[test]
    fn test_unfilled_reservation_counts_as_occupied() {
        let mut views = ViewSet::new("self", 2, 8);
        assert!(views.reserve("storage"));
        assert_eq!(views.occupied_slots(), 1);
        assert!(!views.is_active_full());
        views.insert_active(spec("a"));
        assert_eq!(views.occupied_slots(), 2);
        assert!(views.is_active_full());
    }

    #[test]
    fn test_fill_and_vacate_reserved_slot() {
        let mut views = ViewSet::new("self", 2, 8);
        assert!(views.reserve("storage"));
        assert!(views.has_unfilled_reservation("storage"));
        let peer = spec("a");
        views.insert_active(peer.clone());
        views.fill_reserved_slot(Some("storage"), &peer);
        assert!(!views.has_unfilled_reservation("storage"));
        assert_eq!(views.occupied_slots(), 1);

        views.remove_from_active("a");
        assert!(views.has_unfilled_reservation("storage"));
    }

    #[test]
    fn test_reserve_is_idempotent_and_bounded() {
        let mut views = ViewSet::new("self", 2, 8);
        assert!(views.reserve("x"));
        assert!(views.reserve("x"));
        assert!(views.reserve("y"));
        assert!(!views.reserve("z"));
    }

    #[test]
    fn test_drop_random_active_spares_pinned_peers() {
        let mut views = ViewSet::new("self", 3, 8);
        assert!(views.reserve("storage"));
        let pinned = spec("a");
        views.insert_active(pinned.clone());
        views.fill_reserved_slot(Some("storage"), &pinned);
        views.insert_active(spec("b"));

        let mut rng = rng();
        let dropped = views.drop_random_active(&mut rng).unwrap();
        assert_eq!(dropped.name, "b");
        assert!(views.drop_random_active(&mut rng).is_none());
        assert!(views.is_active("a"));
    }

    #[test]
    fn test_random_draws_respect_exclusions() {
        let mut views = ViewSet::new("self", 4, 8);
        let mut rng = rng();
        views.insert_active(spec("a"));
        views.insert_active(spec("b"));
        for _ in 0..16 {
            let drawn = views.random_active(&["a"], &mut rng).unwrap();
            assert_eq!(drawn.name, "b");
        }
        assert!(views.random_active(&["a", "b"], &mut rng).is_none());
        assert!(views.random_passive(&[], &mut rng).is_none());
    }

    #[test]
    fn test_samples_are_bounded_and_distinct() {
        let mut views = ViewSet::new("self", 8, 8);
        let mut rng = rng();
        for name in ["a", "b", "c"] {
            views.insert_active(spec(name));
        }
        let sample = views.sample_active(5, &mut rng);
        assert_eq!(sample.len(), 3);
        let mut names: Vec<_> = sample.iter().map(|p| p.name.clone()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 3);
    }
}
