//! Protocol-message handlers and membership state.
//!
//! [`ProtocolState`] owns every piece of mutable membership state — the
//! views, the disconnect-id book, the partition table, the cached
//! out-links — and reacts to inbound frames, timer ticks, and transport
//! events by mutating that state and issuing outbound frames. It performs
//! no I/O of its own beyond non-blocking transport dispatch, so the whole
//! protocol can be driven deterministically in tests through the in-memory
//! transport.
//!
//! The coordinator task in [`crate::service`] is the only caller; it feeds
//! exactly one event at a time, which is what makes the single-writer
//! discipline hold.

use {
    crate::{
        config::PeerServiceConfig,
        epoch::EpochStore,
        error::{PeerServiceError, Result},
        ids::MessageIdBook,
        message::{
            Delivery, DisconnectId, ForwardOptions, OverlayMessage, PartitionRef, PeerSpec,
            Priority, Tag,
        },
        partition::PartitionTable,
        transport::{Transport, TransportEvent},
        view::ViewSet,
    },
    log::{debug, info, warn},
    rand::{rngs::SmallRng, SeedableRng},
    std::sync::Arc,
    tokio::sync::mpsc,
};

/// Peers sampled from the active view into each exchange.
const K_ACTIVE: usize = 3;
/// Peers sampled from the passive view into each exchange.
const K_PASSIVE: usize = 4;

/// The membership protocol core.
pub struct ProtocolState {
    config: PeerServiceConfig,
    local: PeerSpec,
    epoch: u64,
    views: ViewSet,
    ids: MessageIdBook,
    partitions: PartitionTable,
    out_links: Vec<PeerSpec>,
    epoch_store: EpochStore,
    transport: Arc<dyn Transport>,
    delivery: mpsc::Sender<Delivery>,
    rng: SmallRng,
}

impl ProtocolState {
    /// Build the protocol state, applying configured reservations.
    pub fn new(
        config: PeerServiceConfig,
        local: PeerSpec,
        epoch: u64,
        epoch_store: EpochStore,
        partitions: PartitionTable,
        transport: Arc<dyn Transport>,
        delivery: mpsc::Sender<Delivery>,
    ) -> Result<Self> {
        let mut views = ViewSet::new(
            local.name.as_str(),
            config.max_active_size,
            config.max_passive_size,
        );
        for tag in &config.reservations {
            if !views.reserve(tag) {
                return Err(PeerServiceError::ReservationLimitExceeded {
                    count: config.reservations.len(),
                    max: config.max_active_size,
                });
            }
        }
        Ok(Self {
            config,
            local,
            epoch,
            views,
            ids: MessageIdBook::new(),
            partitions,
            out_links: Vec::new(),
            epoch_store,
            transport,
            delivery,
            rng: SmallRng::from_os_rng(),
        })
    }

    /// Replace the RNG with a seeded one, for deterministic tests.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    // ── Accessors ───────────────────────────────────────────────────────

    /// The local peer identity.
    pub fn local(&self) -> &PeerSpec {
        &self.local
    }

    /// The current restart epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The membership views.
    pub fn views(&self) -> &ViewSet {
        &self.views
    }

    /// The disconnect-id book.
    pub fn ids(&self) -> &MessageIdBook {
        &self.ids
    }

    /// The injected-partition table.
    pub fn partition_table(&self) -> &PartitionTable {
        &self.partitions
    }

    /// The cached broadcast-tree out-links.
    pub fn out_links(&self) -> &[PeerSpec] {
        &self.out_links
    }

    // ── Frame dispatch ──────────────────────────────────────────────────

    /// React to one inbound protocol frame.
    pub fn handle_message(&mut self, message: OverlayMessage) {
        match message {
            OverlayMessage::Join { peer, tag, epoch } => self.handle_join(peer, tag, epoch),
            OverlayMessage::ForwardJoin {
                peer,
                tag,
                epoch,
                ttl,
                sender,
            } => self.handle_forward_join(peer, tag, epoch, ttl, sender),
            OverlayMessage::Neighbor {
                peer,
                tag,
                last_disconnect_id,
                target,
            } => self.handle_neighbor(peer, tag, last_disconnect_id, target),
            OverlayMessage::NeighborRequest {
                peer,
                priority,
                tag,
                disconnect_id,
                exchange,
            } => self.handle_neighbor_request(peer, priority, tag, disconnect_id, exchange),
            OverlayMessage::NeighborAccepted {
                peer,
                tag,
                last_disconnect_id,
                exchange,
            } => self.handle_neighbor_accepted(peer, tag, last_disconnect_id, exchange),
            OverlayMessage::NeighborRejected { peer, exchange } => {
                self.handle_neighbor_rejected(peer, exchange)
            }
            OverlayMessage::Disconnect {
                peer,
                disconnect_id,
            } => self.handle_disconnect(peer, disconnect_id),
            OverlayMessage::Shuffle {
                exchange,
                ttl,
                sender,
            } => self.handle_shuffle(exchange, ttl, sender),
            OverlayMessage::ShuffleReply { exchange, sender } => {
                debug!("shuffle reply from {} with {} peers", sender, exchange.len());
                self.merge_exchange(exchange);
            }
            OverlayMessage::RelayMessage {
                target,
                message,
                ttl,
            } => self.handle_relay(target, message, ttl),
            OverlayMessage::InjectPartition {
                reference,
                origin: _origin,
                ttl,
            } => self.apply_partition(reference, ttl),
            OverlayMessage::ResolvePartition { reference } => {
                self.apply_resolve_partition(reference);
            }
            OverlayMessage::ForwardMessage {
                target,
                server_ref,
                payload,
                options,
            } => self.handle_forward_message(target, server_ref, payload, options),
        }
    }

    /// React to a transport notification.
    pub fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Inbound(message) => self.handle_message(message),
            TransportEvent::DriverExited { peer } | TransportEvent::ConnectFailed { peer } => {
                self.on_link_lost(peer)
            }
        }
    }

    // ── Protocol handlers ───────────────────────────────────────────────

    fn handle_join(&mut self, peer: PeerSpec, tag: Option<Tag>, epoch: u64) {
        if peer.name == self.local.name {
            return;
        }
        if !self.ids.is_addable_epoch(epoch, &peer.name) {
            warn!("rejecting stale join from {} (epoch {})", peer, epoch);
            return;
        }
        if self.views.is_active(&peer.name) || !self.transport.is_connected(&peer.name) {
            debug!("ignoring join from {}", peer);
            return;
        }

        info!("admitting {} into the active view", peer);
        self.add_to_active(peer.clone(), tag.clone());
        self.send(
            &peer.name,
            OverlayMessage::Neighbor {
                peer: self.local.clone(),
                tag: self.config.tag.clone(),
                last_disconnect_id: self.ids.last_received(&peer.name),
                target: peer.name.clone(),
            },
        );

        // Walk the join through the rest of the active view.
        for member in self.views.active_peers() {
            if member.name == peer.name {
                continue;
            }
            self.send(
                &member.name,
                OverlayMessage::ForwardJoin {
                    peer: peer.clone(),
                    tag: tag.clone(),
                    epoch,
                    ttl: self.config.arwl,
                    sender: self.local.clone(),
                },
            );
        }
    }

    fn handle_forward_join(
        &mut self,
        peer: PeerSpec,
        tag: Option<Tag>,
        epoch: u64,
        ttl: u32,
        sender: PeerSpec,
    ) {
        if peer.name == self.local.name {
            return;
        }
        if ttl == 0 || self.views.active_is_empty() {
            self.admit_walked_joiner(peer, tag, epoch);
            return;
        }
        if ttl == self.config.prwl {
            self.views.add_to_passive(peer.clone(), &mut self.rng);
        }
        match self
            .views
            .random_active(&[sender.name.as_str(), peer.name.as_str()], &mut self.rng)
        {
            Some(next) => self.send(
                &next.name,
                OverlayMessage::ForwardJoin {
                    peer,
                    tag,
                    epoch,
                    ttl: ttl - 1,
                    sender: self.local.clone(),
                },
            ),
            None => self.admit_walked_joiner(peer, tag, epoch),
        }
    }

    /// Terminal hop of a forward-join walk: admit the joiner directly.
    ///
    /// No link to the joiner exists at this hop yet; the dial is started
    /// here and the NEIGHBOR confirmation flushes once it completes.
    fn admit_walked_joiner(&mut self, peer: PeerSpec, tag: Option<Tag>, epoch: u64) {
        if peer.name == self.local.name {
            return;
        }
        if !self.ids.is_addable_epoch(epoch, &peer.name) || self.views.is_active(&peer.name) {
            debug!("not admitting walked joiner {}", peer);
            return;
        }
        info!("forward-join walk ends here, admitting {}", peer);
        self.transport.maybe_connect(&peer);
        self.add_to_active(peer.clone(), tag);
        self.send(
            &peer.name,
            OverlayMessage::Neighbor {
                peer: self.local.clone(),
                tag: self.config.tag.clone(),
                last_disconnect_id: self.ids.last_received(&peer.name),
                target: peer.name.clone(),
            },
        );
    }

    fn handle_neighbor(
        &mut self,
        peer: PeerSpec,
        tag: Option<Tag>,
        last_disconnect_id: Option<DisconnectId>,
        _target: String,
    ) {
        if self.ids.is_addable(last_disconnect_id, &peer.name)
            && self.transport.is_connected(&peer.name)
        {
            self.add_to_active(peer, tag);
        } else {
            debug!("ignoring neighbor confirmation from {}", peer);
        }
    }

    fn handle_neighbor_request(
        &mut self,
        peer: PeerSpec,
        priority: Priority,
        tag: Option<Tag>,
        disconnect_id: Option<DisconnectId>,
        exchange: Vec<PeerSpec>,
    ) {
        let acceptable = priority == Priority::High
            || tag
                .as_deref()
                .is_some_and(|t| self.views.has_unfilled_reservation(t))
            || !self.views.is_active_full();

        if acceptable
            && self.ids.is_addable(disconnect_id, &peer.name)
            && self.transport.is_connected(&peer.name)
        {
            let reply_exchange = self.compose_exchange();
            self.send(
                &peer.name,
                OverlayMessage::NeighborAccepted {
                    peer: self.local.clone(),
                    tag: self.config.tag.clone(),
                    last_disconnect_id: self.ids.last_received(&peer.name),
                    exchange: reply_exchange,
                },
            );
            self.add_to_active(peer, tag);
        } else {
            debug!("rejecting neighbor request from {}", peer);
            let reply_exchange = self.compose_exchange();
            self.send(
                &peer.name,
                OverlayMessage::NeighborRejected {
                    peer: self.local.clone(),
                    exchange: reply_exchange,
                },
            );
        }
        self.merge_exchange(exchange);
    }

    fn handle_neighbor_accepted(
        &mut self,
        peer: PeerSpec,
        tag: Option<Tag>,
        last_disconnect_id: Option<DisconnectId>,
        exchange: Vec<PeerSpec>,
    ) {
        if self.ids.is_addable(last_disconnect_id, &peer.name) {
            info!("neighbor request accepted by {}", peer);
            self.add_to_active(peer, tag);
        }
        self.merge_exchange(exchange);
    }

    fn handle_neighbor_rejected(&mut self, peer: PeerSpec, exchange: Vec<PeerSpec>) {
        debug!("neighbor request rejected by {}", peer);
        self.transport.disconnect(&peer.name);
        self.merge_exchange(exchange);
    }

    fn handle_disconnect(&mut self, peer: PeerSpec, disconnect_id: DisconnectId) {
        if !self.ids.is_valid_disconnect(&peer.name, disconnect_id) {
            debug!("discarding stale disconnect {} from {}", disconnect_id, peer);
            return;
        }
        info!("peer {} dropped us ({})", peer, disconnect_id);
        self.views.remove_from_active(&peer.name);
        self.views.add_to_passive(peer.clone(), &mut self.rng);
        self.ids.record_received(&peer.name, disconnect_id);
        self.transport.disconnect(&peer.name);

        if self.views.active_is_empty() {
            self.promote_random_passive(&[&peer.name], Priority::High);
        }
    }

    fn handle_shuffle(&mut self, exchange: Vec<PeerSpec>, ttl: u32, sender: PeerSpec) {
        if ttl > 0 {
            if let Some(next) = self
                .views
                .random_active(&[sender.name.as_str()], &mut self.rng)
            {
                self.send(
                    &next.name,
                    OverlayMessage::Shuffle {
                        exchange,
                        ttl: ttl - 1,
                        sender,
                    },
                );
                return;
            }
        }

        // Walk over: answer the originator with a passive sample of the
        // same size, then absorb the offered peers.
        let reply = self.views.sample_passive(exchange.len(), &mut self.rng);
        self.transport.maybe_connect(&sender);
        self.send(
            &sender.name,
            OverlayMessage::ShuffleReply {
                exchange: reply,
                sender: self.local.clone(),
            },
        );
        self.merge_exchange(exchange);
    }

    fn handle_relay(&mut self, target: String, message: Box<OverlayMessage>, ttl: u32) {
        if target == self.local.name {
            self.handle_message(*message);
            return;
        }
        if let Some(member) = self.views.active_get(&target) {
            let message = self.annotate_relay_delivery(*message);
            self.send(&member.name, message);
        } else if ttl > 0 {
            self.relay_fan_out(&target, *message, ttl - 1);
        } else {
            debug!("relay ttl exhausted for {}", target);
        }
    }

    fn handle_forward_message(
        &mut self,
        target: String,
        server_ref: String,
        payload: Vec<u8>,
        options: ForwardOptions,
    ) {
        if target == self.local.name {
            self.deliver(server_ref, payload, options.transitive);
        } else {
            warn!("dropping misrouted forward_message for {}", target);
        }
    }

    // ── View maintenance ────────────────────────────────────────────────

    /// Admit a peer into the active view, evicting a random unpinned
    /// member when the view is at capacity. The evicted peer is parked in
    /// the passive view and notified with a fresh disconnect id.
    fn add_to_active(&mut self, peer: PeerSpec, tag: Option<Tag>) {
        if peer.name == self.local.name || self.views.is_active(&peer.name) {
            return;
        }
        self.views.remove_from_passive(&peer.name);

        if self.views.is_active_full() {
            match self.views.drop_random_active(&mut self.rng) {
                Some(dropped) => {
                    let disconnect_id = self.ids.next_outgoing(&dropped.name, self.epoch);
                    info!("evicting {} for {} ({})", dropped, peer, disconnect_id);
                    self.views.add_to_passive(dropped.clone(), &mut self.rng);
                    self.send(
                        &dropped.name,
                        OverlayMessage::Disconnect {
                            peer: self.local.clone(),
                            disconnect_id,
                        },
                    );
                    self.transport.disconnect(&dropped.name);
                }
                None => {
                    warn!("active view pinned full by reservations, not admitting {}", peer);
                    return;
                }
            }
        }

        self.views.insert_active(peer.clone());
        self.views.fill_reserved_slot(tag.as_deref(), &peer);
        self.epoch_store.persist(self.epoch);
    }

    /// A connection driver went away: scrub the peer and repair the
    /// active view from the passive one.
    fn on_link_lost(&mut self, peer: PeerSpec) {
        let was_active = self.views.remove_from_active(&peer.name).is_some();
        self.views.remove_from_passive(&peer.name);
        if was_active {
            info!("lost active peer {}", peer);
            self.promote_random_passive(&[&peer.name], Priority::High);
        } else {
            debug!("lost link to {}", peer);
        }
    }

    /// Ask a random passive peer to become an active neighbor.
    fn promote_random_passive(&mut self, exclude: &[&str], priority: Priority) {
        let Some(candidate) = self.views.random_passive(exclude, &mut self.rng) else {
            debug!("no passive candidate to promote");
            return;
        };
        info!("requesting neighbor {}", candidate);
        self.transport.maybe_connect(&candidate);
        let exchange = self.compose_exchange();
        self.send(
            &candidate.name,
            OverlayMessage::NeighborRequest {
                peer: self.local.clone(),
                priority,
                tag: self.config.tag.clone(),
                disconnect_id: self.ids.last_received(&candidate.name),
                exchange,
            },
        );
    }

    /// Compose a fresh exchange: the local peer first, then samples of
    /// both views. The three sources are disjoint by construction.
    fn compose_exchange(&mut self) -> Vec<PeerSpec> {
        let mut exchange = vec![self.local.clone()];
        exchange.extend(self.views.sample_active(K_ACTIVE, &mut self.rng));
        exchange.extend(self.views.sample_passive(K_PASSIVE, &mut self.rng));
        exchange
    }

    /// Absorb an exchange into the passive view, skipping the local node
    /// and current active peers.
    fn merge_exchange(&mut self, exchange: Vec<PeerSpec>) {
        for peer in exchange {
            if peer.name == self.local.name || self.views.is_active(&peer.name) {
                continue;
            }
            self.views.add_to_passive(peer, &mut self.rng);
        }
    }

    // ── Timers ──────────────────────────────────────────────────────────

    /// Periodic passive-view maintenance: shuffle a fresh exchange toward
    /// a random active peer. Skipped when the active view is empty.
    pub fn on_shuffle_tick(&mut self) {
        let exchange = self.compose_exchange();
        if let Some(peer) = self.views.random_active(&[], &mut self.rng) {
            debug!("shuffling {} peers with {}", exchange.len(), peer);
            self.send(
                &peer.name,
                OverlayMessage::Shuffle {
                    exchange,
                    ttl: self.config.arwl,
                    sender: self.local.clone(),
                },
            );
        }
    }

    /// Periodic promotion: refill a starved active view from the passive
    /// one.
    pub fn on_promotion_tick(&mut self) {
        if self.views.occupied_slots() < self.config.min_active_size {
            self.promote_random_passive(&[], Priority::High);
        }
    }

    /// Replace the cached broadcast-tree out-links.
    pub fn set_out_links(&mut self, links: Vec<PeerSpec>) {
        self.out_links = links
            .into_iter()
            .filter(|p| p.name != self.local.name)
            .collect();
    }

    // ── Relaying ────────────────────────────────────────────────────────

    /// Forward a frame toward `target` along every cached out-link.
    fn relay_fan_out(&mut self, target: &str, message: OverlayMessage, ttl: u32) {
        if self.out_links.is_empty() {
            debug!("no out-links to relay toward {}", target);
            return;
        }
        let boxed = Box::new(message);
        for link in self.out_links.clone() {
            self.send(
                &link.name,
                OverlayMessage::RelayMessage {
                    target: target.to_string(),
                    message: boxed.clone(),
                    ttl,
                },
            );
        }
    }

    /// Mark a relayed frame as transitively delivered and stamp it with
    /// the relayer's out-links.
    fn annotate_relay_delivery(&self, message: OverlayMessage) -> OverlayMessage {
        match message {
            OverlayMessage::ForwardMessage {
                target,
                server_ref,
                payload,
                mut options,
            } => {
                options.transitive = true;
                options.out_links = self.out_links.iter().map(|p| p.name.clone()).collect();
                OverlayMessage::ForwardMessage {
                    target,
                    server_ref,
                    payload,
                    options,
                }
            }
            other => other,
        }
    }

    // ── Partitions ──────────────────────────────────────────────────────

    /// Record a partition against every active peer and propagate it,
    /// with this node as the forwarding origin.
    fn apply_partition(&mut self, reference: PartitionRef, ttl: u32) {
        info!("injecting partition {} (ttl {})", reference, ttl);
        for peer in self.views.active_peers() {
            if ttl > 0 {
                self.send(
                    &peer.name,
                    OverlayMessage::InjectPartition {
                        reference,
                        origin: self.local.clone(),
                        ttl: ttl - 1,
                    },
                );
            }
            self.partitions.insert(reference, peer);
        }
    }

    fn apply_resolve_partition(&mut self, reference: PartitionRef) -> bool {
        if self.partitions.remove_reference(reference) {
            info!("resolved partition {}", reference);
            for peer in self.views.active_peers() {
                self.send(&peer.name, OverlayMessage::ResolvePartition { reference });
            }
            true
        } else {
            false
        }
    }

    // ── External API (serialized through the coordinator) ───────────────

    /// Enter the overlay through `peer`.
    pub fn api_join(&mut self, peer: PeerSpec) -> Result<()> {
        if peer.name == self.local.name {
            return Ok(());
        }
        info!("joining the overlay via {}", peer);
        self.transport.maybe_connect(&peer);
        self.send(
            &peer.name,
            OverlayMessage::Join {
                peer: self.local.clone(),
                tag: self.config.tag.clone(),
                epoch: self.epoch,
            },
        );
        Ok(())
    }

    /// Snapshot of active-view peer names.
    pub fn api_members(&self) -> Vec<String> {
        self.views.active_names()
    }

    /// Reserve an active-view slot for `tag`.
    pub fn api_reserve(&mut self, tag: &str) -> Result<()> {
        if self.views.reserve(tag) {
            Ok(())
        } else {
            Err(PeerServiceError::NoAvailableSlots)
        }
    }

    /// Send an application message over the existing link to `target`.
    pub fn api_send_message(
        &mut self,
        target: String,
        server_ref: String,
        payload: Vec<u8>,
    ) -> Result<()> {
        let frame = OverlayMessage::ForwardMessage {
            target: target.clone(),
            server_ref,
            payload,
            options: ForwardOptions::default(),
        };
        self.transport.dispatch(&target, &frame)
    }

    /// Serialized fallback for a forward whose fast-path dispatch failed:
    /// consult the views, retry over a (possibly fresh) link, and finally
    /// fan out through the broadcast tree when transitive relay is on.
    pub fn api_forward_fallback(
        &mut self,
        target: String,
        server_ref: String,
        payload: Vec<u8>,
        options: ForwardOptions,
    ) -> Result<()> {
        if self.partitions.is_partitioned(&target) {
            return Err(PeerServiceError::Partitioned(target));
        }
        let frame = OverlayMessage::ForwardMessage {
            target: target.clone(),
            server_ref,
            payload,
            options: options.clone(),
        };
        if let Some(member) = self.views.find(&target) {
            self.transport.maybe_connect(&member);
            match self.transport.dispatch(&target, &frame) {
                Ok(()) => return Ok(()),
                Err(e) => debug!("direct forward to {} failed: {}", target, e),
            }
        }
        if self.config.broadcast && options.transitive {
            self.relay_fan_out(&target, frame, self.config.relay_ttl);
            return Ok(());
        }
        Err(PeerServiceError::NotYetConnected(target))
    }

    /// Inject a partition at `origin`, locally or by asking the origin to
    /// initiate. Returns the fresh partition handle.
    pub fn api_inject_partition(&mut self, origin: PeerSpec, ttl: u32) -> Result<PartitionRef> {
        let reference = PartitionTable::fresh_reference(&mut self.rng);
        if origin.name == self.local.name {
            self.apply_partition(reference, ttl);
        } else {
            self.transport.maybe_connect(&origin);
            self.send(
                &origin.name,
                OverlayMessage::InjectPartition {
                    reference,
                    origin: origin.clone(),
                    ttl,
                },
            );
        }
        Ok(reference)
    }

    /// Lift an injected partition and propagate the resolution.
    pub fn api_resolve_partition(&mut self, reference: PartitionRef) -> Result<()> {
        self.apply_resolve_partition(reference);
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// Best-effort dispatch; failures are logged and absorbed.
    fn send(&self, to: &str, message: OverlayMessage) {
        let kind = message.kind();
        if let Err(e) = self.transport.dispatch(to, &message) {
            debug!("dropping {} to {}: {}", kind, to, e);
        }
    }

    /// Hand an application payload up the delivery channel.
    fn deliver(&self, server_ref: String, payload: Vec<u8>, transitive: bool) {
        let delivery = Delivery {
            server_ref,
            payload,
            transitive,
        };
        if self.delivery.try_send(delivery).is_err() {
            warn!("application delivery channel full or closed");
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
