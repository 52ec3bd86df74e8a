//! The peer service coordinator and its public handle.
//!
//! [`PeerServiceManager::spawn`] starts a dedicated event-loop task that
//! owns the [`ProtocolState`] exclusively. External API calls, inbound
//! frames, transport notifications, and timer ticks all funnel into that
//! loop and are processed one at a time, so no handler ever observes
//! another handler's half-applied mutation.
//!
//! ```text
//!  ┌────────────────────────────────────────────────────┐
//!  │                 coordinator task                   │
//!  │                                                    │
//!  │   api requests ──┐                                 │
//!  │   transport ─────┼──▶ one event at a time ──▶      │
//!  │   timer ticks ───┘        ProtocolState            │
//!  │                              │                     │
//!  │                              ▼                     │
//!  │                    PeerConnections (dispatch)      │
//!  └────────────────────────────────────────────────────┘
//! ```
//!
//! The cloneable [`PeerServiceHandle`] is the application-facing API. Its
//! `forward_message` fast path consults the shared partition snapshot and
//! the connection registry directly, entering the coordinator only when
//! the direct dispatch fails.

use {
    crate::{
        config::PeerServiceConfig,
        epoch::EpochStore,
        error::{PeerServiceError, Result},
        handlers::ProtocolState,
        message::{Delivery, ForwardOptions, OverlayMessage, PartitionRef, PeerSpec, Tag},
        partition::PartitionTable,
        relay::{self, BroadcastTree},
        transport::{PeerConnections, Transport, TransportEvent},
    },
    log::{info, warn},
    std::{sync::Arc, time::Duration},
    tokio::{
        sync::{mpsc, oneshot},
        time::{interval, MissedTickBehavior},
    },
};

/// External API calls serialized into the coordinator queue.
enum ApiRequest {
    Join {
        peer: PeerSpec,
        reply: oneshot::Sender<Result<()>>,
    },
    Members {
        reply: oneshot::Sender<Vec<String>>,
    },
    Reserve {
        tag: Tag,
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        target: String,
        server_ref: String,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    ForwardFallback {
        target: String,
        server_ref: String,
        payload: Vec<u8>,
        options: ForwardOptions,
        reply: oneshot::Sender<Result<()>>,
    },
    InjectPartition {
        origin: PeerSpec,
        ttl: u32,
        reply: oneshot::Sender<Result<PartitionRef>>,
    },
    ResolvePartition {
        reference: PartitionRef,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Periodic maintenance ticks.
#[derive(Debug, Clone, Copy)]
enum TimerTick {
    Shuffle,
    Promotion,
    TreeRefresh,
}

/// Starts and names the coordinator task.
pub struct PeerServiceManager;

impl PeerServiceManager {
    /// Bind the transport, load the epoch, and start the coordinator.
    ///
    /// `delivery` receives every application message addressed to this
    /// node. `broadcast_tree` supplies relay out-links and is only
    /// consulted when `config.broadcast` is set.
    pub async fn spawn(
        config: PeerServiceConfig,
        broadcast_tree: Option<Arc<dyn BroadcastTree>>,
        delivery: mpsc::Sender<Delivery>,
    ) -> Result<PeerServiceHandle> {
        config.validate()?;

        let epoch_store = EpochStore::open(config.data_dir.as_deref());
        let epoch = epoch_store.bump();

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = PeerConnections::bind(&config, transport_tx, delivery.clone()).await?;
        let local = transport.local().clone();
        info!("peer service starting as {} (epoch {})", local, epoch);

        let partitions = PartitionTable::new();
        let dyn_transport: Arc<dyn Transport> = transport.clone() as Arc<dyn Transport>;
        let state = ProtocolState::new(
            config.clone(),
            local.clone(),
            epoch,
            epoch_store,
            partitions.clone(),
            dyn_transport,
            delivery,
        )?;

        let (api_tx, api_rx) = mpsc::channel(config.channel_buffer_size);
        let (tick_tx, tick_rx) = mpsc::channel(8);

        spawn_timer(
            tick_tx.clone(),
            Duration::from_millis(config.passive_view_shuffle_period_ms),
            TimerTick::Shuffle,
        );
        if config.random_promotion {
            spawn_timer(
                tick_tx.clone(),
                Duration::from_millis(config.random_promotion_period_ms),
                TimerTick::Promotion,
            );
        }
        if config.broadcast {
            spawn_timer(
                tick_tx,
                Duration::from_millis(config.tree_refresh_period_ms),
                TimerTick::TreeRefresh,
            );
        }

        let loop_transport = Arc::clone(&transport);
        tokio::spawn(run_coordinator(
            state,
            config.out_link_timeout_ms,
            broadcast_tree,
            loop_transport,
            api_rx,
            transport_rx,
            tick_rx,
        ));

        Ok(PeerServiceHandle {
            local,
            api: api_tx,
            partitions,
            transport,
        })
    }
}

/// One event at a time: the single suspension point is the queue dequeue.
async fn run_coordinator(
    mut state: ProtocolState,
    out_link_timeout_ms: u64,
    broadcast_tree: Option<Arc<dyn BroadcastTree>>,
    transport: Arc<PeerConnections>,
    mut api_rx: mpsc::Receiver<ApiRequest>,
    mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    mut tick_rx: mpsc::Receiver<TimerTick>,
) {
    loop {
        tokio::select! {
            request = api_rx.recv() => {
                match request {
                    None => break,
                    Some(ApiRequest::Shutdown { reply }) => {
                        transport.close_all();
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => handle_api_request(&mut state, request),
                }
            }
            Some(event) = transport_rx.recv() => {
                state.on_transport_event(event);
            }
            Some(tick) = tick_rx.recv() => match tick {
                TimerTick::Shuffle => state.on_shuffle_tick(),
                TimerTick::Promotion => state.on_promotion_tick(),
                TimerTick::TreeRefresh => {
                    if let Some(tree) = &broadcast_tree {
                        let links =
                            relay::query_out_links(Arc::clone(tree), out_link_timeout_ms).await;
                        state.set_out_links(links);
                    }
                }
            },
        }
    }
    info!("peer service {} stopped", state.local());
}

fn handle_api_request(state: &mut ProtocolState, request: ApiRequest) {
    match request {
        ApiRequest::Join { peer, reply } => {
            let _ = reply.send(state.api_join(peer));
        }
        ApiRequest::Members { reply } => {
            let _ = reply.send(state.api_members());
        }
        ApiRequest::Reserve { tag, reply } => {
            let _ = reply.send(state.api_reserve(&tag));
        }
        ApiRequest::Send {
            target,
            server_ref,
            payload,
            reply,
        } => {
            let _ = reply.send(state.api_send_message(target, server_ref, payload));
        }
        ApiRequest::ForwardFallback {
            target,
            server_ref,
            payload,
            options,
            reply,
        } => {
            let _ = reply.send(state.api_forward_fallback(target, server_ref, payload, options));
        }
        ApiRequest::InjectPartition { origin, ttl, reply } => {
            let _ = reply.send(state.api_inject_partition(origin, ttl));
        }
        ApiRequest::ResolvePartition { reference, reply } => {
            let _ = reply.send(state.api_resolve_partition(reference));
        }
        ApiRequest::Shutdown { .. } => unreachable!("handled in the event loop"),
    }
}

fn spawn_timer(tx: mpsc::Sender<TimerTick>, period: Duration, tick: TimerTick) {
    tokio::spawn(async move {
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately.
        timer.tick().await;
        loop {
            timer.tick().await;
            if tx.send(tick).await.is_err() {
                break;
            }
        }
    });
}

/// Cloneable application-facing handle to a running peer service.
#[derive(Clone)]
pub struct PeerServiceHandle {
    local: PeerSpec,
    api: mpsc::Sender<ApiRequest>,
    partitions: PartitionTable,
    transport: Arc<PeerConnections>,
}

impl PeerServiceHandle {
    /// The local identity, carrying the actually-bound listener address.
    pub fn local_peer(&self) -> &PeerSpec {
        &self.local
    }

    /// Enter the overlay through `peer`. Always succeeds at the API
    /// level; connection and admission proceed asynchronously.
    pub async fn join(&self, peer: PeerSpec) -> Result<()> {
        self.call(|reply| ApiRequest::Join { peer, reply }).await?
    }

    /// Leaving the overlay is deliberately unsupported; peers age out of
    /// remote views through the failure paths instead.
    pub fn leave(&self, _peer: &str) -> Result<()> {
        Err(PeerServiceError::NotImplemented("leave"))
    }

    /// Synchronous join is deliberately unsupported.
    pub fn sync_join(&self, _peer: &PeerSpec) -> Result<()> {
        Err(PeerServiceError::NotImplemented("sync_join"))
    }

    /// Membership-up subscriptions are deliberately unsupported.
    pub fn on_up(&self, _name: &str) -> Result<()> {
        Err(PeerServiceError::NotImplemented("on_up"))
    }

    /// Membership-down subscriptions are deliberately unsupported.
    pub fn on_down(&self, _name: &str) -> Result<()> {
        Err(PeerServiceError::NotImplemented("on_down"))
    }

    /// Direct member-list manipulation is deliberately unsupported.
    pub fn update_members(&self, _members: &[PeerSpec]) -> Result<()> {
        Err(PeerServiceError::NotImplemented("update_members"))
    }

    /// Snapshot of active-view peer names.
    pub async fn members(&self) -> Result<Vec<String>> {
        self.call(|reply| ApiRequest::Members { reply }).await
    }

    /// Reserve an active-view slot for peers bearing `tag`.
    pub async fn reserve(&self, tag: impl Into<Tag>) -> Result<()> {
        self.call(|reply| ApiRequest::Reserve {
            tag: tag.into(),
            reply,
        })
        .await?
    }

    /// Send an application message over the existing link to `target`.
    pub async fn send_message(
        &self,
        target: impl Into<String>,
        server_ref: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<()> {
        self.call(|reply| ApiRequest::Send {
            target: target.into(),
            server_ref: server_ref.into(),
            payload,
            reply,
        })
        .await?
    }

    /// Forward an application message to `target`.
    ///
    /// Fast path: if the target is not behind an injected partition and a
    /// link exists, the frame is dispatched without entering the
    /// coordinator. Otherwise the serialized fallback consults the views
    /// and, when enabled, the broadcast tree.
    pub async fn forward_message(
        &self,
        target: impl Into<String>,
        server_ref: impl Into<String>,
        payload: Vec<u8>,
        options: ForwardOptions,
    ) -> Result<()> {
        let target = target.into();
        let server_ref = server_ref.into();
        if self.partitions.is_partitioned(&target) {
            return Err(PeerServiceError::Partitioned(target));
        }

        let frame = OverlayMessage::ForwardMessage {
            target: target.clone(),
            server_ref: server_ref.clone(),
            payload: payload.clone(),
            options: options.clone(),
        };
        if self.transport.dispatch(&target, &frame).is_ok() {
            return Ok(());
        }

        self.call(|reply| ApiRequest::ForwardFallback {
            target,
            server_ref,
            payload,
            options,
            reply,
        })
        .await?
    }

    /// Inject a test partition at `origin`, returning its handle.
    pub async fn inject_partition(&self, origin: PeerSpec, ttl: u32) -> Result<PartitionRef> {
        self.call(|reply| ApiRequest::InjectPartition { origin, ttl, reply })
            .await?
    }

    /// Lift an injected partition.
    pub async fn resolve_partition(&self, reference: PartitionRef) -> Result<()> {
        self.call(|reply| ApiRequest::ResolvePartition { reference, reply })
            .await?
    }

    /// Current injected-partition entries as `(reference, peer name)`.
    pub fn partitions(&self) -> Vec<(PartitionRef, String)> {
        self.partitions.entries()
    }

    /// Names of peers with an established link.
    pub fn connections(&self) -> Vec<String> {
        self.transport.connected_names()
    }

    /// Close every link and stop the coordinator.
    pub async fn shutdown(&self) -> Result<()> {
        match self.call(|reply| ApiRequest::Shutdown { reply }).await {
            Ok(()) => Ok(()),
            // The coordinator was already gone; that is a clean shutdown.
            Err(PeerServiceError::ChannelClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn call<T>(&self, request: impl FnOnce(oneshot::Sender<T>) -> ApiRequest) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.api.send(request(reply_tx)).await.is_err() {
            warn!("peer service coordinator is gone");
            return Err(PeerServiceError::ChannelClosed);
        }
        reply_rx.await.map_err(|_| PeerServiceError::ChannelClosed)
    }
}
