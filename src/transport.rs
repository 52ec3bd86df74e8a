//! TCP transport and connection registry for the overlay.
//!
//! Every frame on the wire is length-prefixed:
//!
//! ```text
//! [4 bytes: payload length (u32-le)] [N bytes: bincode payload]
//! ```
//!
//! A connection opens with a single framed [`PeerSpec`] preamble written by
//! the dialer, identifying it to the acceptor; after that both directions
//! carry [`OverlayMessage`] frames.
//!
//! [`PeerConnections`] keeps one registered link per peer name. Dialing
//! registers the link immediately with a bounded outbound buffer, so frames
//! dispatched while the dial is in flight flush once it completes. Each
//! link is driven by a reader task and a writer task; when a reader exits
//! unexpectedly the registry entry is pruned and a
//! [`TransportEvent::DriverExited`] is posted to the coordinator queue.
//! Links closed deliberately through [`Transport::disconnect`] exit
//! silently.

use {
    crate::{
        config::PeerServiceConfig,
        error::{PeerServiceError, Result},
        message::{Delivery, OverlayMessage, PeerSpec},
    },
    log::{debug, error, info, warn},
    std::{
        collections::HashMap,
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc, Mutex, Weak,
        },
    },
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{
            tcp::{OwnedReadHalf, OwnedWriteHalf},
            TcpListener, TcpStream,
        },
        sync::mpsc,
    },
};

/// Upper bound on the identification preamble; peer specs are tiny.
const PREAMBLE_MAX: usize = 4_096;

/// Asynchronous notifications from connection drivers to the coordinator.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded frame arrived from a peer.
    Inbound(OverlayMessage),
    /// A registered connection's driver exited unexpectedly; the registry
    /// entry has already been pruned.
    DriverExited {
        /// The peer the driver was serving.
        peer: PeerSpec,
    },
    /// An outbound dial failed before the link was established; buffered
    /// frames were dropped.
    ConnectFailed {
        /// The peer that could not be reached.
        peer: PeerSpec,
    },
}

/// Observable transport operations the protocol consumes.
pub trait Transport: Send + Sync {
    /// Idempotent connect attempt; registers the link and dials in the
    /// background. Observably a no-op when a link already exists or the
    /// dial later fails.
    fn maybe_connect(&self, peer: &PeerSpec);

    /// Queue a frame on the link to `to`. Succeeds while a dial is still
    /// in flight (the frame is buffered).
    fn dispatch(&self, to: &str, message: &OverlayMessage) -> Result<()>;

    /// Whether an established link to `name` exists.
    fn is_connected(&self, name: &str) -> bool;

    /// Drop the link to `name`, flushing frames already queued. The
    /// driver's subsequent exit is silent.
    fn disconnect(&self, name: &str);

    /// Drop every link; used at shutdown.
    fn close_all(&self);

    /// Names of peers with an established link.
    fn connected_names(&self) -> Vec<String>;
}

/// A registered link to one peer.
struct Entry {
    tx: mpsc::Sender<OverlayMessage>,
    established: Arc<AtomicBool>,
    conn_id: u64,
}

/// TCP-backed connection registry.
pub struct PeerConnections {
    local: PeerSpec,
    registry: Mutex<HashMap<String, Entry>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    delivery: mpsc::Sender<Delivery>,
    weak: Weak<PeerConnections>,
    next_conn_id: AtomicU64,
    max_message_size: usize,
    channel_buffer: usize,
    disable_fast_receive: bool,
}

impl PeerConnections {
    /// Bind the overlay listener and start accepting connections.
    ///
    /// The returned local identity carries the actually-bound address,
    /// which matters when the config requested an ephemeral port.
    pub async fn bind(
        config: &PeerServiceConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
        delivery: mpsc::Sender<Delivery>,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("overlay transport listening on {}", local_addr);

        let this = Arc::new_cyclic(|weak| Self {
            local: PeerSpec::new(config.name.clone(), local_addr),
            registry: Mutex::new(HashMap::new()),
            events,
            delivery,
            weak: weak.clone(),
            next_conn_id: AtomicU64::new(1),
            max_message_size: config.max_message_size,
            channel_buffer: config.channel_buffer_size,
            disable_fast_receive: config.disable_fast_receive,
        });

        tokio::spawn(Arc::clone(&this).run_acceptor(listener));
        Ok(this)
    }

    /// The local identity with the bound listener address.
    pub fn local(&self) -> &PeerSpec {
        &self.local
    }

    fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.registry.lock().expect("connection registry lock poisoned")
    }

    /// Remove the entry for `name` if it still belongs to `conn_id`.
    fn remove_if_current(&self, name: &str, conn_id: u64) -> bool {
        let mut registry = self.lock_registry();
        if registry.get(name).map(|e| e.conn_id) == Some(conn_id) {
            registry.remove(name);
            true
        } else {
            false
        }
    }

    // ── Connection drivers ──────────────────────────────────────────────

    async fn run_acceptor(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("accepted overlay connection from {}", addr);
                    tokio::spawn(Arc::clone(&self).run_inbound(stream, addr));
                }
                Err(e) => {
                    error!("accept error: {}", e);
                }
            }
        }
    }

    async fn run_inbound(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let (mut read, write) = stream.into_split();
        let peer = match read_preamble(&mut read).await {
            Ok(peer) => peer,
            Err(e) => {
                debug!("bad preamble from {}: {}", addr, e);
                return;
            }
        };
        if peer.name == self.local.name {
            warn!("rejecting connection claiming local identity from {}", addr);
            return;
        }

        let conn_id = self.next_conn_id();
        let mut keep_write = None;
        {
            let mut registry = self.lock_registry();
            if registry.contains_key(&peer.name) {
                // A link to this peer already exists (simultaneous dial).
                // Keep reading on the duplicate but leave the registry
                // alone; holding the write half keeps the socket open.
                keep_write = Some(write);
            } else {
                let (tx, rx) = mpsc::channel(self.channel_buffer);
                registry.insert(
                    peer.name.clone(),
                    Entry {
                        tx,
                        established: Arc::new(AtomicBool::new(true)),
                        conn_id,
                    },
                );
                tokio::spawn(run_writer(rx, write, self.max_message_size));
            }
        }
        self.run_reader(peer, conn_id, read, keep_write).await;
    }

    async fn run_dialer(
        self: Arc<Self>,
        peer: PeerSpec,
        conn_id: u64,
        rx: mpsc::Receiver<OverlayMessage>,
        established: Arc<AtomicBool>,
    ) {
        let stream = match TcpStream::connect(peer.addr).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("dial to {} failed: {}", peer, e);
                // Only report the failure if this dial still owned the
                // registry entry; a live inbound link may have taken over.
                if self.remove_if_current(&peer.name, conn_id) {
                    let _ = self.events.send(TransportEvent::ConnectFailed { peer });
                }
                return;
            }
        };
        let (read, mut write) = stream.into_split();

        let preamble = match frame_preamble(&self.local) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("cannot encode local identity: {}", e);
                self.remove_if_current(&peer.name, conn_id);
                return;
            }
        };
        if let Err(e) = write.write_all(&preamble).await {
            debug!("preamble write to {} failed: {}", peer, e);
            if self.remove_if_current(&peer.name, conn_id) {
                let _ = self.events.send(TransportEvent::ConnectFailed { peer });
            }
            return;
        }

        established.store(true, Ordering::Release);
        debug!("established link to {}", peer);
        tokio::spawn(run_writer(rx, write, self.max_message_size));
        self.run_reader(peer, conn_id, read, None).await;
    }

    /// Read frames until EOF or error, then prune the registry entry if
    /// this connection still owns it.
    async fn run_reader(
        self: Arc<Self>,
        peer: PeerSpec,
        conn_id: u64,
        mut read: OwnedReadHalf,
        _keep_write: Option<OwnedWriteHalf>,
    ) {
        let mut header = [0u8; 4];
        loop {
            if let Err(e) = read.read_exact(&mut header).await {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    debug!("header read error from {}: {}", peer, e);
                }
                break;
            }

            let len = OverlayMessage::read_frame_len(&header);
            if len > self.max_message_size {
                warn!(
                    "peer {} sent oversized frame ({} > {}), dropping connection",
                    peer, len, self.max_message_size
                );
                break;
            }

            let mut payload = vec![0u8; len];
            if let Err(e) = read.read_exact(&mut payload).await {
                debug!("payload read error from {}: {}", peer, e);
                break;
            }

            match OverlayMessage::deserialize(&payload) {
                Ok(message) => {
                    debug!("received {} from {}", message.kind(), peer);
                    if self.fast_receive(&message).await {
                        continue;
                    }
                    if self.events.send(TransportEvent::Inbound(message)).is_err() {
                        // Coordinator gone — shut down gracefully.
                        break;
                    }
                }
                Err(e) => {
                    // Skip the frame but keep the connection alive; the
                    // peer may be running a slightly different version.
                    warn!("undecodable frame from {}: {}", peer, e);
                }
            }
        }

        if self.remove_if_current(&peer.name, conn_id) {
            debug!("connection driver for {} exited", peer);
            let _ = self.events.send(TransportEvent::DriverExited { peer });
        }
    }

    /// Deliver a `forward_message` addressed to this node straight to the
    /// application, bypassing the coordinator. Returns whether the frame
    /// was consumed.
    async fn fast_receive(&self, message: &OverlayMessage) -> bool {
        if self.disable_fast_receive {
            return false;
        }
        if let OverlayMessage::ForwardMessage {
            target,
            server_ref,
            payload,
            options,
        } = message
        {
            if *target == self.local.name {
                let delivery = Delivery {
                    server_ref: server_ref.clone(),
                    payload: payload.clone(),
                    transitive: options.transitive,
                };
                if self.delivery.send(delivery).await.is_err() {
                    warn!("application delivery channel closed");
                }
                return true;
            }
        }
        false
    }
}

impl Transport for PeerConnections {
    fn maybe_connect(&self, peer: &PeerSpec) {
        if peer.name == self.local.name {
            return;
        }
        let (conn_id, rx, established) = {
            let mut registry = self.lock_registry();
            if registry.contains_key(&peer.name) {
                return;
            }
            let (tx, rx) = mpsc::channel(self.channel_buffer);
            let established = Arc::new(AtomicBool::new(false));
            let conn_id = self.next_conn_id();
            registry.insert(
                peer.name.clone(),
                Entry {
                    tx,
                    established: Arc::clone(&established),
                    conn_id,
                },
            );
            (conn_id, rx, established)
        };
        debug!("dialing {}", peer);
        if let Some(this) = self.weak.upgrade() {
            tokio::spawn(this.run_dialer(peer.clone(), conn_id, rx, established));
        }
    }

    fn dispatch(&self, to: &str, message: &OverlayMessage) -> Result<()> {
        let registry = self.lock_registry();
        let entry = registry
            .get(to)
            .ok_or_else(|| PeerServiceError::NotYetConnected(to.to_string()))?;
        debug!("dispatching {} to {}", message.kind(), to);
        entry.tx.try_send(message.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                PeerServiceError::SendBufferFull(to.to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                PeerServiceError::Disconnected(to.to_string())
            }
        })
    }

    fn is_connected(&self, name: &str) -> bool {
        self.lock_registry()
            .get(name)
            .is_some_and(|e| e.established.load(Ordering::Acquire))
    }

    fn disconnect(&self, name: &str) {
        if self.lock_registry().remove(name).is_some() {
            debug!("closed link to {}", name);
        }
    }

    fn close_all(&self) {
        let mut registry = self.lock_registry();
        let count = registry.len();
        registry.clear();
        if count > 0 {
            info!("closed {} overlay links", count);
        }
    }

    fn connected_names(&self) -> Vec<String> {
        self.lock_registry()
            .iter()
            .filter(|(_, e)| e.established.load(Ordering::Acquire))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

// ── Framing helpers ─────────────────────────────────────────────────────────

fn frame_preamble(local: &PeerSpec) -> Result<Vec<u8>> {
    let payload = bincode::serialize(local)?;
    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(4usize.saturating_add(payload.len()));
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

async fn read_preamble(read: &mut OwnedReadHalf) -> Result<PeerSpec> {
    let mut header = [0u8; 4];
    read.read_exact(&mut header).await?;
    let len = u32::from_le_bytes(header) as usize;
    if len > PREAMBLE_MAX {
        return Err(PeerServiceError::MessageTooLarge {
            size: len,
            max: PREAMBLE_MAX,
        });
    }
    let mut payload = vec![0u8; len];
    read.read_exact(&mut payload).await?;
    bincode::deserialize(&payload).map_err(PeerServiceError::Serialization)
}

async fn run_writer(
    mut rx: mpsc::Receiver<OverlayMessage>,
    mut write: OwnedWriteHalf,
    max_message_size: usize,
) {
    while let Some(message) = rx.recv().await {
        let frame = match message.serialize_framed(max_message_size) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping outbound {}: {}", message.kind(), e);
                continue;
            }
        };
        if let Err(e) = write.write_all(&frame).await {
            debug!("write error: {}", e);
            break;
        }
    }
    let _ = write.flush().await;
}

// ── Test double ─────────────────────────────────────────────────────────────

#[cfg(any(test, feature = "dev-context-only-utils"))]
pub mod testing {
    //! In-memory transport recording dispatched frames, for protocol
    //! tests that need deterministic connectivity.

    use {
        super::Transport,
        crate::{
            error::{PeerServiceError, Result},
            message::{OverlayMessage, PeerSpec},
        },
        std::{
            collections::HashSet,
            sync::{Arc, Mutex},
        },
    };

    /// Records every `maybe_connect` and `dispatch`; connectivity is
    /// simulated instead of dialed.
    pub struct MemoryTransport {
        local_name: String,
        auto_connect: bool,
        connected: Mutex<HashSet<String>>,
        dialed: Mutex<Vec<String>>,
        sent: Mutex<Vec<(String, OverlayMessage)>>,
    }

    impl MemoryTransport {
        /// With `auto_connect`, `maybe_connect` establishes the link
        /// immediately (as if every dial succeeded instantly).
        pub fn new(local_name: impl Into<String>, auto_connect: bool) -> Arc<Self> {
            Arc::new(Self {
                local_name: local_name.into(),
                auto_connect,
                connected: Mutex::new(HashSet::new()),
                dialed: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
            })
        }

        /// Mark a link established, as if a peer had dialed in.
        pub fn mark_connected(&self, name: &str) {
            self.connected.lock().unwrap().insert(name.to_string());
        }

        /// Every `(recipient, frame)` dispatched so far, oldest first.
        pub fn sent_frames(&self) -> Vec<(String, OverlayMessage)> {
            self.sent.lock().unwrap().clone()
        }

        /// Drain the recorded frames.
        pub fn take_sent(&self) -> Vec<(String, OverlayMessage)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        /// Frames dispatched to one recipient.
        pub fn sent_to(&self, name: &str) -> Vec<OverlayMessage> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(to, _)| to == name)
                .map(|(_, m)| m.clone())
                .collect()
        }

        /// Names passed to `maybe_connect`, in order.
        pub fn dialed(&self) -> Vec<String> {
            self.dialed.lock().unwrap().clone()
        }
    }

    impl Transport for MemoryTransport {
        fn maybe_connect(&self, peer: &PeerSpec) {
            if peer.name == self.local_name {
                return;
            }
            self.dialed.lock().unwrap().push(peer.name.clone());
            if self.auto_connect {
                self.connected.lock().unwrap().insert(peer.name.clone());
            }
        }

        fn dispatch(&self, to: &str, message: &OverlayMessage) -> Result<()> {
            if !self.connected.lock().unwrap().contains(to) {
                return Err(PeerServiceError::NotYetConnected(to.to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), message.clone()));
            Ok(())
        }

        fn is_connected(&self, name: &str) -> bool {
            self.connected.lock().unwrap().contains(name)
        }

        fn disconnect(&self, name: &str) {
            self.connected.lock().unwrap().remove(name);
        }

        fn close_all(&self) {
            self.connected.lock().unwrap().clear();
        }

        fn connected_names(&self) -> Vec<String> {
            self.connected.lock().unwrap().iter().cloned().collect()
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::time::Duration,
        tokio::time::timeout,
    };

    async fn bind_node(
        name: &str,
    ) -> (
        Arc<PeerConnections>,
        mpsc::UnboundedReceiver<TransportEvent>,
        mpsc::Receiver<Delivery>,
    ) {
        let config = PeerServiceConfig::dev_default(name);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (delivery_tx, delivery_rx) = mpsc::channel(16);
        let transport = PeerConnections::bind(&config, events_tx, delivery_tx)
            .await
            .unwrap();
        (transport, events_rx, delivery_rx)
    }

    #[tokio::test]
    async fn test_dial_dispatch_deliver() {
        let (a, _a_events, _a_del) = bind_node("a").await;
        let (b, mut b_events, _b_del) = bind_node("b").await;

        a.maybe_connect(b.local());
        let frame = OverlayMessage::Join {
            peer: a.local().clone(),
            tag: None,
            epoch: 1,
        };
        // Buffered while the dial is in flight.
        a.dispatch("b", &frame).unwrap();

        let event = timeout(Duration::from_secs(2), b_events.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("events channel closed");
        match event {
            TransportEvent::Inbound(received) => assert_eq!(received, frame),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(a.is_connected("b"));
        assert!(b.is_connected("a"));
    }

    #[tokio::test]
    async fn test_remote_close_emits_driver_exited() {
        let (a, _a_events, _a_del) = bind_node("a").await;
        let (b, mut b_events, _b_del) = bind_node("b").await;

        a.maybe_connect(b.local());
        a.dispatch(
            "b",
            &OverlayMessage::Join {
                peer: a.local().clone(),
                tag: None,
                epoch: 1,
            },
        )
        .unwrap();
        // Wait until b has registered the inbound link.
        let _ = timeout(Duration::from_secs(2), b_events.recv()).await.unwrap();

        a.disconnect("b");
        let event = timeout(Duration::from_secs(2), b_events.recv())
            .await
            .expect("timed out waiting for driver exit")
            .expect("events channel closed");
        match event {
            TransportEvent::DriverExited { peer } => assert_eq!(peer.name, "a"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!b.is_connected("a"));
    }

    #[tokio::test]
    async fn test_failed_dial_reports_connect_failed() {
        let (a, mut a_events, _a_del) = bind_node("a").await;

        // Bind then immediately drop a listener to get a port with
        // nothing accepting on it.
        let dead_addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let ghost = PeerSpec::new("ghost", dead_addr);
        a.maybe_connect(&ghost);

        let event = timeout(Duration::from_secs(5), a_events.recv())
            .await
            .expect("timed out waiting for connect failure")
            .expect("events channel closed");
        match event {
            TransportEvent::ConnectFailed { peer } => assert_eq!(peer.name, "ghost"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!a.is_connected("ghost"));
    }
}
