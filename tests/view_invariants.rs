//! Property-based tests for membership-view invariants.
//!
//! Properties tested, over arbitrary protocol-event sequences:
//! 1. The active view never exceeds its cap, counting unfilled
//!    reservations as occupied.
//! 2. The passive view never exceeds its cap.
//! 3. The views stay disjoint.
//! 4. The local node never appears in either view.
//! 5. Sent disconnect ids are monotonically non-decreasing per peer.
//! 6. A stale disconnect leaves the views and the received-id book
//!    unchanged.

use {
    hyparview_net::{
        config::PeerServiceConfig,
        epoch::EpochStore,
        handlers::ProtocolState,
        message::{Delivery, DisconnectId, OverlayMessage, PeerSpec, Priority},
        partition::PartitionTable,
        transport::{testing::MemoryTransport, Transport, TransportEvent},
    },
    proptest::prelude::*,
    std::{collections::HashMap, sync::Arc},
    tokio::sync::mpsc,
};

const MAX_ACTIVE: usize = 4;
const MAX_PASSIVE: usize = 5;
const UNIVERSE: usize = 8;

fn peer(i: u8) -> PeerSpec {
    let i = i as usize % UNIVERSE;
    PeerSpec::new(format!("p{i}"), "127.0.0.1:9000".parse().unwrap())
}

fn peer_names() -> Vec<String> {
    (0..UNIVERSE).map(|i| format!("p{i}")).collect()
}

struct Harness {
    state: ProtocolState,
    transport: Arc<MemoryTransport>,
    // Held open so deliveries are not dropped on the floor mid-run.
    _delivery_rx: mpsc::Receiver<Delivery>,
}

fn harness() -> Harness {
    let mut config = PeerServiceConfig::dev_default("self");
    config.max_active_size = MAX_ACTIVE;
    config.max_passive_size = MAX_PASSIVE;
    config.reservations = vec!["storage".into()];
    let transport = MemoryTransport::new("self", true);
    let dyn_transport: Arc<dyn Transport> = transport.clone() as Arc<dyn Transport>;
    let (delivery_tx, delivery_rx) = mpsc::channel(64);
    let local = PeerSpec::new("self", "127.0.0.1:9000".parse().unwrap());
    let state = ProtocolState::new(
        config,
        local,
        1,
        EpochStore::open(None),
        PartitionTable::new(),
        dyn_transport,
        delivery_tx,
    )
    .unwrap()
    .with_rng_seed(7);
    Harness {
        state,
        transport,
        _delivery_rx: delivery_rx,
    }
}

#[derive(Debug, Clone)]
enum Op {
    Join { peer: u8, epoch: u64 },
    ForwardJoin { peer: u8, ttl: u32, sender: u8 },
    NeighborRequest { peer: u8, high: bool },
    Disconnect { peer: u8, epoch: u64, counter: u64 },
    ShuffleReply { peers: Vec<u8> },
    DriverExit { peer: u8 },
    PromotionTick,
    ShuffleTick,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<u8>(), 0u64..4).prop_map(|(peer, epoch)| Op::Join { peer, epoch }),
        (any::<u8>(), 0u32..7, any::<u8>())
            .prop_map(|(peer, ttl, sender)| Op::ForwardJoin { peer, ttl, sender }),
        (any::<u8>(), any::<bool>()).prop_map(|(peer, high)| Op::NeighborRequest { peer, high }),
        (any::<u8>(), 0u64..4, 0u64..6)
            .prop_map(|(peer, epoch, counter)| Op::Disconnect { peer, epoch, counter }),
        proptest::collection::vec(any::<u8>(), 0..4).prop_map(|peers| Op::ShuffleReply { peers }),
        any::<u8>().prop_map(|peer| Op::DriverExit { peer }),
        Just(Op::PromotionTick),
        Just(Op::ShuffleTick),
    ]
}

fn apply(h: &mut Harness, op: Op) {
    match op {
        Op::Join { peer: i, epoch } => {
            let p = peer(i);
            h.transport.mark_connected(&p.name);
            h.state.handle_message(OverlayMessage::Join {
                peer: p,
                tag: None,
                epoch,
            });
        }
        Op::ForwardJoin {
            peer: i,
            ttl,
            sender,
        } => {
            h.state.handle_message(OverlayMessage::ForwardJoin {
                peer: peer(i),
                tag: Some("storage".into()),
                epoch: 1,
                ttl,
                sender: peer(sender),
            });
        }
        Op::NeighborRequest { peer: i, high } => {
            let p = peer(i);
            h.transport.mark_connected(&p.name);
            h.state.handle_message(OverlayMessage::NeighborRequest {
                peer: p,
                priority: if high { Priority::High } else { Priority::Low },
                tag: None,
                disconnect_id: None,
                exchange: vec![peer(i.wrapping_add(1))],
            });
        }
        Op::Disconnect {
            peer: i,
            epoch,
            counter,
        } => {
            h.state.handle_message(OverlayMessage::Disconnect {
                peer: peer(i),
                disconnect_id: DisconnectId::new(epoch, counter),
            });
        }
        Op::ShuffleReply { peers } => {
            h.state.handle_message(OverlayMessage::ShuffleReply {
                exchange: peers.into_iter().map(peer).collect(),
                sender: peer(0),
            });
        }
        Op::DriverExit { peer: i } => {
            h.state
                .on_transport_event(TransportEvent::DriverExited { peer: peer(i) });
        }
        Op::PromotionTick => h.state.on_promotion_tick(),
        Op::ShuffleTick => h.state.on_shuffle_tick(),
    }
}

fn check_invariants(
    h: &Harness,
    sent_history: &mut HashMap<String, DisconnectId>,
) -> Result<(), TestCaseError> {
    let views = h.state.views();
    prop_assert!(
        views.occupied_slots() <= MAX_ACTIVE,
        "active view over capacity: {} live + {} reserved",
        views.active_len(),
        views.unfilled_reserved()
    );
    prop_assert!(views.passive_len() <= MAX_PASSIVE);

    let active = views.active_names();
    let passive = views.passive_names();
    for name in &active {
        prop_assert!(!passive.contains(name), "{name} in both views");
    }
    prop_assert!(!active.contains(&"self".to_string()));
    prop_assert!(!passive.contains(&"self".to_string()));

    for name in peer_names() {
        if let Some(id) = h.state.ids().last_sent(&name) {
            if let Some(previous) = sent_history.get(&name) {
                prop_assert!(id >= *previous, "sent id for {name} went backwards");
            }
            sent_history.insert(name, id);
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn invariants_hold_under_protocol_churn(
        ops in proptest::collection::vec(op_strategy(), 1..64)
    ) {
        let mut h = harness();
        let mut sent_history = HashMap::new();
        for op in ops {
            apply(&mut h, op);
            check_invariants(&h, &mut sent_history)?;
        }
    }

    #[test]
    fn stale_disconnect_is_a_noop(
        newer_counter in 1u64..8,
        older_counter in 0u64..8,
    ) {
        prop_assume!(older_counter < newer_counter);
        let mut h = harness();

        // Establish b as an active peer, then disconnect it.
        apply(&mut h, Op::Join { peer: 1, epoch: 1 });
        h.state.handle_message(OverlayMessage::Disconnect {
            peer: peer(1),
            disconnect_id: DisconnectId::new(2, newer_counter),
        });

        let active_before = {
            let mut v = h.state.views().active_names();
            v.sort();
            v
        };
        let passive_before = {
            let mut v = h.state.views().passive_names();
            v.sort();
            v
        };
        let received_before = h.state.ids().last_received("p1");

        // The reordered, older disconnect must change nothing.
        h.state.handle_message(OverlayMessage::Disconnect {
            peer: peer(1),
            disconnect_id: DisconnectId::new(2, older_counter),
        });

        let mut active_after = h.state.views().active_names();
        active_after.sort();
        let mut passive_after = h.state.views().passive_names();
        passive_after.sort();
        prop_assert_eq!(active_before, active_after);
        prop_assert_eq!(passive_before, passive_after);
        prop_assert_eq!(received_before, h.state.ids().last_received("p1"));
        prop_assert_eq!(
            h.state.ids().last_received("p1"),
            Some(DisconnectId::new(2, newer_counter))
        );
    }
}
