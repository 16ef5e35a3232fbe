// End-to-end scenario tests against `LoopbackTransport`, run in-process
// with real threads so the blocking request/response and multi-node
// timing actually exercise the concurrency model, not just the
// single-threaded unit logic covered in each component's own module.

use std::sync::Arc;
use std::thread;

use crate::config::ControllerSettings;
use crate::election;
use crate::message::{JoinSettings, Payload};
use crate::node::ControllerNode;
use crate::test_support::LoopbackNetwork;
use crate::types::{ChunkMarker, NodeDefinition, NodeType};
use test_log::test;

fn addr(port: u16) -> NodeDefinition {
    NodeDefinition::new("127.0.0.1", port)
}

fn settings_for(self_addr: &NodeDefinition, controllers: &[NodeDefinition]) -> ControllerSettings {
    ControllerSettings {
        connection_string: controllers
            .iter()
            .map(|c| c.connection_name())
            .collect::<Vec<_>>()
            .join(","),
        node_name: self_addr.hostname.clone(),
        port: self_addr.port,
        log_level: "info".to_string(),
        max_chunk_item_count: 1000,
        redundant_nodes_per_location: 1,
        web_interface_port: 0,
    }
}

fn spawn_controller(network: &Arc<LoopbackNetwork>, self_addr: NodeDefinition, controllers: Vec<NodeDefinition>) -> Arc<ControllerNode> {
    let transport = network.create_transport(self_addr.clone());
    let settings = settings_for(&self_addr, &controllers);
    let node = ControllerNode::new(self_addr, controllers, settings, transport);
    node.install_callbacks();
    node
}

#[test]
fn scenario_1_sole_controller_becomes_primary_without_voting() {
    let network = LoopbackNetwork::new();
    let a = addr(5100);
    let node_a = spawn_controller(&network, a.clone(), vec![a.clone()]);
    node_a.startup_join().unwrap();
    assert!(node_a.is_primary());
}

#[test]
fn scenario_2_three_controller_election_picks_exactly_one_primary() {
    let network = LoopbackNetwork::new();
    let a = addr(5100);
    let b = addr(5101);
    let c = addr(5102);
    let controllers = vec![a.clone(), b.clone(), c.clone()];

    let node_a = spawn_controller(&network, a.clone(), controllers.clone());
    let node_b = spawn_controller(&network, b.clone(), controllers.clone());
    let node_c = spawn_controller(&network, c.clone(), controllers.clone());

    // Startup join concurrently, as three independently-started processes would.
    let handles: Vec<_> = [&node_a, &node_b, &node_c]
        .into_iter()
        .map(|n| {
            let n = Arc::clone(n);
            thread::spawn(move || n.startup_join().unwrap())
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    // Nobody is primary yet (join alone never elects); simulate the
    // reconciler's election kick on all three at once.
    let handles: Vec<_> = [&node_a, &node_b, &node_c]
        .into_iter()
        .map(|n| {
            let n = Arc::clone(n);
            thread::spawn(move || election::initiate_voting(&n))
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let primaries: Vec<NodeDefinition> = [&node_a, &node_b, &node_c]
        .into_iter()
        .filter_map(|n| n.primary())
        .collect();
    assert!(!primaries.is_empty(), "someone must have a primary set");
    assert!(
        primaries.windows(2).all(|w| w[0] == w[1]),
        "every replica must agree on the same primary: {primaries:?}"
    );
    let winners = [&node_a, &node_b, &node_c].into_iter().filter(|n| n.is_primary()).count();
    assert_eq!(winners, 1, "exactly one replica should consider itself primary");
}

#[test]
fn scenario_3_primary_loss_with_quorum_elects_a_new_primary() {
    let network = LoopbackNetwork::new();
    let a = addr(5200);
    let b = addr(5201);
    let c = addr(5202);
    let controllers = vec![a.clone(), b.clone(), c.clone()];

    let node_a = spawn_controller(&network, a.clone(), controllers.clone());
    let node_b = spawn_controller(&network, b.clone(), controllers.clone());
    let node_c = spawn_controller(&network, c.clone(), controllers.clone());
    for n in [&node_a, &node_b, &node_c] {
        n.startup_join().unwrap();
    }
    node_a.set_primary(a.clone());
    node_b.set_primary(a.clone());
    node_c.set_primary(a.clone());

    network.sever(&a, &b);
    network.sever(&a, &c);

    // B and C should have cleared A as primary via the connection-lost callback.
    assert!(node_b.primary().is_none());
    assert!(node_c.primary().is_none());

    // A reconciler tick on B and C (A is gone, quorum is still 2-of-3).
    let won_b = election::initiate_voting(&node_b);
    let won_c = election::initiate_voting(&node_c);
    assert!(won_b || won_c, "one of the surviving replicas must win");
    assert_ne!(won_b, won_c);
}

#[test]
fn scenario_4_loss_of_quorum_clears_the_isolated_replicas_primary() {
    let network = LoopbackNetwork::new();
    let a = addr(5300);
    let b = addr(5301);
    let c = addr(5302);
    let controllers = vec![a.clone(), b.clone(), c.clone()];

    let node_a = spawn_controller(&network, a.clone(), controllers.clone());
    let node_b = spawn_controller(&network, b.clone(), controllers.clone());
    let node_c = spawn_controller(&network, c.clone(), controllers.clone());
    for n in [&node_a, &node_b, &node_c] {
        n.startup_join().unwrap();
    }
    node_a.set_primary(a.clone());

    // Partition A from both other controllers.
    network.sever(&a, &b);
    network.sever(&a, &c);

    assert!(node_a.primary().is_none(), "A must clear its own primary once quorum is lost");
    assert!(!election::initiate_voting(&node_a), "A alone can never reach quorum again");
}

#[test]
fn scenario_5_storage_join_bootstraps_the_chunk_map() {
    let network = LoopbackNetwork::new();
    let a = addr(5400);
    let controllers = vec![a.clone()];
    let node_a = spawn_controller(&network, a.clone(), controllers.clone());
    node_a.startup_join().unwrap();
    assert!(node_a.is_primary());
    assert!(node_a.chunk_map.is_empty());

    let storage_addr = addr(6400);
    let storage = network.create_transport(storage_addr.clone());
    let ack_sender = Arc::clone(&storage);
    storage.on_message_received(Box::new(move |_from, env| {
        if matches!(env.payload, Payload::DatabaseCreate) {
            let _ = ack_sender.send_reply(&env, Payload::Acknowledgement, false);
        }
    }));

    let join_settings = settings_for(&storage_addr, &controllers);
    let payload = Payload::JoinAttempt {
        node_type: NodeType::Storage,
        name: storage_addr.hostname.clone(),
        port: storage_addr.port,
        settings: JoinSettings {
            connection_string: join_settings.connection_string.clone(),
            max_chunk_item_count: join_settings.max_chunk_item_count,
            redundant_nodes_per_location: join_settings.redundant_nodes_per_location,
        },
        is_primary_claim: false,
    };
    let handle = storage.send_message(&a, payload, true).unwrap();
    let outcome = handle.block_until_done();
    assert!(outcome.success);
    let response = outcome.response.unwrap();
    match response.payload {
        Payload::JoinSuccess {
            max_chunk_item_count, ..
        } => {
            assert_eq!(max_chunk_item_count, Some(1000));
            let _ = storage.send_reply(&response, Payload::Acknowledgement, false);
        }
        other => panic!("expected JoinSuccess, got {other:?}"),
    }

    // The controller processes the join handshake's tail (and bootstraps
    // the chunk map) on its own worker thread; give it a moment to land.
    for _ in 0..200 {
        if !node_a.chunk_map.is_empty() {
            break;
        }
        thread::sleep(std::time::Duration::from_millis(10));
    }
    let chunks = node_a.chunk_map.snapshot();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].start, ChunkMarker::Start);
    assert_eq!(chunks[0].end, ChunkMarker::End);
    assert_eq!(chunks[0].owner, storage_addr);
}

#[test]
fn scenario_6_split_then_merge_round_trips_the_chunk_map() {
    let network = LoopbackNetwork::new();
    let a = addr(5500);
    let controllers = vec![a.clone()];
    let node_a = spawn_controller(&network, a.clone(), controllers);
    node_a.startup_join().unwrap();

    let owner = addr(6500);
    node_a.chunk_map.install(owner.clone());

    let mid = ChunkMarker::Value("m".to_string());
    node_a
        .chunk_map
        .apply_split(ChunkMarker::Start, mid.clone(), mid.clone(), ChunkMarker::End, owner.clone());
    let after_split = node_a.chunk_map.snapshot();
    assert_eq!(after_split.len(), 2);
    assert!(node_a.chunk_map.check_invariants().is_ok());

    node_a.chunk_map.apply_merge(ChunkMarker::Start, ChunkMarker::End, owner.clone());
    let after_merge = node_a.chunk_map.snapshot();
    assert_eq!(after_merge.len(), 1);
    assert_eq!(after_merge[0].start, ChunkMarker::Start);
    assert_eq!(after_merge[0].end, ChunkMarker::End);
    assert_eq!(after_merge[0].owner, owner);
}
