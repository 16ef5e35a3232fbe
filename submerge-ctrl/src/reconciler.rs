// Reconciler Loop (C5): the single periodic background task that
// reconnects missing controller peers and kicks off an election
// whenever the replica has no primary.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::election;
use crate::node::{ConnectError, ControllerNode};

const JITTER_RANGE_SECS: std::ops::RangeInclusive<u64> = 30..=120;
/// How finely shutdown is polled while sleeping between ticks; keeps
/// the cooperative-cancellation latency bounded (§5 "Cancellation").
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Runs until `node.is_running()` goes false. Intended to be spawned on
/// its own thread right after startup join completes.
pub fn run(node: Arc<ControllerNode>) {
    loop {
        if !sleep_for_jittered_interval(&node) {
            return;
        }
        if !node.is_running() {
            return;
        }
        tick(&node);
    }
}

/// Sleeps for a fresh random delay in `[30s, 120s]`, polling the
/// running flag frequently enough to exit promptly on shutdown.
/// Returns `false` if shutdown was observed mid-sleep.
fn sleep_for_jittered_interval(node: &Arc<ControllerNode>) -> bool {
    let delay = Duration::from_secs(rand::thread_rng().gen_range(JITTER_RANGE_SECS));
    let mut elapsed = Duration::ZERO;
    while elapsed < delay {
        if !node.is_running() {
            return false;
        }
        let step = SHUTDOWN_POLL_INTERVAL.min(delay - elapsed);
        std::thread::sleep(step);
        elapsed += step;
    }
    node.is_running()
}

fn tick(node: &Arc<ControllerNode>) {
    for peer in node.controllers.iter().filter(|c| **c != node.self_addr) {
        if node.has_peer(peer) {
            continue;
        }
        match node.connect_to_controller(peer) {
            Ok(()) => {}
            Err(ConnectError::Fatal(reason)) => {
                error!(peer = %peer, reason, "controller rejected join, this replica is misconfigured");
                node.shutdown();
                std::process::exit(1);
            }
            Err(ConnectError::Timeout) => {
                warn!(peer = %peer, "reconnect attempt timed out, will retry next tick");
            }
        }
    }

    if node.primary().is_none() {
        election::initiate_voting(node);
    }
}
