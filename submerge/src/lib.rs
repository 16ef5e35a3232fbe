// Process bootstrap (§4.8 "Startup sequence"): load settings, stand up
// the TCP transport and the controller node, join the cluster, and
// keep the reconciler running until shutdown. `bin.rs` is a thin argv
// wrapper around `run`.

use std::path::Path;
use std::sync::Arc;
use std::thread;

use tracing_subscriber::EnvFilter;

use submerge_base::Error;
use submerge_ctrl::{ControllerNode, ControllerSettings};
use submerge_net::TcpTransport;

/// Installs the process-wide tracing subscriber at the level named in
/// `settings`, unless `RUST_LOG` is already set (the env filter always
/// wins, matching how every other crate in this workspace expects to
/// be run during development).
fn init_tracing(settings: &ControllerSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Loads `config_path`, brings up this replica, and blocks until a
/// shutdown signal (Ctrl-C) arrives. Returns on clean shutdown; a
/// rejected join during startup, or `self` being absent from the
/// configured controller set, is fatal and returned as an error
/// (§7.1 "Exit codes" treats this as a misconfiguration, not something
/// to retry).
pub fn run(config_path: &Path) -> Result<(), Error> {
    let settings = ControllerSettings::from_xml_file(config_path)?;
    init_tracing(&settings);

    let self_addr = settings.self_node();
    let controllers = settings.controllers()?;
    let transport = TcpTransport::bind(self_addr.clone(), ("0.0.0.0", settings.port))?;

    let node = ControllerNode::new(self_addr, controllers, settings, transport);
    node.install_callbacks();
    node.startup_join()?;

    let reconciler_node = Arc::clone(&node);
    let reconciler = thread::spawn(move || submerge_ctrl::reconciler::run(reconciler_node));

    let shutdown_node = Arc::clone(&node);
    ctrlc::set_handler(move || {
        tracing::info!("shutdown signal received");
        shutdown_node.shutdown();
    })
    .map_err(|e| submerge_base::err(format!("installing signal handler: {e}")))?;

    reconciler.join().map_err(|_| submerge_base::err("reconciler thread panicked"))?;
    Ok(())
}
