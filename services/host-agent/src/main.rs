//! vmfwd Host Agent
//!
//! Keeps the host-side port forwards of one VM in line with what the guest
//! is listening on.
//!
//! ## Architecture
//!
//! - **Observer**: Polls the guest agent for listening sockets
//! - **Reconciliation Loop**: Diffs observations against confirmed forwards
//! - **Tunnel Actor**: Applies forwards over the SSH control connection,
//!   serving vsock relays itself when the guest can be dialed
//! - **Status Loop**: Reports instance health periodically

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vmfwd_host_agent::actors::{Supervisor, TunnelActor, TunnelConfig};
use vmfwd_host_agent::channel::{AgentRelayGuest, RelayChannel, SshMuxChannel};
use vmfwd_host_agent::config::Config;
use vmfwd_host_agent::forwards::ForwardsFile;
use vmfwd_host_agent::observer::{GuestPortObserver, JsonLinesGuestAgent, ObserverTask};
use vmfwd_host_agent::reconciler::{LoopConfig, ReconciliationLoop};
use vmfwd_host_agent::status;
use vmfwd_host_agent::transport::select_transport;
use vmfwd_host_agent::vsock::{host_probe, VsockPortAllocator};
use vmfwd_reconcile::{DesiredStateStore, Reconciler, ReconcilerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        instance = %config.instance,
        destination = %config.ssh.destination,
        data_dir = %config.data_dir.display(),
        transport = ?config.transport,
        "Starting vmfwd host agent"
    );

    let store = match &config.forwards_file {
        Some(path) => ForwardsFile::load(path)
            .and_then(ForwardsFile::into_store)
            .with_context(|| format!("failed to load forwards file {}", path.display()))?,
        None => DesiredStateStore::empty(),
    };
    info!(
        pinned = store.pinned().len(),
        rules = store.rules().len(),
        "Desired state loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut supervisor = Supervisor::new(shutdown_rx.clone());

    let tunnel_config = TunnelConfig {
        instance: config.instance.clone(),
        max_retries: config.tuning.max_retries,
        backoff: config.tuning.backoff(),
        reestablish_limit: config.tuning.reestablish_limit,
        reestablish_window: config.tuning.reestablish_window,
    };
    let channel = SshMuxChannel::new(config.ssh.clone());

    // relays are served only when the guest can be dialed and ports can be claimed
    let relays = if select_transport(config.transport, true).uses_relays() {
        relay_resources(&config)
    } else {
        None
    };
    let tunnel = match relays {
        Some((cid, allocator)) => {
            let transport = select_transport(config.transport, true);
            info!(transport = transport.name(), guest_cid = cid, "Vsock relays enabled");
            let guest = AgentRelayGuest::new(JsonLinesGuestAgent::new(config.guest_agent.clone()), cid);
            TunnelActor::new(
                tunnel_config,
                RelayChannel::new(channel, guest),
                transport,
                Some(allocator),
            )
            .spawn(&mut supervisor)
        }
        None => {
            let transport = select_transport(config.transport, false);
            info!(transport = transport.name(), "Forwarding over the control connection only");
            TunnelActor::new(tunnel_config, channel, transport, None).spawn(&mut supervisor)
        }
    };

    // a single slot keeps observations from piling up behind a slow pass
    let (observation_tx, observation_rx) = mpsc::channel(1);
    let observer = GuestPortObserver::new(JsonLinesGuestAgent::new(config.guest_agent.clone()));
    let observer_handle = ObserverTask::new(observer, config.tuning.tick_interval, config.tuning.poll_timeout)
        .spawn(observation_tx, shutdown_rx.clone());

    let reconciler = Reconciler::new(ReconcilerConfig {
        grace_ticks: config.tuning.grace_ticks,
    });
    let reconciliation_loop = ReconciliationLoop::new(
        config.instance.clone(),
        reconciler,
        Arc::new(store),
        tunnel.clone(),
        LoopConfig {
            health_check_interval: config.tuning.health_check_interval,
            unreachable_after: config.tuning.grace_ticks,
        },
    );
    let health_rx = reconciliation_loop.subscribe_health();
    let reconciler_handle = tokio::spawn(reconciliation_loop.run(observation_rx, shutdown_rx.clone()));

    let status_handle = tokio::spawn(status::run_status_loop(
        config.instance.clone(),
        config.tuning.status_interval,
        health_rx,
        tunnel.subscribe(),
        shutdown_rx.clone(),
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = status_handle => {
            match result {
                Ok(Ok(())) => info!("Status loop exited normally"),
                Ok(Err(e)) => error!(error = %e, "Status loop error"),
                Err(e) => error!(error = %e, "Status task panicked"),
            }
        }
        _ = reconciler_handle => {
            info!("Reconciliation loop exited");
        }
        _ = observer_handle => {
            warn!("Guest observer exited");
        }
    }

    let _ = shutdown_tx.send(true);

    info!(actors = supervisor.running_count(), "Waiting for actors to shut down...");
    supervisor.stop_all().await;

    info!("Host agent shutdown complete");
    Ok(())
}

/// Guest context id and port allocator, or `None` when relays cannot be served.
fn relay_resources(config: &Config) -> Option<(u32, Arc<VsockPortAllocator>)> {
    if !cfg!(target_os = "linux") {
        warn!("Vsock relays need a linux host, relayed forwards are disabled");
        return None;
    }
    let Some(cid) = config.guest_cid else {
        warn!("VMFWD_GUEST_CID is not set, relayed forwards are disabled");
        return None;
    };
    match VsockPortAllocator::new(
        &config.vsock_claims_dir,
        config.vsock_port_min,
        config.vsock_port_max,
        config.vsock_probe_attempts,
        host_probe(),
    ) {
        Ok(allocator) => Some((cid, Arc::new(allocator))),
        Err(e) => {
            warn!(error = %e, "Vsock allocator unavailable, relayed forwards are disabled");
            None
        }
    }
}
