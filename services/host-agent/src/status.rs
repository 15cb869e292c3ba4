//! Status reporting for the instance's forwarding health.
//!
//! The reporter logs:
//! - A periodic summary of instance health and control-connection status
//! - Every health change as soon as it is published
//!
//! Repeatedly unhealthy summaries escalate from `warn` to `error`.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};
use vmfwd_reconcile::InstanceHealth;

use crate::actors::{shutdown_signalled, ConnectionStatus};

/// Unhealthy summaries logged at `warn` before escalating.
const WARN_THRESHOLD: u32 = 3;

/// Run the status loop until shutdown.
pub async fn run_status_loop(
    instance: String,
    interval: Duration,
    mut health: watch::Receiver<InstanceHealth>,
    connection: watch::Receiver<ConnectionStatus>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(
        instance = %instance,
        interval_secs = interval.as_secs(),
        "Starting status loop"
    );

    let mut consecutive_unhealthy = 0u32;
    let mut interval_timer = tokio::time::interval(interval);
    let mut health_open = true;

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                let current = *health.borrow();
                let link = *connection.borrow();

                if current.is_healthy() {
                    consecutive_unhealthy = 0;
                    info!(
                        instance = %instance,
                        state = current.label(),
                        connection = %link,
                        "Instance status"
                    );
                } else {
                    consecutive_unhealthy += 1;
                    if consecutive_unhealthy <= WARN_THRESHOLD {
                        warn!(
                            instance = %instance,
                            state = current.label(),
                            health = %current,
                            connection = %link,
                            consecutive_unhealthy,
                            "Instance status"
                        );
                    } else {
                        error!(
                            instance = %instance,
                            state = current.label(),
                            health = %current,
                            connection = %link,
                            consecutive_unhealthy,
                            "Instance persistently unhealthy"
                        );
                    }
                }
            }
            changed = health.changed(), if health_open => {
                if changed.is_err() {
                    // reconciliation loop is gone; keep reporting the last value
                    health_open = false;
                    continue;
                }
                let current = *health.borrow_and_update();
                info!(instance = %instance, state = current.label(), health = %current, "Health changed");
            }
            _ = shutdown_signalled(&mut shutdown) => {
                info!(instance = %instance, "Status loop shutting down");
                break;
            }
        }
    }

    Ok(())
}
