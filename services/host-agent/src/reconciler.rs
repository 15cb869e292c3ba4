//! Reconciliation loop for converging forwards.
//!
//! The loop:
//! - Applies each guest observation as one reconciliation pass
//! - Checks the control connection periodically and re-establishes it
//! - Publishes instance health after every change
//!
//! It exclusively owns the forward table; the tunnel actor only ever sees
//! individual add and remove requests.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use vmfwd_reconcile::{
    Action, Conflict, ConflictKind, DesiredStateStore, ForwardKey, ForwardPhase, ForwardRule, ForwardTable,
    InstanceHealth, PortSpec, Reconciler, DEFAULT_GRACE_TICKS,
};

use crate::actors::{shutdown_signalled, ConnectionStatus, TunnelError, TunnelHandle};
use crate::observer::Observation;

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Interval between control-connection checks.
    pub health_check_interval: Duration,

    /// Consecutive failed polls tolerated before the guest agent is reported
    /// unreachable.
    pub unreachable_after: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(10),
            unreachable_after: DEFAULT_GRACE_TICKS,
        }
    }
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub added: usize,
    pub removed: usize,
    pub failed: usize,
    pub conflicts: usize,
    /// The connection was replaced during the pass.
    pub connection_reset: bool,
    /// The pass stopped early.
    pub interrupted: bool,
}

/// Drives one instance's forwards toward the desired state.
pub struct ReconciliationLoop {
    instance: String,
    reconciler: Reconciler,
    store: Arc<DesiredStateStore>,
    tunnel: TunnelHandle,
    table: ForwardTable,
    config: LoopConfig,
    health_tx: watch::Sender<InstanceHealth>,
    /// Keys rejected by a conflict on the previous pass.
    rejected: BTreeSet<ForwardKey>,
    failed_polls: u32,
}

impl ReconciliationLoop {
    /// Create a new loop.
    pub fn new(
        instance: impl Into<String>,
        reconciler: Reconciler,
        store: Arc<DesiredStateStore>,
        tunnel: TunnelHandle,
        config: LoopConfig,
    ) -> Self {
        let (health_tx, _) = watch::channel(InstanceHealth::Healthy);
        Self {
            instance: instance.into(),
            reconciler,
            store,
            tunnel,
            table: ForwardTable::new(),
            config,
            health_tx,
            rejected: BTreeSet::new(),
            failed_polls: 0,
        }
    }

    pub fn table(&self) -> &ForwardTable {
        &self.table
    }

    pub fn health(&self) -> InstanceHealth {
        *self.health_tx.borrow()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<InstanceHealth> {
        self.health_tx.subscribe()
    }

    /// Run until shutdown or until the observer goes away.
    pub async fn run(mut self, mut observations: mpsc::Receiver<Observation>, mut shutdown: watch::Receiver<bool>) {
        info!(
            instance = %self.instance,
            grace_ticks = self.reconciler.grace_ticks(),
            health_check_interval_secs = self.config.health_check_interval.as_secs(),
            pinned = self.store.pinned().len(),
            rules = self.store.rules().len(),
            "Starting reconciliation loop"
        );

        let mut health_check_interval = tokio::time::interval(self.config.health_check_interval);

        loop {
            tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => {
                    info!(instance = %self.instance, "Reconciliation loop shutting down");
                    break;
                }
                observation = observations.recv() => {
                    let Some(observation) = observation else {
                        info!(instance = %self.instance, "Observer stopped, ending reconciliation loop");
                        break;
                    };
                    self.run_pass(observation).await;
                }
                _ = health_check_interval.tick() => {
                    self.check_connection().await;
                }
            }
        }
    }

    /// Apply one observation.
    pub async fn run_pass(&mut self, observation: Observation) -> PassSummary {
        if let Some(error) = &observation.error {
            self.failed_polls += 1;
            debug!(instance = %self.instance, failed_polls = self.failed_polls, error = %error, "Applying stale snapshot");
        } else {
            self.failed_polls = 0;
        }

        let plan = self
            .reconciler
            .plan(&observation.snapshot, &self.store, &mut self.table);

        let mut summary = PassSummary {
            conflicts: plan.conflicts.len(),
            ..PassSummary::default()
        };
        self.report_conflicts(&plan.conflicts);

        for action in plan.actions {
            let keep_going = match action {
                Action::Remove { key, spec } => self.apply_remove(key, spec, &mut summary).await,
                Action::Add(rule) => self.apply_add(rule, &mut summary).await,
            };
            if !keep_going {
                summary.interrupted = true;
                break;
            }
        }

        if summary != PassSummary::default() {
            debug!(
                instance = %self.instance,
                added = summary.added,
                removed = summary.removed,
                failed = summary.failed,
                conflicts = summary.conflicts,
                connection_reset = summary.connection_reset,
                interrupted = summary.interrupted,
                "Reconciliation pass complete"
            );
        }

        self.publish_health();
        summary
    }

    /// Check the control connection and re-establish it if it is down.
    ///
    /// Returns whether the connection is usable afterwards.
    pub async fn check_connection(&mut self) -> bool {
        if self.tunnel.check_alive().await {
            self.publish_health();
            return true;
        }

        warn!(instance = %self.instance, "Control connection check failed, re-establishing");
        let result = self.tunnel.reestablish().await;
        let requeued = self.table.mark_all_pending();

        let usable = match result {
            Ok(()) => {
                info!(instance = %self.instance, requeued, "Forwards queued for re-add on new connection");
                true
            }
            Err(TunnelError::Cancelled | TunnelError::Stopped) => false,
            Err(e) if e.is_connection_lost() => {
                warn!(instance = %self.instance, error = %e, "Control connection still unavailable");
                false
            }
            Err(e) => {
                debug!(instance = %self.instance, error = %e, "Re-establish failed");
                false
            }
        };

        self.publish_health();
        usable
    }

    /// Returns false when the rest of the pass should be skipped.
    async fn apply_add(&mut self, rule: ForwardRule, summary: &mut PassSummary) -> bool {
        let key = rule.key();
        if self.table.phase(&key) == Some(ForwardPhase::PendingRemoval) {
            debug!(instance = %self.instance, forward = %rule.spec, "Previous definition still being removed");
            return true;
        }

        self.table.begin_add(rule.clone());
        match self.tunnel.add_forward(rule.clone()).await {
            Ok(()) => {
                self.table.confirm_add(&key);
                summary.added += 1;
                info!(
                    instance = %self.instance,
                    forward = %rule.spec,
                    origin = rule.origin.as_str(),
                    "Forward active"
                );
                true
            }
            Err(TunnelError::Transient(detail)) => {
                summary.failed += 1;
                warn!(instance = %self.instance, forward = %rule.spec, error = %detail, "Forward add failed, will retry");
                self.table.fail_add(&key, false, detail);
                true
            }
            Err(TunnelError::Rejected(detail)) => {
                summary.failed += 1;
                warn!(instance = %self.instance, forward = %rule.spec, error = %detail, "Forward rejected");
                self.table.fail_add(&key, true, detail);
                true
            }
            Err(e) => self.handle_connection_error(e, summary),
        }
    }

    async fn apply_remove(&mut self, key: ForwardKey, spec: PortSpec, summary: &mut PassSummary) -> bool {
        match self.tunnel.remove_forward(key.clone()).await {
            Ok(()) => {
                self.table.confirm_remove(&key);
                summary.removed += 1;
                info!(instance = %self.instance, forward = %spec, "Forward removed");
                true
            }
            Err(TunnelError::Transient(detail)) => {
                warn!(instance = %self.instance, forward = %spec, error = %detail, "Forward removal failed, will retry");
                true
            }
            Err(TunnelError::Rejected(detail)) => {
                // nothing left to cancel on the remote side
                warn!(instance = %self.instance, forward = %spec, error = %detail, "Forward cancel rejected, dropping it");
                self.table.confirm_remove(&key);
                summary.removed += 1;
                true
            }
            Err(e) => self.handle_connection_error(e, summary),
        }
    }

    fn handle_connection_error(&mut self, error: TunnelError, summary: &mut PassSummary) -> bool {
        match error {
            TunnelError::ConnectionReset => {
                let requeued = self.table.mark_all_pending();
                summary.connection_reset = true;
                info!(instance = %self.instance, requeued, "Control connection was replaced, forwards requeued");
                true
            }
            TunnelError::ConnectionDown(_) | TunnelError::Unavailable(_) => {
                self.table.mark_all_pending();
                error!(instance = %self.instance, error = %error, "Control connection lost, pass abandoned");
                false
            }
            TunnelError::Cancelled | TunnelError::Stopped => {
                debug!(instance = %self.instance, error = %error, "Pass interrupted");
                false
            }
            TunnelError::Transient(_) | TunnelError::Rejected(_) => true,
        }
    }

    /// Log each conflict once when it appears, then quietly while it persists.
    fn report_conflicts(&mut self, conflicts: &[Conflict]) {
        let mut current = BTreeSet::new();

        for conflict in conflicts {
            let key = conflict.rejected.key();
            let (reason, other) = match &conflict.kind {
                ConflictKind::DuplicateHostEndpoint { winner } => ("duplicate host endpoint", winner),
                ConflictKind::HostEndpointOccupied { holder } => ("host endpoint still occupied", holder),
            };
            if self.rejected.contains(&key) {
                debug!(instance = %self.instance, forward = %conflict.rejected.spec, other = %other, reason, "Forward still conflicting");
            } else {
                warn!(instance = %self.instance, forward = %conflict.rejected.spec, other = %other, reason, "Forward conflicts with another forward");
            }
            current.insert(key);
        }

        for cleared in self.rejected.difference(&current) {
            info!(instance = %self.instance, forward = %cleared, "Conflict cleared");
        }
        self.rejected = current;
    }

    fn publish_health(&mut self) {
        let connection_available = self.tunnel.status() != ConnectionStatus::Unavailable;
        let guest_unreachable = self.failed_polls > self.config.unreachable_after;
        let health = InstanceHealth::evaluate(connection_available, guest_unreachable, self.table.failed_rule_count());

        let previous = self.health_tx.send_replace(health);
        if previous != health {
            if health.is_healthy() {
                info!(instance = %self.instance, health = %health, "Instance health changed");
            } else {
                warn!(instance = %self.instance, health = %health, previous = %previous, "Instance health changed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_config_default() {
        let config = LoopConfig::default();
        assert_eq!(config.health_check_interval, Duration::from_secs(10));
        assert_eq!(config.unreachable_after, 2);
    }

    #[test]
    fn test_pass_summary_default_is_quiet() {
        let summary = PassSummary::default();
        assert!(!summary.connection_reset);
        assert!(!summary.interrupted);
        assert_eq!(summary.added + summary.removed + summary.failed, 0);
    }
}
