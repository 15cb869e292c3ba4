//! Tunnel actor - sole owner of the control connection.
//!
//! Every forward mutation for an instance goes through this actor, one
//! message at a time, so no two mutations ever race on the connection.
//! The actor also owns the vsock relay ports held for its forwards.
//!
//! ## Failure handling
//!
//! ```text
//! transient    -> retry with backoff, then TunnelError::Transient
//! fatal-rule   -> TunnelError::Rejected, relay port released
//! fatal-global -> re-establish, then TunnelError::ConnectionReset
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};
use vmfwd_reconcile::{
    ForwardKey, ForwardRule, PortSpec, RetryTracker, DEFAULT_MAX_RETRIES, DEFAULT_REESTABLISH_LIMIT,
    DEFAULT_REESTABLISH_WINDOW,
};

use super::framework::{Actor, ActorContext, ActorError, ActorHandle, BackoffPolicy, Supervisor};
use crate::channel::{ChannelError, ControlChannel, FailureClass, ForwardTuple};
use crate::transport::TransportCapability;
use crate::vsock::{VsockAllocation, VsockPortAllocator};

/// Mailbox size for the tunnel actor.
const MAILBOX_SIZE: usize = 64;

// =============================================================================
// Messages
// =============================================================================

/// Messages handled by TunnelActor.
#[derive(Debug)]
pub enum TunnelMessage {
    AddForward {
        rule: ForwardRule,
        reply: oneshot::Sender<Result<(), TunnelError>>,
    },

    RemoveForward {
        key: ForwardKey,
        reply: oneshot::Sender<Result<(), TunnelError>>,
    },

    CheckAlive {
        reply: oneshot::Sender<bool>,
    },

    Reestablish {
        reply: oneshot::Sender<Result<(), TunnelError>>,
    },
}

/// Outcome of a tunnel request that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    /// Retries exhausted; worth trying again next tick.
    #[error("transient failure: {0}")]
    Transient(String),

    /// This forward cannot be installed as defined.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The connection was replaced; every forward on it is gone.
    #[error("control connection re-established, remote forwards were dropped")]
    ConnectionReset,

    /// The connection is down and re-establishing it failed.
    #[error("control connection down: {0}")]
    ConnectionDown(String),

    /// Re-establishing keeps failing.
    #[error("control connection unavailable: {0}")]
    Unavailable(String),

    #[error("cancelled")]
    Cancelled,

    #[error("tunnel controller stopped")]
    Stopped,
}

impl TunnelError {
    /// Whether the connection itself is gone.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionDown(_) | Self::Unavailable(_))
    }
}

/// State of the control connection as last observed by the actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    /// Re-establishing has failed, but not often enough to give up.
    Reconnecting,
    Unavailable,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Unavailable => "unavailable",
        })
    }
}

// =============================================================================
// Config
// =============================================================================

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Instance name, used for logging.
    pub instance: String,

    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,

    pub backoff: BackoffPolicy,

    /// Failed re-establish attempts within `reestablish_window` before the
    /// connection is reported unavailable.
    pub reestablish_limit: u32,

    pub reestablish_window: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            instance: "default".to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffPolicy::default(),
            reestablish_limit: DEFAULT_REESTABLISH_LIMIT,
            reestablish_window: DEFAULT_REESTABLISH_WINDOW,
        }
    }
}

// =============================================================================
// Actor
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mutation {
    Add,
    Cancel,
}

/// Actor owning one instance's control connection.
pub struct TunnelActor<C> {
    config: TunnelConfig,
    channel: C,
    transport: Arc<dyn TransportCapability>,
    allocator: Option<Arc<VsockPortAllocator>>,
    /// Forwards confirmed on the current connection.
    active: BTreeMap<ForwardKey, ForwardTuple>,
    relays: BTreeMap<ForwardKey, VsockAllocation>,
    /// Relayed tuples by key. Relays outlive a reconnect, unlike `active`.
    relayed: BTreeMap<ForwardKey, ForwardTuple>,
    reestablish_failures: RetryTracker,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl<C: ControlChannel + 'static> TunnelActor<C> {
    pub fn new(
        config: TunnelConfig,
        channel: C,
        transport: Arc<dyn TransportCapability>,
        allocator: Option<Arc<VsockPortAllocator>>,
    ) -> Self {
        let reestablish_failures = RetryTracker::new(config.reestablish_limit, config.reestablish_window);
        let (status_tx, _) = watch::channel(ConnectionStatus::Connected);
        Self {
            config,
            channel,
            transport,
            allocator,
            active: BTreeMap::new(),
            relays: BTreeMap::new(),
            relayed: BTreeMap::new(),
            reestablish_failures,
            status_tx,
        }
    }

    /// Spawn under `supervisor` and return a handle for the reconciliation loop.
    pub fn spawn(self, supervisor: &mut Supervisor) -> TunnelHandle {
        let status = self.status_tx.subscribe();
        let actor = supervisor.spawn(self, MAILBOX_SIZE);
        TunnelHandle { actor, status }
    }

    async fn add_forward(&mut self, rule: ForwardRule, ctx: &mut ActorContext) -> Result<(), TunnelError> {
        let key = rule.key();
        let relay_port = self.relay_port_for(&key, &rule.spec).await?;
        let tuple = ForwardTuple::for_spec(&rule.spec, relay_port);

        if let Some(current) = self.active.get(&key).cloned() {
            if current == tuple {
                debug!(instance = %self.config.instance, forward = %tuple, "Forward already active");
                return Ok(());
            }
            warn!(
                instance = %self.config.instance,
                current = %current,
                replacement = %tuple,
                "Replacing forward that was not removed first"
            );
            self.mutate(Mutation::Cancel, &current, ctx).await?;
            self.active.remove(&key);
        }

        match self.mutate(Mutation::Add, &tuple, ctx).await {
            Ok(()) => {
                if tuple.relay_port.is_some() {
                    self.relayed.insert(key.clone(), tuple.clone());
                }
                self.active.insert(key, tuple);
                Ok(())
            }
            Err(e @ TunnelError::Rejected(_)) => {
                self.release_relay(&key).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn remove_forward(&mut self, key: ForwardKey, ctx: &mut ActorContext) -> Result<(), TunnelError> {
        let Some(tuple) = self.active.get(&key).cloned() else {
            debug!(instance = %self.config.instance, forward = %key, "Forward not active on this connection");
            if let Some(relayed) = self.relayed.get(&key).cloned() {
                if let Err(e) = self.apply_once(Mutation::Cancel, &relayed).await {
                    debug!(instance = %self.config.instance, forward = %relayed, error = %e, "Relay cancel failed");
                }
            }
            self.release_relay(&key).await;
            return Ok(());
        };

        match self.mutate(Mutation::Cancel, &tuple, ctx).await {
            Ok(()) => {
                self.active.remove(&key);
                self.release_relay(&key).await;
                Ok(())
            }
            Err(e @ TunnelError::Rejected(_)) => {
                self.active.remove(&key);
                self.release_relay(&key).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Apply one mutation, retrying transient failures.
    async fn mutate(
        &mut self,
        mutation: Mutation,
        tuple: &ForwardTuple,
        ctx: &mut ActorContext,
    ) -> Result<(), TunnelError> {
        let mut attempt = 0;

        loop {
            let result = tokio::select! {
                result = self.apply_once(mutation, tuple) => result,
                _ = ctx.cancelled() => return Err(TunnelError::Cancelled),
            };

            let err = match result {
                Ok(()) => return Ok(()),
                Err(ChannelError::NotFound(_)) if mutation == Mutation::Cancel => {
                    debug!(instance = %self.config.instance, forward = %tuple, "Forward already absent");
                    return Ok(());
                }
                Err(e) => e,
            };

            match err.class() {
                FailureClass::Transient if attempt < self.config.max_retries => {
                    let delay = self.config.backoff.delay(attempt);
                    attempt += 1;
                    debug!(
                        instance = %self.config.instance,
                        forward = %tuple,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying forward mutation"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancelled() => return Err(TunnelError::Cancelled),
                    }
                }
                FailureClass::Transient => return Err(TunnelError::Transient(err.to_string())),
                FailureClass::FatalRule => return Err(TunnelError::Rejected(err.to_string())),
                FailureClass::FatalGlobal => {
                    warn!(instance = %self.config.instance, error = %err, "Control connection lost");
                    return match self.reestablish(ctx).await {
                        Ok(()) => Err(TunnelError::ConnectionReset),
                        Err(TunnelError::Transient(detail)) => Err(TunnelError::ConnectionDown(detail)),
                        Err(e) => Err(e),
                    };
                }
            }
        }
    }

    async fn apply_once(&self, mutation: Mutation, tuple: &ForwardTuple) -> Result<(), ChannelError> {
        match mutation {
            Mutation::Add => self.channel.add_forward(tuple).await,
            Mutation::Cancel => self.channel.cancel_forward(tuple).await,
        }
    }

    /// Replace the connection. Forwards on the old one are forgotten either way.
    async fn reestablish(&mut self, ctx: &mut ActorContext) -> Result<(), TunnelError> {
        let result = tokio::select! {
            result = self.channel.reconnect() => result,
            _ = ctx.cancelled() => return Err(TunnelError::Cancelled),
        };

        let dropped = self.active.len();
        self.active.clear();

        match result {
            Ok(()) => {
                self.reestablish_failures.clear(&self.config.instance);
                self.status_tx.send_replace(ConnectionStatus::Connected);
                info!(instance = %self.config.instance, dropped, "Control connection re-established");
                Ok(())
            }
            Err(e) => {
                let exhausted = self.reestablish_failures.record_failure(&self.config.instance);
                let failures = self.reestablish_failures.failures(&self.config.instance);
                if exhausted {
                    self.status_tx.send_replace(ConnectionStatus::Unavailable);
                    error!(
                        instance = %self.config.instance,
                        failures,
                        error = %e,
                        "Control connection unavailable"
                    );
                    Err(TunnelError::Unavailable(e.to_string()))
                } else {
                    self.status_tx.send_replace(ConnectionStatus::Reconnecting);
                    warn!(
                        instance = %self.config.instance,
                        failures,
                        error = %e,
                        "Failed to re-establish control connection"
                    );
                    Err(TunnelError::Transient(e.to_string()))
                }
            }
        }
    }

    async fn relay_port_for(&mut self, key: &ForwardKey, spec: &PortSpec) -> Result<Option<u32>, TunnelError> {
        if !self.transport.requires_relay(spec.protocol) {
            return Ok(None);
        }
        if let Some(allocation) = self.relays.get(key) {
            return Ok(Some(allocation.port));
        }

        let Some(allocator) = self.allocator.clone() else {
            return Err(TunnelError::Rejected(format!(
                "{} transport needs a vsock relay for {} but no allocator is configured",
                self.transport.name(),
                spec.protocol
            )));
        };

        let port = tokio::task::spawn_blocking(move || allocator.allocate())
            .await
            .map_err(|e| TunnelError::Transient(format!("vsock allocation task failed: {e}")))?
            .map_err(|e| TunnelError::Rejected(e.to_string()))?;

        info!(instance = %self.config.instance, forward = %key, port, "Allocated vsock relay port");
        self.relays.insert(
            key.clone(),
            VsockAllocation {
                port,
                owner: key.clone(),
            },
        );
        Ok(Some(port))
    }

    async fn release_relay(&mut self, key: &ForwardKey) {
        self.relayed.remove(key);
        let Some(allocation) = self.relays.remove(key) else {
            return;
        };
        let Some(allocator) = self.allocator.clone() else {
            return;
        };

        let port = allocation.port;
        if let Err(e) = tokio::task::spawn_blocking(move || allocator.release(port)).await {
            warn!(instance = %self.config.instance, port, error = %e, "vsock release task failed");
        } else {
            debug!(instance = %self.config.instance, forward = %allocation.owner, port, "Released vsock relay port");
        }
    }

    async fn check_alive(&self, ctx: &mut ActorContext) -> bool {
        tokio::select! {
            alive = self.channel.check_alive() => alive,
            _ = ctx.cancelled() => false,
        }
    }
}

#[async_trait]
impl<C: ControlChannel + 'static> Actor for TunnelActor<C> {
    type Message = TunnelMessage;

    fn name(&self) -> &str {
        "tunnel"
    }

    async fn handle(&mut self, msg: TunnelMessage, ctx: &mut ActorContext) -> Result<bool, ActorError> {
        match msg {
            TunnelMessage::AddForward { rule, reply } => {
                let result = self.add_forward(rule, ctx).await;
                let _ = reply.send(result);
            }
            TunnelMessage::RemoveForward { key, reply } => {
                let result = self.remove_forward(key, ctx).await;
                let _ = reply.send(result);
            }
            TunnelMessage::CheckAlive { reply } => {
                let alive = self.check_alive(ctx).await;
                let _ = reply.send(alive);
            }
            TunnelMessage::Reestablish { reply } => {
                let result = self.reestablish(ctx).await;
                let _ = reply.send(result);
            }
        }
        Ok(true)
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        let keys: Vec<ForwardKey> = self.relays.keys().cloned().collect();
        for key in keys {
            self.release_relay(&key).await;
        }
        info!(
            instance = %self.config.instance,
            active = self.active.len(),
            "Tunnel controller stopped"
        );
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Request/reply interface to the tunnel actor.
#[derive(Clone)]
pub struct TunnelHandle {
    actor: ActorHandle<TunnelMessage>,
    status: watch::Receiver<ConnectionStatus>,
}

impl TunnelHandle {
    pub async fn add_forward(&self, rule: ForwardRule) -> Result<(), TunnelError> {
        let (reply, rx) = oneshot::channel();
        self.request(TunnelMessage::AddForward { rule, reply }, rx).await?
    }

    pub async fn remove_forward(&self, key: ForwardKey) -> Result<(), TunnelError> {
        let (reply, rx) = oneshot::channel();
        self.request(TunnelMessage::RemoveForward { key, reply }, rx).await?
    }

    /// `false` if the connection is down or the actor is gone.
    pub async fn check_alive(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        self.request(TunnelMessage::CheckAlive { reply }, rx)
            .await
            .unwrap_or(false)
    }

    pub async fn reestablish(&self) -> Result<(), TunnelError> {
        let (reply, rx) = oneshot::channel();
        self.request(TunnelMessage::Reestablish { reply }, rx).await?
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    async fn request<T>(&self, msg: TunnelMessage, rx: oneshot::Receiver<T>) -> Result<T, TunnelError> {
        self.actor.send(msg).await.map_err(|_| TunnelError::Stopped)?;
        rx.await.map_err(|_| TunnelError::Stopped)
    }
}
