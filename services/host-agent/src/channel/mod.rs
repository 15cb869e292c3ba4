//! Control connection interface and mock implementation.
//!
//! The control connection is the single multiplexed channel to the guest
//! over which forwards are added and cancelled:
//! - `SshMuxChannel` drives an OpenSSH ControlMaster
//! - `RelayChannel` serves vsock-relayed forwards and wraps another channel
//! - `MockControlChannel` records mutations in memory for tests

mod relay;
mod ssh;

pub use relay::{parse_relay_reply, AgentRelayGuest, RelayChannel, RelayConn, RelayGuest};
pub use ssh::{classify_ssh_failure, SshConfig, SshMuxChannel};

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use vmfwd_reconcile::{PortSpec, Protocol, SocketTarget};

/// One side of a forward as the control connection sees it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Endpoint {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Concrete mutation arguments for one forward.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardTuple {
    pub protocol: Protocol,
    /// Host socket to listen on.
    pub bind: Endpoint,
    /// Guest socket to connect to.
    pub connect: Endpoint,
    /// Hypervisor-socket relay port, when the transport needs one.
    pub relay_port: Option<u32>,
}

impl ForwardTuple {
    pub fn for_spec(spec: &PortSpec, relay_port: Option<u32>) -> Self {
        let bind = match &spec.host {
            SocketTarget::Port(port) => Endpoint::Inet(SocketAddr::new(spec.host_address, *port)),
            SocketTarget::Path(path) => Endpoint::Unix(path.clone()),
        };
        let connect = match &spec.guest {
            SocketTarget::Port(port) => Endpoint::Inet(SocketAddr::new(spec.connect_address(), *port)),
            SocketTarget::Path(path) => Endpoint::Unix(path.clone()),
        };

        Self {
            protocol: spec.protocol,
            bind,
            connect,
            relay_port,
        }
    }
}

impl fmt::Display for ForwardTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.bind, self.connect)?;
        if let Some(port) = self.relay_port {
            write!(f, " via vsock:{port}")?;
        }
        Ok(())
    }
}

/// How a failed mutation should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry with backoff.
    Transient,
    /// Give up on this forward; other forwards are unaffected.
    FatalRule,
    /// The connection itself is gone.
    FatalGlobal,
}

/// Errors reported by a control connection.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("control connection busy: {0}")]
    Busy(String),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("invalid forward address: {0}")]
    InvalidAddress(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("address already in use: {0}")]
    AddressInUse(String),

    #[error("unsupported forward: {0}")]
    Unsupported(String),

    #[error("forward not found: {0}")]
    NotFound(String),

    #[error("control connection down: {0}")]
    ConnectionDown(String),

    #[error("control command failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Busy(_) | Self::Refused(_) | Self::Io(_) => FailureClass::Transient,
            Self::InvalidAddress(_)
            | Self::PermissionDenied(_)
            | Self::AddressInUse(_)
            | Self::Unsupported(_)
            | Self::NotFound(_) => FailureClass::FatalRule,
            Self::ConnectionDown(_) => FailureClass::FatalGlobal,
        }
    }
}

/// Control connection interface.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Install a forward.
    async fn add_forward(&self, tuple: &ForwardTuple) -> Result<(), ChannelError>;

    /// Cancel a forward. `NotFound` means it was already absent.
    async fn cancel_forward(&self, tuple: &ForwardTuple) -> Result<(), ChannelError>;

    /// Whether the connection is currently usable.
    async fn check_alive(&self) -> bool;

    /// Replace the connection. Forwards installed on the old connection are gone.
    async fn reconnect(&self) -> Result<(), ChannelError>;
}

// =============================================================================
// Mock
// =============================================================================

/// Mutation kinds that can be scripted to fail on the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    Add,
    Cancel,
}

#[derive(Default)]
struct MockState {
    alive: bool,
    forwards: BTreeMap<Endpoint, ForwardTuple>,
    script: VecDeque<(MockOp, ChannelError)>,
    reconnect_failures: u32,
    mutations: u64,
    reconnects: u64,
}

/// Mock control connection for testing and development.
///
/// Clones share state, so a test can keep one clone for inspection while the
/// tunnel controller owns another.
#[derive(Clone)]
pub struct MockControlChannel {
    state: Arc<Mutex<MockState>>,
}

impl MockControlChannel {
    /// Create a connected mock.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                alive: true,
                ..MockState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next mutation of kind `op` with `error`.
    pub fn fail_next(&self, op: MockOp, error: ChannelError) {
        self.lock().script.push_back((op, error));
    }

    /// Fail the next `count` reconnect attempts.
    pub fn fail_reconnects(&self, count: u32) {
        self.lock().reconnect_failures = count;
    }

    /// Drop or restore the connection. Dropping it loses every forward.
    pub fn set_alive(&self, alive: bool) {
        let mut state = self.lock();
        state.alive = alive;
        if !alive {
            state.forwards.clear();
        }
    }

    /// Mutations attempted so far, successful or not.
    pub fn mutation_count(&self) -> u64 {
        self.lock().mutations
    }

    /// Successful reconnects so far.
    pub fn reconnect_count(&self) -> u64 {
        self.lock().reconnects
    }

    /// Forwards currently installed.
    pub fn forwards(&self) -> Vec<ForwardTuple> {
        self.lock().forwards.values().cloned().collect()
    }

    pub fn has_forward(&self, bind: &Endpoint) -> bool {
        self.lock().forwards.contains_key(bind)
    }

    /// Begin a mutation: count it and pop a scripted failure if one is queued.
    fn begin(&self, op: MockOp) -> Option<ChannelError> {
        let mut state = self.lock();
        state.mutations += 1;
        if !state.alive {
            return Some(ChannelError::ConnectionDown("mock connection closed".to_string()));
        }
        state
            .script
            .iter()
            .position(|(o, _)| *o == op)
            .and_then(|i| state.script.remove(i))
            .map(|(_, e)| e)
    }
}

impl Default for MockControlChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlChannel for MockControlChannel {
    async fn add_forward(&self, tuple: &ForwardTuple) -> Result<(), ChannelError> {
        if let Some(e) = self.begin(MockOp::Add) {
            return Err(e);
        }

        let mut state = self.lock();
        let existing = state.forwards.get(&tuple.bind).cloned();
        match existing {
            Some(existing) if existing == *tuple => Ok(()),
            Some(_) => Err(ChannelError::AddressInUse(tuple.bind.to_string())),
            None => {
                debug!(forward = %tuple, "[MOCK] Forward added");
                state.forwards.insert(tuple.bind.clone(), tuple.clone());
                Ok(())
            }
        }
    }

    async fn cancel_forward(&self, tuple: &ForwardTuple) -> Result<(), ChannelError> {
        if let Some(e) = self.begin(MockOp::Cancel) {
            return Err(e);
        }

        let mut state = self.lock();
        match state.forwards.remove(&tuple.bind) {
            Some(_) => {
                debug!(forward = %tuple, "[MOCK] Forward cancelled");
                Ok(())
            }
            None => Err(ChannelError::NotFound(tuple.bind.to_string())),
        }
    }

    async fn check_alive(&self) -> bool {
        self.lock().alive
    }

    async fn reconnect(&self) -> Result<(), ChannelError> {
        let mut state = self.lock();
        if state.reconnect_failures > 0 {
            state.reconnect_failures -= 1;
            return Err(ChannelError::ConnectionDown("mock reconnect refused".to_string()));
        }
        state.alive = true;
        state.forwards.clear();
        state.reconnects += 1;
        debug!("[MOCK] Control connection re-established");
        Ok(())
    }
}
