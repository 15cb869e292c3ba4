//! Actor framework for the host agent.
//!
//! A lightweight actor framework: each actor owns the mutable state and side
//! effects of one resource and processes its messages sequentially.
//!
//! ## Actor Types
//!
//! - `TunnelActor`: sole owner of an instance's control connection and of the
//!   vsock relay ports held for its forwards

mod framework;
mod tunnel;

pub use framework::{
    shutdown_signalled, Actor, ActorContext, ActorError, ActorHandle, ActorState, BackoffPolicy,
    Message, Supervisor,
};
pub use tunnel::{ConnectionStatus, TunnelActor, TunnelConfig, TunnelError, TunnelHandle, TunnelMessage};
