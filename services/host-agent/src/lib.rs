//! vmfwd Host Agent Library
//!
//! The host agent runs next to a VM and keeps host-side port forwards in
//! line with the sockets the guest is listening on. It polls the guest
//! agent, diffs the result against the forwards it has confirmed, and
//! applies the difference over a multiplexed control connection.
//!
//! ## Architecture
//!
//! ```text
//! ObserverTask ──Observation──▶ ReconciliationLoop ──add/remove──▶ TunnelActor
//!   (guest poll)                 (owns ForwardTable)               (owns ControlChannel)
//! ```
//!
//! Only the tunnel actor talks to the control connection, and only the
//! reconciliation loop mutates the forward table.
//!
//! ## Modules
//!
//! - `actors`: Actor framework and the tunnel actor
//! - `channel`: Control-connection abstraction, OpenSSH, relay and mock channels
//! - `observer`: Guest agent client and polling task
//! - `transport`: Which protocols need a vsock relay
//! - `vsock`: Host-wide vsock port allocation

pub mod actors;
pub mod channel;
pub mod observer;
pub mod transport;
pub mod vsock;

// Internal modules exposed for integration tests
pub mod config;
pub mod forwards;
pub mod reconciler;
pub mod status;

// Re-export commonly used types
pub use channel::{ControlChannel, MockControlChannel};
pub use observer::{GuestPortObserver, Observation, ObserverTask};
pub use reconciler::{LoopConfig, PassSummary, ReconciliationLoop};
