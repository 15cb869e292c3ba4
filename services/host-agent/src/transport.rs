//! Transport capabilities.
//!
//! Decides, per protocol, whether a forward needs a hypervisor-socket relay
//! port in addition to the control-connection mutation.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use vmfwd_reconcile::Protocol;

/// Which transport the agent should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// Pick based on the host platform.
    #[default]
    Auto,
    Loopback,
    Vsock,
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(Self::Auto),
            "loopback" | "ssh" => Ok(Self::Loopback),
            "vsock" | "hvsock" => Ok(Self::Vsock),
            other => Err(format!("unknown transport '{other}' (expected auto, loopback or vsock)")),
        }
    }
}

/// What a transport can carry without extra resources.
pub trait TransportCapability: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Whether a forward of `protocol` needs a vsock relay port.
    fn requires_relay(&self, protocol: Protocol) -> bool;

    /// Whether any forward needs a relay.
    fn uses_relays(&self) -> bool {
        self.requires_relay(Protocol::Tcp) || self.requires_relay(Protocol::Udp)
    }
}

/// Everything rides the control connection; what it cannot carry fails per rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectTransport;

impl TransportCapability for DirectTransport {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn requires_relay(&self, _protocol: Protocol) -> bool {
        false
    }
}

/// Forwards ride the control connection to guest loopback.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackTransport;

impl TransportCapability for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn requires_relay(&self, protocol: Protocol) -> bool {
        // datagrams cannot ride the multiplexed stream
        protocol == Protocol::Udp
    }
}

/// Every inet forward is relayed over a hypervisor socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct HypervisorSocketTransport;

impl TransportCapability for HypervisorSocketTransport {
    fn name(&self) -> &'static str {
        "vsock"
    }

    fn requires_relay(&self, protocol: Protocol) -> bool {
        matches!(protocol, Protocol::Tcp | Protocol::Udp)
    }
}

/// Decided once at startup. Without a relay server nothing is marked as
/// relayed, so no vsock port is ever allocated for a tuple no channel serves.
pub fn select_transport(mode: TransportMode, relays_available: bool) -> Arc<dyn TransportCapability> {
    if !relays_available {
        return Arc::new(DirectTransport);
    }
    match mode {
        TransportMode::Loopback => Arc::new(LoopbackTransport),
        TransportMode::Vsock => Arc::new(HypervisorSocketTransport),
        TransportMode::Auto if cfg!(windows) => Arc::new(HypervisorSocketTransport),
        TransportMode::Auto => Arc::new(LoopbackTransport),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode() {
        assert_eq!("auto".parse::<TransportMode>().unwrap(), TransportMode::Auto);
        assert_eq!("SSH".parse::<TransportMode>().unwrap(), TransportMode::Loopback);
        assert_eq!("hvsock".parse::<TransportMode>().unwrap(), TransportMode::Vsock);
        assert!("quic".parse::<TransportMode>().is_err());
    }

    #[test]
    fn test_relay_requirements() {
        let loopback = select_transport(TransportMode::Loopback, true);
        assert!(!loopback.requires_relay(Protocol::Tcp));
        assert!(loopback.requires_relay(Protocol::Udp));
        assert!(!loopback.requires_relay(Protocol::Unix));

        let vsock = select_transport(TransportMode::Vsock, true);
        assert_eq!(vsock.name(), "vsock");
        assert!(vsock.requires_relay(Protocol::Tcp));
        assert!(!vsock.requires_relay(Protocol::Unix));
        assert!(vsock.uses_relays());
    }

    #[test]
    fn test_no_relays_without_relay_server() {
        for mode in [TransportMode::Auto, TransportMode::Loopback, TransportMode::Vsock] {
            let transport = select_transport(mode, false);
            assert_eq!(transport.name(), "direct");
            assert!(!transport.uses_relays());
            assert!(!transport.requires_relay(Protocol::Udp));
        }
    }

    #[cfg(not(windows))]
    #[test]
    fn test_auto_prefers_loopback_off_windows() {
        assert_eq!(select_transport(TransportMode::Auto, true).name(), "loopback");
    }
}
