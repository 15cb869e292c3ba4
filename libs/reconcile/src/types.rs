//! Forward data model.
//!
//! A [`PortSpec`] describes one guest socket and the host socket it is exposed
//! on. Specs are immutable values: when the desired definition of a forward
//! changes, a new spec replaces the old one.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::ParseError;

/// Transport protocol of a forwarded socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Unix,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Unix => "unix",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "unix" => Ok(Self::Unix),
            other => Err(ParseError::Protocol(other.to_string())),
        }
    }
}

/// Port number or filesystem path on one side of a forward.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SocketTarget {
    Port(u16),
    Path(PathBuf),
}

impl SocketTarget {
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Port(p) => Some(*p),
            Self::Path(_) => None,
        }
    }
}

fn fmt_endpoint(f: &mut fmt::Formatter<'_>, address: IpAddr, target: &SocketTarget) -> fmt::Result {
    match target {
        SocketTarget::Port(port) => write!(f, "{}", SocketAddr::new(address, *port)),
        SocketTarget::Path(path) => write!(f, "{}", path.display()),
    }
}

/// One forward between a guest socket and a host socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortSpec {
    pub protocol: Protocol,
    pub guest_address: IpAddr,
    pub guest: SocketTarget,
    pub host_address: IpAddr,
    pub host: SocketTarget,
}

impl PortSpec {
    pub fn tcp(guest_address: IpAddr, guest_port: u16, host_address: IpAddr, host_port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            guest_address,
            guest: SocketTarget::Port(guest_port),
            host_address,
            host: SocketTarget::Port(host_port),
        }
    }

    pub fn udp(guest_address: IpAddr, guest_port: u16, host_address: IpAddr, host_port: u16) -> Self {
        Self {
            protocol: Protocol::Udp,
            ..Self::tcp(guest_address, guest_port, host_address, host_port)
        }
    }

    /// Unix socket forward. Addresses are fixed to loopback so that keys stay
    /// comparable with inet forwards.
    pub fn unix(guest_path: impl Into<PathBuf>, host_path: impl Into<PathBuf>) -> Self {
        Self {
            protocol: Protocol::Unix,
            guest_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            guest: SocketTarget::Path(guest_path.into()),
            host_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            host: SocketTarget::Path(host_path.into()),
        }
    }

    /// Identity of the forward: which guest socket it exposes.
    pub fn key(&self) -> ForwardKey {
        ForwardKey {
            protocol: self.protocol,
            guest_address: self.guest_address,
            guest: self.guest.clone(),
        }
    }

    /// The host socket this forward occupies.
    pub fn host_endpoint(&self) -> HostEndpoint {
        HostEndpoint {
            protocol: self.protocol,
            host_address: self.host_address,
            host: self.host.clone(),
        }
    }

    /// Address the guest end of the tunnel dials.
    ///
    /// A socket bound to the unspecified address is reached through the
    /// loopback address of the same family.
    pub fn connect_address(&self) -> IpAddr {
        match self.guest_address {
            IpAddr::V4(a) if a.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(a) if a.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            other => other,
        }
    }

    pub fn guest_port(&self) -> Option<u16> {
        self.guest.port()
    }

    pub fn host_port(&self) -> Option<u16> {
        self.host.port()
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.protocol)?;
        fmt_endpoint(f, self.host_address, &self.host)?;
        f.write_str(" <- guest ")?;
        fmt_endpoint(f, self.guest_address, &self.guest)
    }
}

/// Identity key of a forward: `(protocol, guest address, guest port or path)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ForwardKey {
    pub protocol: Protocol,
    pub guest_address: IpAddr,
    pub guest: SocketTarget,
}

impl fmt::Display for ForwardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.protocol)?;
        fmt_endpoint(f, self.guest_address, &self.guest)
    }
}

/// Host-side socket: `(protocol, host address, host port or path)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostEndpoint {
    pub protocol: Protocol,
    pub host_address: IpAddr,
    pub host: SocketTarget,
}

impl fmt::Display for HostEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.protocol)?;
        fmt_endpoint(f, self.host_address, &self.host)
    }
}

/// Where a desired forward came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Reported by the guest agent; lives only while the guest socket does.
    Discovered,
    /// Explicitly configured.
    Static,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Static => "static",
        }
    }
}

/// A desired forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    pub spec: PortSpec,
    pub origin: Origin,

    /// Pinned rules are requested on every tick regardless of discovery.
    pub pinned: bool,

    /// Configuration order. Lower wins host-endpoint conflicts.
    pub order: usize,
}

impl ForwardRule {
    pub fn pinned(spec: PortSpec, order: usize) -> Self {
        Self {
            spec,
            origin: Origin::Static,
            pinned: true,
            order,
        }
    }

    pub fn discovered(spec: PortSpec, order: usize) -> Self {
        Self {
            spec,
            origin: Origin::Discovered,
            pinned: false,
            order,
        }
    }

    pub fn key(&self) -> ForwardKey {
        self.spec.key()
    }
}

/// A listening socket reported by the guest agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuestSocket {
    pub protocol: Protocol,
    pub address: IpAddr,
    pub port: u16,
}

impl GuestSocket {
    pub fn new(protocol: Protocol, address: IpAddr, port: u16) -> Self {
        Self {
            protocol,
            address,
            port,
        }
    }

    pub fn tcp(address: IpAddr, port: u16) -> Self {
        Self::new(Protocol::Tcp, address, port)
    }

    /// Forward for this socket before any configured remapping: the same
    /// port on the host's IPv4 loopback.
    pub fn default_spec(&self) -> PortSpec {
        PortSpec {
            protocol: self.protocol,
            guest_address: self.address,
            guest: SocketTarget::Port(self.port),
            host_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            host: SocketTarget::Port(self.port),
        }
    }
}

impl fmt::Display for GuestSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol, SocketAddr::new(self.address, self.port))
    }
}

/// Ordered, de-duplicated set of guest sockets captured at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestSocketSnapshot {
    sockets: Vec<GuestSocket>,
    captured_at: DateTime<Utc>,
    stale: bool,
}

impl GuestSocketSnapshot {
    /// Build a fresh snapshot, keeping the first occurrence of each socket.
    pub fn new(sockets: impl IntoIterator<Item = GuestSocket>) -> Self {
        let mut seen = HashSet::new();
        let sockets = sockets.into_iter().filter(|s| seen.insert(*s)).collect();

        Self {
            sockets,
            captured_at: Utc::now(),
            stale: false,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Carry this snapshot over after a failed poll.
    pub fn into_stale(mut self) -> Self {
        self.stale = true;
        self
    }

    pub fn sockets(&self) -> &[GuestSocket] {
        &self.sockets
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}
