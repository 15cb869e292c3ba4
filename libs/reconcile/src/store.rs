//! Desired forwarding state loaded from configuration.
//!
//! The store is built once before the engine starts and is read-only
//! afterwards. It holds two things:
//!
//! - an ordered list of [`PortRule`]s evaluated against discovered sockets
//!   (first match wins, so an ignore rule placed after a forward rule for the
//!   same port has no effect)
//! - the pinned static forwards, requested on every tick

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::types::{ForwardRule, PortSpec, Protocol, SocketTarget};
use crate::ParseError;

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    /// Returns `None` when `start > end`.
    pub fn new(start: u16, end: u16) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    /// Every non-zero port.
    pub fn all() -> Self {
        Self {
            start: 1,
            end: u16::MAX,
        }
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn len(&self) -> u32 {
        u32::from(self.end) - u32::from(self.start) + 1
    }

    pub fn is_single(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Matcher for the guest address a socket is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressPattern {
    Any,
    Exact(IpAddr),
    Cidr { network: IpAddr, prefix: u8 },
}

impl AddressPattern {
    /// Whether a socket bound to `addr` is reachable at this pattern.
    ///
    /// Unspecified addresses cover their family (`::` covers both), in either
    /// direction: a socket on `0.0.0.0` matches `10.0.0.0/8`, and the
    /// pattern `0.0.0.0` matches a socket on `192.168.5.15`.
    pub fn matches(&self, addr: IpAddr) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(ip) => *ip == addr || covers(addr, *ip) || covers(*ip, addr),
            Self::Cidr { network, prefix } => {
                in_network(addr, *network, *prefix) || covers(addr, *network)
            }
        }
    }
}

impl FromStr for AddressPattern {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "*" || s.eq_ignore_ascii_case("any") {
            return Ok(Self::Any);
        }

        if let Some((network, prefix)) = s.split_once('/') {
            let network: IpAddr = network
                .parse()
                .map_err(|_| ParseError::Address(s.to_string()))?;
            let prefix: u8 = prefix
                .parse()
                .map_err(|_| ParseError::Address(s.to_string()))?;
            let max = if network.is_ipv4() { 32 } else { 128 };
            if prefix > max {
                return Err(ParseError::Address(s.to_string()));
            }
            return Ok(Self::Cidr { network, prefix });
        }

        s.parse()
            .map(Self::Exact)
            .map_err(|_| ParseError::Address(s.to_string()))
    }
}

fn covers(bound: IpAddr, candidate: IpAddr) -> bool {
    match bound {
        IpAddr::V4(a) if a.is_unspecified() => candidate.is_ipv4(),
        IpAddr::V6(a) if a.is_unspecified() => true,
        _ => false,
    }
}

fn in_network(addr: IpAddr, network: IpAddr, prefix: u8) -> bool {
    match (addr, network) {
        (IpAddr::V4(a), IpAddr::V4(n)) => {
            let bits = u32::from(prefix.min(32));
            if bits == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - bits);
            (u32::from(a) & mask) == (u32::from(n) & mask)
        }
        (IpAddr::V6(a), IpAddr::V6(n)) => {
            let bits = u32::from(prefix.min(128));
            if bits == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - bits);
            (u128::from(a) & mask) == (u128::from(n) & mask)
        }
        _ => false,
    }
}

/// What a matching rule does with a discovered socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleAction {
    Ignore,
    Forward {
        host_address: IpAddr,
        /// `None` keeps the guest port.
        host_ports: Option<PortRange>,
    },
}

/// One ordered configuration entry evaluated against discovered sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRule {
    /// `None` matches tcp and udp.
    pub protocol: Option<Protocol>,
    pub guest_ports: PortRange,
    pub guest_address: AddressPattern,
    pub action: RuleAction,
}

impl PortRule {
    pub fn ignore(guest_ports: PortRange) -> Self {
        Self {
            protocol: None,
            guest_ports,
            guest_address: AddressPattern::Any,
            action: RuleAction::Ignore,
        }
    }

    pub fn forward(guest_ports: PortRange, host_address: IpAddr, host_ports: Option<PortRange>) -> Self {
        Self {
            protocol: None,
            guest_ports,
            guest_address: AddressPattern::Any,
            action: RuleAction::Forward {
                host_address,
                host_ports,
            },
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_guest_address(mut self, pattern: AddressPattern) -> Self {
        self.guest_address = pattern;
        self
    }

    pub fn matches(&self, spec: &PortSpec) -> bool {
        let protocol_ok = match self.protocol {
            Some(p) => p == spec.protocol,
            None => matches!(spec.protocol, Protocol::Tcp | Protocol::Udp),
        };
        let Some(port) = spec.guest_port() else {
            return false;
        };

        protocol_ok && self.guest_ports.contains(port) && self.guest_address.matches(spec.guest_address)
    }

    fn apply(&self, spec: &PortSpec) -> PortSpec {
        let RuleAction::Forward {
            host_address,
            host_ports,
        } = &self.action
        else {
            return spec.clone();
        };
        let Some(guest_port) = spec.guest_port() else {
            return spec.clone();
        };

        let host_port = match host_ports {
            None => guest_port,
            Some(range) => {
                let offset = guest_port - self.guest_ports.start();
                range
                    .start()
                    .checked_add(offset)
                    .filter(|p| range.contains(*p))
                    .unwrap_or(range.start())
            }
        };

        PortSpec {
            host_address: *host_address,
            host: SocketTarget::Port(host_port),
            ..spec.clone()
        }
    }
}

/// Static forwards and discovery predicates, read-only after load.
#[derive(Debug, Clone, Default)]
pub struct DesiredStateStore {
    rules: Vec<PortRule>,
    pinned: Vec<ForwardRule>,
}

impl DesiredStateStore {
    /// Pinned rules take configuration order from their position in
    /// `pinned`, ahead of any discovered forward.
    pub fn new(rules: Vec<PortRule>, pinned: Vec<PortSpec>) -> Self {
        let pinned = pinned
            .into_iter()
            .enumerate()
            .map(|(order, spec)| ForwardRule::pinned(spec, order))
            .collect();

        Self { rules, pinned }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// True when the first rule matching `spec` is an ignore rule.
    pub fn should_ignore(&self, spec: &PortSpec) -> bool {
        matches!(
            self.first_match(spec).map(|(_, r)| &r.action),
            Some(RuleAction::Ignore)
        )
    }

    /// Apply the host-side override of the first matching forward rule.
    pub fn remap(&self, spec: &PortSpec) -> PortSpec {
        match self.first_match(spec) {
            Some((_, rule)) => rule.apply(spec),
            None => spec.clone(),
        }
    }

    /// Remapped spec and configuration order for a discovered socket, or
    /// `None` when it is ignored.
    ///
    /// A socket matched by a forward rule ranks by that rule's position,
    /// after every pinned rule. Unmatched sockets rank after every
    /// configured entry.
    pub fn resolve(&self, spec: &PortSpec) -> Option<(PortSpec, usize)> {
        let offset = self.pinned.len();
        match self.first_match(spec) {
            Some((_, rule)) if rule.action == RuleAction::Ignore => None,
            Some((index, rule)) => Some((rule.apply(spec), offset + index)),
            None => Some((spec.clone(), offset + self.rules.len())),
        }
    }

    pub fn pinned(&self) -> &[ForwardRule] {
        &self.pinned
    }

    pub fn rules(&self) -> &[PortRule] {
        &self.rules
    }

    fn first_match(&self, spec: &PortSpec) -> Option<(usize, &PortRule)> {
        self.rules.iter().enumerate().find(|(_, r)| r.matches(spec))
    }
}
