//! Forwards file loading.
//!
//! ```toml
//! [[forwards]]
//! guest_port = 8080
//! host_port = 18080
//! static = true
//!
//! [[forwards]]
//! guest_port_range = [3000, 3009]
//! host_port_range = [13000, 13009]
//!
//! [[forwards]]
//! guest_ip = "0.0.0.0"
//! guest_port_range = [1, 1023]
//! ignore = true
//!
//! [[forwards]]
//! guest_socket = "/run/docker.sock"
//! host_socket = "/tmp/vm-docker.sock"
//! static = true
//! ```
//!
//! Entries are evaluated in file order; the first entry matching a
//! discovered socket decides what happens to it.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use vmfwd_reconcile::{AddressPattern, DesiredStateStore, PortRange, PortRule, PortSpec, Protocol};

#[derive(Debug, Error)]
pub enum ForwardsFileError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid forwards file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("forward entry {index}: {reason}")]
    Invalid { index: usize, reason: String },
}

/// Parsed forwards file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardsFile {
    #[serde(default)]
    pub forwards: Vec<ForwardEntry>,
}

/// One `[[forwards]]` entry as written.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardEntry {
    pub protocol: Option<String>,
    pub guest_ip: Option<String>,
    pub guest_port: Option<u16>,
    pub guest_port_range: Option<[u16; 2]>,
    pub guest_socket: Option<PathBuf>,
    pub host_ip: Option<IpAddr>,
    pub host_port: Option<u16>,
    pub host_port_range: Option<[u16; 2]>,
    pub host_socket: Option<PathBuf>,
    #[serde(default)]
    pub ignore: bool,
    #[serde(default, rename = "static")]
    pub pinned: bool,
}

/// What one entry contributes to the store.
enum Translated {
    Rule(PortRule),
    Pinned(PortSpec),
}

impl ForwardsFile {
    pub fn parse(contents: &str) -> Result<Self, ForwardsFileError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load(path: &Path) -> Result<Self, ForwardsFileError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ForwardsFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Validate every entry and build the store.
    pub fn into_store(self) -> Result<DesiredStateStore, ForwardsFileError> {
        let mut rules = Vec::new();
        let mut pinned = Vec::new();

        for (index, entry) in self.forwards.into_iter().enumerate() {
            match entry.translate().map_err(|reason| ForwardsFileError::Invalid { index, reason })? {
                Translated::Rule(rule) => rules.push(rule),
                Translated::Pinned(spec) => pinned.push(spec),
            }
        }

        Ok(DesiredStateStore::new(rules, pinned))
    }
}

impl ForwardEntry {
    fn translate(self) -> Result<Translated, String> {
        let protocol = self
            .protocol
            .as_deref()
            .map(str::parse::<Protocol>)
            .transpose()
            .map_err(|e| e.to_string())?;

        if let Some(guest_socket) = self.guest_socket {
            return translate_socket(protocol, guest_socket, self.host_socket, self.pinned, self.ignore);
        }
        if self.host_socket.is_some() {
            return Err("host_socket requires guest_socket".to_string());
        }
        if protocol == Some(Protocol::Unix) {
            return Err("unix entries need guest_socket and host_socket".to_string());
        }

        let guest_ports = port_range("guest_port", self.guest_port, self.guest_port_range)?
            .ok_or_else(|| "one of guest_port, guest_port_range or guest_socket is required".to_string())?;
        let host_ports = port_range("host_port", self.host_port, self.host_port_range)?;
        let guest_address = self
            .guest_ip
            .as_deref()
            .map(str::parse::<AddressPattern>)
            .transpose()
            .map_err(|e| e.to_string())?
            .unwrap_or(AddressPattern::Any);

        if self.ignore {
            if self.pinned {
                return Err("an entry cannot be both ignore and static".to_string());
            }
            if self.host_ip.is_some() || host_ports.is_some() {
                return Err("ignore entries cannot set host fields".to_string());
            }
            let mut rule = PortRule::ignore(guest_ports).with_guest_address(guest_address);
            if let Some(protocol) = protocol {
                rule = rule.with_protocol(protocol);
            }
            return Ok(Translated::Rule(rule));
        }

        if let Some(host) = host_ports {
            if host.len() != guest_ports.len() {
                return Err(format!(
                    "host range {host} and guest range {guest_ports} differ in length"
                ));
            }
        }
        let host_address = self.host_ip.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        if self.pinned {
            if !guest_ports.is_single() {
                return Err("static entries need a single guest_port".to_string());
            }
            let guest_address = match guest_address {
                AddressPattern::Exact(ip) => ip,
                AddressPattern::Any => IpAddr::V4(Ipv4Addr::LOCALHOST),
                AddressPattern::Cidr { .. } => {
                    return Err("static entries need a single guest_ip".to_string());
                }
            };
            let guest_port = guest_ports.start();
            let host_port = host_ports.map(|r| r.start()).unwrap_or(guest_port);
            let spec = match protocol.unwrap_or(Protocol::Tcp) {
                Protocol::Udp => PortSpec::udp(guest_address, guest_port, host_address, host_port),
                _ => PortSpec::tcp(guest_address, guest_port, host_address, host_port),
            };
            return Ok(Translated::Pinned(spec));
        }

        let mut rule = PortRule::forward(guest_ports, host_address, host_ports).with_guest_address(guest_address);
        if let Some(protocol) = protocol {
            rule = rule.with_protocol(protocol);
        }
        Ok(Translated::Rule(rule))
    }
}

fn translate_socket(
    protocol: Option<Protocol>,
    guest_socket: PathBuf,
    host_socket: Option<PathBuf>,
    pinned: bool,
    ignore: bool,
) -> Result<Translated, String> {
    if !matches!(protocol, None | Some(Protocol::Unix)) {
        return Err("guest_socket entries must use protocol \"unix\"".to_string());
    }
    if ignore {
        return Err("socket entries cannot be ignore entries".to_string());
    }
    if !pinned {
        return Err("socket entries must be static".to_string());
    }
    let host_socket = host_socket.ok_or_else(|| "guest_socket requires host_socket".to_string())?;
    if !guest_socket.is_absolute() || !host_socket.is_absolute() {
        return Err("socket paths must be absolute".to_string());
    }
    Ok(Translated::Pinned(PortSpec::unix(guest_socket, host_socket)))
}

fn port_range(field: &str, single: Option<u16>, range: Option<[u16; 2]>) -> Result<Option<PortRange>, String> {
    match (single, range) {
        (Some(_), Some(_)) => Err(format!("{field} and {field}_range are mutually exclusive")),
        (Some(0), None) => Err(format!("{field} must not be 0")),
        (Some(port), None) => Ok(Some(PortRange::single(port))),
        (None, Some([start, end])) => PortRange::new(start, end)
            .filter(|r| r.start() != 0)
            .map(Some)
            .ok_or_else(|| format!("{field}_range [{start}, {end}] is empty or includes 0")),
        (None, None) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use vmfwd_reconcile::{GuestSocket, SocketTarget};

    use super::*;

    const ANY4: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

    fn store(toml: &str) -> DesiredStateStore {
        ForwardsFile::parse(toml).unwrap().into_store().unwrap()
    }

    fn invalid(toml: &str) -> String {
        match ForwardsFile::parse(toml).unwrap().into_store() {
            Err(ForwardsFileError::Invalid { reason, .. }) => reason,
            other => panic!("expected invalid entry, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_file() {
        let store = store("");
        assert!(store.pinned().is_empty());
        assert!(store.rules().is_empty());
    }

    #[test]
    fn test_static_entry() {
        let store = store(
            r#"
            [[forwards]]
            guest_port = 8080
            host_port = 18080
            static = true
            "#,
        );
        let pinned = &store.pinned()[0];
        assert!(pinned.pinned);
        assert_eq!(pinned.spec.guest, SocketTarget::Port(8080));
        assert_eq!(pinned.spec.host, SocketTarget::Port(18080));
        assert_eq!(pinned.spec.protocol, Protocol::Tcp);
    }

    #[test]
    fn test_range_remap() {
        let store = store(
            r#"
            [[forwards]]
            guest_port_range = [3000, 3009]
            host_port_range = [13000, 13009]
            "#,
        );
        let spec = store.remap(&GuestSocket::tcp(ANY4, 3004).default_spec());
        assert_eq!(spec.host, SocketTarget::Port(13004));
    }

    #[test]
    fn test_first_match_wins() {
        let store = store(
            r#"
            [[forwards]]
            guest_port = 22
            host_port = 2222

            [[forwards]]
            guest_port_range = [1, 1023]
            ignore = true
            "#,
        );
        let ssh = GuestSocket::tcp(ANY4, 22).default_spec();
        assert!(!store.should_ignore(&ssh));
        assert_eq!(store.remap(&ssh).host, SocketTarget::Port(2222));
        assert!(store.should_ignore(&GuestSocket::tcp(ANY4, 80).default_spec()));
    }

    #[test]
    fn test_socket_entry() {
        let store = store(
            r#"
            [[forwards]]
            guest_socket = "/run/docker.sock"
            host_socket = "/tmp/vm-docker.sock"
            static = true
            "#,
        );
        assert_eq!(store.pinned()[0].spec, PortSpec::unix("/run/docker.sock", "/tmp/vm-docker.sock"));
    }

    #[test]
    fn test_invalid_entries() {
        assert!(invalid("[[forwards]]\nhost_port = 1").contains("required"));
        assert!(invalid("[[forwards]]\nguest_port = 1\nguest_port_range = [1, 2]").contains("mutually exclusive"));
        assert!(invalid("[[forwards]]\nguest_port_range = [10, 1]").contains("empty"));
        assert!(invalid("[[forwards]]\nguest_port_range = [1, 10]\nhost_port_range = [1, 5]").contains("length"));
        assert!(invalid("[[forwards]]\nguest_port_range = [1, 10]\nstatic = true").contains("single"));
        assert!(invalid("[[forwards]]\nguest_socket = \"/a.sock\"\nhost_socket = \"/b.sock\"").contains("static"));
        assert!(invalid("[[forwards]]\nguest_port = 1\nignore = true\nstatic = true").contains("both"));
        assert!(invalid("[[forwards]]\nguest_port = 1\nprotocol = \"sctp\"").contains("sctp"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            ForwardsFile::parse("[[forwards]]\nguest_prot = 1"),
            Err(ForwardsFileError::Toml(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = ForwardsFile::load(Path::new("/nonexistent/forwards.toml")).unwrap_err();
        assert!(matches!(err, ForwardsFileError::Read { .. }));
    }
}
