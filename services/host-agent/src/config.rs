//! Configuration for the host agent.
//!
//! Everything comes from `VMFWD_*` environment variables. Missing values fall
//! back to defaults; malformed ones are errors.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use vmfwd_reconcile::{
    DEFAULT_GRACE_TICKS, DEFAULT_MAX_RETRIES, DEFAULT_REESTABLISH_LIMIT, DEFAULT_REESTABLISH_WINDOW,
    DEFAULT_TICK_INTERVAL,
};

use crate::actors::BackoffPolicy;
use crate::channel::SshConfig;
use crate::observer::GuestAgentAddress;
use crate::transport::TransportMode;
use crate::vsock::{DEFAULT_PROBE_ATTEMPTS, VSOCK_PORT_MAX, VSOCK_PORT_MIN};

/// Timing and retry knobs of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileTuning {
    /// Guest poll cadence.
    pub tick_interval: Duration,

    /// Upper bound on a single guest poll.
    pub poll_timeout: Duration,

    /// Fresh ticks a discovered forward may be missing before removal.
    pub grace_ticks: u32,

    /// Retries for a transient mutation failure.
    pub max_retries: u32,

    pub backoff_base: Duration,

    pub backoff_max: Duration,

    /// Failed re-establish attempts before the connection is unavailable.
    pub reestablish_limit: u32,

    pub reestablish_window: Duration,

    /// Control-connection check cadence.
    pub health_check_interval: Duration,

    /// Status log cadence.
    pub status_interval: Duration,
}

impl Default for ReconcileTuning {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            poll_timeout: Duration::from_secs(2),
            grace_ticks: DEFAULT_GRACE_TICKS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
            reestablish_limit: DEFAULT_REESTABLISH_LIMIT,
            reestablish_window: DEFAULT_REESTABLISH_WINDOW,
            health_check_interval: Duration::from_secs(10),
            status_interval: Duration::from_secs(60),
        }
    }
}

impl ReconcileTuning {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.backoff_base,
            max: self.backoff_max,
            ..BackoffPolicy::default()
        }
    }
}

/// Host agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Instance name, used in paths and logs.
    pub instance: String,

    /// Data directory for sockets and claims.
    pub data_dir: PathBuf,

    pub guest_agent: GuestAgentAddress,

    pub ssh: SshConfig,

    /// TOML file with forward entries.
    pub forwards_file: Option<PathBuf>,

    pub transport: TransportMode,

    pub vsock_port_min: u32,

    pub vsock_port_max: u32,

    /// Claims directory shared by every agent on the host.
    pub vsock_claims_dir: PathBuf,

    pub vsock_probe_attempts: u32,

    /// Guest context id for vsock relays. Relays stay off without it.
    pub guest_cid: Option<u32>,

    pub tuning: ReconcileTuning,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let instance = lookup("VMFWD_INSTANCE").unwrap_or_else(|| "default".to_string());
        if instance.is_empty() || instance.contains('/') {
            bail!("VMFWD_INSTANCE must be a non-empty name without '/'.");
        }

        let data_dir = lookup("VMFWD_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/vmfwd"));
        let instance_dir = data_dir.join(&instance);

        let guest_agent = match lookup("VMFWD_GUEST_AGENT") {
            Some(v) => v.parse().unwrap_or_else(|never: std::convert::Infallible| match never {}),
            None => GuestAgentAddress::Unix(instance_dir.join("ga.sock")),
        };

        let ssh_port = parse_var(&lookup, "VMFWD_SSH_PORT", 60022u16)?;
        let control_path = lookup("VMFWD_SSH_CONTROL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| instance_dir.join("ssh.sock"));
        let mut ssh = SshConfig::new(
            lookup("VMFWD_SSH_DESTINATION").unwrap_or_else(|| "127.0.0.1".to_string()),
            ssh_port,
            control_path,
        );
        if let Some(binary) = lookup("VMFWD_SSH_BINARY") {
            ssh.ssh_binary = PathBuf::from(binary);
        }
        ssh.user = lookup("VMFWD_SSH_USER");
        ssh.identity_file = lookup("VMFWD_SSH_IDENTITY").map(PathBuf::from);

        let forwards_file = lookup("VMFWD_FORWARDS_FILE").map(PathBuf::from);

        let transport = lookup("VMFWD_TRANSPORT")
            .map(|v| TransportMode::from_str(&v))
            .transpose()
            .map_err(anyhow::Error::msg)
            .context("VMFWD_TRANSPORT is invalid.")?
            .unwrap_or_default();

        let vsock_port_min = parse_var(&lookup, "VMFWD_VSOCK_PORT_MIN", VSOCK_PORT_MIN)?;
        let vsock_port_max = parse_var(&lookup, "VMFWD_VSOCK_PORT_MAX", VSOCK_PORT_MAX)?;
        if vsock_port_min > vsock_port_max {
            bail!("VMFWD_VSOCK_PORT_MIN ({vsock_port_min}) exceeds VMFWD_VSOCK_PORT_MAX ({vsock_port_max}).");
        }
        let vsock_claims_dir = lookup("VMFWD_VSOCK_CLAIMS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("vsock-claims"));
        let vsock_probe_attempts = parse_var(&lookup, "VMFWD_VSOCK_PROBE_ATTEMPTS", DEFAULT_PROBE_ATTEMPTS)?.max(1);

        let guest_cid = lookup("VMFWD_GUEST_CID")
            .map(|v| v.trim().parse::<u32>())
            .transpose()
            .context("VMFWD_GUEST_CID must be a vsock context id.")?;
        if matches!(guest_cid, Some(cid) if cid <= 2) {
            bail!("VMFWD_GUEST_CID must be greater than 2.");
        }

        let tuning = load_tuning(&lookup)?;

        let log_level = lookup("VMFWD_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            instance,
            data_dir,
            guest_agent,
            ssh,
            forwards_file,
            transport,
            vsock_port_min,
            vsock_port_max,
            vsock_claims_dir,
            vsock_probe_attempts,
            guest_cid,
            tuning,
            log_level,
        })
    }
}

fn load_tuning<F>(lookup: &F) -> Result<ReconcileTuning>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = ReconcileTuning::default();

    let tuning = ReconcileTuning {
        tick_interval: parse_millis(lookup, "VMFWD_TICK_INTERVAL_MS", defaults.tick_interval)?,
        poll_timeout: parse_millis(lookup, "VMFWD_POLL_TIMEOUT_MS", defaults.poll_timeout)?,
        grace_ticks: parse_var(lookup, "VMFWD_GRACE_TICKS", defaults.grace_ticks)?,
        max_retries: parse_var(lookup, "VMFWD_MAX_RETRIES", defaults.max_retries)?,
        backoff_base: parse_millis(lookup, "VMFWD_BACKOFF_BASE_MS", defaults.backoff_base)?,
        backoff_max: parse_millis(lookup, "VMFWD_BACKOFF_MAX_MS", defaults.backoff_max)?,
        reestablish_limit: parse_var(lookup, "VMFWD_REESTABLISH_LIMIT", defaults.reestablish_limit)?.max(1),
        reestablish_window: parse_millis(lookup, "VMFWD_REESTABLISH_WINDOW_MS", defaults.reestablish_window)?,
        health_check_interval: parse_millis(
            lookup,
            "VMFWD_HEALTH_CHECK_INTERVAL_MS",
            defaults.health_check_interval,
        )?,
        status_interval: parse_millis(lookup, "VMFWD_STATUS_INTERVAL_MS", defaults.status_interval)?,
    };

    if tuning.tick_interval < Duration::from_millis(50) {
        bail!("VMFWD_TICK_INTERVAL_MS must be at least 50.");
    }
    if tuning.poll_timeout.is_zero() || tuning.poll_timeout >= tuning.tick_interval {
        bail!("VMFWD_POLL_TIMEOUT_MS must be positive and shorter than the tick interval.");
    }
    if tuning.backoff_base > tuning.backoff_max {
        bail!("VMFWD_BACKOFF_BASE_MS must not exceed VMFWD_BACKOFF_MAX_MS.");
    }
    if tuning.health_check_interval.is_zero() || tuning.status_interval.is_zero() {
        bail!("VMFWD_HEALTH_CHECK_INTERVAL_MS and VMFWD_STATUS_INTERVAL_MS must be positive.");
    }

    Ok(tuning)
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(lookup(name)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{name} must be a non-negative integer."))?
        .unwrap_or(default))
}

fn parse_millis<F>(lookup: &F, name: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let millis = parse_var(lookup, name, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}
