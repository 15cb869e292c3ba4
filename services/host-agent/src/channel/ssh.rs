//! OpenSSH ControlMaster control connection.
//!
//! Forwards are installed with `ssh -O forward` against a persistent master
//! socket. Failures are classified from the client's stderr.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};
use vmfwd_reconcile::Protocol;

use super::{ChannelError, ControlChannel, ForwardTuple};

/// Options passed to every ssh invocation unless overridden.
pub const DEFAULT_SSH_OPTIONS: &[&str] = &[
    "BatchMode=yes",
    "StrictHostKeyChecking=no",
    "UserKnownHostsFile=/dev/null",
    "LogLevel=ERROR",
];

/// SSH connection configuration.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Path to the ssh client binary.
    pub ssh_binary: PathBuf,

    /// Host to connect to.
    pub destination: String,

    pub port: u16,

    pub user: Option<String>,

    pub identity_file: Option<PathBuf>,

    /// ControlMaster socket path.
    pub control_path: PathBuf,

    /// Extra `-o` options.
    pub options: Vec<String>,

    /// Upper bound on a single ssh invocation.
    pub command_timeout: Duration,
}

impl SshConfig {
    pub fn new(destination: impl Into<String>, port: u16, control_path: impl Into<PathBuf>) -> Self {
        Self {
            ssh_binary: PathBuf::from("ssh"),
            destination: destination.into(),
            port,
            user: None,
            identity_file: None,
            control_path: control_path.into(),
            options: DEFAULT_SSH_OPTIONS.iter().map(|o| o.to_string()).collect(),
            command_timeout: Duration::from_secs(10),
        }
    }
}

/// Control connection backed by an OpenSSH ControlMaster.
pub struct SshMuxChannel {
    config: SshConfig,
}

impl SshMuxChannel {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.config.ssh_binary);
        cmd.arg("-S")
            .arg(&self.config.control_path)
            .arg("-p")
            .arg(self.config.port.to_string());
        if let Some(user) = &self.config.user {
            cmd.arg("-l").arg(user);
        }
        if let Some(identity) = &self.config.identity_file {
            cmd.arg("-i").arg(identity);
        }
        for option in &self.config.options {
            cmd.arg("-o").arg(option);
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    /// Run a mux client command and classify its failure.
    async fn run_control(&self, args: &[&str]) -> Result<(), ChannelError> {
        let mut cmd = self.base_command();
        cmd.args(args)
            .arg(&self.config.destination)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(self.config.command_timeout, cmd.output())
            .await
            .map_err(|_| ChannelError::Busy(format!("ssh {} timed out", args.join(" "))))??;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(args = %args.join(" "), stderr = %stderr.trim(), "ssh control command failed");
        Err(classify_ssh_failure(&stderr))
    }
}

/// `-L` argument for a tuple.
fn forward_argument(tuple: &ForwardTuple) -> Result<String, ChannelError> {
    if let Some(port) = tuple.relay_port {
        return Err(ChannelError::Unsupported(format!(
            "ssh cannot carry a vsock relay (port {port})"
        )));
    }
    if tuple.protocol == Protocol::Udp {
        return Err(ChannelError::Unsupported("ssh cannot forward udp".to_string()));
    }
    Ok(format!("{}:{}", tuple.bind, tuple.connect))
}

/// Map ssh client stderr to a channel error.
pub fn classify_ssh_failure(stderr: &str) -> ChannelError {
    let message = stderr.trim().to_string();
    let lower = message.to_ascii_lowercase();

    if lower.contains("control socket connect")
        || lower.contains("master is not running")
        || lower.contains("read from master failed")
        || lower.contains("broken pipe")
        || lower.contains("connection closed")
    {
        return ChannelError::ConnectionDown(message);
    }
    if lower.contains("not forwarded") || lower.contains("unknown forwarding") {
        return ChannelError::NotFound(message);
    }
    if lower.contains("address already in use")
        || lower.contains("cannot listen")
        || lower.contains("port forwarding failed")
    {
        return ChannelError::AddressInUse(message);
    }
    if lower.contains("permission denied") || lower.contains("privileged port") {
        return ChannelError::PermissionDenied(message);
    }
    if lower.contains("bad local forwarding") || lower.contains("bad forwarding") || lower.contains("invalid") {
        return ChannelError::InvalidAddress(message);
    }
    if lower.contains("connection refused") {
        return ChannelError::Refused(message);
    }
    ChannelError::Busy(message)
}

#[async_trait]
impl ControlChannel for SshMuxChannel {
    async fn add_forward(&self, tuple: &ForwardTuple) -> Result<(), ChannelError> {
        let spec = forward_argument(tuple)?;
        self.run_control(&["-O", "forward", "-L", &spec]).await
    }

    async fn cancel_forward(&self, tuple: &ForwardTuple) -> Result<(), ChannelError> {
        let spec = forward_argument(tuple)?;
        self.run_control(&["-O", "cancel", "-L", &spec]).await
    }

    async fn check_alive(&self) -> bool {
        self.run_control(&["-O", "check"]).await.is_ok()
    }

    async fn reconnect(&self) -> Result<(), ChannelError> {
        // a wedged master keeps its socket; ask it to exit first
        let _ = self.run_control(&["-O", "exit"]).await;
        if let Err(e) = std::fs::remove_file(&self.config.control_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.config.control_path.display(), error = %e, "Failed to remove control socket");
            }
        }

        // the backgrounded master inherits stderr, so only the exit status is read
        let mut cmd = self.base_command();
        cmd.args(["-M", "-N", "-f", "-o", "ControlPersist=yes"])
            .arg(&self.config.destination)
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let status = tokio::time::timeout(self.config.command_timeout, cmd.status())
            .await
            .map_err(|_| ChannelError::ConnectionDown("ssh master start timed out".to_string()))??;

        if !status.success() {
            return Err(ChannelError::ConnectionDown(format!("ssh master exited with {status}")));
        }

        info!(
            destination = %self.config.destination,
            control_path = %self.config.control_path.display(),
            "ssh control master started"
        );
        Ok(())
    }
}
