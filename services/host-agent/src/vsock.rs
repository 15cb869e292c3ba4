//! Vsock relay port allocation.
//!
//! Ports are drawn at random from a configured range. A candidate is first
//! claimed with an exclusively created file in a claims directory shared by
//! every agent on the host, then checked against the live vsock table. The
//! claim file is what makes two allocators never hand out the same port; the
//! probe catches ports held by processes that do not use claim files.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};
use vmfwd_reconcile::ForwardKey;

/// Lowest port handed out by default; lower ports are privileged.
pub const VSOCK_PORT_MIN: u32 = 1024;

/// Highest port handed out by default.
pub const VSOCK_PORT_MAX: u32 = 0x7fff_ffff;

/// Random candidates tried before giving up.
pub const DEFAULT_PROBE_ATTEMPTS: u32 = 64;

const CLAIM_SUFFIX: &str = "claim";

/// A relay port held on behalf of one forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsockAllocation {
    pub port: u32,
    pub owner: ForwardKey,
}

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("no free vsock port in {min}..={max} after {attempts} attempts")]
    ResourceExhausted { min: u32, max: u32, attempts: u32 },

    #[error("invalid vsock port range {min}..={max}")]
    InvalidRange { min: u32, max: u32 },

    #[error("vsock claim error: {0}")]
    Io(#[from] io::Error),
}

/// Authoritative check of whether a vsock port is bound on this host.
pub trait PortProbe: Send + Sync {
    fn in_use(&self, port: u32) -> io::Result<bool>;
}

/// Probes by binding a host-side vsock listener.
#[cfg(target_os = "linux")]
#[derive(Debug, Default)]
pub struct VsockBindProbe;

#[cfg(target_os = "linux")]
impl PortProbe for VsockBindProbe {
    fn in_use(&self, port: u32) -> io::Result<bool> {
        use vsock::{VsockAddr, VsockListener, VMADDR_CID_HOST};

        match VsockListener::bind(&VsockAddr::new(VMADDR_CID_HOST, port)) {
            Ok(listener) => {
                drop(listener);
                Ok(false)
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => Ok(true),
            Err(e) => Err(e),
        }
    }
}

/// Trusts claim files alone, for hosts without a probeable vsock table.
#[derive(Debug, Default)]
pub struct ClaimOnlyProbe;

impl PortProbe for ClaimOnlyProbe {
    fn in_use(&self, _port: u32) -> io::Result<bool> {
        Ok(false)
    }
}

/// The probe for this host platform.
pub fn host_probe() -> Box<dyn PortProbe> {
    #[cfg(target_os = "linux")]
    {
        Box::new(VsockBindProbe)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(ClaimOnlyProbe)
    }
}

/// Allocates unique vsock relay ports.
pub struct VsockPortAllocator {
    claims_dir: PathBuf,
    min: u32,
    max: u32,
    max_attempts: u32,
    probe: Box<dyn PortProbe>,
    held: Mutex<BTreeSet<u32>>,
}

impl VsockPortAllocator {
    /// Create an allocator over `min..=max`.
    ///
    /// Claims left behind by processes that no longer exist are removed.
    pub fn new(
        claims_dir: impl Into<PathBuf>,
        min: u32,
        max: u32,
        max_attempts: u32,
        probe: Box<dyn PortProbe>,
    ) -> Result<Self, AllocatorError> {
        if min > max {
            return Err(AllocatorError::InvalidRange { min, max });
        }

        let claims_dir = claims_dir.into();
        fs::create_dir_all(&claims_dir)?;

        let allocator = Self {
            claims_dir,
            min,
            max,
            max_attempts: max_attempts.max(1),
            probe,
            held: Mutex::new(BTreeSet::new()),
        };
        let swept = allocator.sweep_stale_claims()?;
        if swept > 0 {
            info!(count = swept, dir = %allocator.claims_dir.display(), "Removed stale vsock claims");
        }
        Ok(allocator)
    }

    /// Allocate a port no other allocator on this host holds.
    pub fn allocate(&self) -> Result<u32, AllocatorError> {
        let mut rng = rand::rng();

        for attempt in 0..self.max_attempts {
            let port = rng.random_range(self.min..=self.max);
            if self.lock_held().contains(&port) {
                continue;
            }
            if !self.claim(port)? {
                continue;
            }

            match self.probe.in_use(port) {
                Ok(false) => {
                    self.lock_held().insert(port);
                    debug!(port, attempt, "Allocated vsock port");
                    return Ok(port);
                }
                Ok(true) => {
                    debug!(port, "vsock port bound outside the claims directory");
                    self.remove_claim(port);
                }
                Err(e) => {
                    self.remove_claim(port);
                    return Err(e.into());
                }
            }
        }

        Err(AllocatorError::ResourceExhausted {
            min: self.min,
            max: self.max,
            attempts: self.max_attempts,
        })
    }

    /// Return a port to the pool.
    pub fn release(&self, port: u32) {
        if self.lock_held().remove(&port) {
            self.remove_claim(port);
            debug!(port, "Released vsock port");
        }
    }

    /// Ports held by this allocator.
    pub fn held(&self) -> Vec<u32> {
        self.lock_held().iter().copied().collect()
    }

    fn lock_held(&self) -> std::sync::MutexGuard<'_, BTreeSet<u32>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim_path(&self, port: u32) -> PathBuf {
        self.claims_dir.join(format!("{port}.{CLAIM_SUFFIX}"))
    }

    /// Create the claim file. `false` when another claim exists.
    fn claim(&self, port: u32) -> Result<bool, AllocatorError> {
        self.claim_with(port, |file| writeln!(file, "{}", std::process::id()))
    }

    fn claim_with<F>(&self, port: u32, write_owner: F) -> Result<bool, AllocatorError>
    where
        F: FnOnce(&mut File) -> io::Result<()>,
    {
        let path = self.claim_path(port);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                // an ownerless claim would never be swept
                if let Err(e) = write_owner(&mut file) {
                    drop(file);
                    self.remove_claim(port);
                    return Err(e.into());
                }
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_claim(&self, port: u32) {
        let path = self.claim_path(port);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove vsock claim");
            }
        }
    }

    fn sweep_stale_claims(&self) -> io::Result<usize> {
        let mut swept = 0;
        for entry in fs::read_dir(&self.claims_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CLAIM_SUFFIX) {
                continue;
            }
            let Some(pid) = read_claim_owner(&path) else {
                continue;
            };
            if process_alive(pid) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => swept += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(swept)
    }
}

impl Drop for VsockPortAllocator {
    fn drop(&mut self) {
        let held = std::mem::take(&mut *self.lock_held());
        for port in held {
            self.remove_claim(port);
        }
    }
}

fn read_claim_owner(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks for existence and permission.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tempfile::TempDir;

    use super::*;

    struct FixedProbe(HashSet<u32>);

    impl PortProbe for FixedProbe {
        fn in_use(&self, port: u32) -> io::Result<bool> {
            Ok(self.0.contains(&port))
        }
    }

    fn allocator(dir: &Path, min: u32, max: u32, attempts: u32) -> VsockPortAllocator {
        VsockPortAllocator::new(dir, min, max, attempts, Box::new(ClaimOnlyProbe)).unwrap()
    }

    #[test]
    fn test_allocate_writes_claim() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(dir.path(), 5000, 5000, 4);

        let port = alloc.allocate().unwrap();
        assert_eq!(port, 5000);
        let owner = read_claim_owner(&dir.path().join("5000.claim")).unwrap();
        assert_eq!(owner, std::process::id());
    }

    #[test]
    fn test_exhausted_range() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(dir.path(), 5000, 5000, 8);

        alloc.allocate().unwrap();
        assert!(matches!(alloc.allocate(), Err(AllocatorError::ResourceExhausted { .. })));
    }

    #[test]
    fn test_release_returns_port() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(dir.path(), 5000, 5000, 8);

        let port = alloc.allocate().unwrap();
        alloc.release(port);
        assert!(!dir.path().join("5000.claim").exists());
        assert_eq!(alloc.allocate().unwrap(), 5000);
    }

    #[test]
    fn test_probe_skips_bound_port() {
        let dir = TempDir::new().unwrap();
        let probe = FixedProbe([6000].into_iter().collect());
        let alloc = VsockPortAllocator::new(dir.path(), 6000, 6001, 256, Box::new(probe)).unwrap();

        assert_eq!(alloc.allocate().unwrap(), 6001);
        assert!(!dir.path().join("6000.claim").exists());
    }

    #[test]
    fn test_separate_allocators_share_claims() {
        let dir = TempDir::new().unwrap();
        let first = allocator(dir.path(), 7000, 7001, 256);
        let second = allocator(dir.path(), 7000, 7001, 256);

        let a = first.allocate().unwrap();
        let b = second.allocate().unwrap();
        assert_ne!(a, b);
        assert!(second.allocate().is_err());
    }

    #[test]
    fn test_stale_claim_swept() {
        let dir = TempDir::new().unwrap();
        // beyond any default pid_max
        fs::write(dir.path().join("8000.claim"), "2147483000\n").unwrap();
        fs::write(dir.path().join("8001.claim"), format!("{}\n", std::process::id())).unwrap();

        let alloc = allocator(dir.path(), 8000, 8001, 256);
        assert!(!dir.path().join("8000.claim").exists());
        assert!(dir.path().join("8001.claim").exists());
        assert_eq!(alloc.allocate().unwrap(), 8000);
    }

    #[test]
    fn test_failed_owner_write_removes_claim() {
        let dir = TempDir::new().unwrap();
        let alloc = allocator(dir.path(), 9100, 9100, 4);

        let result = alloc.claim_with(9100, |_| Err(io::Error::other("disk full")));
        assert!(matches!(result, Err(AllocatorError::Io(_))));
        assert!(!dir.path().join("9100.claim").exists());

        // the port is still claimable
        assert_eq!(alloc.allocate().unwrap(), 9100);
    }

    #[test]
    fn test_drop_releases_claims() {
        let dir = TempDir::new().unwrap();
        {
            let alloc = allocator(dir.path(), 9000, 9000, 4);
            alloc.allocate().unwrap();
        }
        assert!(!dir.path().join("9000.claim").exists());
    }

    #[test]
    fn test_invalid_range() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            VsockPortAllocator::new(dir.path(), 10, 5, 1, Box::new(ClaimOnlyProbe)),
            Err(AllocatorError::InvalidRange { .. })
        ));
    }
}
