// VPN Client - PID File Module
// Keeps a second daemon from starting against the same runtime directory

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::paths;

const PID_FILE_NAME: &str = "daemon.pid";

/// Holds the PID file for the life of the daemon and removes it on drop
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    /// Claim the PID file in the default runtime directory
    pub fn create() -> Result<Self> {
        Self::create_in(&paths::runtime_dir()?)
    }

    /// Claim `<dir>/daemon.pid`, failing if a live process already owns it.
    ///
    /// A file left behind by a dead process is replaced.
    pub fn create_in(dir: &Path) -> Result<Self> {
        let path = dir.join(PID_FILE_NAME);

        if let Some(pid) = read_pid(&path) {
            if is_process_running(pid) && pid != std::process::id() {
                anyhow::bail!(
                    "Another daemon is already running with PID {}. \
                     Stop it first or delete {} if that process is gone.",
                    pid,
                    path.display()
                );
            }
            if pid == std::process::id() {
                anyhow::bail!("PID file {} is already held by this process", path.display());
            }
            warn!("Replacing stale PID file left by process {}", pid);
        }

        fs::create_dir_all(dir).context("Failed to create runtime directory")?;
        let pid = std::process::id();
        fs::write(&path, pid.to_string()).context("Failed to write PID file")?;

        info!("Wrote PID {} to {}", pid, path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed PID file: {}", self.path.display()),
            Err(e) => warn!("Failed to remove PID file {}: {}", self.path.display(), e),
        }
    }
}

// Unreadable or garbage contents count as no owner
fn read_pid(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;
    contents.trim().parse().ok()
}

/// kill(pid, 0) probes for existence without delivering a signal
fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the permission and existence check
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
