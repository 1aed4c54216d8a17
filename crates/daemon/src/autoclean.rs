// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Client Contributors

// VPN Client - Auto-Clean Module
// After a stop-all request, watch for the desktop app being deleted and
// remove the rest of the installation when it is

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const SYSTEM_ROOT_DIR: &str = "/usr/local/bin";
const APP_BUNDLE: &str = "/Applications/VPN Client.app";
const POLL_INTERVAL: Duration = Duration::from_secs(10);
const POLL_ATTEMPTS: u32 = 30;
// Never remove anything this close to the filesystem root
const MIN_PATH_COMPONENTS: usize = 3;

const INSTALLED_PATHS: &[&str] = &[
    "/usr/local/bin/vpn-client-openvpn",
    "/usr/local/bin/vpn-client-daemon",
    "/private/var/db/receipts/com.vpnclient.pkg.bom",
    "/private/var/db/receipts/com.vpnclient.pkg.plist",
    "/var/lib/vpn-client",
    "/var/log/vpn-client.log",
    "/Library/LaunchAgents/com.vpnclient.client.plist",
    "/Library/LaunchDaemons/com.vpnclient.daemon.plist",
];

/// Invoked after every stop-all request
pub trait CleanupWatch: Send + Sync {
    fn schedule(&self);
}

/// Used where the daemon is not a system-wide macOS install
#[derive(Debug, Default)]
pub struct NoCleanup;

impl CleanupWatch for NoCleanup {
    fn schedule(&self) {
        debug!("Auto-clean not applicable to this installation");
    }
}

/// Polls for the app bundle; once it is gone, deletes the leftovers and
/// asks the daemon to shut down
pub struct UninstallWatch {
    app_bundle: PathBuf,
    leftovers: Vec<PathBuf>,
    poll_interval: Duration,
    attempts: u32,
    shutdown: broadcast::Sender<()>,
    watching: Arc<AtomicBool>,
}

impl UninstallWatch {
    pub fn new(
        app_bundle: PathBuf,
        leftovers: Vec<PathBuf>,
        poll_interval: Duration,
        attempts: u32,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            app_bundle,
            leftovers,
            poll_interval,
            attempts,
            shutdown,
            watching: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The watch for this installation, or a no-op outside a system-wide
    /// macOS install
    pub fn for_installation(
        enabled: bool,
        root_dir: &Path,
        shutdown: broadcast::Sender<()>,
    ) -> Arc<dyn CleanupWatch> {
        if !enabled || !cfg!(target_os = "macos") || root_dir != Path::new(SYSTEM_ROOT_DIR) {
            return Arc::new(NoCleanup);
        }

        let mut leftovers: Vec<PathBuf> = INSTALLED_PATHS.iter().map(PathBuf::from).collect();
        leftovers.push(PathBuf::from(APP_BUNDLE));
        Arc::new(Self::new(
            PathBuf::from(APP_BUNDLE),
            leftovers,
            POLL_INTERVAL,
            POLL_ATTEMPTS,
            shutdown,
        ))
    }

    /// Returns true if the app was gone and the leftovers were removed
    fn check_and_clean(app_bundle: &Path, leftovers: &[PathBuf]) -> io::Result<bool> {
        if app_bundle.exists() {
            return Ok(false);
        }

        info!("{} was removed, cleaning up installation", app_bundle.display());
        let mut result = Ok(true);
        for path in leftovers {
            if let Err(e) = remove_path(path) {
                warn!("Failed to remove {}: {}", path.display(), e);
                result = Err(e);
            }
        }
        result
    }
}

impl CleanupWatch for UninstallWatch {
    fn schedule(&self) {
        if self.watching.swap(true, Ordering::SeqCst) {
            debug!("Uninstall watch already running");
            return;
        }

        let app_bundle = self.app_bundle.clone();
        let leftovers = self.leftovers.clone();
        let poll_interval = self.poll_interval;
        let attempts = self.attempts;
        let shutdown = self.shutdown.clone();
        let watching = self.watching.clone();

        tokio::spawn(async move {
            for _ in 0..attempts {
                tokio::time::sleep(poll_interval).await;
                match Self::check_and_clean(&app_bundle, &leftovers) {
                    Ok(false) => continue,
                    Ok(true) => {
                        info!("Installation removed, shutting down");
                        let _ = shutdown.send(());
                        break;
                    }
                    Err(e) => {
                        error!("Auto-clean failed: {}", e);
                        break;
                    }
                }
            }
            watching.store(false, Ordering::SeqCst);
        });
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    if path.components().count() < MIN_PATH_COMPONENTS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to remove {}", path.display()),
        ));
    }

    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn watch(dir: &TempDir, shutdown: broadcast::Sender<()>) -> UninstallWatch {
        let leftovers = vec![
            dir.path().join("bin").join("vpn-client-daemon"),
            dir.path().join("lib"),
            dir.path().join("never-installed"),
        ];
        UninstallWatch::new(
            dir.path().join("VPN Client.app"),
            leftovers,
            Duration::from_millis(10),
            5,
            shutdown,
        )
    }

    fn install(dir: &TempDir) {
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("bin").join("vpn-client-daemon"), "bin").unwrap();
        fs::create_dir_all(dir.path().join("lib").join("state")).unwrap();
        fs::write(dir.path().join("lib").join("state").join("db"), "x").unwrap();
    }

    #[tokio::test]
    async fn test_missing_app_triggers_cleanup_and_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        install(&temp_dir);
        let (shutdown, mut shutdown_rx) = broadcast::channel(1);

        watch(&temp_dir, shutdown).schedule();

        tokio::time::timeout(Duration::from_secs(5), shutdown_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!temp_dir.path().join("bin").join("vpn-client-daemon").exists());
        assert!(!temp_dir.path().join("lib").exists());
    }

    #[tokio::test]
    async fn test_present_app_leaves_installation_alone() {
        let temp_dir = TempDir::new().unwrap();
        install(&temp_dir);
        fs::create_dir_all(temp_dir.path().join("VPN Client.app")).unwrap();
        let (shutdown, mut shutdown_rx) = broadcast::channel(1);

        let watch = watch(&temp_dir, shutdown);
        watch.schedule();

        let waited = tokio::time::timeout(Duration::from_millis(300), shutdown_rx.recv()).await;
        assert!(waited.is_err());
        assert!(temp_dir.path().join("lib").exists());
        assert!(!watch.watching.load(Ordering::SeqCst));
    }

    #[test]
    fn test_refuses_shallow_paths() {
        assert!(remove_path(Path::new("/usr")).is_err());
    }

    #[test]
    fn test_not_applicable_outside_system_install() {
        let (shutdown, _) = broadcast::channel(1);
        // Both resolve to the no-op, which needs no runtime
        UninstallWatch::for_installation(true, Path::new("/opt/vpn"), shutdown.clone()).schedule();
        UninstallWatch::for_installation(false, Path::new(SYSTEM_ROOT_DIR), shutdown).schedule();
    }
}
