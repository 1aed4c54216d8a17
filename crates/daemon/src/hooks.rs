// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Client Contributors

// VPN Client - Hook Scripts Module
// Installs per-profile tunnel files and runs the down-hook on teardown

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use vpn_client_common::{Error, ProfileConfig, Result};

use crate::permissions::{self, MODE_PRIVATE_EXEC, MODE_PRIVATE_FILE};

#[cfg(target_os = "macos")]
const UP_SCRIPT: &str = include_str!("../scripts/darwin-up.sh");
#[cfg(target_os = "macos")]
const DOWN_SCRIPT: &str = include_str!("../scripts/darwin-down.sh");

// Elsewhere the tunnel binary manages resolver state itself
#[cfg(not(target_os = "macos"))]
const UP_SCRIPT: &str = include_str!("../scripts/noop.sh");
#[cfg(not(target_os = "macos"))]
const DOWN_SCRIPT: &str = include_str!("../scripts/noop.sh");

const SPAWN_ATTEMPTS: u32 = 3;

/// Files on disk backing one running profile
#[derive(Debug, Clone)]
pub struct ProfileFiles {
    pub profile_id: String,
    /// Tunnel configuration (`data` of the profile)
    pub config: PathBuf,
    /// Username/password file, present only when the profile carries credentials
    pub auth: Option<PathBuf>,
    pub up_hook: PathBuf,
    pub down_hook: PathBuf,
}

impl ProfileFiles {
    /// Environment handed to hook scripts
    pub fn hook_env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("config", self.config.display().to_string()),
            ("profile_id", self.profile_id.clone()),
        ]
    }

    /// Remove the files that only live for the duration of a connection
    pub fn remove_transient(&self) {
        if let Some(auth) = &self.auth {
            if let Err(e) = fs::remove_file(auth) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove credentials file {}: {}", auth.display(), e);
                }
            }
        }
    }
}

/// Installs hook artifacts and tunnel files into the work directory
#[derive(Debug, Clone)]
pub struct HookScripts {
    work_dir: PathBuf,
}

impl HookScripts {
    pub fn new(work_dir: PathBuf) -> Self {
        Self { work_dir }
    }

    /// Write the profile's config, credentials and default hooks.
    ///
    /// Custom hook paths from the profile are used as-is.
    pub fn install(&self, profile: &ProfileConfig) -> Result<ProfileFiles> {
        permissions::ensure_directory_with_permissions(&self.work_dir, false)
            .map_err(into_io_error)?;

        let id = &profile.id;
        let config = self.work_dir.join(format!("{}.conf", id));
        write_file(&config, profile.data.as_bytes(), MODE_PRIVATE_FILE)?;

        let auth = match &profile.credentials {
            Some(credentials) => {
                let path = self.work_dir.join(format!("{}.auth", id));
                let contents = zeroize::Zeroizing::new(format!(
                    "{}\n{}\n",
                    credentials.username, credentials.password
                ));
                write_file(&path, contents.as_bytes(), MODE_PRIVATE_FILE)?;
                Some(path)
            }
            None => None,
        };

        let up_hook = match &profile.up_script {
            Some(path) => path.clone(),
            None => {
                let path = self.work_dir.join(format!("{}-up.sh", id));
                write_file(&path, UP_SCRIPT.as_bytes(), MODE_PRIVATE_EXEC)?;
                path
            }
        };
        let down_hook = match &profile.down_script {
            Some(path) => path.clone(),
            None => {
                let path = self.work_dir.join(format!("{}-down.sh", id));
                write_file(&path, DOWN_SCRIPT.as_bytes(), MODE_PRIVATE_EXEC)?;
                path
            }
        };

        debug!("Installed tunnel files for profile {} in {}", id, self.work_dir.display());

        Ok(ProfileFiles {
            profile_id: id.clone(),
            config,
            auth,
            up_hook,
            down_hook,
        })
    }
}

fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    permissions::write_with_mode(path, contents, mode).map_err(into_io_error)
}

// Keep the path context but report it as the I/O failure it is
fn into_io_error(e: anyhow::Error) -> Error {
    let kind = e
        .downcast_ref::<std::io::Error>()
        .map_or(std::io::ErrorKind::Other, |io| io.kind());
    Error::Io(std::io::Error::new(kind, format!("{:#}", e)))
}

/// Run the profile's down-hook and wait for it, at most `timeout`.
///
/// On timeout the hook process is killed.
pub async fn run_down_hook(files: &ProfileFiles, timeout: Duration) -> Result<()> {
    let child = spawn_hook(&files.down_hook, &files.hook_env()).await?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Err(_) => Err(Error::Hook(format!(
            "{} timed out after {:?}",
            files.down_hook.display(),
            timeout
        ))),
        Ok(Err(e)) => Err(Error::Hook(format!(
            "failed waiting for {}: {}",
            files.down_hook.display(),
            e
        ))),
        Ok(Ok(output)) if !output.status.success() => Err(Error::Hook(format!(
            "{} exited with {}: {}",
            files.down_hook.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
        Ok(Ok(_)) => Ok(()),
    }
}

// A freshly written script can briefly report ETXTBSY while a concurrently
// forked child still holds the write descriptor.
async fn spawn_hook(path: &Path, env: &[(&'static str, String)]) -> Result<Child> {
    let mut attempt = 1;
    loop {
        let result = Command::new(path)
            .envs(env.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        match result {
            Ok(child) => return Ok(child),
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempt < SPAWN_ATTEMPTS => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => {
                return Err(Error::Hook(format!("failed to run {}: {}", path.display(), e)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;
    use vpn_client_common::Credentials;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_install_default_hooks() {
        let temp_dir = TempDir::new().unwrap();
        let hooks = HookScripts::new(temp_dir.path().join("profiles"));

        let mut profile = ProfileConfig::new("office", "client\ndev tun\n");
        profile.credentials = Some(Credentials {
            username: "alice".to_string(),
            password: "secret".to_string(),
        });

        let files = hooks.install(&profile).unwrap();
        assert_eq!(fs::read_to_string(&files.config).unwrap(), "client\ndev tun\n");
        assert!(files.up_hook.ends_with("office-up.sh"));
        assert!(files.down_hook.ends_with("office-down.sh"));

        let auth = files.auth.clone().unwrap();
        assert_eq!(fs::read_to_string(&auth).unwrap(), "alice\nsecret\n");
        let mode = fs::metadata(&auth).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        let mode = fs::metadata(&files.down_hook).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);

        files.remove_transient();
        assert!(!auth.exists());
    }

    #[test]
    fn test_install_keeps_custom_hooks() {
        let temp_dir = TempDir::new().unwrap();
        let hooks = HookScripts::new(temp_dir.path().to_path_buf());

        let mut profile = ProfileConfig::new("home", "client");
        profile.down_script = Some(PathBuf::from("/opt/vpn/down.sh"));

        let files = hooks.install(&profile).unwrap();
        assert_eq!(files.down_hook, PathBuf::from("/opt/vpn/down.sh"));
        assert!(files.up_hook.ends_with("home-up.sh"));
        assert!(files.auth.is_none());
    }

    #[test]
    fn test_install_reports_io_failure() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();
        let hooks = HookScripts::new(blocker.join("work"));

        let err = hooks.install(&ProfileConfig::new("office", "client")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("not-a-dir"));
    }

    #[tokio::test]
    async fn test_run_down_hook_success_and_env() {
        let temp_dir = TempDir::new().unwrap();
        let marker = temp_dir.path().join("marker");
        let down = script(
            temp_dir.path(),
            "down.sh",
            &format!("#!/bin/sh\necho \"$profile_id\" >> {}\n", marker.display()),
        );

        let hooks = HookScripts::new(temp_dir.path().join("work"));
        let mut profile = ProfileConfig::new("p1", "client");
        profile.down_script = Some(down);
        let files = hooks.install(&profile).unwrap();

        run_down_hook(&files, Duration::from_secs(5)).await.unwrap();
        assert_eq!(fs::read_to_string(&marker).unwrap(), "p1\n");
    }

    #[tokio::test]
    async fn test_run_down_hook_failure() {
        let temp_dir = TempDir::new().unwrap();
        let down = script(temp_dir.path(), "down.sh", "#!/bin/sh\necho broken >&2\nexit 3\n");

        let hooks = HookScripts::new(temp_dir.path().join("work"));
        let mut profile = ProfileConfig::new("p1", "client");
        profile.down_script = Some(down);
        let files = hooks.install(&profile).unwrap();

        let err = run_down_hook(&files, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::Hook(_)));
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test]
    async fn test_run_down_hook_timeout() {
        let temp_dir = TempDir::new().unwrap();
        let down = script(temp_dir.path(), "down.sh", "#!/bin/sh\nsleep 30\n");

        let hooks = HookScripts::new(temp_dir.path().join("work"));
        let mut profile = ProfileConfig::new("p1", "client");
        profile.down_script = Some(down);
        let files = hooks.install(&profile).unwrap();

        let started = std::time::Instant::now();
        let err = run_down_hook(&files, Duration::from_millis(200)).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
