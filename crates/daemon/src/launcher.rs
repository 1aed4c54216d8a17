// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Client Contributors

// VPN Client - Tunnel Launcher Module
// Spawns the external tunnel subprocess for a profile

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use vpn_client_common::{Error, ProfileConfig, Result};

use crate::hooks::ProfileFiles;

/// Starts tunnel subprocesses
///
/// The returned child must have piped stdout and stderr; the supervisor
/// reads both and owns the process from then on.
#[async_trait]
pub trait TunnelLauncher: Send + Sync {
    async fn launch(&self, profile: &ProfileConfig, files: &ProfileFiles) -> Result<Child>;
}

/// Launches the OpenVPN binary shipped next to the daemon
#[derive(Debug, Clone)]
pub struct OpenVpnLauncher {
    binary: PathBuf,
}

impl OpenVpnLauncher {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Command-line arguments for a profile.
    ///
    /// Only the up-hook is handed to the tunnel; the daemon runs the
    /// down-hook itself once the process has been reaped.
    pub fn build_args(profile: &ProfileConfig, files: &ProfileFiles) -> Vec<String> {
        let mut args = vec![
            "--config".to_string(),
            files.config.display().to_string(),
            "--script-security".to_string(),
            "2".to_string(),
            "--up".to_string(),
            files.up_hook.display().to_string(),
            "--verb".to_string(),
            "2".to_string(),
        ];

        if let Some(remote) = &profile.remote {
            args.extend([
                "--remote".to_string(),
                remote.host.clone(),
                remote.port.to_string(),
                remote.proto.as_str().to_string(),
            ]);
        }

        if let Some(auth) = &files.auth {
            args.extend([
                "--auth-user-pass".to_string(),
                auth.display().to_string(),
                "--auth-nocache".to_string(),
            ]);
        }

        args
    }
}

#[async_trait]
impl TunnelLauncher for OpenVpnLauncher {
    async fn launch(&self, profile: &ProfileConfig, files: &ProfileFiles) -> Result<Child> {
        let args = Self::build_args(profile, files);
        debug!("Launching {} {:?}", self.binary.display(), args);

        let child = Command::new(&self.binary)
            .args(&args)
            .envs(files.hook_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", self.binary.display(), e)))?;

        info!(
            "Launched tunnel for profile {} (pid {})",
            profile.display_name(),
            child.id().unwrap_or(0)
        );
        Ok(child)
    }
}


/// Launchers for exercising the daemon without a real tunnel binary
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Runs a shell snippet in place of the tunnel
    pub(crate) struct ShellLauncher {
        script: String,
        launches: Arc<AtomicUsize>,
    }

    impl ShellLauncher {
        pub(crate) fn new(script: impl Into<String>) -> Self {
            Self {
                script: script.into(),
                launches: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Shared counter of successful launches
        pub(crate) fn launches(&self) -> Arc<AtomicUsize> {
            self.launches.clone()
        }
    }

    #[async_trait]
    impl TunnelLauncher for ShellLauncher {
        async fn launch(&self, _profile: &ProfileConfig, files: &ProfileFiles) -> Result<Child> {
            let child = Command::new("/bin/sh")
                .arg("-c")
                .arg(&self.script)
                .envs(files.hook_env())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| Error::Spawn(e.to_string()))?;
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(child)
        }
    }
}
