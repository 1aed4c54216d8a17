// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Client Contributors

// VPN Client - Paths Module
// Locates the installed binaries and the daemon's data and runtime directories

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const APP_DIR_NAME: &str = "vpn-client";
const SOCKET_FILE_NAME: &str = "vpn-client.sock";

/// Directory holding the daemon executable and the binaries installed next to it
pub fn root_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to locate daemon executable")?;
    let exe = exe.canonicalize().unwrap_or(exe);
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow::anyhow!("Daemon executable has no parent directory"))
}

/// Per-user configuration directory: ~/.config/vpn-client
pub fn config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
}

/// Runtime directory for the socket and PID file
pub fn runtime_dir() -> Result<PathBuf> {
    dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .map(|dir| dir.join(APP_DIR_NAME))
        .ok_or_else(|| anyhow::anyhow!("Could not determine runtime directory"))
}

/// Default location of the control socket
pub fn socket_path() -> Result<PathBuf> {
    Ok(runtime_dir()?.join(SOCKET_FILE_NAME))
}

/// Default directory for per-profile tunnel configs, credentials and hooks
pub fn default_work_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
        .join("profiles")
}
