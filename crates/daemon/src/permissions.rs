// Permissions and security hardening for daemon files and directories

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::debug;

/// Owner read/write: configs, credentials, tokens
pub const MODE_PRIVATE_FILE: u32 = 0o600;
/// Owner read/write/execute: installed hook scripts
pub const MODE_PRIVATE_EXEC: u32 = 0o700;

/// Set umask to 0077 so every file the daemon creates starts owner-only.
/// Call early in main() before creating any files.
pub fn set_restrictive_umask() {
    unsafe {
        libc::umask(0o077);
    }
    debug!("Set restrictive umask: 0077");
}

/// Apply an explicit mode to a file or directory
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set permissions {:o} on {}", mode, path.display()))?;
    debug!("Set permissions to {:o}: {}", mode, path.display());
    Ok(())
}

/// Write a file and restrict it to `mode` before returning
pub fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
    set_mode(path, mode)
}

/// Socket mode: 0660 with group access, 0600 otherwise
pub fn set_socket_permissions(path: &Path, group_access: bool) -> Result<()> {
    set_mode(path, if group_access { 0o660 } else { 0o600 })
}

/// Create a directory (and parents) and apply 0770/0700 depending on group access
pub fn ensure_directory_with_permissions(path: &Path, group_access: bool) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory {}", path.display()))?;
        debug!("Created directory: {}", path.display());
    }
    set_mode(path, if group_access { 0o770 } else { 0o700 })
}
