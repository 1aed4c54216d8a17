// VPN Client - Daemon Config Module
// Listener mode, auth, tunnel binary location and timing knobs

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bus::DEFAULT_MAILBOX_CAPACITY;
use crate::gateway::GatewaySettings;
use crate::manager::ManagerSettings;
use crate::paths;
use crate::permissions::{self, MODE_PRIVATE_FILE};

const CONFIG_FILE_NAME: &str = "daemon.toml";
const TUNNEL_BINARY_NAME: &str = "openvpn";

/// Listener mode for the daemon
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ListenerMode {
    /// Unix domain socket (local-only)
    #[default]
    UnixSocket,
    /// Plain HTTP on a loopback TCP port
    TcpHttp,
}

/// Daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub listener_mode: ListenerMode,

    /// Host for tcp-http mode; must be loopback
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    #[serde(default = "default_auth_token_path")]
    pub auth_token_path: PathBuf,

    /// Require the Auth-Key header on every request
    #[serde(default = "default_require_auth")]
    pub require_auth: bool,

    /// Enable group access to the socket and runtime directory
    /// (0770/0660 instead of 0700/0600)
    #[serde(default)]
    pub group_access: bool,

    /// Overrides the directory the daemon was installed to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_dir: Option<PathBuf>,

    /// Tunnel executable; defaults to `openvpn` inside the root directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_binary: Option<PathBuf>,

    /// Where per-profile configs, credentials and hooks are written
    #[serde(default = "paths::default_work_dir")]
    pub work_dir: PathBuf,

    /// Events buffered per subscriber before deliveries are dropped
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    #[serde(default = "default_connect_grace_secs")]
    pub connect_grace_secs: u64,

    /// Limit for profiles that must report initialization before they count as up
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,

    #[serde(default = "default_down_hook_timeout_secs")]
    pub down_hook_timeout_secs: u64,

    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_ping_wait_secs")]
    pub ping_wait_secs: u64,

    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,

    /// Watch for the application being uninstalled after a stop request
    #[serde(default = "default_autoclean")]
    pub autoclean: bool,
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_port() -> u16 {
    9770
}

fn default_auth_token_path() -> PathBuf {
    paths::config_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("daemon.token")
}

fn default_require_auth() -> bool {
    true
}

fn default_mailbox_capacity() -> usize {
    DEFAULT_MAILBOX_CAPACITY
}

fn default_connect_grace_secs() -> u64 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    60
}

fn default_stop_timeout_secs() -> u64 {
    10
}

fn default_down_hook_timeout_secs() -> u64 {
    10
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_ping_wait_secs() -> u64 {
    40
}

fn default_write_timeout_secs() -> u64 {
    10
}

fn default_autoclean() -> bool {
    true
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listener_mode: ListenerMode::default(),
            bind_host: default_bind_host(),
            bind_port: default_bind_port(),
            auth_token_path: default_auth_token_path(),
            require_auth: default_require_auth(),
            group_access: false,
            root_dir: None,
            tunnel_binary: None,
            work_dir: paths::default_work_dir(),
            mailbox_capacity: default_mailbox_capacity(),
            connect_grace_secs: default_connect_grace_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            down_hook_timeout_secs: default_down_hook_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            ping_wait_secs: default_ping_wait_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            autoclean: default_autoclean(),
        }
    }
}

impl DaemonConfig {
    /// Validate the daemon configuration
    pub fn validate(&self) -> Result<()> {
        if self.listener_mode == ListenerMode::TcpHttp && !is_loopback_host(&self.bind_host) {
            anyhow::bail!(
                "Security violation: tcp-http mode must bind a loopback host (bind_host: {}).\n\
                 Use 127.0.0.1, ::1 or localhost, or switch listener_mode to 'unix-socket'.",
                self.bind_host
            );
        }

        if self.mailbox_capacity == 0 {
            anyhow::bail!("mailbox_capacity must be greater than zero");
        }

        for (name, value) in [
            ("connect_grace_secs", self.connect_grace_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("stop_timeout_secs", self.stop_timeout_secs),
            ("down_hook_timeout_secs", self.down_hook_timeout_secs),
            ("ping_interval_secs", self.ping_interval_secs),
            ("ping_wait_secs", self.ping_wait_secs),
            ("write_timeout_secs", self.write_timeout_secs),
        ] {
            if value == 0 {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }

        if self.ping_wait_secs <= self.ping_interval_secs {
            anyhow::bail!(
                "ping_wait_secs ({}) must be longer than ping_interval_secs ({})",
                self.ping_wait_secs,
                self.ping_interval_secs
            );
        }

        Ok(())
    }

    /// Load daemon configuration from the default location, creating it
    /// with defaults on first run
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            info!("No daemon configuration found, using defaults");
            info!("Configuration will be saved to: {}", config_path.display());
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let contents = fs::read_to_string(config_path)
            .context("Failed to read daemon configuration")?;

        let config: Self = toml::from_str(&contents)
            .context("Failed to parse daemon configuration")?;

        config.validate()
            .context("Configuration validation failed")?;

        info!("Loaded daemon configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Write the configuration as TOML with mode 0600
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create configuration directory")?;
        }

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize daemon configuration")?;

        permissions::write_with_mode(config_path, contents.as_bytes(), MODE_PRIVATE_FILE)
            .context("Failed to write daemon configuration")?;

        info!("Saved daemon configuration to: {}", config_path.display());
        Ok(())
    }

    /// Get the path to the daemon configuration file
    pub fn config_path() -> Result<PathBuf> {
        Ok(paths::config_dir()?.join(CONFIG_FILE_NAME))
    }

    /// `host:port` for tcp-http mode
    pub fn bind_address(&self) -> String {
        match self.bind_host.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.bind_port),
            _ => format!("{}:{}", self.bind_host, self.bind_port),
        }
    }

    /// Directory the daemon and its bundled binaries live in
    pub fn resolve_root_dir(&self) -> Result<PathBuf> {
        match &self.root_dir {
            Some(dir) => Ok(dir.clone()),
            None => paths::root_dir(),
        }
    }

    pub fn resolve_tunnel_binary(&self) -> Result<PathBuf> {
        match &self.tunnel_binary {
            Some(binary) => Ok(binary.clone()),
            None => Ok(self.resolve_root_dir()?.join(TUNNEL_BINARY_NAME)),
        }
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            connect_grace: Duration::from_secs(self.connect_grace_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            down_hook_timeout: Duration::from_secs(self.down_hook_timeout_secs),
        }
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            ping_wait: Duration::from_secs(self.ping_wait_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            ..GatewaySettings::default()
        }
    }
}

fn is_loopback_host(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}
