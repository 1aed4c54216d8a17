// Profile configuration structures sent by the UI when starting a tunnel

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Transport protocol for the tunnel endpoint
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Udp,
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
        }
    }
}

/// Endpoint override for the tunnel (otherwise taken from `data`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub host: String,
    #[serde(default = "default_vpn_port")]
    pub port: u16,
    #[serde(default)]
    pub proto: Protocol,
}

/// Username/password handed to the tunnel through a private auth file
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

// Keep the password out of logs
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}

/// Complete profile configuration needed to launch a tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Stable profile identifier
    pub id: String,
    /// Human-readable profile name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Tunnel configuration text
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteEndpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    /// Custom up-hook; the daemon installs its own when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_script: Option<PathBuf>,
    /// Custom down-hook; the daemon installs its own when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down_script: Option<PathBuf>,
    /// Only count the tunnel as up once it reports initialization, and give
    /// up with a `timeout_error` if that takes too long
    #[serde(default)]
    pub timeout: bool,
}

fn default_vpn_port() -> u16 {
    1194
}

impl ProfileConfig {
    /// Minimal profile with only an identifier and tunnel configuration
    pub fn new(id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            data: data.into(),
            remote: None,
            credentials: None,
            up_script: None,
            down_script: None,
            timeout: false,
        }
    }

    /// Validate the profile configuration
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidProfile("Profile id cannot be empty".to_string()));
        }
        // The id names files in the daemon's work directory
        if self.id.contains(['/', '\\']) || self.id.starts_with('.') {
            return Err(Error::InvalidProfile(format!(
                "Profile id '{}' must not contain path separators or start with '.'",
                self.id
            )));
        }

        if let Some(remote) = &self.remote {
            if remote.host.is_empty() {
                return Err(Error::InvalidProfile("Remote host cannot be empty".to_string()));
            }
            if remote.port == 0 {
                return Err(Error::InvalidProfile(
                    "Remote port must be greater than 0".to_string(),
                ));
            }
        }

        if let Some(credentials) = &self.credentials {
            if credentials.username.is_empty() {
                return Err(Error::InvalidProfile("Username cannot be empty".to_string()));
            }
        }

        Ok(())
    }

    /// Name for logs and UI, falling back to the id
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_validation() {
        let mut profile = ProfileConfig::new("office", "client\ndev tun\n");
        profile.remote = Some(RemoteEndpoint {
            host: "vpn.example.com".to_string(),
            port: 1194,
            proto: Protocol::Udp,
        });
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn test_invalid_profile_ids() {
        assert!(ProfileConfig::new("", "client").validate().is_err());
        assert!(ProfileConfig::new("../etc", "client").validate().is_err());
        assert!(ProfileConfig::new("a/b", "client").validate().is_err());
        assert!(ProfileConfig::new(".hidden", "client").validate().is_err());
    }

    #[test]
    fn test_invalid_remote() {
        let mut profile = ProfileConfig::new("office", "client");
        profile.remote = Some(RemoteEndpoint {
            host: String::new(),
            port: 1194,
            proto: Protocol::Tcp,
        });
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_deserialize_start_request_defaults() {
        let profile: ProfileConfig = serde_json::from_str(
            r#"{"id":"home","data":"client","remote":{"host":"10.0.0.1"},
                "credentials":{"username":"alice","password":"secret"}}"#,
        )
        .unwrap();

        let remote = profile.remote.as_ref().unwrap();
        assert_eq!(remote.port, 1194);
        assert_eq!(remote.proto, Protocol::Udp);
        assert_eq!(profile.display_name(), "home");
        assert!(profile.up_script.is_none());
        assert!(!profile.timeout);
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let credentials = Credentials {
            username: "alice".to_string(),
            password: "hunter2".to_string(),
        };
        let printed = format!("{:?}", credentials);
        assert!(printed.contains("alice"));
        assert!(!printed.contains("hunter2"));
    }
}
