// Error types for the VPN client daemon and its clients

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Failed to launch tunnel: {0}")]
    Spawn(String),

    #[error("Hook script error: {0}")]
    Hook(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
