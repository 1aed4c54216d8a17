// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Client Contributors

// VPN Client - Common Library
// Wire types and profile configuration shared by the daemon and its UI clients

pub mod config;
pub mod error;
pub mod types;

pub use config::{Credentials, ProfileConfig, Protocol, RemoteEndpoint};
pub use error::{Error, Result};
pub use types::{
    from_unix_millis, unix_now, Event, EventKind, ProfileSnapshot, ProfileState, StateChange,
    StatusResponse,
};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;
