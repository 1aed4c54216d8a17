// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Client Contributors

// VPN Client - Profile Manager Module
// Tracks per-profile tunnel state and serializes start/stop per profile

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vpn_client_common::{
    EventKind, ProfileConfig, ProfileSnapshot, ProfileState, Result, StateChange,
};

use crate::bus::EventBus;
use crate::hooks::HookScripts;
use crate::launcher::TunnelLauncher;
use crate::output::NetworkParams;
use crate::supervisor::Supervisor;

/// Timing knobs for tunnel supervision
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// How long a tunnel stays `Connecting` before it is considered up
    pub connect_grace: Duration,
    /// How long a profile started with `timeout` may take to report
    /// initialization before it is torn down
    pub connect_timeout: Duration,
    /// Wait after SIGTERM before the tunnel is killed
    pub stop_timeout: Duration,
    pub down_hook_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            connect_grace: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(10),
            down_hook_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of a start request
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// A new tunnel was launched
    Started(ProfileSnapshot),
    /// The profile was not at rest; nothing was launched
    AlreadyActive(ProfileSnapshot),
}

struct RunningTunnel {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

/// State kept for one known profile
pub(crate) struct ProfileSlot {
    id: String,
    status: Mutex<ProfileSnapshot>,
    // Held for the whole of a start or stop
    control: AsyncMutex<Option<RunningTunnel>>,
}

impl ProfileSlot {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: Mutex::new(ProfileSnapshot {
                id: id.to_string(),
                ..Default::default()
            }),
            control: AsyncMutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    fn lock_status(&self) -> MutexGuard<'_, ProfileSnapshot> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn snapshot(&self) -> ProfileSnapshot {
        self.lock_status().clone()
    }

    pub(crate) fn state(&self) -> ProfileState {
        self.lock_status().state
    }

    /// Move to `next` if that is legal from the current state.
    ///
    /// The state event is published while the status lock is held, so
    /// listeners see transitions in the order they happened.
    pub(crate) fn transition(
        &self,
        bus: &EventBus,
        next: ProfileState,
        update: impl FnOnce(&mut ProfileSnapshot),
    ) -> bool {
        let mut status = self.lock_status();
        if !status.state.can_transition_to(next) {
            debug!(
                "Profile {}: ignoring transition {} -> {}",
                self.id, status.state, next
            );
            return false;
        }

        status.state = next;
        update(&mut status);
        bus.publish(EventKind::State(StateChange::from_snapshot(&status)));
        true
    }

    /// Update network details of a connected tunnel without a state event
    pub(crate) fn record_network(&self, params: &NetworkParams) {
        let mut status = self.lock_status();
        if status.state == ProfileState::Connected {
            status.server_addr = params.server_addr.clone();
            status.client_addr = params.client_addr.clone();
            status.dns_servers = params.dns_servers.clone();
            status.search_domains = params.search_domains.clone();
            status.routes = params.routes.clone();
        }
    }

    // Supervisor died without finishing; walk the state machine back to rest
    fn force_disconnected(&self, bus: &EventBus, reason: String) {
        let error = Some(reason);
        self.transition(bus, ProfileState::Disconnecting, |status| {
            status.error = error.clone();
        });
        self.transition(bus, ProfileState::Disconnected, |status| {
            status.error = error;
            status.timestamp = None;
        });
    }
}

struct ManagerInner {
    profiles: RwLock<HashMap<String, Arc<ProfileSlot>>>,
    bus: EventBus,
    launcher: Arc<dyn TunnelLauncher>,
    hooks: HookScripts,
    settings: ManagerSettings,
}

/// Owns every profile's tunnel lifecycle
#[derive(Clone)]
pub struct ProfileManager {
    inner: Arc<ManagerInner>,
}

impl ProfileManager {
    pub fn new(
        bus: EventBus,
        launcher: Arc<dyn TunnelLauncher>,
        hooks: HookScripts,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                profiles: RwLock::new(HashMap::new()),
                bus,
                launcher,
                hooks,
                settings,
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    async fn slot(&self, id: &str) -> Option<Arc<ProfileSlot>> {
        self.inner.profiles.read().await.get(id).cloned()
    }

    async fn slot_or_insert(&self, id: &str) -> Arc<ProfileSlot> {
        if let Some(slot) = self.slot(id).await {
            return slot;
        }
        let mut profiles = self.inner.profiles.write().await;
        profiles
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(ProfileSlot::new(id)))
            .clone()
    }

    /// Launch a tunnel for `profile` unless one is already active.
    ///
    /// On launch failure the profile stays `Disconnected` and no event is
    /// published.
    pub async fn start(&self, profile: ProfileConfig) -> Result<StartOutcome> {
        profile.validate()?;
        let slot = self.slot_or_insert(&profile.id).await;
        let mut control = slot.control.lock().await;

        let current = slot.state();
        if current.is_active() {
            info!("Profile {} is already {}, not starting", profile.id, current);
            return Ok(StartOutcome::AlreadyActive(slot.snapshot()));
        }

        // The previous supervisor publishes Disconnected as its last step
        if let Some(previous) = control.take() {
            if let Err(e) = previous.supervisor.await {
                warn!("Previous supervisor for {} ended abnormally: {}", profile.id, e);
            }
        }

        let files = self.inner.hooks.install(&profile)?;
        let child = match self.inner.launcher.launch(&profile, &files).await {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to launch tunnel for {}: {}", profile.id, e);
                files.remove_transient();
                return Err(e);
            }
        };

        let name = profile.name.clone();
        slot.transition(&self.inner.bus, ProfileState::Connecting, |status| {
            status.name = name;
            status.error = None;
            status.timestamp = None;
        });

        let cancel = CancellationToken::new();
        let supervisor = Supervisor {
            slot: slot.clone(),
            require_init: profile.timeout,
            bus: self.inner.bus.clone(),
            files,
            settings: self.inner.settings.clone(),
        };
        let handle = tokio::spawn(supervisor.run(child, cancel.clone()));
        *control = Some(RunningTunnel {
            cancel,
            supervisor: handle,
        });

        info!("Starting profile {}", profile.display_name());
        Ok(StartOutcome::Started(slot.snapshot()))
    }

    /// Stop the profile's tunnel and wait until it is `Disconnected`.
    ///
    /// Stopping an unknown or idle profile is a no-op.
    pub async fn stop(&self, id: &str) -> ProfileSnapshot {
        let Some(slot) = self.slot(id).await else {
            debug!("Stop for unknown profile {}", id);
            return ProfileSnapshot {
                id: id.to_string(),
                ..Default::default()
            };
        };

        let mut control = slot.control.lock().await;
        if !slot.state().is_active() {
            debug!("Profile {} already disconnected", id);
            return slot.snapshot();
        }

        let Some(running) = control.take() else {
            warn!("Profile {} is {} without a supervisor", id, slot.state());
            slot.force_disconnected(&self.inner.bus, "tunnel supervisor missing".to_string());
            return slot.snapshot();
        };

        info!("Stopping profile {}", id);
        slot.transition(&self.inner.bus, ProfileState::Disconnecting, |status| {
            status.error = None;
        });
        running.cancel.cancel();

        if let Err(e) = running.supervisor.await {
            error!("Supervisor for {} ended abnormally: {}", id, e);
            slot.force_disconnected(&self.inner.bus, format!("tunnel supervisor failed: {}", e));
        }

        slot.snapshot()
    }

    /// Stop every known profile concurrently
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.inner.profiles.read().await.keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        info!("Stopping all profiles ({})", ids.len());
        futures::future::join_all(ids.iter().map(|id| self.stop(id))).await;
    }

    pub async fn snapshot(&self, id: &str) -> Option<ProfileSnapshot> {
        self.slot(id).await.map(|slot| slot.snapshot())
    }

    /// Snapshots of all known profiles, ordered by id
    pub async fn snapshots(&self) -> Vec<ProfileSnapshot> {
        let mut snapshots: Vec<ProfileSnapshot> = self
            .inner
            .profiles
            .read()
            .await
            .values()
            .map(|slot| slot.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// True if any profile is `Connected`
    pub async fn any_connected(&self) -> bool {
        self.inner
            .profiles
            .read()
            .await
            .values()
            .any(|slot| slot.state() == ProfileState::Connected)
    }
}
