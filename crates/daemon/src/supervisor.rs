// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Client Contributors

// VPN Client - Supervisor Module
// Owns one tunnel subprocess from launch until it is reaped and the down-hook has run

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vpn_client_common::{unix_now, EventKind, ProfileState};

use crate::bus::EventBus;
use crate::hooks::{self, ProfileFiles};
use crate::manager::{ManagerSettings, ProfileSlot};
use crate::output::{NetworkParams, OutputSignal};

const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const MAX_READ_ERRORS: u32 = 3;

/// Line reader over one of the tunnel's output pipes.
///
/// Bytes that are not UTF-8 are replaced rather than rejected: the pipe has to
/// keep draining or the tunnel dies on its next write. A line cut short by a
/// cancelled read stays in `partial` for the next call.
struct OutputLines {
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    partial: Vec<u8>,
}

impl OutputLines {
    /// Next line, `None` only at end of stream
    async fn next_line(&mut self) -> Option<String> {
        let mut errors = 0;
        loop {
            match self.reader.read_until(b'\n', &mut self.partial).await {
                Ok(0) if self.partial.is_empty() => return None,
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    errors += 1;
                    warn!("Error reading tunnel output: {}", e);
                    if errors >= MAX_READ_ERRORS {
                        return None;
                    }
                }
            }
        }

        let mut line = std::mem::take(&mut self.partial);
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

/// Why the running phase ended
enum Exit {
    /// Stop was requested; the process still has to be terminated
    Requested,
    /// The process went away on its own
    Unexpected(String),
    /// Initialization was required and did not arrive in time
    TimedOut,
}

pub(crate) struct Supervisor {
    pub(crate) slot: Arc<ProfileSlot>,
    /// Promote only on the initialization marker, within `connect_timeout`
    pub(crate) require_init: bool,
    pub(crate) bus: EventBus,
    pub(crate) files: ProfileFiles,
    pub(crate) settings: ManagerSettings,
}

impl Supervisor {
    /// Drive the profile from `Connecting` to `Disconnected`.
    pub(crate) async fn run(self, mut child: Child, cancel: CancellationToken) {
        let mut stdout = child.stdout.take().map(into_lines);
        let mut stderr = child.stderr.take().map(into_lines);
        let mut params = NetworkParams::default();
        let mut recorded = NetworkParams::default();
        let mut promoted = false;

        let grace = tokio::time::sleep(self.settings.connect_grace);
        tokio::pin!(grace);
        let connect_deadline = tokio::time::sleep(self.settings.connect_timeout);
        tokio::pin!(connect_deadline);

        let exit = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Exit::Requested,
                status = child.wait() => {
                    break Exit::Unexpected(match status {
                        Ok(status) => format!("Tunnel exited unexpectedly ({})", status),
                        Err(e) => format!("Lost track of tunnel process: {}", e),
                    });
                }
                _ = &mut grace, if !promoted && !self.require_init => {
                    promoted = true;
                    self.promote(&params);
                    recorded = params.clone();
                }
                _ = &mut connect_deadline, if !promoted && self.require_init => {
                    break Exit::TimedOut;
                }
                line = next_line(&mut stdout) => match line {
                    Some(line) => {
                        if self.handle_line(line, &mut params) && !promoted {
                            promoted = true;
                            self.promote(&params);
                            recorded = params.clone();
                        }
                    }
                    None => stdout = None,
                },
                line = next_line(&mut stderr) => match line {
                    Some(line) => {
                        self.handle_line(line, &mut params);
                    }
                    None => stderr = None,
                },
            }

            if promoted && params != recorded {
                self.slot.record_network(&params);
                recorded = params.clone();
            }
        };

        let failure = match exit {
            Exit::Requested => {
                self.terminate(&mut child).await;
                None
            }
            Exit::Unexpected(reason) => {
                warn!("Profile {}: {}", self.slot.id(), reason);
                self.drain_output(&mut stdout, &mut params).await;
                self.drain_output(&mut stderr, &mut params).await;
                let error = Some(reason);
                self.slot.transition(&self.bus, ProfileState::Disconnecting, |status| {
                    status.error = error.clone();
                });
                error
            }
            Exit::TimedOut => {
                let reason = format!(
                    "Connection timed out after {:?}",
                    self.settings.connect_timeout
                );
                warn!("Profile {}: {}", self.slot.id(), reason);
                self.bus.publish(EventKind::TimeoutError {
                    profile: self.slot.id().to_string(),
                });
                let error = Some(reason);
                self.slot.transition(&self.bus, ProfileState::Disconnecting, |status| {
                    status.error = error.clone();
                });
                self.terminate(&mut child).await;
                error
            }
        };

        if let Err(e) = hooks::run_down_hook(&self.files, self.settings.down_hook_timeout).await {
            warn!("Down hook for profile {} failed: {}", self.slot.id(), e);
        }
        self.files.remove_transient();

        self.slot.transition(&self.bus, ProfileState::Disconnected, |status| {
            status.error = failure;
            clear_network(status);
        });
        info!("Profile {} disconnected", self.slot.id());
    }

    /// Connecting -> Connected with whatever network parameters are known so far
    fn promote(&self, params: &NetworkParams) {
        let promoted = self.slot.transition(&self.bus, ProfileState::Connected, |status| {
            status.timestamp = Some(unix_now());
            apply_network(status, params);
        });
        if promoted {
            info!("Profile {} connected", self.slot.id());
        }
    }

    /// Publish a line of output; returns true if it marks the tunnel as up
    fn handle_line(&self, line: String, params: &mut NetworkParams) -> bool {
        let signal = params.observe(&line);
        self.bus.publish(EventKind::Output {
            profile: self.slot.id().to_string(),
            output: line,
        });

        match signal {
            Some(OutputSignal::Initialized) => true,
            Some(OutputSignal::AuthFailed) => {
                warn!("Profile {}: authentication failed", self.slot.id());
                self.bus.publish(EventKind::AuthError {
                    profile: self.slot.id().to_string(),
                });
                false
            }
            None => false,
        }
    }

    /// SIGTERM, then SIGKILL once `stop_timeout` has passed
    async fn terminate(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            debug!("Sending SIGTERM to tunnel {} (pid {})", self.slot.id(), pid);
            // SAFETY: pid belongs to a child we have not reaped yet
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(self.settings.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => debug!("Tunnel {} exited: {}", self.slot.id(), status),
            Ok(Err(e)) => warn!("Failed waiting for tunnel {}: {}", self.slot.id(), e),
            Err(_) => {
                warn!(
                    "Tunnel {} ignored SIGTERM for {:?}, killing",
                    self.slot.id(),
                    self.settings.stop_timeout
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill tunnel {}: {}", self.slot.id(), e);
                }
            }
        }
    }

    // Publish what the process wrote right before dying
    async fn drain_output(&self, lines: &mut Option<OutputLines>, params: &mut NetworkParams) {
        let Some(reader) = lines.as_mut() else {
            return;
        };
        let drain = async {
            while let Some(line) = reader.next_line().await {
                self.handle_line(line, params);
            }
        };
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
            debug!("Output of {} still open after exit, not waiting", self.slot.id());
        }
        *lines = None;
    }
}

fn into_lines<R: AsyncRead + Send + Unpin + 'static>(reader: R) -> OutputLines {
    let boxed: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
    OutputLines {
        reader: BufReader::new(boxed),
        partial: Vec::new(),
    }
}

// Pending forever once the stream is gone, so select! just stops polling it
async fn next_line(lines: &mut Option<OutputLines>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

fn apply_network(status: &mut vpn_client_common::ProfileSnapshot, params: &NetworkParams) {
    status.server_addr = params.server_addr.clone();
    status.client_addr = params.client_addr.clone();
    status.dns_servers = params.dns_servers.clone();
    status.search_domains = params.search_domains.clone();
    status.routes = params.routes.clone();
}

fn clear_network(status: &mut vpn_client_common::ProfileSnapshot) {
    apply_network(status, &NetworkParams::default());
    status.timestamp = None;
}
