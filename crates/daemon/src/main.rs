// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Client Contributors

// VPN Client - Daemon
// Privileged control plane: runs tunnels per profile and streams their state to the UI

mod api;
mod auth;
mod autoclean;
mod bus;
mod config;
mod gateway;
mod hooks;
mod launcher;
mod manager;
mod output;
mod paths;
mod permissions;
mod pidfile;
mod supervisor;

use std::sync::Arc;

use anyhow::{Context, Result};
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tower::Service;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::{create_router, AppState};
use autoclean::UninstallWatch;
use bus::EventBus;
use config::{DaemonConfig, ListenerMode};
use gateway::StatusGateway;
use hooks::HookScripts;
use launcher::OpenVpnLauncher;
use manager::ProfileManager;

#[tokio::main]
async fn main() -> Result<()> {
    // Set restrictive umask before creating any files
    permissions::set_restrictive_umask();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vpn_client_daemon=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("VPN Client Daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let pid_guard = pidfile::PidFileGuard::create()
        .context("Failed to create PID file - another daemon may already be running")?;
    debug!("PID file: {}", pid_guard.path().display());

    let daemon_config = DaemonConfig::load()?;
    info!("Listener mode: {:?}", daemon_config.listener_mode);
    info!("Authentication required: {}", daemon_config.require_auth);

    let auth_key = if daemon_config.require_auth {
        let (key, _generated) = auth::load_or_generate_key(&daemon_config.auth_token_path)?;
        Some(key)
    } else {
        warn!("Authentication disabled - any local process can control tunnels");
        None
    };

    let root_dir = daemon_config.resolve_root_dir()?;
    let tunnel_binary = daemon_config.resolve_tunnel_binary()?;
    info!("Root directory: {}", root_dir.display());
    info!("Tunnel binary: {}", tunnel_binary.display());

    let manager = ProfileManager::new(
        EventBus::new(daemon_config.mailbox_capacity),
        Arc::new(OpenVpnLauncher::new(tunnel_binary)),
        HookScripts::new(daemon_config.work_dir.clone()),
        daemon_config.manager_settings(),
    );
    let gateway = StatusGateway::new(manager.clone(), daemon_config.gateway_settings());

    // Closes event streams and, from the uninstall watch, stops the daemon
    let (shutdown_tx, _) = broadcast::channel(1);
    let cleanup =
        UninstallWatch::for_installation(daemon_config.autoclean, &root_dir, shutdown_tx.clone());

    let state = Arc::new(AppState {
        gateway,
        cleanup,
        shutdown_tx: shutdown_tx.clone(),
    });

    let app = match auth_key {
        Some(key) => create_router(state).layer(axum::middleware::from_fn_with_state(
            auth::AuthState::new(key),
            auth::auth_middleware,
        )),
        None => create_router(state),
    };

    match daemon_config.listener_mode {
        ListenerMode::UnixSocket => {
            serve_unix_socket(app, &daemon_config, manager, shutdown_tx).await?;
        }
        ListenerMode::TcpHttp => {
            serve_tcp_http(app, &daemon_config.bind_address(), manager, shutdown_tx).await?;
        }
    }

    info!("Daemon shut down");
    Ok(())
}

/// Serve on a Unix domain socket (local-only)
async fn serve_unix_socket(
    app: axum::Router,
    daemon_config: &DaemonConfig,
    manager: ProfileManager,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<()> {
    let socket_path = paths::socket_path()?;

    if socket_path.exists() {
        std::fs::remove_file(&socket_path).context("Failed to remove existing socket file")?;
    }

    if let Some(parent) = socket_path.parent() {
        permissions::ensure_directory_with_permissions(parent, daemon_config.group_access)?;
    }

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("Failed to bind to socket: {}", socket_path.display()))?;
    permissions::set_socket_permissions(&socket_path, daemon_config.group_access)?;

    info!("Daemon listening on Unix socket: {}", socket_path.display());

    let (stop_accepting_tx, mut stop_accepting_rx) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(shutdown_signal(manager, shutdown_tx, Some(stop_accepting_tx)));

    loop {
        tokio::select! {
            _ = stop_accepting_rx.recv() => {
                info!("Shutting down server...");
                break;
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let app = app.clone();
                        tokio::spawn(async move {
                            let stream = TokioIo::new(stream);
                            let hyper_service = hyper::service::service_fn(
                                move |request: hyper::Request<hyper::body::Incoming>| {
                                    let mut app = app.clone();
                                    async move { app.call(request).await }
                                },
                            );

                            if let Err(err) = hyper_util::server::conn::auto::Builder::new(
                                hyper_util::rt::TokioExecutor::new(),
                            )
                            .serve_connection_with_upgrades(stream, hyper_service)
                            .await
                            {
                                let message = err.to_string();
                                if message.contains("connection closed") || message.contains("Broken pipe") {
                                    debug!("Client disconnected: {}", err);
                                } else {
                                    error!("Error serving connection: {}", err);
                                }
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            }
        }
    }

    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }

    Ok(())
}

/// Serve plain HTTP on a loopback TCP port
async fn serve_tcp_http(
    app: axum::Router,
    bind_address: &str,
    manager: ProfileManager,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_address))?;

    info!("Daemon listening on TCP (HTTP): {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager, shutdown_tx, None))
        .await
        .context("TCP HTTP server error")?;

    Ok(())
}

/// Wait for Ctrl+C, SIGTERM or an internal shutdown request, stop every
/// tunnel, then close event streams and the listener
async fn shutdown_signal(
    manager: ProfileManager,
    shutdown_tx: broadcast::Sender<()>,
    stop_accepting: Option<tokio::sync::mpsc::Sender<()>>,
) {
    let mut requested = shutdown_tx.subscribe();
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => Some(sigterm),
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
        _ = async {
            match sigterm.as_mut() {
                Some(sigterm) => {
                    sigterm.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        } => info!("Received SIGTERM, shutting down"),
        _ = requested.recv() => info!("Shutdown requested, shutting down"),
    }

    manager.stop_all().await;
    info!("All profiles stopped");

    let _ = shutdown_tx.send(());
    if let Some(stop_accepting) = stop_accepting {
        let _ = stop_accepting.send(()).await;
    }
}
