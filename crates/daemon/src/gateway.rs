// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Client Contributors

// VPN Client - Status Gateway Module
// Streams bus events to WebSocket subscribers and answers status queries

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use vpn_client_common::{from_unix_millis, EventKind, StatusResponse};

use crate::bus::EventBus;
use crate::manager::ProfileManager;

/// Text frame a UI sends to prove it is alive
pub const AWAKE_TOKEN: &str = "awake";

const WAKEUP_POLL: Duration = Duration::from_millis(20);

/// Keepalive and write timing for subscriber connections
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub ping_interval: Duration,
    /// Read deadline; refreshed by Pong frames and the awake token
    pub ping_wait: Duration,
    pub write_timeout: Duration,
    /// How long a wakeup request waits for a UI to answer
    pub wakeup_wait: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            ping_wait: Duration::from_secs(40),
            write_timeout: Duration::from_secs(10),
            wakeup_wait: Duration::from_millis(300),
        }
    }
}

/// How a subscriber's read side ended
#[derive(Debug)]
enum ReadEnd {
    Closed,
    TimedOut,
    Failed(String),
}

struct GatewayInner {
    manager: ProfileManager,
    settings: GatewaySettings,
    // Unix milliseconds, 0 until a UI has reported in
    last_awake: AtomicI64,
    // Bumped on every awake token; wakeup compares against this, not the clock
    awake_count: AtomicU64,
}

#[derive(Clone)]
pub struct StatusGateway {
    inner: Arc<GatewayInner>,
}

impl StatusGateway {
    pub fn new(manager: ProfileManager, settings: GatewaySettings) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                manager,
                settings,
                last_awake: AtomicI64::new(0),
                awake_count: AtomicU64::new(0),
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        self.inner.manager.bus()
    }

    pub fn manager(&self) -> &ProfileManager {
        &self.inner.manager
    }

    pub fn mark_awake(&self) {
        self.inner
            .last_awake
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
        self.inner.awake_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Last time any UI sent the awake token
    pub fn last_awake(&self) -> Option<DateTime<Utc>> {
        match self.inner.last_awake.load(Ordering::SeqCst) {
            0 => None,
            millis => from_unix_millis(millis),
        }
    }

    /// Aggregate status: true if any profile is connected
    pub async fn query(&self) -> StatusResponse {
        StatusResponse {
            status: self.inner.manager.any_connected().await,
        }
    }

    /// Ask a running UI to show itself; true if one answered in time.
    ///
    /// Only an awake token received after this call began counts as an answer.
    pub async fn wakeup(&self) -> bool {
        let seen = self.inner.awake_count.load(Ordering::SeqCst);
        self.bus().publish(EventKind::Wakeup);

        let deadline = Instant::now() + self.inner.settings.wakeup_wait;
        loop {
            if self.inner.awake_count.load(Ordering::SeqCst) > seen {
                return true;
            }
            if Instant::now() >= deadline {
                debug!("No UI answered the wakeup request (last seen {:?})", self.last_awake());
                return false;
            }
            tokio::time::sleep(WAKEUP_POLL).await;
        }
    }

    /// Serve one upgraded subscriber connection until it ends.
    ///
    /// Events from the bus go out as JSON text frames; the connection is
    /// dropped when the client stops answering pings, on write failure, or
    /// when the daemon shuts down.
    pub async fn subscribe(&self, socket: WebSocket, mut shutdown: broadcast::Receiver<()>) {
        let settings = self.inner.settings.clone();
        let mut listener = self.bus().register();
        let subscriber = listener.id();
        info!(
            "Subscriber {} connected ({} listening)",
            subscriber,
            self.bus().listener_count()
        );

        let (mut sink, stream) = socket.split();
        let mut reader = tokio::spawn(read_loop(stream, self.clone(), settings.ping_wait));

        // First ping one interval after connect, not immediately
        let mut keepalive = tokio::time::interval_at(
            Instant::now() + settings.ping_interval,
            settings.ping_interval,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                event = listener.recv() => {
                    let Some(event) = event else {
                        break "mailbox closed".to_string();
                    };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to serialize event {}: {}", event.id, e);
                            continue;
                        }
                    };
                    if let Err(e) = send_frame(&mut sink, Message::Text(text), settings.write_timeout).await {
                        break e;
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(e) = send_frame(&mut sink, Message::Ping(Vec::new()), settings.write_timeout).await {
                        break e;
                    }
                }
                end = &mut reader => {
                    break match end {
                        Ok(ReadEnd::Closed) => "closed by client".to_string(),
                        Ok(ReadEnd::TimedOut) => "keepalive timed out".to_string(),
                        Ok(ReadEnd::Failed(e)) => format!("read failed: {}", e),
                        Err(e) => format!("reader task failed: {}", e),
                    };
                }
                _ = shutdown.recv() => break "daemon shutting down".to_string(),
            }
        };

        reader.abort();
        listener.close();
        let _ = send_frame(&mut sink, Message::Close(None), settings.write_timeout).await;
        info!("Subscriber {} disconnected: {}", subscriber, reason);
        debug!("Event deliveries dropped so far: {}", self.bus().dropped_deliveries());
    }
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    message: Message,
    write_timeout: Duration,
) -> Result<(), String> {
    match tokio::time::timeout(write_timeout, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("write failed: {}", e)),
        Err(_) => Err(format!("write timed out after {:?}", write_timeout)),
    }
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    gateway: StatusGateway,
    ping_wait: Duration,
) -> ReadEnd {
    let mut deadline = Instant::now() + ping_wait;
    loop {
        let message = match tokio::time::timeout_at(deadline, stream.next()).await {
            Err(_) => return ReadEnd::TimedOut,
            Ok(None) => return ReadEnd::Closed,
            Ok(Some(Err(e))) => return ReadEnd::Failed(e.to_string()),
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Pong(_) => deadline = Instant::now() + ping_wait,
            Message::Text(text) if text.trim() == AWAKE_TOKEN => {
                gateway.mark_awake();
                deadline = Instant::now() + ping_wait;
            }
            Message::Text(text) => debug!("Ignoring subscriber message: {}", text),
            Message::Close(_) => return ReadEnd::Closed,
            Message::Binary(_) | Message::Ping(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookScripts;
    use crate::launcher::testing::ShellLauncher;
    use crate::manager::ManagerSettings;
    use axum::extract::ws::WebSocketUpgrade;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;
    use tempfile::TempDir;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;
    use vpn_client_common::{Event, ProfileConfig, ProfileState};

    fn gateway(dir: &TempDir, settings: GatewaySettings) -> StatusGateway {
        let manager = ProfileManager::new(
            EventBus::default(),
            Arc::new(ShellLauncher::new("exec sleep 30")),
            HookScripts::new(dir.path().join("work")),
            ManagerSettings {
                connect_grace: Duration::from_millis(50),
                ..Default::default()
            },
        );
        StatusGateway::new(manager, settings)
    }

    fn fast_keepalive() -> GatewaySettings {
        GatewaySettings {
            ping_interval: Duration::from_millis(100),
            ping_wait: Duration::from_millis(300),
            write_timeout: Duration::from_secs(1),
            wakeup_wait: Duration::from_millis(300),
        }
    }

    async fn serve(gateway: StatusGateway) -> (SocketAddr, broadcast::Sender<()>) {
        let (shutdown_tx, _) = broadcast::channel(1);
        let tx = shutdown_tx.clone();
        let app = Router::new().route(
            "/events",
            get(move |ws: WebSocketUpgrade| {
                let gateway = gateway.clone();
                let shutdown = tx.subscribe();
                async move {
                    ws.on_upgrade(move |socket| async move {
                        gateway.subscribe(socket, shutdown).await
                    })
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, shutdown_tx)
    }

    async fn connect(
        addr: SocketAddr,
    ) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/events", addr))
            .await
            .unwrap();
        ws
    }

    async fn wait_for_listeners(bus: &EventBus, count: usize) {
        wait_for_listeners_within(bus, count, Duration::from_secs(5)).await;
    }

    async fn wait_for_listeners_within(bus: &EventBus, count: usize, limit: Duration) {
        let deadline = Instant::now() + limit;
        while bus.listener_count() != count {
            assert!(
                Instant::now() < deadline,
                "expected {} listeners within {:?}",
                count,
                limit
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn next_event<S>(ws: &mut S) -> Event
    where
        S: futures::Stream<Item = Result<ClientMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let ClientMessage::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_two_subscribers_see_identical_streams() {
        let temp_dir = TempDir::new().unwrap();
        let gateway = gateway(&temp_dir, GatewaySettings::default());
        let (addr, _shutdown) = serve(gateway.clone()).await;

        let mut first = connect(addr).await;
        let mut second = connect(addr).await;
        wait_for_listeners(gateway.bus(), 2).await;

        let mut published = Vec::new();
        for i in 0..5 {
            let event = gateway.bus().publish(EventKind::Output {
                profile: "p1".to_string(),
                output: format!("line {}", i),
            });
            published.push(event.id);
        }

        for ws in [&mut first, &mut second] {
            let mut received = Vec::new();
            for _ in 0..5 {
                received.push(next_event(ws).await.id);
            }
            assert_eq!(received, published);
        }
    }

    #[tokio::test]
    async fn test_silent_subscriber_is_dropped() {
        let temp_dir = TempDir::new().unwrap();
        let gateway = gateway(&temp_dir, fast_keepalive());
        let (addr, _shutdown) = serve(gateway.clone()).await;

        // Never reads, so never answers pings
        let _ws = connect(addr).await;
        wait_for_listeners(gateway.bus(), 1).await;

        // Read deadline plus at most one more ping round
        let settings = fast_keepalive();
        let limit = settings.ping_wait + settings.ping_interval + Duration::from_millis(250);
        wait_for_listeners_within(gateway.bus(), 0, limit).await;
    }

    #[tokio::test]
    async fn test_awake_keeps_subscriber_alive() {
        let temp_dir = TempDir::new().unwrap();
        let gateway = gateway(&temp_dir, fast_keepalive());
        let (addr, _shutdown) = serve(gateway.clone()).await;
        assert!(gateway.last_awake().is_none());

        let mut ws = connect(addr).await;
        wait_for_listeners(gateway.bus(), 1).await;

        for _ in 0..10 {
            ws.send(ClientMessage::Text(AWAKE_TOKEN.to_string()))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert_eq!(gateway.bus().listener_count(), 1);
        assert!(gateway.last_awake().is_some());
    }

    #[tokio::test]
    async fn test_shutdown_closes_subscribers() {
        let temp_dir = TempDir::new().unwrap();
        let gateway = gateway(&temp_dir, GatewaySettings::default());
        let (addr, shutdown) = serve(gateway.clone()).await;

        let mut ws = connect(addr).await;
        wait_for_listeners(gateway.bus(), 1).await;

        shutdown.send(()).unwrap();
        wait_for_listeners(gateway.bus(), 0).await;

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(Ok(message)) = ws.next().await {
                if message.is_close() {
                    return true;
                }
            }
            true
        })
        .await
        .unwrap();
        assert!(closed);
    }

    #[tokio::test]
    async fn test_wakeup_answered_by_ui() {
        let temp_dir = TempDir::new().unwrap();
        let settings = GatewaySettings {
            wakeup_wait: Duration::from_secs(2),
            ..GatewaySettings::default()
        };
        let gateway = gateway(&temp_dir, settings);
        let (addr, _shutdown) = serve(gateway.clone()).await;

        assert!(!gateway.wakeup().await);

        // An awake from before the request is not an answer to it
        gateway.mark_awake();
        assert!(!gateway.wakeup().await);

        let mut ws = connect(addr).await;
        wait_for_listeners(gateway.bus(), 1).await;

        let ui = tokio::spawn(async move {
            loop {
                let event = next_event(&mut ws).await;
                if event.kind == EventKind::Wakeup {
                    ws.send(ClientMessage::Text(AWAKE_TOKEN.to_string()))
                        .await
                        .unwrap();
                    return ws;
                }
            }
        });

        assert!(gateway.wakeup().await);
        ui.await.unwrap();
    }

    #[tokio::test]
    async fn test_query_reflects_connected_profiles() {
        let temp_dir = TempDir::new().unwrap();
        let gateway = gateway(&temp_dir, GatewaySettings::default());
        let mut listener = gateway.bus().register();

        assert!(!gateway.query().await.status);

        gateway
            .manager()
            .start(ProfileConfig::new("p1", "client"))
            .await
            .unwrap();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), listener.recv())
                .await
                .unwrap()
                .unwrap();
            if let EventKind::State(change) = event.kind {
                if change.state == ProfileState::Connected {
                    break;
                }
            }
        }
        assert!(gateway.query().await.status);

        gateway.manager().stop("p1").await;
        assert!(!gateway.query().await.status);
    }
}
