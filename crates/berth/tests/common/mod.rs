//! Test utilities and common setup.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use berth::api::{self, AppState};
use berth::db::Database;
use berth::retry::RetryPolicy;
use berth::scheduler::ExpiryScheduler;
use berth::session::{SessionManager, SessionRecord, SessionRegistry, SessionState};
use berth::settings::SandboxConfig;
use berth::testing::{FakeEngine, FakeSpawner};
use berth_protocol::{ClientEvent, Frame, InitPayload, ServerEvent, UserRef};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

/// How long a test waits for any single event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// A session manager wired to fakes.
pub struct TestEnv {
    pub sessions: Arc<SessionManager>,
    pub engine: Arc<FakeEngine>,
    pub spawner: Arc<FakeSpawner>,
    pub shutdown: CancellationToken,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_config(SandboxConfig::default()).await
    }

    pub async fn with_config(config: SandboxConfig) -> Self {
        let db = Database::in_memory()
            .await
            .expect("Failed to create test database");
        let engine = FakeEngine::new();
        let spawner = FakeSpawner::new();
        let shutdown = CancellationToken::new();
        let sessions = Arc::new(
            SessionManager::new(
                SessionRegistry::new(&db),
                ExpiryScheduler::new(&db, 16),
                engine.clone(),
                spawner.clone(),
                Arc::new(config),
                shutdown.clone(),
            )
            .with_retry(RetryPolicy::immediate(1)),
        );
        Self {
            sessions,
            engine,
            spawner,
            shutdown,
        }
    }

    pub fn router(&self) -> Router {
        api::create_router(AppState::new(self.sessions.clone()))
    }

    pub fn registry(&self) -> &SessionRegistry {
        self.sessions.registry()
    }

    pub fn scheduler(&self) -> &ExpiryScheduler {
        self.sessions.scheduler()
    }

    pub async fn lookup(&self, user_id: &str) -> Option<SessionRecord> {
        self.registry().lookup(user_id).await.unwrap()
    }

    /// Poll until `user_id`'s record is in `state`.
    pub async fn wait_for_state(&self, user_id: &str, state: SessionState) -> SessionRecord {
        let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
        loop {
            if let Some(record) = self.lookup(user_id).await {
                if record.state == state {
                    return record;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "session of {user_id} never reached {state}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until no connection is registered.
    pub async fn wait_for_idle(&self) {
        assert!(
            self.sessions.hub().drain(EVENT_TIMEOUT).await,
            "connections did not tear down"
        );
    }
}

/// A running HTTP server on an ephemeral port.
pub struct TestServer {
    pub env: TestEnv,
    pub addr: SocketAddr,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(TestEnv::new().await).await
    }

    pub async fn start_with(env: TestEnv) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().unwrap();
        let app = env.router();
        let shutdown = env.shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .ok();
        });
        Self { env, addr }
    }

    pub async fn connect(&self) -> TestClient {
        TestClient::connect(self.addr).await
    }
}

/// A WebSocket terminal client.
pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("Failed to connect WebSocket");
        Self { ws }
    }

    pub async fn send(&mut self, event: ClientEvent) {
        let message = match event.encode().unwrap() {
            Frame::Text(text) => Message::text(text),
            Frame::Binary(bytes) => Message::binary(bytes),
        };
        self.ws.send(message).await.unwrap();
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::text(text.to_string())).await.unwrap();
    }

    pub async fn init(&mut self, uid: &str, path: &str, lesson_type: Option<&str>) {
        self.send(ClientEvent::Init(InitPayload {
            user: UserRef {
                uid: uid.to_string(),
            },
            path: path.to_string(),
            lesson_type: lesson_type.map(str::to_string),
        }))
        .await;
    }

    /// `init` followed by `ready`.
    pub async fn start_session(&mut self, uid: &str, path: &str, lesson_type: Option<&str>) {
        self.init(uid, path, lesson_type).await;
        self.send(ClientEvent::Ready).await;
    }

    /// Next server event, or `None` once the socket is closed.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        loop {
            let message = tokio::time::timeout(EVENT_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for a server event");
            let frame = match message {
                Some(Ok(Message::Text(text))) => Frame::Text(text.to_string()),
                Some(Ok(Message::Binary(bytes))) => Frame::Binary(bytes),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
            };
            return Some(ServerEvent::decode(frame).expect("server sent a malformed frame"));
        }
    }

    /// Read events until the status line `status` arrives. Returns what came before.
    pub async fn expect_status(&mut self, status: &str) -> Vec<ServerEvent> {
        let wanted = ServerEvent::status(status);
        let mut seen = Vec::new();
        loop {
            match self.next_event().await {
                Some(event) if event == wanted => return seen,
                Some(event) => seen.push(event),
                None => panic!("socket closed before {status:?}; saw {seen:?}"),
            }
        }
    }

    /// Read events until the socket closes.
    pub async fn drain(&mut self) -> Vec<ServerEvent> {
        let mut seen = Vec::new();
        while let Some(event) = self.next_event().await {
            seen.push(event);
        }
        seen
    }

    pub async fn close(mut self) {
        self.ws.close(None).await.ok();
    }
}
