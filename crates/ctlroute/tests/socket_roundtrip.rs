//! End-to-end: client and server over a real Unix socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::task::JoinHandle;

use ctlroute::{
    ClientConfig, ClientError, ControlClient, ControlServer, Health, HandlerError, HandlerRegistry,
    PowerManager, RouterConfig, RouterService, ServerError, handler_fn, register_power_handlers,
    register_system_handlers,
};

struct Harness {
    _dir: tempfile::TempDir,
    path: PathBuf,
    service: Arc<RouterService>,
    server: JoinHandle<Result<(), ServerError>>,
}

impl Harness {
    async fn start(registry: HandlerRegistry) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let service = Arc::new(RouterService::new(Arc::new(registry)));
        let server = ControlServer::new(
            RouterConfig::default().with_socket_path(&path),
            Arc::clone(&service),
        );
        let server = tokio::spawn(async move { server.serve().await });

        wait_until(|| {
            let service = Arc::clone(&service);
            async move { service.health().await.status == Health::Ready }
        })
        .await;

        Self {
            _dir: dir,
            path,
            service,
            server,
        }
    }

    async fn client(&self) -> ControlClient {
        ControlClient::connect(&self.path, ClientConfig::default())
            .await
            .unwrap()
    }

    async fn stop(self) {
        self.service.trigger_shutdown();
        tokio::time::timeout(Duration::from_secs(5), self.server)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
        assert!(!socket_exists(&self.path));
    }
}

fn socket_exists(path: &Path) -> bool {
    path.exists()
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn default_registry() -> HandlerRegistry {
    let registry = HandlerRegistry::new();
    register_system_handlers(&registry).unwrap();
    register_power_handlers(&registry, Arc::new(PowerManager::default())).unwrap();
    registry
}

#[tokio::test]
async fn handshake_and_ping() {
    let harness = Harness::start(default_registry()).await;
    let client = harness.client().await;

    client.send_ready().await.unwrap();
    let latency = client.ping().await.unwrap();
    assert!(latency < Duration::from_secs(2));

    let service = Arc::clone(&harness.service);
    wait_until(|| {
        let service = Arc::clone(&service);
        async move { service.health().await.ready_peers == 1 }
    })
    .await;

    drop(client);
    wait_until(|| {
        let service = Arc::clone(&service);
        async move { service.health().await.connections == 0 }
    })
    .await;

    harness.stop().await;
}

#[tokio::test]
async fn unknown_action_reports_error() {
    let harness = Harness::start(default_registry()).await;
    let client = harness.client().await;

    let err = client
        .request("system", "frobnicate", Value::Null)
        .await
        .unwrap_err();
    match err {
        ClientError::Remote(message) => assert_eq!(message, "Unknown system action: frobnicate"),
        other => panic!("expected remote error, got {other:?}"),
    }

    harness.stop().await;
}

#[tokio::test]
async fn power_actions_round_trip() {
    let harness = Harness::start(default_registry()).await;
    let client = harness.client().await;

    let status = client.request("power", "status", Value::Null).await.unwrap();
    assert_eq!(status, json!({"prevented": false}));

    client
        .notify("power", "sessions", json!({"count": 2, "enabled": true}))
        .await
        .unwrap();
    // Same connection: the request below is read after the event, but may
    // finish first, so poll.
    let poller = client.clone();
    wait_until(move || {
        let client = poller.clone();
        async move {
            client.request("power", "status", Value::Null).await.unwrap() == json!({"prevented": true})
        }
    })
    .await;

    let allowed = client.request("power", "allow_sleep", Value::Null).await.unwrap();
    assert_eq!(allowed, json!({"prevented": false}));

    harness.stop().await;
}

#[tokio::test]
async fn concurrent_requests_are_correlated() {
    let registry = default_registry();
    registry
        .register(
            "test",
            "echo",
            handler_fn(|_conn, env| async move {
                let delay = env.payload_as::<Value>()?["delay_ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(env.payload.unwrap_or_default())
            }),
        )
        .unwrap();
    registry
        .register(
            "test",
            "fail",
            handler_fn(|_conn, _env| async { Err(HandlerError::failed("refused")) }),
        )
        .unwrap();
    let harness = Harness::start(registry).await;
    let client = harness.client().await;

    let mut tasks = Vec::new();
    for i in 0..20u64 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let payload = json!({"n": i, "delay_ms": (20 - i) * 5});
            let reply = client.request("test", "echo", payload.clone()).await.unwrap();
            assert_eq!(reply, payload);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let err = client.request("test", "fail", Value::Null).await.unwrap_err();
    assert!(matches!(err, ClientError::Remote(ref m) if m == "refused"));
    assert_eq!(client.pending_requests(), 0);

    harness.stop().await;
}

#[tokio::test]
async fn second_server_on_live_socket_fails() {
    let harness = Harness::start(default_registry()).await;

    let other = ControlServer::new(
        RouterConfig::default().with_socket_path(&harness.path),
        Arc::new(RouterService::new(Arc::new(HandlerRegistry::new()))),
    );
    let err = other.serve().await.unwrap_err();
    assert!(matches!(err, ServerError::Bind { .. }));

    // The original server is untouched.
    let client = harness.client().await;
    client.ping().await.unwrap();

    harness.stop().await;
}

#[tokio::test]
async fn shutdown_closes_clients() {
    let harness = Harness::start(default_registry()).await;
    let client = harness.client().await;
    client.ping().await.unwrap();

    harness.stop().await;

    let poller = client.clone();
    wait_until(move || {
        let closed = poller.is_closed();
        async move { closed }
    })
    .await;
    let err = client.ping().await.unwrap_err();
    assert!(matches!(err, ClientError::Closed));
}
