//! Integration tests of the control-plane API against the in-memory
//! object store: session lifecycle, ownership, warm-pool consumption,
//! and the CONNECT tunnel over a real socket.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use control_plane::{Reaper, SessionIndex, UserClientCache, WarmPoolController, WatchAdapter};
use object_store::{ClientFactory, MemoryClientFactory, MemoryStore, ObjectStore, Selector};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const ALICE: &str = "alice-token";
const BOB: &str = "bob-token";

struct TestEnv {
    store: Arc<MemoryStore>,
    index: Arc<SessionIndex>,
    router: axum::Router<()>,
    app: Arc<control_plane_api::App>,
    shutdown: CancellationToken,
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn env(warm_pool: Option<&str>, in_pod_port: u16) -> TestEnv {
    let store = MemoryStore::new();
    let factory = MemoryClientFactory::new(store.clone());
    factory.register_token(ALICE, "alice");
    factory.register_token(BOB, "bob");

    let shutdown = CancellationToken::new();
    let index = Arc::new(SessionIndex::new());
    let (scheduler, scheduler_rx) = control_plane::Scheduler::new();
    let watch = WatchAdapter::new(index.clone(), scheduler);

    tokio::spawn(control_plane::scheduler::run(
        scheduler_rx,
        Arc::new(Reaper::new(factory.system_client())),
        shutdown.clone(),
    ));
    tokio::spawn(watch.clone().run(
        factory.system_client(),
        "default".to_string(),
        shutdown.clone(),
    ));

    let app = Arc::new(control_plane_api::App {
        index: index.clone(),
        watch,
        factory: factory.clone() as Arc<dyn ClientFactory>,
        clients: UserClientCache::default(),
        policy: Box::new(control_plane_api::CreatorOrSystem {
            system_principal: factory.system_principal().to_string(),
        }),
        warm_poke: None,
        config: control_plane_api::Config {
            namespace: "default".to_string(),
            warm_pool: warm_pool.map(str::to_string),
            in_pod_port,
            connect_timeout: Duration::from_secs(2),
            default_image: "agentcube/sandbox:latest".to_string(),
        },
    });

    TestEnv {
        store,
        index,
        router: control_plane_api::build_router(app.clone()),
        app,
        shutdown,
    }
}

/// Marks every pending sandbox Ready shortly after creation, standing in
/// for the orchestrator.
fn spawn_fake_orchestrator(store: Arc<MemoryStore>, delay: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            let pending = store
                .list_sandboxes("default", &Selector::everything())
                .await
                .unwrap_or_default();
            for sandbox in pending.into_iter().filter(|s| s.ready.is_none()) {
                let store = store.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = store.set_sandbox_ready(
                        "default",
                        &sandbox.meta.name,
                        true,
                        Some("127.0.0.1"),
                    );
                });
            }
        }
    });
}

async fn request_json(
    router: &axum::Router<()>,
    method: &str,
    path: &str,
    token: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header(header::AUTHORIZATION, format!("Bearer {token}"));
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create_sandbox(env: &TestEnv, token: &str, body: serde_json::Value) -> serde_json::Value {
    let (status, value) = request_json(&env.router, "POST", "/v1/sandboxes", token, Some(body)).await;
    assert_eq!(status, StatusCode::OK, "{value}");
    value
}

#[tokio::test]
async fn test_health_is_open() {
    let env = env(None, 8888).await;
    let response = env
        .router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_requests_require_a_known_token() {
    let env = env(None, 8888).await;

    let (status, _) = request_json(&env.router, "GET", "/v1/sandboxes", "unknown", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let response = env
        .router
        .clone()
        .oneshot(
            Request::get("/v1/sandboxes")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    // Missing Authorization header entirely.
    assert_ne!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_create_then_visible_to_creator_only() {
    let env = env(None, 8888).await;
    spawn_fake_orchestrator(env.store.clone(), Duration::from_millis(100), env.shutdown.clone());

    // The sandbox becomes Ready only after the create call is already
    // waiting; the pre-registered watch must still observe it.
    let record = create_sandbox(&env, ALICE, serde_json::json!({"ttl": 600})).await;
    let id = record["sessionId"].as_str().unwrap().to_string();
    assert_eq!(record["status"], "Running");
    assert_eq!(record["creatorPrincipal"], "alice");
    assert!(record["objectName"].as_str().unwrap().starts_with("sandbox-"));

    let (status, fetched) =
        request_json(&env.router, "GET", &format!("/v1/sandboxes/{id}"), ALICE, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["sessionId"], id.as_str());

    // Another principal can neither fetch nor see it listed.
    let (status, _) =
        request_json(&env.router, "GET", &format!("/v1/sandboxes/{id}"), BOB, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, listed) = request_json(&env.router, "GET", "/v1/sandboxes", BOB, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["total"], 0);

    let (status, listed) = request_json(&env.router, "GET", "/v1/sandboxes", ALICE, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["total"], 1);
    assert_eq!(listed["limit"], 50);
}

#[tokio::test]
async fn test_ttl_bounds_are_enforced() {
    let env = env(None, 8888).await;
    spawn_fake_orchestrator(env.store.clone(), Duration::from_millis(10), env.shutdown.clone());

    for bad in [59, 28801] {
        let (status, body) = request_json(
            &env.router,
            "POST",
            "/v1/sandboxes",
            ALICE,
            Some(serde_json::json!({"ttl": bad})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "ttl {bad}");
        assert_eq!(body["error"], "INVALID_TTL");
    }

    for good in [60, 28800] {
        create_sandbox(&env, ALICE, serde_json::json!({"ttl": good})).await;
    }
}

#[tokio::test]
async fn test_delete_is_driven_through_the_watch() {
    let env = env(None, 8888).await;
    spawn_fake_orchestrator(env.store.clone(), Duration::from_millis(10), env.shutdown.clone());

    let record = create_sandbox(&env, ALICE, serde_json::json!({})).await;
    let id = record["sessionId"].as_str().unwrap().to_string();
    let name = record["objectName"].as_str().unwrap().to_string();

    // Bob may not delete Alice's sandbox.
    let (status, _) =
        request_json(&env.router, "DELETE", &format!("/v1/sandboxes/{id}"), BOB, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) =
        request_json(&env.router, "DELETE", &format!("/v1/sandboxes/{id}"), ALICE, None).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    // The object is gone from the store, and the watch removes the record.
    assert!(env.store.get_sandbox("default", &name).await.unwrap_err().is_not_found());
    for _ in 0..100 {
        if env.index.get(&id).is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let (status, _) =
        request_json(&env.router, "GET", &format!("/v1/sandboxes/{id}"), ALICE, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_pagination_bounds() {
    let env = env(None, 8888).await;

    let (status, body) =
        request_json(&env.router, "GET", "/v1/sandboxes?limit=0", ALICE, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

    let (status, _) =
        request_json(&env.router, "GET", "/v1/sandboxes?limit=101", ALICE, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) =
        request_json(&env.router, "GET", "/v1/sandboxes?limit=1&offset=5", ALICE, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["limit"], 1);
    assert_eq!(body["offset"], 5);
}

#[tokio::test]
async fn test_warm_pool_consumption_and_backfill() {
    let env = env(Some("pool"), 8888).await;

    env.store.put_warm_pool(
        "default",
        "pool",
        object_store::WarmPoolSpec {
            template: object_store::PodTemplate {
                image: "agentcube/sandbox:latest".to_string(),
                ..Default::default()
            },
            desired_replicas: 2,
        },
    );
    let controller = WarmPoolController::new(
        env.app.factory.system_client(),
        "default".to_string(),
        "pool".to_string(),
    );
    controller.reconcile().await.unwrap();

    let warm = Selector::label(models::LABEL_WARM, "true");
    let members = env.store.list_sandboxes("default", &warm).await.unwrap();
    assert_eq!(members.len(), 2);
    for member in &members {
        env.store
            .set_sandbox_ready("default", &member.meta.name, true, Some("10.0.0.7"))
            .unwrap();
    }

    // The claim consumes a warm member instead of creating a new object.
    let record = create_sandbox(&env, ALICE, serde_json::json!({"ttl": 600})).await;
    assert!(record["objectName"]
        .as_str()
        .unwrap()
        .starts_with("pool-warm-"));
    assert_eq!(record["status"], "Running");
    assert_eq!(
        env.store.list_sandboxes("default", &warm).await.unwrap().len(),
        1
    );

    // Reconcile backfills the donated member.
    controller.reconcile().await.unwrap();
    assert_eq!(
        env.store.list_sandboxes("default", &warm).await.unwrap().len(),
        2
    );

    // Deleting the pool cascades to its remaining members, but not to the
    // bound sandbox.
    let bound = record["objectName"].as_str().unwrap();
    env.store.delete_warm_pool("default", "pool").unwrap();
    assert_eq!(
        env.store
            .list_sandboxes("default", &Selector::everything())
            .await
            .unwrap()
            .iter()
            .filter(|s| s.meta.name != bound)
            .count(),
        0
    );
    assert!(env.store.get_sandbox("default", bound).await.is_ok());
}

#[tokio::test]
async fn test_tunnel_half_close_over_a_real_socket() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Backend: read until client FIN, then answer with 2 KiB and close.
    let backend = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend.local_addr().unwrap().port();
    let backend_task = tokio::spawn(async move {
        let (mut socket, _) = backend.accept().await.unwrap();
        let mut received = Vec::new();
        socket.read_to_end(&mut received).await.unwrap();
        socket.write_all(&vec![0x5a; 2048]).await.unwrap();
        socket.shutdown().await.unwrap();
        received
    });

    let env = env(None, backend_port).await;
    spawn_fake_orchestrator(env.store.clone(), Duration::from_millis(10), env.shutdown.clone());
    let record = create_sandbox(&env, ALICE, serde_json::json!({"ttl": 600})).await;
    let id = record["sessionId"].as_str().unwrap().to_string();

    // Serve the router on a real socket so CONNECT can upgrade.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let router = env.router.clone();
    let server = tokio::spawn(async move { axum::serve(listener, router).await });

    let mut client = tokio::net::TcpStream::connect(address).await.unwrap();
    client
        .write_all(
            format!(
                "CONNECT /v1/sandboxes/{id} HTTP/1.1\r\nHost: agentcube\r\nAuthorization: Bearer {ALICE}\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    // Read the response head.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        client.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    // Send 1 KiB and half-close our write side.
    client.write_all(&vec![0xa5; 1024]).await.unwrap();
    client.shutdown().await.unwrap();

    // The backend's 2 KiB still arrives after our FIN.
    let mut returned = Vec::new();
    client.read_to_end(&mut returned).await.unwrap();
    assert_eq!(returned.len(), 2048);
    assert!(returned.iter().all(|b| *b == 0x5a));

    let received = backend_task.await.unwrap();
    assert_eq!(received.len(), 1024);

    // Tunnel activity was stamped on the record and the object.
    let record = env.index.get(&id).unwrap();
    assert!(record.last_activity_at.is_some());

    server.abort();
}

#[tokio::test]
async fn test_tunnel_rejects_foreign_and_unknown_sessions() {
    let env = env(None, 1).await;
    spawn_fake_orchestrator(env.store.clone(), Duration::from_millis(10), env.shutdown.clone());
    let record = create_sandbox(&env, ALICE, serde_json::json!({})).await;
    let id = record["sessionId"].as_str().unwrap().to_string();

    let (status, _) = request_json(
        &env.router,
        "CONNECT",
        &format!("/v1/sandboxes/{id}"),
        BOB,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = request_json(
        &env.router,
        "CONNECT",
        "/v1/sandboxes/does-not-exist",
        ALICE,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
