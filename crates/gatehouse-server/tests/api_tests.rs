//! HTTP API integration tests.
//!
//! Exercise the router end-to-end against in-memory backends: login and
//! token lifecycle, deny-by-default authorization, login rate limiting.
//! No network listener — requests go straight through the tower service.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use gatehouse_storage::UserStore;

use axum::Router;
use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{Request, StatusCode, header};
use chrono::Utc;
use tower::ServiceExt;
use uuid::Uuid;

use gatehouse_broker::tcp::TcpBridgeDriver;
use gatehouse_broker::{DriverRegistry, SessionBroker};
use gatehouse_core::audit::AuditRecorder;
use gatehouse_core::auth::AuthService;
use gatehouse_core::cache::Cache;
use gatehouse_core::crypto;
use gatehouse_core::permission::{PermissionChecker, builtin_registry};
use gatehouse_core::ratelimit::{LimitRule, RateLimiter};
use gatehouse_core::session::{DEFAULT_REFRESH_TTL, SessionService};
use gatehouse_core::settings::SettingsService;
use gatehouse_core::sso::SsoResolver;
use gatehouse_core::token::{DEFAULT_ACCESS_TTL, TokenSigner};
use gatehouse_core::vault::VaultService;
use gatehouse_server::routes;
use gatehouse_server::state::AppState;
use gatehouse_storage::models::User;
use gatehouse_storage::{KvStore, MemoryKv, MemoryStore, Store};

struct TestApp {
    app: Router,
    store: Arc<MemoryStore>,
    state: Arc<AppState>,
}

fn make_user(username: &str, password: &str, is_root: bool) -> User {
    User {
        id: Uuid::new_v4(),
        username: username.to_owned(),
        email: format!("{username}@example.com"),
        password_hash: crypto::hash_password(password).unwrap(),
        first_name: None,
        last_name: None,
        is_active: true,
        is_root,
        auth_provider: "local".to_owned(),
        auth_subject: None,
        last_login_at: None,
        last_login_ip: None,
        created_at: Utc::now(),
    }
}

async fn test_app() -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let store_dyn: Arc<dyn Store> = Arc::clone(&store) as Arc<dyn Store>;
    let kv = Arc::new(MemoryKv::new());

    store
        .insert_user(&make_user("admin", "Secret123!", true))
        .await
        .unwrap();

    let registry = Arc::new(builtin_registry().unwrap());
    let checker = Arc::new(PermissionChecker::new(registry, Arc::clone(&store_dyn)));
    let settings = Arc::new(SettingsService::new(Arc::clone(&store_dyn)));
    let audit = Arc::new(AuditRecorder::new(Arc::clone(&store_dyn), 90));
    let sessions = Arc::new(SessionService::new(
        Arc::clone(&store_dyn),
        Cache::new(Arc::clone(&kv) as Arc<dyn KvStore>),
        TokenSigner::new(&[9u8; 32], DEFAULT_ACCESS_TTL),
        DEFAULT_REFRESH_TTL,
    ));
    let auth = Arc::new(AuthService::new(
        Arc::clone(&store_dyn),
        Arc::clone(&sessions),
    ));
    let sso = Arc::new(SsoResolver::new(
        Arc::clone(&store_dyn),
        Arc::clone(&sessions),
        true,
    ));
    let vault = Arc::new(VaultService::new(
        Arc::clone(&store_dyn),
        crypto::SecretKey::generate(),
        Arc::clone(&audit),
    ));

    let drivers = Arc::new(DriverRegistry::new());
    drivers.register(Arc::new(TcpBridgeDriver::new())).unwrap();

    let broker = Arc::new(SessionBroker::new(
        Arc::clone(&store_dyn),
        Arc::clone(&drivers),
        Arc::clone(&checker),
        Arc::clone(&vault),
        Arc::clone(&settings),
        Arc::clone(&audit),
        std::env::temp_dir().join(format!("gh-api-{}", Uuid::new_v4())),
    ));

    let limiter = Arc::new(RateLimiter::new(Arc::clone(&kv) as Arc<dyn KvStore>, None));

    let state = Arc::new(AppState {
        store: store_dyn,
        sessions,
        auth,
        sso,
        checker,
        vault,
        settings,
        audit,
        drivers,
        broker,
        limiter,
        login_rule: LimitRule::new(100, Duration::from_secs(60)),
    });

    let app = routes::router(Arc::clone(&state)).layer(MockConnectInfo(std::net::SocketAddr::from(
        ([127, 0, 0, 1], 52000),
    )));

    TestApp { app, store, state }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, body)
}

fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_authed(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

async fn login(app: &Router, username: &str, password: &str) -> (StatusCode, serde_json::Value) {
    send(
        app,
        post_json(
            "/v1/auth/login",
            &serde_json::json!({ "username": username, "password": password }),
        ),
    )
    .await
}

#[tokio::test]
async fn health_is_public() {
    let test = test_app().await;
    let (status, body) = send(
        &test.app,
        Request::builder()
            .uri("/v1/health")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn login_me_refresh_logout_lifecycle() {
    let test = test_app().await;

    // Login as the root user.
    let (status, body) = login(&test.app, "admin", "Secret123!").await;
    assert_eq!(status, StatusCode::OK);
    let access = body["access"].as_str().unwrap().to_owned();
    let refresh = body["refresh"].as_str().unwrap().to_owned();
    assert_eq!(body["user"]["username"], "admin");
    assert_eq!(body["user"]["is_root"], true);

    // The access token answers /auth/me.
    let (status, body) = send(&test.app, get_authed("/v1/auth/me", &access)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], "admin");
    assert_eq!(body["is_root"], true);

    // Refresh rotates the refresh token.
    let (status, body) = send(
        &test.app,
        post_json("/v1/auth/refresh", &serde_json::json!({ "refresh_token": refresh })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rotated = body["refresh"].as_str().unwrap().to_owned();
    let new_access = body["access"].as_str().unwrap().to_owned();
    assert_ne!(rotated, refresh);

    // The old refresh token is dead.
    let (status, _) = send(
        &test.app,
        post_json("/v1/auth/refresh", &serde_json::json!({ "refresh_token": refresh })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Logout revokes; the access token stops working.
    let (status, _) = send(
        &test.app,
        Request::builder()
            .method("POST")
            .uri("/v1/auth/logout")
            .header(header::AUTHORIZATION, format!("Bearer {new_access}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&test.app, get_authed("/v1/auth/me", &new_access)).await;
    assert_eq!(status, StatusCode::GONE);

    // And the rotated refresh token reports the revocation.
    let (status, _) = send(
        &test.app,
        post_json("/v1/auth/refresh", &serde_json::json!({ "refresh_token": rotated })),
    )
    .await;
    assert!(status == StatusCode::GONE || status == StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_refresh_token_is_not_found() {
    let test = test_app().await;
    let (status, _) = send(
        &test.app,
        post_json(
            "/v1/auth/refresh",
            &serde_json::json!({ "refresh_token": "nope" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn wrong_password_is_unauthorized() {
    let test = test_app().await;
    let (status, _) = login(&test.app, "admin", "wrong").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn non_root_without_roles_is_denied_users_but_not_health() {
    let test = test_app().await;
    test.store
        .insert_user(&make_user("nobody", "Passw0rd!", false))
        .await
        .unwrap();

    let (status, body) = login(&test.app, "nobody", "Passw0rd!").await;
    assert_eq!(status, StatusCode::OK);
    let access = body["access"].as_str().unwrap().to_owned();

    let (status, _) = send(&test.app, get_authed("/v1/users", &access)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &test.app,
        Request::builder()
            .uri("/v1/health")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Root sees the user list.
    let (_, body) = login(&test.app, "admin", "Secret123!").await;
    let admin_access = body["access"].as_str().unwrap().to_owned();
    let (status, body) = send(&test.app, get_authed("/v1/users", &admin_access)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn hundred_and_first_login_is_rate_limited() {
    let test = test_app().await;

    for _ in 0..100 {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/auth/login")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::from(
                serde_json::json!({ "username": "admin", "password": "wrong" }).to_string(),
            ))
            .unwrap();
        let (status, _) = send(&test.app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    let request = Request::builder()
        .method("POST")
        .uri("/v1/auth/login")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", "203.0.113.7")
        .body(Body::from(
            serde_json::json!({ "username": "admin", "password": "Secret123!" }).to_string(),
        ))
        .unwrap();
    let response = test.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response
        .headers()
        .get(header::RETRY_AFTER)
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1 && retry_after <= 60);

    // A different source IP is unaffected.
    let request = Request::builder()
        .method("POST")
        .uri("/v1/auth/login")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", "198.51.100.9")
        .body(Body::from(
            serde_json::json!({ "username": "admin", "password": "Secret123!" }).to_string(),
        ))
        .unwrap();
    let (status, _) = send(&test.app, request).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn permission_registry_renders_for_any_authenticated_user() {
    let test = test_app().await;
    test.store
        .insert_user(&make_user("viewer", "Passw0rd!", false))
        .await
        .unwrap();
    let (_, body) = login(&test.app, "viewer", "Passw0rd!").await;
    let access = body["access"].as_str().unwrap().to_owned();

    let (status, body) = send(&test.app, get_authed("/v1/permissions/registry", &access)).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|d| d["id"].as_str())
        .collect();
    assert!(ids.contains(&"connection.launch"));
    assert!(ids.contains(&"tcp.connect"));

    // Effective capabilities for self are visible without extra grants.
    let (status, body) = send(
        &test.app,
        get_authed("/v1/auth/me", &access),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let my_id = body["id"].as_str().unwrap().to_owned();
    let (status, body) = send(
        &test.app,
        get_authed(&format!("/v1/permissions/effective/user/{my_id}"), &access),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["permissions"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn protocol_catalog_lists_tcp_bridge() {
    let test = test_app().await;
    let (_, body) = login(&test.app, "admin", "Secret123!").await;
    let access = body["access"].as_str().unwrap().to_owned();

    let (status, body) = send(&test.app, get_authed("/v1/protocols", &access)).await;
    assert_eq!(status, StatusCode::OK);
    let catalog = body.as_array().unwrap();
    assert_eq!(catalog.len(), 1);
    assert_eq!(catalog[0]["descriptor"]["id"], "tcp");
    assert_eq!(catalog[0]["capabilities"]["terminal"], true);
    assert_eq!(catalog[0]["enabled"], true);
}

#[tokio::test]
async fn vault_read_requires_share_or_ownership() {
    let test = test_app().await;
    test.store
        .insert_user(&make_user("stranger", "Passw0rd!", false))
        .await
        .unwrap();

    let (_, body) = login(&test.app, "admin", "Secret123!").await;
    let admin_access = body["access"].as_str().unwrap().to_owned();

    // Admin stores a secret.
    let (status, body) = send(
        &test.app,
        Request::builder()
            .method("POST")
            .uri("/v1/vault/identities")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {admin_access}"))
            .body(Body::from(
                serde_json::json!({ "name": "db-password", "secret": "hunter2" }).to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let identity_id = body["id"].as_str().unwrap().to_owned();

    // Owner reads it back decrypted.
    let (status, body) = send(
        &test.app,
        get_authed(&format!("/v1/vault/identities/{identity_id}"), &admin_access),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["secret"], "hunter2");
    assert_eq!(body["encoding"], "utf8");

    // A stranger without a share gets 403.
    let (_, body) = login(&test.app, "stranger", "Passw0rd!").await;
    let stranger_access = body["access"].as_str().unwrap().to_owned();
    let (status, _) = send(
        &test.app,
        get_authed(
            &format!("/v1/vault/identities/{identity_id}"),
            &stranger_access,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn launch_and_close_live_session_over_http() {
    let test = test_app().await;
    let (_, body) = login(&test.app, "admin", "Secret123!").await;
    let access = body["access"].as_str().unwrap().to_owned();

    // A real TCP target the bridge driver can reach.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _held = listener.accept().await;
        std::future::pending::<()>().await;
    });

    let (status, body) = send(
        &test.app,
        Request::builder()
            .method("POST")
            .uri("/v1/connections")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {access}"))
            .body(Body::from(
                serde_json::json!({
                    "name": "loopback",
                    "protocol_id": "tcp",
                    "host": "127.0.0.1",
                    "port": port,
                })
                .to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let connection_id = body["id"].as_str().unwrap().to_owned();

    let gauge_before = test.state.broker.active_count();
    let (status, body) = send(
        &test.app,
        Request::builder()
            .method("POST")
            .uri(format!("/v1/connections/{connection_id}/launch"))
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {access}"))
            .body(Body::from("{}"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let session_id = body["session_id"].as_str().unwrap().to_owned();
    assert_eq!(
        body["ws_url"],
        format!("/v1/active-sessions/{session_id}/ws")
    );
    assert_eq!(test.state.broker.active_count(), gauge_before + 1);

    let (status, body) = send(&test.app, get_authed("/v1/active-sessions", &access)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, _) = send(
        &test.app,
        Request::builder()
            .method("DELETE")
            .uri(format!("/v1/active-sessions/{session_id}"))
            .header(header::AUTHORIZATION, format!("Bearer {access}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(test.state.broker.active_count(), gauge_before);

    let (status, body) = send(&test.app, get_authed("/v1/audit?limit=20", &access)).await;
    assert_eq!(status, StatusCode::OK);
    let actions: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["action"].as_str())
        .collect();
    assert!(actions.contains(&"session.opened"));
    assert!(actions.contains(&"session.closed"));
}

#[tokio::test]
async fn launch_against_missing_connection_is_not_found() {
    let test = test_app().await;
    let (_, body) = login(&test.app, "admin", "Secret123!").await;
    let access = body["access"].as_str().unwrap().to_owned();

    let (status, _) = send(
        &test.app,
        Request::builder()
            .method("POST")
            .uri(format!("/v1/connections/{}/launch", Uuid::new_v4()))
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {access}"))
            .body(Body::from("{}"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
