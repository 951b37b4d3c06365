//! REST API tests driven through the router with `tower::ServiceExt`

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{expect_opened, setup, setup_custom, TestClient, TEST_TOKEN};
use fxtunnel_server::api::{api_router, mint_access_token};
use fxtunnel_store::{PlanRecord, Store, UserRecord};
use serde_json::Value;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

async fn call(router: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: Value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

fn get(path: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header("authorization", format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

fn delete(path: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(path)
        .header("authorization", format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

fn post_json(path: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("authorization", format!("Bearer {}", token))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_is_public() {
    let env = setup(26100).await;
    let router = api_router(env.state.clone());
    let (status, json) = call(
        &router,
        Request::builder().uri("/api/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
}

#[tokio::test]
async fn test_missing_token_is_401_with_code() {
    let env = setup(26110).await;
    let router = api_router(env.state.clone());
    let (status, json) = call(
        &router,
        Request::builder().uri("/api/tunnels").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["code"], "NOT_AUTHENTICATED");
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_list_tunnels_with_api_token() {
    let env = setup(26120).await;
    let mut client = TestClient::connect(&env.state).await;
    client.auth(TEST_TOKEN).await;
    expect_opened(client.open_http(Some("demo")).await);

    let router = api_router(env.state.clone());
    let (status, json) = call(&router, get("/api/tunnels", TEST_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    let rows = json.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["kind"], "http");
    assert_eq!(rows[0]["subdomain"], "demo");
    assert!(rows[0]["last_heartbeat_at"].is_string());
}

#[tokio::test]
async fn test_delete_tunnel_idempotence() {
    let env = setup(26130).await;
    let mut client = TestClient::connect(&env.state).await;
    client.auth(TEST_TOKEN).await;
    let (tunnel_id, _, _) = expect_opened(client.open_http(Some("bye")).await);

    let router = api_router(env.state.clone());
    let path = format!("/api/tunnels/{}", tunnel_id);
    let (status, _) = call(&router, delete(&path, TEST_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(env.state.registry.lookup_subdomain("bye").await.is_none());

    // Second delete: the tunnel no longer exists
    let (status, json) = call(&router, delete(&path, TEST_TOKEN)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_foreign_tunnel_is_invisible() {
    let env = setup(26140).await;
    let mut client = TestClient::connect(&env.state).await;
    client.auth(TEST_TOKEN).await;
    let (tunnel_id, _, _) = expect_opened(client.open_http(Some("mine")).await);

    // Another, non-admin principal
    let stranger = UserRecord {
        id: Uuid::new_v4(),
        display_name: "stranger".to_string(),
        is_admin: false,
        plan_id: "default".to_string(),
        disabled: false,
        created_at: chrono::Utc::now(),
    };
    env.store.put_user(stranger.clone()).await.unwrap();
    let jwt = mint_access_token(
        &env.state.config.api.jwt_secret,
        &stranger,
        Duration::from_secs(600),
    );

    let router = api_router(env.state.clone());
    let (status, _) =
        call(&router, delete(&format!("/api/tunnels/{}", tunnel_id), &jwt)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    // Still routable
    assert!(env.state.registry.lookup_subdomain("mine").await.is_some());
}

#[tokio::test]
async fn test_jwt_auth_and_expiry_shape() {
    let env = setup(26150).await;
    let user = env.store.get_user(env.user_id).await.unwrap().unwrap();
    let jwt = mint_access_token(
        &env.state.config.api.jwt_secret,
        &user,
        Duration::from_secs(600),
    );

    let router = api_router(env.state.clone());
    let (status, _) = call(&router, get("/api/tunnels", &jwt)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = call(&router, get("/api/tunnels", "not.a.jwt")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["code"], "NOT_AUTHENTICATED");
}

#[tokio::test]
async fn test_admin_route_requires_admin() {
    let env = setup(26160).await;
    let router = api_router(env.state.clone());

    let (status, json) = call(&router, get("/api/admin/tunnels", TEST_TOKEN)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["code"], "FORBIDDEN");

    // Promote the user and try again
    let mut user = env.store.get_user(env.user_id).await.unwrap().unwrap();
    user.is_admin = true;
    env.store.put_user(user).await.unwrap();
    let (status, _) = call(&router, get("/api/admin/tunnels", TEST_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_reserved_subdomain_crud_and_conflict() {
    let env = setup(26170).await;
    let router = api_router(env.state.clone());

    let (status, json) = call(
        &router,
        post_json("/api/domains", TEST_TOKEN, serde_json::json!({ "subdomain": "Keep" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["subdomain"], "keep");

    // Conflicting reservation from another principal
    let stranger = UserRecord {
        id: Uuid::new_v4(),
        display_name: "stranger".to_string(),
        is_admin: false,
        plan_id: "default".to_string(),
        disabled: false,
        created_at: chrono::Utc::now(),
    };
    env.store.put_user(stranger.clone()).await.unwrap();
    let jwt = mint_access_token(
        &env.state.config.api.jwt_secret,
        &stranger,
        Duration::from_secs(600),
    );
    let (status, json) = call(
        &router,
        post_json("/api/domains", &jwt, serde_json::json!({ "subdomain": "keep" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "SUBDOMAIN_TAKEN");

    let (status, _) = call(&router, get("/api/domains", TEST_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(&router, delete("/api/domains/keep", TEST_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&router, delete("/api/domains/keep", TEST_TOKEN)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_custom_domain_requires_reserved_target() {
    let env = setup(26180).await;
    let router = api_router(env.state.clone());

    let (status, json) = call(
        &router,
        post_json(
            "/api/custom-domains",
            TEST_TOKEN,
            serde_json::json!({ "domain": "app.external.test", "target_subdomain": "x" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["code"], "TARGET_NOT_RESERVED");

    // Reserve the target, then the custom domain is accepted unverified
    let (status, _) = call(
        &router,
        post_json("/api/domains", TEST_TOKEN, serde_json::json!({ "subdomain": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = call(
        &router,
        post_json(
            "/api/custom-domains",
            TEST_TOKEN,
            serde_json::json!({ "domain": "app.external.test", "target_subdomain": "x" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["verified"], false);

    // Domains under the base domain are refused
    let (status, json) = call(
        &router,
        post_json(
            "/api/custom-domains",
            TEST_TOKEN,
            serde_json::json!({ "domain": "evil.example.test", "target_subdomain": "x" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "INVALID_DOMAIN");

    let (status, _) = call(&router, delete("/api/custom-domains/app.external.test", TEST_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_inspect_listing_and_clear() {
    let env = setup(26190).await;
    let mut client = TestClient::connect(&env.state).await;
    client.auth(TEST_TOKEN).await;
    let (tunnel_id, _, _) = expect_opened(client.open_http(Some("ins")).await);

    for i in 0..3 {
        env.state.inspect.push(fxtunnel_store::CapturedExchange {
            id: Uuid::new_v4(),
            tunnel_id,
            host: "ins.example.test".to_string(),
            timestamp: chrono::Utc::now(),
            duration_ns: 10 + i,
            method: "GET".to_string(),
            path: format!("/{}", i),
            status: 200,
            req_headers: vec![],
            resp_headers: vec![],
            req_body: String::new(),
            resp_body: String::new(),
            req_truncated: false,
            resp_truncated: false,
            error: false,
            replay_ref: None,
        });
    }

    let router = api_router(env.state.clone());
    let path = format!("/api/tunnels/{}/inspect?limit=2", tunnel_id);
    let (status, json) = call(&router, get(&path, TEST_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    let rows = json.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    // Latest first
    assert_eq!(rows[0]["path"], "/2");

    let (status, _) = call(
        &router,
        delete(&format!("/api/tunnels/{}/inspect", tunnel_id), TEST_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(env.state.inspect.ring_len(tunnel_id), 0);

    // Unknown exchange id
    let (status, _) = call(
        &router,
        get(
            &format!("/api/tunnels/{}/inspect/{}", tunnel_id, Uuid::new_v4()),
            TEST_TOKEN,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_global_rate_limit_trips() {
    let env = setup_custom(
        26200,
        PlanRecord {
            id: "default".to_string(),
            max_tunnels: 8,
            max_subdomains: 8,
            max_custom_domains: 4,
            inspector_enabled: true,
        },
        |config| {
            config.server.api.rate_limiting.global_per_minute = 3;
        },
    )
    .await;
    let router = api_router(env.state.clone());

    for _ in 0..3 {
        let (status, _) = call(
            &router,
            Request::builder().uri("/api/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, json) = call(
        &router,
        Request::builder().uri("/api/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json["code"], "RATE_LIMITED");
}
