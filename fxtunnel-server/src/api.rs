// REST/JSON API
// Reads and mutates the registry and store on behalf of authenticated
// principals. Every request carries a bearer access token (HMAC JWT) or
// an API token secret; errors are `{ "error": ..., "code": ... }`.

use crate::inspect::{ExchangeSummary, InspectEvent};
use crate::replay::{self, ReplayError, ReplayOverrides};
use crate::session;
use crate::state::ServerState;
use crate::subdomain;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use fxtunnel_store::{hash_token, CapturedExchange, ReservedSubdomainRecord, Store, UserRecord};
use fxtunnel_store::CustomDomainRecord;
use fxtunnel_store::PlanRecord;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default and maximum page sizes for inspect listings
const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 500;

/// API context shared by all handlers
pub struct ApiState {
    pub server: Arc<ServerState>,
    limiter: RateLimiter,
}

/// Structured API error
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> ApiError {
        ApiError { status, code, message: message.into() }
    }

    fn not_found() -> ApiError {
        ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "not found")
    }

    fn unauthorized(message: &str) -> ApiError {
        ApiError::new(StatusCode::UNAUTHORIZED, "NOT_AUTHENTICATED", message)
    }

    fn forbidden(message: &str) -> ApiError {
        ApiError::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }

    fn store(e: fxtunnel_store::StoreError) -> ApiError {
        ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE", e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message, "code": self.code }));
        (self.status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// The authenticated caller, attached by the auth middleware
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: UserRecord,
    pub is_admin: bool,
}

/// JWT claims for access tokens
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub admin: bool,
    pub exp: usize,
}

/// Mint a short-lived access token for a principal
pub fn mint_access_token(secret: &str, user: &UserRecord, ttl: Duration) -> String {
    let claims = Claims {
        sub: user.id,
        admin: user.is_admin,
        exp: (Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default()).timestamp()
            as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .unwrap_or_default()
}

/// Two-tier per-IP rate limiter with fixed one-minute windows
struct RateLimiter {
    enabled: bool,
    trust_proxy_header: bool,
    global_per_minute: u32,
    auth_per_minute: u32,
    windows: Mutex<HashMap<String, (u32, Instant)>>,
}

impl RateLimiter {
    fn new(config: &fxtunnel_config::ServerConfig) -> RateLimiter {
        RateLimiter {
            enabled: config.api.rate_limiting.enabled,
            trust_proxy_header: config.trust_proxy_header,
            global_per_minute: config.api.rate_limiting.global_per_minute,
            auth_per_minute: config.api.rate_limiting.auth_per_minute,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn check(&self, key: String, limit: u32) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        let entry = windows.entry(key).or_insert((0, now));
        if now.duration_since(entry.1) > Duration::from_secs(60) {
            *entry = (0, now);
        }
        if entry.0 >= limit {
            return false;
        }
        entry.0 += 1;
        true
    }
}

/// Build the API router; serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()`
pub fn api_router(server: Arc<ServerState>) -> Router {
    let ctx = Arc::new(ApiState { limiter: RateLimiter::new(&server.config), server });

    let protected = Router::new()
        .route("/api/tunnels", get(list_tunnels))
        .route("/api/tunnels/:id", delete(close_tunnel))
        .route("/api/tunnels/:id/inspect", get(list_exchanges).delete(clear_exchanges))
        .route("/api/tunnels/:id/inspect/stream", get(stream_exchanges))
        .route("/api/tunnels/:id/inspect/:exchange_id", get(get_exchange))
        .route("/api/tunnels/:id/inspect/:exchange_id/replay", post(replay_exchange))
        .route("/api/domains", get(list_domains).post(reserve_domain))
        .route("/api/domains/:subdomain", delete(release_domain))
        .route("/api/custom-domains", get(list_custom_domains).post(add_custom_domain))
        .route("/api/custom-domains/:domain", delete(delete_custom_domain))
        .route("/api/custom-domains/:domain/verify", post(verify_custom_domain))
        .route("/api/admin/tunnels", get(admin_list_tunnels))
        .route_layer(middleware::from_fn_with_state(ctx.clone(), auth_middleware));

    let mut router = Router::new()
        .route("/api/health", get(health))
        .merge(protected)
        .layer(middleware::from_fn_with_state(ctx.clone(), rate_limit_middleware));

    let origins: Vec<HeaderValue> = ctx
        .server
        .config
        .api
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    if !origins.is_empty() {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
        );
    }

    router.with_state(ctx)
}

fn request_ip(ctx: &ApiState, req: &Request<axum::body::Body>) -> String {
    if ctx.limiter.trust_proxy_header {
        if let Some(ip) = req.headers().get("x-real-ip").and_then(|v| v.to_str().ok()) {
            return ip.to_string();
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn rate_limit_middleware(
    State(ctx): State<Arc<ApiState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if ctx.limiter.enabled {
        let ip = request_ip(&ctx, &req);
        let is_auth_route = req.uri().path().starts_with("/api/auth");
        let limit = if is_auth_route {
            ctx.limiter.auth_per_minute
        } else {
            ctx.limiter.global_per_minute
        };
        let key = if is_auth_route { format!("auth:{}", ip) } else { ip };
        if !ctx.limiter.check(key, limit) {
            return ApiError::new(
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                "too many requests",
            )
            .into_response();
        }
    }
    next.run(req).await
}

async fn auth_middleware(
    State(ctx): State<Arc<ApiState>>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let token = match req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        Some(t) => t.to_string(),
        None => return ApiError::unauthorized("missing bearer token").into_response(),
    };

    let auth = if token.starts_with("sk_") {
        authenticate_api_token(&ctx, &token).await
    } else {
        authenticate_jwt(&ctx, &token).await
    };

    match auth {
        Ok(user) => {
            req.extensions_mut().insert(user);
            next.run(req).await
        }
        Err(e) => e.into_response(),
    }
}

async fn authenticate_api_token(ctx: &ApiState, secret: &str) -> ApiResult<AuthUser> {
    let token = ctx
        .server
        .store
        .find_token_by_hash(&hash_token(secret))
        .await
        .map_err(ApiError::store)?
        .ok_or_else(|| ApiError::unauthorized("unknown token"))?;
    let user = ctx
        .server
        .store
        .get_user(token.user_id)
        .await
        .map_err(ApiError::store)?
        .ok_or_else(|| ApiError::unauthorized("token has no principal"))?;
    if user.disabled {
        return Err(ApiError::forbidden("account disabled"));
    }
    let is_admin = user.is_admin;
    Ok(AuthUser { user, is_admin })
}

async fn authenticate_jwt(ctx: &ApiState, token: &str) -> ApiResult<AuthUser> {
    let secret = ctx.server.config.api.jwt_secret.as_bytes();
    let claims = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret),
        &Validation::default(),
    )
    .map_err(|e| ApiError::unauthorized(&format!("invalid access token: {}", e)))?
    .claims;

    let user = ctx
        .server
        .store
        .get_user(claims.sub)
        .await
        .map_err(ApiError::store)?
        .ok_or_else(|| ApiError::unauthorized("principal no longer exists"))?;
    if user.disabled {
        return Err(ApiError::forbidden("account disabled"));
    }
    Ok(AuthUser { is_admin: claims.admin && user.is_admin, user })
}

async fn health(State(ctx): State<Arc<ApiState>>) -> Response {
    let body = json!({
        "status": "healthy",
        "active_tunnels": ctx.server.registry.len().await,
        "active_sessions": ctx.server.sessions.count().await,
        "base_domain": ctx.server.config.base_domain,
    });
    (StatusCode::OK, Json(body)).into_response()
}

/// Serialized tunnel row
#[derive(Debug, Serialize)]
struct TunnelView {
    id: Uuid,
    kind: String,
    subdomain: Option<String>,
    port: Option<u16>,
    name: Option<String>,
    created_at: chrono::DateTime<Utc>,
    session_id: Uuid,
    last_heartbeat_at: Option<chrono::DateTime<Utc>>,
    bytes_sent: u64,
    bytes_received: u64,
    requests: u64,
}

async fn tunnel_view(state: &ServerState, tunnel: &crate::registry::Tunnel) -> TunnelView {
    use std::sync::atomic::Ordering;
    let last_heartbeat_at = state
        .sessions
        .get(tunnel.session_id)
        .await
        .map(|s| s.last_heartbeat());
    TunnelView {
        id: tunnel.id,
        kind: tunnel.kind.to_string(),
        subdomain: tunnel.binding.subdomain().map(|s| s.to_string()),
        port: tunnel.binding.port(),
        name: tunnel.name.clone(),
        created_at: tunnel.created_at,
        session_id: tunnel.session_id,
        last_heartbeat_at,
        bytes_sent: tunnel.counters.bytes_sent.load(Ordering::Relaxed),
        bytes_received: tunnel.counters.bytes_received.load(Ordering::Relaxed),
        requests: tunnel.counters.requests.load(Ordering::Relaxed),
    }
}

async fn list_tunnels(
    State(ctx): State<Arc<ApiState>>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<Json<Vec<TunnelView>>> {
    let tunnels = ctx.server.registry.list_by_principal(auth.user.id).await;
    let mut views = Vec::with_capacity(tunnels.len());
    for tunnel in tunnels {
        views.push(tunnel_view(&ctx.server, &tunnel).await);
    }
    Ok(Json(views))
}

async fn admin_list_tunnels(
    State(ctx): State<Arc<ApiState>>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<Json<Vec<TunnelView>>> {
    if !auth.is_admin {
        return Err(ApiError::forbidden("admin only"));
    }
    let tunnels = ctx.server.registry.list_all().await;
    let mut views = Vec::with_capacity(tunnels.len());
    for tunnel in tunnels {
        views.push(tunnel_view(&ctx.server, &tunnel).await);
    }
    Ok(Json(views))
}

/// Fetch a tunnel the caller may act on; non-owned tunnels are invisible
async fn owned_tunnel(
    ctx: &ApiState,
    auth: &AuthUser,
    id: Uuid,
) -> ApiResult<Arc<crate::registry::Tunnel>> {
    let tunnel = ctx.server.registry.get(id).await.ok_or_else(ApiError::not_found)?;
    if tunnel.principal_id != auth.user.id && !auth.is_admin {
        return Err(ApiError::not_found());
    }
    Ok(tunnel)
}

async fn close_tunnel(
    State(ctx): State<Arc<ApiState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let tunnel = owned_tunnel(&ctx, &auth, id).await?;
    ctx.server.close_tunnel(tunnel.id).await;
    session::notify_closed(&ctx.server, &tunnel).await;
    Ok((StatusCode::OK, Json(json!({ "closed": id }))).into_response())
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

async fn list_exchanges(
    State(ctx): State<Arc<ApiState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<ExchangeSummary>>> {
    let tunnel = owned_tunnel(&ctx, &auth, id).await?;
    let limit = page.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE);
    let summaries = ctx
        .server
        .inspect
        .list(tunnel.id, page.offset, limit)
        .iter()
        .map(|e| ExchangeSummary::from(e.as_ref()))
        .collect();
    Ok(Json(summaries))
}

async fn get_exchange(
    State(ctx): State<Arc<ApiState>>,
    Extension(auth): Extension<AuthUser>,
    Path((id, exchange_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<CapturedExchange>> {
    let tunnel = owned_tunnel(&ctx, &auth, id).await?;
    let exchange = find_exchange(&ctx, tunnel.id, exchange_id).await?;
    Ok(Json(exchange))
}

async fn find_exchange(
    ctx: &ApiState,
    tunnel_id: Uuid,
    exchange_id: Uuid,
) -> ApiResult<CapturedExchange> {
    if let Some(exchange) = ctx.server.inspect.get(tunnel_id, exchange_id) {
        return Ok((*exchange).clone());
    }
    // Fall back to the durable journal
    match ctx.server.store.get_exchange(exchange_id).await.map_err(ApiError::store)? {
        Some(exchange) if exchange.tunnel_id == tunnel_id => Ok(exchange),
        _ => Err(ApiError::not_found()),
    }
}

async fn clear_exchanges(
    State(ctx): State<Arc<ApiState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let tunnel = owned_tunnel(&ctx, &auth, id).await?;
    ctx.server.inspect.clear(tunnel.id);
    Ok((StatusCode::OK, Json(json!({ "cleared": tunnel.id }))).into_response())
}

async fn stream_exchanges(
    State(ctx): State<Arc<ApiState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>>> {
    let tunnel = owned_tunnel(&ctx, &auth, id).await?;
    let (_subscriber, rx) = ctx.server.inspect.subscribe(tunnel.id);

    enum SseState {
        Open(tokio::sync::mpsc::Receiver<InspectEvent>),
        Done,
    }

    let stream = futures_util::stream::unfold(SseState::Open(rx), |state| async move {
        match state {
            SseState::Open(mut rx) => match rx.recv().await {
                Some(InspectEvent::Exchange(exchange)) => {
                    let summary = ExchangeSummary::from(exchange.as_ref());
                    let event = Event::default()
                        .event("exchange")
                        .data(serde_json::to_string(&summary).unwrap_or_default());
                    Some((Ok(event), SseState::Open(rx)))
                }
                // Channel closed: either the tunnel went away or this
                // subscriber was dropped for falling behind
                None => {
                    let event = Event::default().event("reset").data("{}");
                    Some((Ok(event), SseState::Done))
                }
            },
            SseState::Done => None,
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize, Default)]
struct ReplayBody {
    method: Option<String>,
    path: Option<String>,
    headers: Option<HashMap<String, String>>,
    /// Base64 replacement body
    body: Option<String>,
}

async fn replay_exchange(
    State(ctx): State<Arc<ApiState>>,
    Extension(auth): Extension<AuthUser>,
    Path((id, exchange_id)): Path<(Uuid, Uuid)>,
    body: Option<Json<ReplayBody>>,
) -> ApiResult<Json<CapturedExchange>> {
    let tunnel = owned_tunnel(&ctx, &auth, id).await?;
    let original = find_exchange(&ctx, tunnel.id, exchange_id).await?;
    let overrides = body.map(|Json(b)| b).unwrap_or_default();

    let decoded_body = match overrides.body {
        Some(b64) => {
            use base64::Engine as _;
            Some(
                base64::engine::general_purpose::STANDARD
                    .decode(b64.as_bytes())
                    .map_err(|e| {
                        ApiError::new(StatusCode::BAD_REQUEST, "BAD_BODY", e.to_string())
                    })?,
            )
        }
        None => None,
    };

    let replayed = replay::replay_exchange(
        ctx.server.clone(),
        &original,
        ReplayOverrides {
            method: overrides.method,
            path: overrides.path,
            headers: overrides
                .headers
                .map(|map| map.into_iter().collect::<Vec<(String, String)>>()),
            body: decoded_body,
        },
    )
    .await
    .map_err(|e| match e {
        ReplayError::TunnelGone => {
            ApiError::new(StatusCode::BAD_GATEWAY, "TUNNEL_GONE", "tunnel is gone")
        }
        ReplayError::InspectorDisabled => ApiError::forbidden("inspector disabled for this plan"),
        ReplayError::BadRequest(msg) => ApiError::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
        ReplayError::Failed(msg) => ApiError::new(StatusCode::BAD_GATEWAY, "REPLAY_FAILED", msg),
    })?;

    Ok(Json((*replayed).clone()))
}

async fn list_domains(
    State(ctx): State<Arc<ApiState>>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<Json<Vec<ReservedSubdomainRecord>>> {
    let list = ctx
        .server
        .store
        .list_reserved_subdomains(auth.user.id)
        .await
        .map_err(ApiError::store)?;
    Ok(Json(list))
}

#[derive(Debug, Deserialize)]
struct ReserveBody {
    subdomain: String,
}

async fn reserve_domain(
    State(ctx): State<Arc<ApiState>>,
    Extension(auth): Extension<AuthUser>,
    Json(body): Json<ReserveBody>,
) -> ApiResult<Json<ReservedSubdomainRecord>> {
    let label = subdomain::normalize(&body.subdomain).ok_or_else(|| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "INVALID_SUBDOMAIN",
            format!("'{}' is not a valid subdomain", body.subdomain),
        )
    })?;

    let plan = load_plan(&ctx, &auth.user).await?;
    let current = ctx
        .server
        .store
        .list_reserved_subdomains(auth.user.id)
        .await
        .map_err(ApiError::store)?
        .len();
    if !PlanRecord::allows(plan.max_subdomains, current) {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "QUOTA_EXCEEDED",
            format!("plan allows {} reserved subdomains", plan.max_subdomains),
        ));
    }

    let record = ReservedSubdomainRecord {
        id: Uuid::new_v4(),
        user_id: auth.user.id,
        subdomain: label,
        created_at: Utc::now(),
    };
    ctx.server.store.put_reserved_subdomain(record.clone()).await.map_err(|e| match e {
        fxtunnel_store::StoreError::Conflict(msg) => {
            ApiError::new(StatusCode::CONFLICT, "SUBDOMAIN_TAKEN", msg)
        }
        other => ApiError::store(other),
    })?;
    Ok(Json(record))
}

async fn release_domain(
    State(ctx): State<Arc<ApiState>>,
    Extension(auth): Extension<AuthUser>,
    Path(label): Path<String>,
) -> ApiResult<Response> {
    let removed = ctx
        .server
        .store
        .delete_reserved_subdomain(auth.user.id, &label)
        .await
        .map_err(ApiError::store)?;
    if !removed {
        return Err(ApiError::not_found());
    }
    Ok((StatusCode::OK, Json(json!({ "released": label }))).into_response())
}

async fn load_plan(ctx: &ApiState, user: &UserRecord) -> ApiResult<PlanRecord> {
    ctx.server
        .store
        .get_plan(&user.plan_id)
        .await
        .map_err(ApiError::store)?
        .ok_or_else(|| {
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "plan missing")
        })
}

async fn list_custom_domains(
    State(ctx): State<Arc<ApiState>>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<Json<Vec<CustomDomainRecord>>> {
    let list = ctx
        .server
        .store
        .list_custom_domains(auth.user.id)
        .await
        .map_err(ApiError::store)?;
    Ok(Json(list))
}

#[derive(Debug, Deserialize)]
struct CustomDomainBody {
    domain: String,
    target_subdomain: String,
}

async fn add_custom_domain(
    State(ctx): State<Arc<ApiState>>,
    Extension(auth): Extension<AuthUser>,
    Json(body): Json<CustomDomainBody>,
) -> ApiResult<Json<CustomDomainRecord>> {
    let domain = body.domain.trim().to_ascii_lowercase();
    if domain.is_empty() || domain.len() > 253 || !domain.contains('.') {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "INVALID_DOMAIN",
            format!("'{}' is not a usable domain", body.domain),
        ));
    }
    if domain == ctx.server.config.base_domain
        || domain.ends_with(&format!(".{}", ctx.server.config.base_domain))
    {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "INVALID_DOMAIN",
            "custom domains must live outside the base domain",
        ));
    }

    let target = subdomain::normalize(&body.target_subdomain).ok_or_else(|| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "INVALID_SUBDOMAIN",
            format!("'{}' is not a valid subdomain", body.target_subdomain),
        )
    })?;

    // The target must be a reservation owned by the caller
    match ctx.server.store.get_reserved_subdomain(&target).await.map_err(ApiError::store)? {
        Some(reserved) if reserved.user_id == auth.user.id => {}
        _ => {
            return Err(ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "TARGET_NOT_RESERVED",
                format!("subdomain '{}' is not reserved by you", target),
            ))
        }
    }

    let plan = load_plan(&ctx, &auth.user).await?;
    let current = ctx
        .server
        .store
        .list_custom_domains(auth.user.id)
        .await
        .map_err(ApiError::store)?
        .len();
    if !PlanRecord::allows(plan.max_custom_domains, current) {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "QUOTA_EXCEEDED",
            format!("plan allows {} custom domains", plan.max_custom_domains),
        ));
    }

    let record = CustomDomainRecord {
        id: Uuid::new_v4(),
        user_id: auth.user.id,
        domain: domain.clone(),
        target_subdomain: target,
        verified: false,
        verified_at: None,
        created_at: Utc::now(),
    };
    ctx.server.store.put_custom_domain(record.clone()).await.map_err(|e| match e {
        fxtunnel_store::StoreError::Conflict(msg) => {
            ApiError::new(StatusCode::CONFLICT, "DOMAIN_TAKEN", msg)
        }
        other => ApiError::store(other),
    })?;
    Ok(Json(record))
}

async fn verify_custom_domain(
    State(ctx): State<Arc<ApiState>>,
    Extension(auth): Extension<AuthUser>,
    Path(domain): Path<String>,
) -> ApiResult<Json<CustomDomainRecord>> {
    let domain = domain.to_ascii_lowercase();
    let mut record = match ctx.server.store.get_custom_domain(&domain).await.map_err(ApiError::store)? {
        Some(r) if r.user_id == auth.user.id || auth.is_admin => r,
        _ => return Err(ApiError::not_found()),
    };

    let verified = ctx
        .server
        .certs
        .verify_custom_domain(&record.domain, &record.target_subdomain)
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_GATEWAY, "DNS_ERROR", e.to_string()))?;

    if verified && !record.verified {
        record.verified = true;
        record.verified_at = Some(Utc::now());
        ctx.server.store.update_custom_domain(record.clone()).await.map_err(ApiError::store)?;
        ctx.server
            .registry
            .set_custom_domain(record.domain.clone(), record.target_subdomain.clone())
            .await;
        ctx.server.certs.on_domain_verified(record.domain.clone());
        debug!(domain = %record.domain, "custom domain verified");
    } else if !verified {
        warn!(domain = %record.domain, "custom domain verification failed");
    }

    Ok(Json(record))
}

async fn delete_custom_domain(
    State(ctx): State<Arc<ApiState>>,
    Extension(auth): Extension<AuthUser>,
    Path(domain): Path<String>,
) -> ApiResult<Response> {
    let domain = domain.to_ascii_lowercase();
    let removed = ctx
        .server
        .store
        .delete_custom_domain(auth.user.id, &domain)
        .await
        .map_err(ApiError::store)?;
    if !removed {
        return Err(ApiError::not_found());
    }
    ctx.server.registry.remove_custom_domain(&domain).await;
    ctx.server.certs.remove_domain(&domain).await;
    Ok((StatusCode::OK, Json(json!({ "deleted": domain }))).into_response())
}
