//! Edge interceptor.
//!
//! Axum middleware that runs the admission check in front of every page
//! request:
//!
//! 1. Excluded paths (API, health, static assets) pass straight through.
//! 2. A blocklisted client gets the `blocked` rejection page.
//! 3. The admission decision (cached for a short TTL) may reject with the
//!    reason-specific page.
//! 4. Admitted requests are counted asynchronously; their completion is
//!    recorded once the inner response is ready, strictly after the count.
//!
//! The counting calls are fire-and-forget: their failure never changes a
//! decision already made. A check that errors or outlives the configured
//! timeout admits the request.
//!
//! Forwarding headers (`X-Forwarded-For`, `X-Real-IP`) are honored only when
//! the socket peer is a trusted proxy; otherwise the peer address is the
//! client.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use ipnet::IpNet;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::controller::AdmissionController;
use crate::model::{Decision, RejectReason};
use crate::page::rejection_response;

/// Path prefixes never subject to admission control.
pub const EXCLUDED_PREFIXES: &[&str] = &[
    "/api/",
    "/health",
    "/favicon.ico",
    "/overload",
    "/robots.txt",
    "/sitemap.xml",
];

/// Knobs for the interceptor.
#[derive(Debug, Clone)]
pub struct EdgeSettings {
    /// How long a global admission decision is reused. Zero disables the cache.
    pub decision_cache_ttl: Duration,

    /// Upper bound on one store round trip before failing open.
    pub check_timeout: Duration,

    /// Peers allowed to name the client through forwarding headers.
    pub trusted_proxies: Vec<IpNet>,
}

impl Default for EdgeSettings {
    fn default() -> Self {
        Self {
            decision_cache_ttl: Duration::from_millis(1000),
            check_timeout: Duration::from_millis(500),
            trusted_proxies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedDecision {
    decision: Decision,
    decided_at: Instant,
}

/// Shared state of the interceptor middleware.
#[derive(Clone)]
pub struct EdgeGuard {
    controller: AdmissionController,
    settings: EdgeSettings,
    cache: Arc<Mutex<Option<CachedDecision>>>,
}

impl EdgeGuard {
    pub fn new(controller: AdmissionController, settings: EdgeSettings) -> Self {
        Self {
            controller,
            settings,
            cache: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether `ip` is on the blocklist. Lookup failures and timeouts count as "no".
    async fn is_blocked(&self, ip: &str) -> bool {
        let lookup = self.controller.blocklist().is_blocked(ip, Utc::now());

        match tokio::time::timeout(self.settings.check_timeout, lookup).await {
            Ok(Ok(Some(_))) => {
                let controller = self.controller.clone();
                let ip = ip.to_string();
                tokio::spawn(async move {
                    if let Err(e) = controller.blocklist().record_hit(&ip).await {
                        debug!(error = %e, "Failed to count blocked request");
                    }
                });
                true
            }
            Ok(Ok(None)) => false,
            Ok(Err(e)) => {
                warn!(error = %e, "Blocklist lookup failed; admitting");
                false
            }
            Err(_) => {
                warn!("Blocklist lookup timed out; admitting");
                false
            }
        }
    }

    /// The global admission decision, served from the cache while it is fresh.
    async fn admission_decision(&self) -> Decision {
        let ttl = self.settings.decision_cache_ttl;

        if !ttl.is_zero() {
            if let Some(cached) = self.cached() {
                if cached.decided_at.elapsed() < ttl {
                    return cached.decision;
                }
            }
        }

        let check = self.controller.check(Utc::now());
        let decision = match tokio::time::timeout(self.settings.check_timeout, check).await {
            Ok(outcome) => outcome.decision,
            Err(_) => {
                warn!("Admission check timed out; admitting");
                Decision::Allow
            }
        };

        if !ttl.is_zero() {
            if let Ok(mut cache) = self.cache.lock() {
                *cache = Some(CachedDecision {
                    decision,
                    decided_at: Instant::now(),
                });
            }
        }

        decision
    }

    fn cached(&self) -> Option<CachedDecision> {
        self.cache.lock().ok().and_then(|cache| *cache)
    }

    /// Count an admitted request, then release it once `completed` fires.
    ///
    /// Both steps run in one task so the release can never overtake the
    /// count. A dropped sender (the request was cancelled) also releases.
    fn spawn_accounting(&self, completed: oneshot::Receiver<()>) {
        let controller = self.controller.clone();
        tokio::spawn(async move {
            match controller.increment(Utc::now()).await {
                Ok(Some(_)) => {}
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "Failed to count admitted request");
                    return;
                }
            }

            let _ = completed.await;

            if let Err(e) = controller.decrement().await {
                warn!(error = %e, "Failed to record request completion");
            }
        });
    }
}

/// Whether `path` bypasses admission control.
pub fn is_excluded(path: &str) -> bool {
    if EXCLUDED_PREFIXES.iter().any(|prefix| path.starts_with(prefix)) {
        return true;
    }
    // Static assets
    path.contains('.') && !path.ends_with(".html")
}

fn is_trusted(peer: IpAddr, trusted_proxies: &[IpNet]) -> bool {
    trusted_proxies.iter().any(|net| net.contains(&peer))
}

/// Client address of `request`.
///
/// The socket peer, unless the peer is one of `trusted_proxies`: then the
/// first `X-Forwarded-For` hop, else `X-Real-IP`, else the peer itself.
/// `None` when the peer address is unknown.
pub fn client_ip(request: &Request, trusted_proxies: &[IpNet]) -> Option<String> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())?;

    if !is_trusted(peer, trusted_proxies) {
        return Some(peer.to_string());
    }

    let headers = request.headers();

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    Some(
        forwarded
            .or(real_ip)
            .map(str::to_string)
            .unwrap_or_else(|| peer.to_string()),
    )
}

/// The interceptor itself; install with `middleware::from_fn_with_state`.
pub async fn admission_guard(
    State(guard): State<EdgeGuard>,
    request: Request,
    next: Next,
) -> Response {
    if is_excluded(request.uri().path()) {
        return next.run(request).await;
    }

    if let Some(ip) = client_ip(&request, &guard.settings.trusted_proxies) {
        if guard.is_blocked(&ip).await {
            return rejection_response(RejectReason::Blocked);
        }
    }

    if let Decision::Reject(reason) = guard.admission_decision().await {
        return rejection_response(reason);
    }

    let (completed, on_complete) = oneshot::channel();
    guard.spawn_accounting(on_complete);
    let response = next.run(request).await;
    let _ = completed.send(());

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockRequest, TrafficState};
    use crate::storage::Storage;
    use axum::{
        Router,
        body::Body,
        http::{Request as HttpRequest, StatusCode, header},
        middleware,
        routing::get,
    };
    use tower::ServiceExt;

    async fn ok_handler() -> &'static str {
        "ok"
    }

    async fn setup(settings: EdgeSettings) -> (Router, Storage, AdmissionController) {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let controller = AdmissionController::new(storage.clone());
        let guard = EdgeGuard::new(controller.clone(), settings);

        let app = Router::new()
            .route("/", get(ok_handler))
            .route("/docs/page.html", get(ok_handler))
            .route("/logo.png", get(ok_handler))
            .route("/api/ping", get(ok_handler))
            .layer(middleware::from_fn_with_state(guard, admission_guard));

        (app, storage, controller)
    }

    fn request(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri(uri)
            .extension(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 8080))))
            .body(Body::empty())
            .unwrap()
    }

    async fn overload(storage: &Storage) {
        let state = TrafficState {
            spike_ratio: 250.0,
            request_count_window: 900,
            ..TrafficState::seed(Utc::now())
        };
        storage.save_traffic_state(&state).await.unwrap();
    }

    #[test]
    fn test_excluded_paths() {
        assert!(is_excluded("/api/traffic/state"));
        assert!(is_excluded("/health"));
        assert!(is_excluded("/favicon.ico"));
        assert!(is_excluded("/static/app.js"));
        assert!(!is_excluded("/"));
        assert!(!is_excluded("/docs/intro"));
        assert!(!is_excluded("/docs/page.html"));
    }

    fn trusted(cidrs: &[&str]) -> Vec<IpNet> {
        cidrs.iter().map(|c| c.parse().unwrap()).collect()
    }

    fn request_from(uri: &str, peer: [u8; 4], forwarded_for: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder()
            .uri(uri)
            .extension(ConnectInfo(SocketAddr::from((peer, 8080))));
        if let Some(forwarded_for) = forwarded_for {
            builder = builder.header("x-forwarded-for", forwarded_for);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn permanent_block(ip: &str) -> BlockRequest {
        BlockRequest {
            ip_address: ip.to_string(),
            reason: None,
            is_permanent: Some(true),
            expires_hours: None,
        }
    }

    #[test]
    fn test_client_ip_behind_trusted_proxy() {
        let proxies = trusted(&["10.0.0.0/8"]);

        let req = HttpRequest::builder()
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .header("x-real-ip", "198.51.100.2")
            .extension(ConnectInfo(SocketAddr::from(([10, 1, 2, 3], 8080))))
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&req, &proxies).as_deref(), Some("203.0.113.9"));

        let req = HttpRequest::builder()
            .header("x-real-ip", "198.51.100.2")
            .extension(ConnectInfo(SocketAddr::from(([10, 1, 2, 3], 8080))))
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&req, &proxies).as_deref(), Some("198.51.100.2"));

        let req = request_from("/", [10, 1, 2, 3], None);
        assert_eq!(client_ip(&req, &proxies).as_deref(), Some("10.1.2.3"));
    }

    #[test]
    fn test_client_ip_ignores_headers_from_untrusted_peer() {
        let req = request_from("/", [127, 0, 0, 1], Some("9.9.9.9"));
        assert_eq!(client_ip(&req, &[]).as_deref(), Some("127.0.0.1"));

        let proxies = trusted(&["10.0.0.0/8"]);
        assert_eq!(client_ip(&req, &proxies).as_deref(), Some("127.0.0.1"));

        // Without a known peer nothing can be trusted.
        let bare = HttpRequest::builder()
            .header("x-forwarded-for", "9.9.9.9")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&bare, &proxies), None);
    }

    #[tokio::test]
    async fn test_nominal_traffic_passes() {
        let (app, _, _) = setup(EdgeSettings::default()).await;

        let response = app.oneshot(request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_hard_overload_renders_rejection_page() {
        let (app, storage, _) = setup(EdgeSettings::default()).await;
        overload(&storage).await;

        let response = app.clone().oneshot(request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "10");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&body).contains("hard_overload"));

        let response = app.clone().oneshot(request("/docs/page.html")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        // Excluded paths are untouched.
        let response = app.clone().oneshot(request("/api/ping")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(request("/logo.png")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_max_concurrent_returns_429() {
        let (app, storage, _) = setup(EdgeSettings::default()).await;
        let state = TrafficState {
            concurrent_users: 1000,
            spike_ratio: 50.0,
            ..TrafficState::seed(Utc::now())
        };
        storage.save_traffic_state(&state).await.unwrap();

        let response = app.oneshot(request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "10");
    }

    #[tokio::test]
    async fn test_blocked_client_is_rejected() {
        let (app, _, controller) = setup(EdgeSettings::default()).await;
        controller
            .blocklist()
            .block(&permanent_block("127.0.0.1"), Utc::now())
            .await
            .unwrap();

        let response = app.clone().oneshot(request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&body).contains(r#"content="blocked""#));

        let response = app
            .oneshot(request_from("/", [127, 0, 0, 2], None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_blocked_peer_cannot_spoof_forwarded_for() {
        let (app, _, controller) = setup(EdgeSettings::default()).await;
        controller
            .blocklist()
            .block(&permanent_block("127.0.0.1"), Utc::now())
            .await
            .unwrap();

        let response = app
            .oneshot(request_from("/", [127, 0, 0, 1], Some("9.9.9.9")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_trusted_proxy_forwards_client_address() {
        let settings = EdgeSettings {
            trusted_proxies: trusted(&["10.0.0.0/8"]),
            ..EdgeSettings::default()
        };
        let (app, _, controller) = setup(settings).await;
        controller
            .blocklist()
            .block(&permanent_block("203.0.113.9"), Utc::now())
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(request_from("/", [10, 0, 0, 5], Some("203.0.113.9")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app
            .oneshot(request_from("/", [10, 0, 0, 5], Some("198.51.100.7")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_decision_is_cached() {
        let settings = EdgeSettings {
            decision_cache_ttl: Duration::from_secs(60),
            ..EdgeSettings::default()
        };
        let (app, storage, controller) = setup(settings).await;
        overload(&storage).await;

        let response = app.clone().oneshot(request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        controller.reset(Utc::now()).await.unwrap();

        let response = app.oneshot(request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_uncached_decision_follows_state() {
        let settings = EdgeSettings {
            decision_cache_ttl: Duration::ZERO,
            ..EdgeSettings::default()
        };
        let (app, storage, controller) = setup(settings).await;
        overload(&storage).await;

        let response = app.clone().oneshot(request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        controller.reset(Utc::now()).await.unwrap();

        let response = app.oneshot(request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_is_down() {
        let (app, storage, _) = setup(EdgeSettings::default()).await;
        storage.close().await;

        let response = app.oneshot(request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    async fn settled(storage: &Storage, request_count_window: i64) -> bool {
        for _ in 0..200 {
            if let Ok(Some(state)) = storage.load_traffic_state().await {
                if state.request_count_window == request_count_window
                    && state.concurrent_users == 0
                {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_every_admitted_request_is_released() {
        let settings = EdgeSettings {
            decision_cache_ttl: Duration::ZERO,
            ..EdgeSettings::default()
        };
        let (app, storage, _) = setup(settings).await;

        for count in 1..=50 {
            let response = app.clone().oneshot(request("/")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(
                settled(&storage, count).await,
                "request {count} left concurrent_users raised"
            );
        }
    }

    #[tokio::test]
    async fn test_stalled_store_fails_open() {
        let settings = EdgeSettings {
            decision_cache_ttl: Duration::ZERO,
            check_timeout: Duration::from_millis(50),
            ..EdgeSettings::default()
        };
        let (app, storage, controller) = setup(settings).await;
        controller
            .blocklist()
            .block(&permanent_block("127.0.0.1"), Utc::now())
            .await
            .unwrap();
        overload(&storage).await;

        let response = app.clone().oneshot(request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        // Hold every pooled connection so both lookups stall.
        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(storage.pool.acquire().await.unwrap());
        }

        let response = app.oneshot(request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        drop(held);
    }
}
