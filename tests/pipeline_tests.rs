//! End-to-end tests over the assembled router.
//!
//! Each test builds a fresh gateway with its own config and drives the full
//! middleware pipeline in-process with `tower::ServiceExt::oneshot`, with no
//! network, no containers.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::routing::get;
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use apigate::analytics::RequestLog;
use apigate::limiter::{GlobalLimit, RateLimitConfig, Tier};
use apigate::middleware::{FilterMode, IpRules};
use apigate::{AppState, Config, build_router, totp};

const BROWSER_ID: &str = "550e8400-e29b-41d4-a716-446655440000";

struct Gateway {
    router: Router,
    state: AppState,
    _store_dir: tempfile::TempDir,
}

async fn gateway_with(configure: impl FnOnce(&mut Config)) -> Gateway {
    let store_dir = tempfile::tempdir().unwrap();
    let mut config = Config {
        device_store_path: store_dir.path().join("devices.json"),
        ..Config::default()
    };
    configure(&mut config);

    let state = AppState::new(config).await;
    let app = Router::new().route("/api/ping", get(|| async { "pong" }));
    let router = build_router(state.clone(), app);
    Gateway {
        router,
        state,
        _store_dir: store_dir,
    }
}

/// Tier table with a single tier that is also the default.
fn one_tier(name: &str, tier: Tier, global_max: u32) -> RateLimitConfig {
    let mut tiers = HashMap::new();
    tiers.insert(name.to_string(), tier);
    RateLimitConfig {
        tiers,
        default_tier: name.to_string(),
        global_limit: GlobalLimit {
            max_requests: global_max,
            window_ms: 60_000,
        },
    }
}

fn get_request(path: &str, ip: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .unwrap()
}

fn get_with_key(path: &str, ip: &str, key: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header("x-forwarded-for", ip)
        .header("x-api-key", key)
        .body(Body::empty())
        .unwrap()
}

fn post_json(path: &str, ip: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("x-forwarded-for", ip)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn header_str<'a>(response: &'a axum::response::Response, name: &str) -> &'a str {
    response.headers().get(name).unwrap().to_str().unwrap()
}

#[tokio::test]
async fn token_bucket_drains_then_rejects() {
    let gw = gateway_with(|c| {
        c.rate_limits = one_tier("free", Tier::token_bucket(5, 1.0), 1_000_000);
    })
    .await;

    for expected_remaining in ["4", "3", "2", "1", "0"] {
        let resp = gw
            .router
            .clone()
            .oneshot(get_request("/api/ping", "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header_str(&resp, "x-ratelimit-limit"), "5");
        assert_eq!(header_str(&resp, "x-ratelimit-remaining"), expected_remaining);
    }

    let resp = gw
        .router
        .clone()
        .oneshot(get_request("/api/ping", "10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header_str(&resp, "x-ratelimit-remaining"), "0");
    assert_eq!(header_str(&resp, "x-ratelimit-reset"), "1");

    let body = body_json(resp).await;
    assert_eq!(body["error"], "Rate limit exceeded");
    assert_eq!(body["retryAfter"], 1);
}

#[tokio::test]
async fn rate_limits_are_isolated_per_ip() {
    let gw = gateway_with(|c| {
        c.rate_limits = one_tier("free", Tier::token_bucket(5, 1.0), 1_000_000);
    })
    .await;

    for _ in 0..5 {
        let resp = gw
            .router
            .clone()
            .oneshot(get_request("/api/ping", "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
    let resp = gw
        .router
        .clone()
        .oneshot(get_request("/api/ping", "10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

    // A different client starts with a full bucket.
    let resp = gw
        .router
        .clone()
        .oneshot(get_request("/api/ping", "10.0.0.2"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header_str(&resp, "x-ratelimit-remaining"), "4");
}

#[tokio::test]
async fn global_ceiling_spans_all_clients() {
    let gw = gateway_with(|c| {
        c.rate_limits = one_tier("unlimited", Tier::unlimited(), 5);
    })
    .await;

    for i in 0..5 {
        let resp = gw
            .router
            .clone()
            .oneshot(get_request("/api/ping", &format!("10.0.0.{i}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    // A brand-new client is still rejected: the ceiling is process-wide.
    let resp = gw
        .router
        .clone()
        .oneshot(get_request("/api/ping", "10.0.0.99"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header_str(&resp, "x-ratelimit-limit"), "5");
}

#[tokio::test]
async fn sliding_window_admits_exactly_max() {
    let gw = gateway_with(|c| {
        c.rate_limits = one_tier("pro", Tier::sliding_window(10, 60_000), 1_000_000);
    })
    .await;

    for _ in 0..10 {
        let resp = gw
            .router
            .clone()
            .oneshot(get_request("/api/ping", "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
    let resp = gw
        .router
        .clone()
        .oneshot(get_request("/api/ping", "10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn totp_round_trip_authenticates_as_browser_id() {
    let gw = gateway_with(|_| {}).await;

    let resp = gw
        .router
        .clone()
        .oneshot(post_json(
            "/auth/device/register",
            "10.0.0.1",
            json!({ "browserId": BROWSER_ID, "userAgent": "test-suite" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["browserId"], BROWSER_ID);
    let secret = body["sharedSecret"].as_str().unwrap().to_string();
    assert_eq!(secret.len(), 64);

    let code = totp::generate_code(BROWSER_ID, &secret, 0, Utc::now().timestamp_millis());
    let key = totp::format_key(BROWSER_ID, &code);

    let resp = gw
        .router
        .clone()
        .oneshot(get_with_key("/api/ping", "10.0.0.1", &key))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // The log hook resolved the client as the browser id.
    let resp = gw
        .router
        .clone()
        .oneshot(get_request("/admin/logs?limit=1", "10.0.0.1"))
        .await
        .unwrap();
    let body = body_json(resp).await;
    let newest = &body["logs"][0];
    assert_eq!(newest["clientId"], BROWSER_ID);
    assert_eq!(newest["authenticated"], true);
    assert_eq!(newest["path"], "/api/ping");

    // Altering the last hex character invalidates the code.
    let mut bad_code: Vec<u8> = code.bytes().collect();
    let last = bad_code.last_mut().unwrap();
    *last = if *last == b'0' { b'1' } else { b'0' };
    let bad_key = totp::format_key(BROWSER_ID, &String::from_utf8(bad_code).unwrap());

    let resp = gw
        .router
        .clone()
        .oneshot(get_with_key("/api/ping", "10.0.0.1", &bad_key))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(resp).await;
    assert_eq!(body["error"], "Invalid TOTP code");
}

#[tokio::test]
async fn re_registration_returns_same_secret() {
    let gw = gateway_with(|_| {}).await;

    let first = body_json(
        gw.router
            .clone()
            .oneshot(post_json(
                "/auth/device/register",
                "10.0.0.1",
                json!({ "browserId": BROWSER_ID }),
            ))
            .await
            .unwrap(),
    )
    .await;
    let second = body_json(
        gw.router
            .clone()
            .oneshot(post_json(
                "/auth/device/register",
                "10.0.0.1",
                json!({ "browserId": BROWSER_ID }),
            ))
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(first["sharedSecret"], second["sharedSecret"]);
    assert!(second["expiresAt"].as_i64().unwrap() >= first["expiresAt"].as_i64().unwrap());
}

#[tokio::test]
async fn malformed_registration_rejects() {
    let gw = gateway_with(|_| {}).await;

    let resp = gw
        .router
        .clone()
        .oneshot(post_json(
            "/auth/device/register",
            "10.0.0.1",
            json!({ "browserId": "not-a-uuid" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = body_json(resp).await;
    assert_eq!(body["error"], "browserId must be a UUID");
}

#[tokio::test]
async fn malformed_totp_key_rejects_with_401() {
    let gw = gateway_with(|_| {}).await;

    let resp = gw
        .router
        .clone()
        .oneshot(get_with_key("/api/ping", "10.0.0.1", "totp_nounderscore"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(resp).await;
    assert_eq!(body["error"], "Malformed TOTP key");
}

#[tokio::test]
async fn static_key_lifecycle() {
    let gw = gateway_with(|c| {
        let mut limits = one_tier("free", Tier::token_bucket(60, 1.0), 1_000_000);
        limits
            .tiers
            .insert("premium".to_string(), Tier::sliding_window(2, 60_000));
        c.rate_limits = limits;
    })
    .await;

    // Missing name rejects.
    let resp = gw
        .router
        .clone()
        .oneshot(post_json("/admin/keys", "9.9.9.9", json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // Create a premium key.
    let resp = gw
        .router
        .clone()
        .oneshot(post_json(
            "/admin/keys",
            "9.9.9.9",
            json!({ "name": "dashboard", "tier": "premium" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created = body_json(resp).await;
    assert_eq!(created["id"], "key_001");
    let secret = created["secret"].as_str().unwrap().to_string();
    assert!(secret.starts_with("gw_live_"));
    assert_eq!(secret.len(), "gw_live_".len() + 32);

    // The key authenticates and resolves the premium tier (limit 2).
    for expected in ["1", "0"] {
        let resp = gw
            .router
            .clone()
            .oneshot(get_with_key("/api/ping", "10.0.0.1", &secret))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header_str(&resp, "x-ratelimit-limit"), "2");
        assert_eq!(header_str(&resp, "x-ratelimit-remaining"), expected);
    }
    let resp = gw
        .router
        .clone()
        .oneshot(get_with_key("/api/ping", "10.0.0.1", &secret))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

    // Revoke, then the key no longer authenticates.
    let resp = gw
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/admin/keys/key_001")
                .header("x-forwarded-for", "9.9.9.9")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["id"], "key_001");

    let resp = gw
        .router
        .clone()
        .oneshot(get_with_key("/api/ping", "10.0.0.2", &secret))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        body_json(resp).await["error"],
        "Invalid or revoked API key"
    );
}

#[tokio::test]
async fn revoking_unknown_key_is_404() {
    let gw = gateway_with(|_| {}).await;
    let resp = gw
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/admin/keys/key_404")
                .header("x-forwarded-for", "9.9.9.9")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn allowlist_mode_rejects_unlisted_ips() {
    let gw = gateway_with(|c| {
        c.ip_rules = IpRules {
            allowlist: ["10.0.0.1".to_string()].into_iter().collect(),
            blocklist: Default::default(),
            mode: FilterMode::Allowlist,
        };
    })
    .await;

    let resp = gw
        .router
        .clone()
        .oneshot(get_request("/api/ping", "10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = gw
        .router
        .clone()
        .oneshot(get_request("/api/ping", "203.0.113.5"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(resp).await["error"], "IP not in allowlist");
}

#[tokio::test]
async fn blocklist_mode_rejects_listed_ips() {
    let gw = gateway_with(|c| {
        c.ip_rules = IpRules {
            allowlist: Default::default(),
            blocklist: ["203.0.113.5".to_string()].into_iter().collect(),
            mode: FilterMode::Blocklist,
        };
    })
    .await;

    let resp = gw
        .router
        .clone()
        .oneshot(get_request("/api/ping", "203.0.113.5"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(resp).await["error"], "IP is blocked");

    let resp = gw
        .router
        .clone()
        .oneshot(get_request("/api/ping", "10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn rejected_requests_are_still_logged() {
    let gw = gateway_with(|c| {
        c.rate_limits = one_tier("free", Tier::token_bucket(1, 1.0), 1_000_000);
    })
    .await;

    let ok = gw
        .router
        .clone()
        .oneshot(get_request("/api/ping", "10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);
    let rejected = gw
        .router
        .clone()
        .oneshot(get_request("/api/ping", "10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);

    let snapshot = gw.state.analytics.snapshot();
    assert_eq!(snapshot.total_requests, 2);
    assert_eq!(snapshot.rate_limit_hits, 1);
}

#[tokio::test]
async fn analytics_snapshot_aggregates() {
    let gw = gateway_with(|_| {}).await;
    let now = Utc::now().timestamp_millis();
    let log = |path: &str, status: u16, time: u64| RequestLog {
        timestamp: now,
        method: "GET".to_string(),
        path: path.to_string(),
        status_code: status,
        response_time: time,
        client_id: "10.0.0.1".to_string(),
        ip: "10.0.0.1".to_string(),
        api_key: None,
        authenticated: false,
    };
    for _ in 0..3 {
        gw.state.analytics.record(log("/a", 200, 100));
    }
    gw.state.analytics.record(log("/b", 500, 200));

    let resp = gw
        .router
        .clone()
        .oneshot(get_request("/admin/analytics", "9.9.9.9"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;

    assert_eq!(body["totalRequests"], 4);
    assert_eq!(body["errorRate"], 25.0);
    assert_eq!(body["avgResponseTime"], 125.0);
    assert_eq!(body["topEndpoints"][0]["path"], "/a");
    assert_eq!(body["topEndpoints"][0]["count"], 3);
    assert_eq!(body["topEndpoints"][1]["path"], "/b");
    assert_eq!(body["topEndpoints"][1]["count"], 1);
}

#[tokio::test]
async fn management_surface_bypasses_the_limiter() {
    let gw = gateway_with(|c| {
        c.rate_limits = one_tier("free", Tier::token_bucket(1, 1.0), 1_000_000);
    })
    .await;

    // Saturate the tier for this client.
    let _ = gw
        .router
        .clone()
        .oneshot(get_request("/api/ping", "10.0.0.1"))
        .await
        .unwrap();

    // The dashboard keeps answering.
    for _ in 0..5 {
        let resp = gw
            .router
            .clone()
            .oneshot(get_request("/admin/analytics", "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get("x-ratelimit-limit").is_none());
    }
}

#[tokio::test]
async fn config_endpoint_reports_shape() {
    let gw = gateway_with(|_| {}).await;
    let _ = body_json(
        gw.router
            .clone()
            .oneshot(post_json(
                "/admin/keys",
                "9.9.9.9",
                json!({ "name": "one" }),
            ))
            .await
            .unwrap(),
    )
    .await;

    let resp = gw
        .router
        .clone()
        .oneshot(get_request("/admin/config", "9.9.9.9"))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["activeKeys"], 1);
    assert!(body["rateLimits"]["tiers"].is_object());
    assert_eq!(body["rateLimits"]["defaultTier"], "free");
    assert!(body["ipRules"]["mode"].is_string());
}

#[tokio::test]
async fn logs_endpoint_paginates_newest_first() {
    let gw = gateway_with(|_| {}).await;
    for i in 0..5 {
        let _ = gw
            .router
            .clone()
            .oneshot(get_request(&format!("/api/ping?i={i}"), "10.0.0.1"))
            .await
            .unwrap();
    }

    let resp = gw
        .router
        .clone()
        .oneshot(get_request("/admin/logs?limit=2&offset=1", "9.9.9.9"))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["limit"], 2);
    assert_eq!(body["offset"], 1);
    assert_eq!(body["logs"].as_array().unwrap().len(), 2);
    assert_eq!(body["logs"][0]["path"], "/api/ping");
}

#[tokio::test]
async fn responses_carry_request_ids() {
    let gw = gateway_with(|_| {}).await;

    let resp = gw
        .router
        .clone()
        .oneshot(get_request("/api/ping", "10.0.0.1"))
        .await
        .unwrap();
    let generated = header_str(&resp, "x-request-id").to_string();
    assert!(uuid::Uuid::parse_str(&generated).is_ok());

    let mut req = get_request("/api/ping", "10.0.0.1");
    req.headers_mut()
        .insert("x-request-id", "corr-77".parse().unwrap());
    let resp = gw.router.clone().oneshot(req).await.unwrap();
    assert_eq!(header_str(&resp, "x-request-id"), "corr-77");
}

#[tokio::test]
async fn sse_stream_headers() {
    let gw = gateway_with(|_| {}).await;

    let resp = gw
        .router
        .clone()
        .oneshot(get_request("/admin/analytics/stream", "9.9.9.9"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(header_str(&resp, "content-type").starts_with("text/event-stream"));
    assert_eq!(header_str(&resp, "cache-control"), "no-cache");
    assert_eq!(header_str(&resp, "x-accel-buffering"), "no");
}

#[tokio::test]
async fn health_endpoint_answers() {
    let gw = gateway_with(|_| {}).await;
    let resp = gw
        .router
        .clone()
        .oneshot(get_request("/health", "10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["status"], "healthy");
}
