use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::Json;

use super::types::ApiResponse;
use crate::config::DriverConfig;

const MAX_TRACKED_CLIENTS: usize = 4096;
const WINDOW: Duration = Duration::from_secs(1);
/// Inspection requests are this much cheaper than world-changing ones.
const WRITE_COST: u32 = 4;

/// Token check plus a per-client request budget. `rate_limit_per_sec`
/// counts world-changing requests (clone, destruct, reload, ...); `stat`
/// and other reads may come `WRITE_COST` times as often.
#[derive(Clone)]
pub struct ConsoleSecurity {
    pub required_token: Option<String>,
    pub rate_limit_per_sec: u32,
    windows: Arc<Mutex<HashMap<String, ClientWindow>>>,
}

struct ClientWindow {
    opened: Instant,
    spent: u32,
}

impl ConsoleSecurity {
    pub fn new(required_token: Option<String>, rate_limit_per_sec: u32) -> Self {
        Self {
            required_token: required_token
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            rate_limit_per_sec: rate_limit_per_sec.max(1),
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &DriverConfig) -> Self {
        Self::new(config.console_token.clone(), config.console_rate_limit_per_sec)
    }

    fn budget(&self) -> u32 {
        self.rate_limit_per_sec.saturating_mul(WRITE_COST)
    }

    fn accepts(&self, headers: &HeaderMap) -> bool {
        match self.required_token.as_deref() {
            Some(expected) => presented_token(headers) == Some(expected),
            None => true,
        }
    }

    /// Spends `cost` from `client`'s current window. On refusal, returns how
    /// long until the window reopens.
    fn charge(&self, client: &str, cost: u32, now: Instant) -> Result<(), Duration> {
        let Ok(mut windows) = self.windows.lock() else {
            return Ok(());
        };
        if windows.len() >= MAX_TRACKED_CLIENTS && !windows.contains_key(client) {
            windows.retain(|_, w| now.duration_since(w.opened) < WINDOW);
        }
        let window = windows.entry(client.to_string()).or_insert(ClientWindow {
            opened: now,
            spent: 0,
        });
        let elapsed = now.duration_since(window.opened);
        if elapsed >= WINDOW {
            window.opened = now;
            window.spent = 0;
        }
        if window.spent.saturating_add(cost) > self.budget() {
            return Err(WINDOW.saturating_sub(now.duration_since(window.opened)));
        }
        window.spent += cost;
        Ok(())
    }
}

fn request_cost(method: &Method) -> u32 {
    if method == Method::GET || method == Method::HEAD {
        1
    } else {
        WRITE_COST
    }
}

/// `Authorization: Bearer <token>`, else `X-Api-Key`.
fn presented_token(headers: &HeaderMap) -> Option<&str> {
    let value = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    value(header::AUTHORIZATION)
        .and_then(|auth| {
            auth.strip_prefix("Bearer ")
                .or_else(|| auth.strip_prefix("bearer "))
                .map(str::trim)
        })
        .or_else(|| value(header::HeaderName::from_static("x-api-key")))
}

/// The originating hop of a forwarded chain, else `X-Real-Ip`.
fn client_of(headers: &HeaderMap) -> String {
    let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    get("x-forwarded-for")
        .and_then(|chain| chain.split(',').next())
        .or_else(|| get("x-real-ip"))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("local")
        .to_string()
}

pub async fn console_guard(
    State(security): State<ConsoleSecurity>,
    req: Request,
    next: Next,
) -> axum::response::Response {
    let client = client_of(req.headers());
    if !security.accepts(req.headers()) {
        tracing::warn!(client = %client, path = %req.uri().path(), "console request without a valid token");
        return (
            StatusCode::UNAUTHORIZED,
            Json(ApiResponse::err::<()>(
                "Unauthorized: send Authorization: Bearer <MUDRIVER_CONSOLE_TOKEN>",
            )),
        )
            .into_response();
    }

    if let Err(retry_in) = security.charge(&client, request_cost(req.method()), Instant::now()) {
        let retry_after = retry_in.as_secs().max(1).to_string();
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_after)],
            Json(ApiResponse::err::<()>("Too many console requests, slow down")),
        )
            .into_response();
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use axum::routing::get;
    use axum::{middleware, Router};
    use tower::util::ServiceExt;

    fn app(security: ConsoleSecurity) -> Router {
        Router::new()
            .route("/stat", get(|| async { "stat" }).post(|| async { "clone" }))
            .layer(middleware::from_fn_with_state(security, console_guard))
    }

    fn request(method: &str, headers: &[(&str, &str)]) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder().method(method).uri("/stat");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).expect("request")
    }

    #[tokio::test]
    async fn wizard_token_is_required_when_configured() {
        let app = app(ConsoleSecurity::new(Some("wizard".to_string()), 100));
        let status = |headers: &'static [(&'static str, &'static str)]| {
            let app = app.clone();
            async move { app.oneshot(request("GET", headers)).await.expect("response").status() }
        };
        assert_eq!(status(&[]).await, StatusCode::UNAUTHORIZED);
        assert_eq!(status(&[("authorization", "Bearer mortal")]).await, StatusCode::UNAUTHORIZED);
        assert_eq!(status(&[("authorization", "Bearer wizard")]).await, StatusCode::OK);
        assert_eq!(status(&[("x-api-key", "wizard")]).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn world_changes_cost_more_than_inspection() {
        let app = app(ConsoleSecurity::new(None, 1));
        let ip = [("x-real-ip", "10.0.0.1")];
        for _ in 0..WRITE_COST {
            let res = app.clone().oneshot(request("GET", &ip)).await.expect("response");
            assert_eq!(res.status(), StatusCode::OK);
        }
        let res = app.clone().oneshot(request("GET", &ip)).await.expect("response");
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(res.headers().contains_key(header::RETRY_AFTER));

        let other = [("x-real-ip", "10.0.0.2")];
        let res = app.clone().oneshot(request("POST", &other)).await.expect("response");
        assert_eq!(res.status(), StatusCode::OK);
        let res = app.oneshot(request("POST", &other)).await.expect("response");
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn forwarded_chain_is_keyed_by_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.1.1.1".parse().expect("header"));
        headers.insert("x-real-ip", "10.1.1.1".parse().expect("header"));
        assert_eq!(client_of(&headers), "203.0.113.9");
        assert_eq!(client_of(&HeaderMap::new()), "local");
    }

    #[test]
    fn window_reopens_after_a_second() {
        let security = ConsoleSecurity::new(None, 1);
        let start = Instant::now();
        assert!(security.charge("wiz", WRITE_COST, start).is_ok());
        let wait = security
            .charge("wiz", 1, start + Duration::from_millis(400))
            .expect_err("spent");
        assert_eq!(wait, Duration::from_millis(600));
        assert!(security.charge("wiz", WRITE_COST, start + WINDOW).is_ok());
    }

    #[test]
    fn blank_token_disables_auth() {
        let security = ConsoleSecurity::new(Some("  ".to_string()), 0);
        assert!(security.required_token.is_none());
        assert_eq!(security.rate_limit_per_sec, 1);
        assert!(security.accepts(&HeaderMap::new()));
    }
}
