//! Wizard console over HTTP.
//!
//! The server runs on its own thread with a Tokio runtime. Every request is
//! turned into a [`ConsoleCommand`] and queued for the driver loop, which
//! answers through a oneshot channel between ticks.

mod router;
mod routes;
mod security;
pub mod types;

use crossbeam_channel::{Receiver, Sender};
use serde_json::Value;

use crate::config::DriverConfig;
use crate::driver::{ConsoleCommand, Driver};

pub use router::build_router;
pub use security::ConsoleSecurity;

pub type ConsoleReply = tokio::sync::oneshot::Sender<Result<Value, String>>;

pub struct ConsoleRequest {
    pub command: ConsoleCommand,
    pub reply: ConsoleReply,
}

#[derive(Clone)]
pub struct ConsoleState {
    pub(crate) sender: Sender<ConsoleRequest>,
}

pub fn channel() -> (ConsoleState, Receiver<ConsoleRequest>) {
    let (sender, receiver) = crossbeam_channel::unbounded();
    (ConsoleState { sender }, receiver)
}

/// Starts the HTTP console on a background thread.
pub fn spawn(config: &DriverConfig, state: ConsoleState) -> std::thread::JoinHandle<()> {
    let addr = config.console_addr.clone();
    let security = ConsoleSecurity::from_config(config);
    std::thread::spawn(move || {
        let rt = match tokio::runtime::Runtime::new() {
            Ok(rt) => rt,
            Err(err) => {
                tracing::error!(error = %err, "console runtime failed to start");
                return;
            }
        };
        rt.block_on(async {
            let app = build_router(state, security);
            let listener = match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => listener,
                Err(err) => {
                    tracing::error!(addr = %addr, error = %err, "console failed to bind");
                    return;
                }
            };
            tracing::info!(addr = %addr, "console listening");
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!(error = %err, "console server stopped");
            }
        });
    })
}

/// Answers every queued console request. Called by the driver loop between
/// ticks so requests never interleave with world code.
pub fn serve_pending(driver: &mut Driver, requests: &Receiver<ConsoleRequest>) -> usize {
    let mut served = 0;
    while let Ok(request) = requests.try_recv() {
        let result = driver.execute_console(request.command);
        let _ = request.reply.send(result);
        served += 1;
    }
    served
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::MemorySource;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use tower::util::ServiceExt;

    /// Router wired to a driver living on its own thread, the way the binary
    /// runs it.
    fn app() -> Router {
        let (state, requests) = channel();
        std::thread::spawn(move || {
            let source = MemorySource::new()
                .with("room/hall", "fn capabilities() { [\"room\"] }")
                .with(
                    "npc/rat",
                    "fn capabilities() { [\"living\"] } fn on_load() { state_set(\"hp\", 3); }",
                );
            let mut driver = Driver::new(DriverConfig::default(), Box::new(source));
            for request in requests.iter() {
                let result = driver.execute_console(request.command);
                let _ = request.reply.send(result);
            }
        });
        build_router(state, ConsoleSecurity::new(None, 1000))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");
        let res = app.clone().oneshot(req).await.expect("response");
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, serde_json::from_slice(&bytes).expect("json"))
    }

    #[tokio::test]
    async fn clone_stat_and_destruct() {
        let app = app();
        let (status, cloned) = call(
            &app,
            "POST",
            "/objects/clone",
            Some(serde_json::json!({ "blueprint": "npc/rat" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cloned["ok"], true);
        assert_eq!(cloned["data"]["id"], "npc/rat#1");

        let (_, stat) = call(&app, "GET", "/stat?id=npc/rat%231", None).await;
        assert_eq!(stat["data"]["state"]["hp"], 3);
        assert_eq!(stat["data"]["blueprint"], "npc/rat");

        let (_, listed) = call(&app, "GET", "/blueprints", None).await;
        assert_eq!(listed["data"][0]["instances"], 1);

        let (_, gone) = call(
            &app,
            "POST",
            "/objects/destruct",
            Some(serde_json::json!({ "id": "npc/rat#1" })),
        )
        .await;
        assert_eq!(gone["ok"], true);
        let (_, missing) = call(&app, "GET", "/stat?id=npc/rat%231", None).await;
        assert_eq!(missing["ok"], false);
        assert!(missing["error"].as_str().is_some_and(|e| e.contains("npc/rat#1")));
    }

    #[tokio::test]
    async fn console_line_and_errors() {
        let app = app();
        let (_, cloned) = call(
            &app,
            "POST",
            "/console",
            Some(serde_json::json!({ "line": "clone room/hall" })),
        )
        .await;
        assert_eq!(cloned["data"]["id"], "room/hall#1");

        let (_, bad) = call(
            &app,
            "POST",
            "/console",
            Some(serde_json::json!({ "line": "teleport me" })),
        )
        .await;
        assert_eq!(bad["ok"], false);

        let (_, errors) = call(&app, "GET", "/errors", None).await;
        assert_eq!(errors["data"], serde_json::json!([]));
        let (_, cleared) = call(&app, "DELETE", "/errors", None).await;
        assert_eq!(cleared["data"]["cleared"], 0);
    }

    #[tokio::test]
    async fn force_queues_a_player_command() {
        let app = app();
        call(
            &app,
            "POST",
            "/objects/clone",
            Some(serde_json::json!({ "blueprint": "npc/rat" })),
        )
        .await;
        let (status, queued) = call(
            &app,
            "POST",
            "/objects/force",
            Some(serde_json::json!({ "object": "npc/rat#1", "line": "flee" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(queued["data"]["queued"], "npc/rat#1");
        assert_eq!(queued["data"]["pending"], 1);

        let (_, missing) = call(
            &app,
            "POST",
            "/objects/force",
            Some(serde_json::json!({ "object": "npc/rat#7", "line": "flee" })),
        )
        .await;
        assert_eq!(missing["ok"], false);
    }

    #[tokio::test]
    async fn snapshot_then_restore_into_busy_world_is_refused() {
        let app = app();
        call(
            &app,
            "POST",
            "/objects/clone",
            Some(serde_json::json!({ "blueprint": "npc/rat" })),
        )
        .await;
        let (_, snapshot) = call(&app, "GET", "/snapshot", None).await;
        assert_eq!(snapshot["data"]["instances"][0]["id"], "npc/rat#1");

        let (_, refused) = call(&app, "POST", "/restore", Some(snapshot["data"].clone())).await;
        assert_eq!(refused["ok"], false);
        assert!(refused["error"]
            .as_str()
            .is_some_and(|e| e.contains("empty world")));
    }
}
