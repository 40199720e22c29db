use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use super::routes::*;
use super::security::{console_guard, ConsoleSecurity};
use super::ConsoleState;

pub fn build_router(state: ConsoleState, security: ConsoleSecurity) -> Router {
    Router::new()
        .route("/blueprints", get(list_blueprints))
        .route("/blueprints/reload", post(reload_blueprint))
        .route("/blueprints/unload", post(unload_blueprint))
        .route("/blueprints/update", post(update_blueprints))
        .route("/objects/clone", post(clone_object))
        .route("/objects/destruct", post(destruct_object))
        .route("/objects/move", post(move_object))
        .route("/objects/force", post(force_command))
        .route("/stat", get(stat))
        .route("/errors", get(get_errors).delete(clear_errors))
        .route("/snapshot", get(snapshot))
        .route("/restore", post(restore))
        .route("/console", post(console_line))
        .layer(middleware::from_fn_with_state(security, console_guard))
        .with_state(state)
}
