use axum::extract::{Query, State};
use axum::Json;
use serde_json::Value;

use super::types::{
    ApiResponse, BlueprintRequest, ForceRequest, LineRequest, MoveRequest, ObjectRequest, ReloadRequest, StatQuery,
};
use super::{ConsoleRequest, ConsoleState};
use crate::driver::ConsoleCommand;
use crate::persistence::WorldSnapshot;

type Reply = Json<ApiResponse<Value>>;

/// Hands `command` to the driver loop and waits for its answer.
async fn dispatch(state: &ConsoleState, command: ConsoleCommand) -> Reply {
    let (tx, rx) = tokio::sync::oneshot::channel();
    if state.sender.send(ConsoleRequest { command, reply: tx }).is_err() {
        return Json(ApiResponse::err("Driver loop stopped"));
    }
    match rx.await {
        Ok(Ok(data)) => Json(ApiResponse::success(data)),
        Ok(Err(e)) => Json(ApiResponse::err(e)),
        Err(_) => Json(ApiResponse::err("Channel closed")),
    }
}

pub(super) async fn list_blueprints(State(state): State<ConsoleState>) -> Reply {
    dispatch(&state, ConsoleCommand::Blueprints).await
}

pub(super) async fn reload_blueprint(
    State(state): State<ConsoleState>,
    Json(req): Json<ReloadRequest>,
) -> Reply {
    dispatch(
        &state,
        ConsoleCommand::Reload {
            blueprint: req.blueprint,
            force: req.force,
        },
    )
    .await
}

pub(super) async fn unload_blueprint(
    State(state): State<ConsoleState>,
    Json(req): Json<BlueprintRequest>,
) -> Reply {
    dispatch(&state, ConsoleCommand::Unload(req.blueprint)).await
}

pub(super) async fn update_blueprints(State(state): State<ConsoleState>) -> Reply {
    dispatch(&state, ConsoleCommand::Update).await
}

pub(super) async fn clone_object(
    State(state): State<ConsoleState>,
    Json(req): Json<BlueprintRequest>,
) -> Reply {
    dispatch(&state, ConsoleCommand::Clone(req.blueprint)).await
}

pub(super) async fn destruct_object(
    State(state): State<ConsoleState>,
    Json(req): Json<ObjectRequest>,
) -> Reply {
    dispatch(&state, ConsoleCommand::Destruct(req.id)).await
}

pub(super) async fn move_object(
    State(state): State<ConsoleState>,
    Json(req): Json<MoveRequest>,
) -> Reply {
    dispatch(
        &state,
        ConsoleCommand::Move {
            object: req.object,
            destination: req.destination,
        },
    )
    .await
}

pub(super) async fn force_command(
    State(state): State<ConsoleState>,
    Json(req): Json<ForceRequest>,
) -> Reply {
    dispatch(
        &state,
        ConsoleCommand::Force {
            object: req.object,
            line: req.line,
        },
    )
    .await
}

pub(super) async fn stat(State(state): State<ConsoleState>, Query(query): Query<StatQuery>) -> Reply {
    dispatch(&state, ConsoleCommand::Stat(query.id)).await
}

pub(super) async fn get_errors(State(state): State<ConsoleState>) -> Reply {
    dispatch(&state, ConsoleCommand::Errors).await
}

pub(super) async fn clear_errors(State(state): State<ConsoleState>) -> Reply {
    dispatch(&state, ConsoleCommand::ClearErrors).await
}

pub(super) async fn snapshot(State(state): State<ConsoleState>) -> Reply {
    dispatch(&state, ConsoleCommand::Snapshot).await
}

pub(super) async fn restore(
    State(state): State<ConsoleState>,
    Json(snapshot): Json<WorldSnapshot>,
) -> Reply {
    dispatch(&state, ConsoleCommand::Restore(Box::new(snapshot))).await
}

pub(super) async fn console_line(
    State(state): State<ConsoleState>,
    Json(req): Json<LineRequest>,
) -> Reply {
    dispatch(&state, ConsoleCommand::Line(req.line)).await
}
