use crate::error::{ApiError, ApiResult};
use crate::state::{AnswerRejection, AppState, launch_run};
use attractor_engine::{
    Checkpoint, EngineError, GateAnswer, RunEvent, RunEventKind, checkpoint_path, load_pipeline,
};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing::get, routing::post};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::process::Stdio;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/pipelines", post(create_pipeline))
        .route("/pipelines/:id", get(get_pipeline))
        .route("/pipelines/:id/cancel", post(cancel_pipeline))
        .route("/pipelines/:id/events", get(stream_events))
        .route(
            "/pipelines/:id/questions/:qid/answer",
            post(answer_question),
        )
        .route("/pipelines/:id/checkpoint", get(get_checkpoint))
        .route("/pipelines/:id/context", get(get_context))
        .route("/pipelines/:id/graph", get(get_graph))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePipelineRequest {
    dot_source: String,
}

#[derive(Debug, Deserialize)]
struct AnswerRequest {
    value: String,
    #[allow(dead_code)]
    text: Option<String>,
}

async fn create_pipeline(
    State(state): State<AppState>,
    Json(request): Json<CreatePipelineRequest>,
) -> ApiResult<impl IntoResponse> {
    let (graph, _) = load_pipeline(&request.dot_source, None, Default::default()).map_err(
        |error| match error {
            EngineError::Validation(failure) => {
                ApiError::validation("pipeline validation failed", failure.diagnostics)
            }
            other => ApiError::bad_request(other.to_string()),
        },
    )?;

    let run_id = uuid::Uuid::new_v4().to_string();
    launch_run(&state, run_id.clone(), request.dot_source, graph);
    tracing::info!(run_id = %run_id, "pipeline accepted");
    Ok((StatusCode::CREATED, Json(json!({ "runId": run_id }))))
}

async fn get_pipeline(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let handle = lookup(&state, &run_id)?;
    let context = handle
        .context
        .snapshot()
        .map_err(|error| ApiError::Internal(error.to_string()))?;
    let pending = handle.pending_question().map(|(question_id, question)| {
        json!({
            "questionId": question_id,
            "nodeId": question.node_id,
            "text": question.text,
            "choices": question
                .choices
                .iter()
                .map(|choice| {
                    json!({
                        "key": choice.key,
                        "label": choice.label,
                        "targetNode": choice.target_node,
                    })
                })
                .collect::<Vec<_>>(),
        })
    });

    Ok(Json(json!({
        "runId": handle.run_id,
        "status": handle.phase().as_str(),
        "failureReason": handle.failure_reason(),
        "currentNode": handle.current_node(),
        "completedNodes": handle.completed_nodes(),
        "context": context.values,
        "pendingQuestion": pending,
    })))
}

async fn cancel_pipeline(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let handle = lookup(&state, &run_id)?;
    handle
        .cancel()
        .map_err(|_| ApiError::Conflict(format!("run '{run_id}' is already terminal")))?;
    Ok(Json(json!({ "runId": run_id, "status": "cancelled" })))
}

async fn answer_question(
    State(state): State<AppState>,
    Path((run_id, question_id)): Path<(String, String)>,
    Json(request): Json<AnswerRequest>,
) -> ApiResult<impl IntoResponse> {
    let handle = lookup(&state, &run_id)?;
    handle
        .answer_question(&question_id, GateAnswer::Selected(request.value))
        .map_err(|rejection| match rejection {
            AnswerRejection::NonePending => ApiError::Conflict(format!(
                "question '{question_id}' is not pending (already answered?)"
            )),
            AnswerRejection::WrongId => {
                ApiError::NotFound(format!("question '{question_id}' is unknown"))
            }
        })?;
    Ok(Json(json!({ "runId": run_id, "questionId": question_id })))
}

async fn stream_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>> {
    let handle = lookup(&state, &run_id)?;

    let (sender, receiver) = tokio::sync::mpsc::channel::<Event>(64);
    tokio::spawn(async move {
        // Subscribe before replaying the buffer so nothing falls between;
        // duplicates are dropped by sequence number.
        let mut live = handle.subscribe_live();
        let buffered = handle.buffered_events();
        let mut last_seq = None;

        for event in buffered {
            last_seq = Some(event.seq);
            let terminal = is_terminal_event(&event);
            if sender.send(sse_frame(&event)).await.is_err() {
                return;
            }
            if terminal {
                let _ = sender.send(done_frame(&handle)).await;
                return;
            }
        }
        if handle.phase().is_terminal() {
            let _ = sender.send(done_frame(&handle)).await;
            return;
        }

        while let Ok(event) = live.recv().await {
            if last_seq.is_some_and(|seq| event.seq <= seq) {
                continue;
            }
            last_seq = Some(event.seq);
            let terminal = is_terminal_event(&event);
            if sender.send(sse_frame(&event)).await.is_err() {
                return;
            }
            if terminal {
                let _ = sender.send(done_frame(&handle)).await;
                return;
            }
        }
        let _ = sender.send(done_frame(&handle)).await;
    });

    let stream = ReceiverStream::new(receiver).map(Ok::<_, Infallible>);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn is_terminal_event(event: &RunEvent) -> bool {
    matches!(
        event.kind,
        RunEventKind::PipelineCompleted { .. } | RunEventKind::PipelineFailed { .. }
    )
}

fn sse_frame(event: &RunEvent) -> Event {
    Event::default()
        .event(event.kind.name())
        .json_data(event)
        .unwrap_or_else(|_| Event::default().data("{}"))
}

fn done_frame(handle: &crate::state::RunHandle) -> Event {
    Event::default().event("done").data(
        json!({
            "status": handle.phase().as_str(),
            "failureReason": handle.failure_reason(),
        })
        .to_string(),
    )
}

async fn get_checkpoint(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let handle = lookup(&state, &run_id)?;
    let path = checkpoint_path(&handle.logs_root);
    if !path.is_file() {
        return Err(ApiError::NotFound(format!(
            "run '{run_id}' has no checkpoint yet"
        )));
    }
    let checkpoint =
        Checkpoint::load(&path).map_err(|error| ApiError::Internal(error.to_string()))?;
    Ok(Json(
        serde_json::to_value(checkpoint).map_err(|error| ApiError::Internal(error.to_string()))?,
    ))
}

async fn get_context(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let handle = lookup(&state, &run_id)?;
    let snapshot = handle
        .context
        .snapshot()
        .map_err(|error| ApiError::Internal(error.to_string()))?;
    Ok(Json(json!({
        "values": snapshot.values,
        "logs": snapshot.logs,
    })))
}

/// Rendered SVG when a `dot` binary is available, raw source otherwise.
async fn get_graph(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Response> {
    let handle = lookup(&state, &run_id)?;

    let rendered = tokio::process::Command::new("dot")
        .arg("-Tsvg")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok();
    if let Some(mut child) = rendered {
        use tokio::io::AsyncWriteExt;
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(handle.dot_source.as_bytes()).await;
        }
        if let Ok(output) = child.wait_with_output().await {
            if output.status.success() {
                return Ok((
                    [(header::CONTENT_TYPE, "image/svg+xml")],
                    output.stdout,
                )
                    .into_response());
            }
        }
    }

    Ok((
        [(header::CONTENT_TYPE, "text/vnd.graphviz")],
        handle.dot_source.clone(),
    )
        .into_response())
}

fn lookup(state: &AppState, run_id: &str) -> ApiResult<std::sync::Arc<crate::state::RunHandle>> {
    state
        .get(run_id)
        .ok_or_else(|| ApiError::NotFound(format!("run '{run_id}' is unknown")))
}
