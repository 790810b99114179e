//! HTTP/stream front-end: JSON endpoints, SSE for logs and events, and the
//! bidirectional TTY socket. Handlers translate the wire into orchestrator
//! calls and nothing more.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use axum::Json;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use adz_core::{ApiError, Engine, MountFingerprint, check_readiness, pathguard, write_env};

use crate::AppState;
use crate::orchestrator::{Run, RunChunk, StartRequest, StopOutcome, TAIL_BYTES};
use crate::transcript;
use crate::warm::WarmSummary;

const RECENT_FILES_CAP: usize = 50;
const RECENT_FILES_MAX_DEPTH: usize = 6;

/// Adapter giving `ApiError` an HTTP shape.
pub struct HttpError(pub ApiError);

impl From<ApiError> for HttpError {
    fn from(err: ApiError) -> Self {
        Self(err)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({"error": self.0.kind(), "message": self.0.to_string()});
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, HttpError>;

// ---------------------------------------------------------------------------
// Health and identity
// ---------------------------------------------------------------------------

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "image": state.config.runtime.image,
        "allow": {
            "workspaces": state.config.allow.workspace_roots,
            "creds": state.config.allow.creds_roots,
        },
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
    }))
}

pub async fn whoami() -> Json<Value> {
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    Json(json!({
        "uid": uid,
        "gid": gid,
        "platform": {
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
        },
    }))
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunBody {
    engine: String,
    workspace: String,
    creds: String,
    #[serde(default)]
    read_only: bool,
    #[serde(default)]
    uidgid: Option<String>,
    #[serde(default)]
    extra_env: BTreeMap<String, String>,
    #[serde(default)]
    prefer_warm: Option<bool>,
    #[serde(default)]
    argv: Vec<String>,
}

pub async fn start_run(
    State(state): State<AppState>,
    Json(body): Json<StartRunBody>,
) -> ApiResult<Json<Value>> {
    let started = state
        .orchestrator
        .start(StartRequest {
            engine: body.engine,
            workspace: body.workspace,
            creds: body.creds,
            read_only: body.read_only,
            uid_gid: body.uidgid,
            extra_env: body.extra_env.into_iter().collect(),
            prefer_warm: body.prefer_warm.unwrap_or(true),
            argv: body.argv,
        })
        .await?;
    Ok(Json(serde_json::to_value(started).unwrap_or_default()))
}

pub async fn list_runs(State(state): State<AppState>) -> Json<Value> {
    let runs = state.orchestrator.list().await;
    Json(serde_json::to_value(runs).unwrap_or_default())
}

pub async fn run_meta(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let meta = state.orchestrator.meta(&id).await?;
    Ok(Json(serde_json::to_value(meta).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    follow: u8,
}

fn chunk_event(bytes: &[u8]) -> Event {
    Event::default().event("chunk").data(BASE64.encode(bytes))
}

/// SSE log stream: one `chunk` frame with a transcript tail, then (when
/// following) live frames. Duplicates across the tail/live seam are
/// acceptable by contract.
pub async fn run_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let run = state
        .orchestrator
        .get(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(id.clone()))?;

    // Subscribe before reading the tail so the seam overlaps instead of
    // gapping.
    let mut rx = run.subscribe();
    let tail = transcript::tail(&run.transcript_path, TAIL_BYTES)
        .await
        .unwrap_or_default();
    let follow = query.follow == 1;

    let stream = async_stream::stream! {
        yield Ok::<_, Infallible>(chunk_event(&tail));
        if !follow {
            return;
        }
        loop {
            match rx.recv().await {
                Ok(RunChunk::Bytes(bytes)) => yield Ok(chunk_event(&bytes)),
                Ok(RunChunk::Terminal(marker)) => {
                    yield Ok(chunk_event(marker.as_bytes()));
                    return;
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "log follower lagged, frames dropped");
                    continue;
                }
                Err(RecvError::Closed) => return,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
pub struct InputBody {
    data: String,
}

pub async fn run_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<InputBody>,
) -> ApiResult<Json<Value>> {
    state.orchestrator.input(&id, body.data.as_bytes()).await?;
    Ok(Json(json!({"ok": true})))
}

fn outcome_json(outcome: StopOutcome) -> Json<Value> {
    match outcome {
        StopOutcome::Done => Json(json!({"ok": true})),
        StopOutcome::Fallback => Json(json!({"ok": true, "fallback": true})),
    }
}

pub async fn stop_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(outcome_json(state.orchestrator.stop(&id).await?))
}

pub async fn kill_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(outcome_json(state.orchestrator.kill(&id).await?))
}

pub async fn close_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(outcome_json(state.orchestrator.close(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct BulkQuery {
    #[serde(default, rename = "includeWarm")]
    include_warm: u8,
}

async fn destroy_all_warm(state: &AppState) -> usize {
    let mut removed = 0;
    if let Ok(warm) = state.warm.list().await {
        for summary in warm {
            if state.warm.destroy(&summary.id).await.is_ok() {
                removed += 1;
            }
        }
    }
    removed
}

pub async fn stop_all(
    State(state): State<AppState>,
    Query(query): Query<BulkQuery>,
) -> Json<Value> {
    let stopped = state.orchestrator.stop_all().await;
    let warm_removed = if query.include_warm == 1 {
        destroy_all_warm(&state).await
    } else {
        0
    };
    Json(json!({"ok": true, "stopped": stopped, "warmRemoved": warm_removed}))
}

pub async fn kill_all(
    State(state): State<AppState>,
    Query(query): Query<BulkQuery>,
) -> Json<Value> {
    let killed = state.orchestrator.kill_all().await;
    let warm_removed = if query.include_warm == 1 {
        destroy_all_warm(&state).await
    } else {
        0
    };
    Json(json!({"ok": true, "killed": killed, "warmRemoved": warm_removed}))
}

// ---------------------------------------------------------------------------
// Artifacts and workspace files
// ---------------------------------------------------------------------------

pub async fn run_artifacts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let run = state
        .orchestrator
        .get(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(id.clone()))?;

    let workspace = run.fingerprint.workspace.clone();
    let since = SystemTime::from(run.started_at);
    let (transcripts, recent) = tokio::task::spawn_blocking(move || {
        (
            list_transcripts(&workspace),
            recent_files(&workspace, since, RECENT_FILES_CAP),
        )
    })
    .await
    .map_err(ApiError::runtime)?;

    Ok(Json(json!({"transcripts": transcripts, "recentFiles": recent})))
}

fn list_transcripts(workspace: &FsPath) -> Vec<String> {
    let runs_dir = workspace.join(".runs");
    let Ok(entries) = std::fs::read_dir(&runs_dir) else {
        return Vec::new();
    };
    let mut out: Vec<String> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "log"))
        .map(|path| path.display().to_string())
        .collect();
    out.sort();
    out.reverse();
    out
}

/// Workspace files modified at or after `since`, newest first, capped.
/// Dot-directories (including `.runs/`) are skipped.
fn recent_files(workspace: &FsPath, since: SystemTime, cap: usize) -> Vec<String> {
    let mut found: Vec<(SystemTime, String)> = Vec::new();
    let mut stack = vec![(workspace.to_path_buf(), 0usize)];

    while let Some((dir, depth)) = stack.pop() {
        if depth > RECENT_FILES_MAX_DEPTH {
            continue;
        }
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                stack.push((entry.path(), depth + 1));
                continue;
            }
            let Ok(mtime) = meta.modified() else {
                continue;
            };
            if mtime >= since {
                found.push((mtime, entry.path().display().to_string()));
            }
        }
    }

    found.sort_by(|a, b| b.0.cmp(&a.0));
    found.into_iter().take(cap).map(|(_, path)| path).collect()
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    path: String,
}

/// Stream a file that lives under the Run's workspace. The workspace is the
/// only allowed root here, which also admits `.runs/` transcripts.
pub async fn run_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Response> {
    let run = state
        .orchestrator
        .get(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(id.clone()))?;

    let workspace = run.fingerprint.workspace.clone();
    let requested = if query.path.starts_with('/') {
        PathBuf::from(&query.path)
    } else {
        workspace.join(&query.path)
    };
    let resolved = pathguard::validate(&requested, std::slice::from_ref(&workspace))?;

    let bytes = tokio::fs::read(&resolved)
        .await
        .map_err(|_| ApiError::NotFound(query.path.clone()))?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.bus.subscribe();
    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok::<_, Infallible>(
                        Event::default().event(event.stream_name()).data(data),
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "event subscriber lagged, frames dropped");
                    continue;
                }
                Err(RecvError::Closed) => return,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// Warm pool
// ---------------------------------------------------------------------------

pub async fn warm_list(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let warm = state.warm.list().await.map_err(ApiError::runtime)?;
    Ok(Json(serde_json::to_value(warm).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmEnsureBody {
    engine: String,
    workspace: String,
    creds: String,
    #[serde(default)]
    read_only: bool,
    #[serde(default)]
    uidgid: Option<String>,
}

pub async fn warm_ensure(
    State(state): State<AppState>,
    Json(body): Json<WarmEnsureBody>,
) -> ApiResult<Json<Value>> {
    let engine: Engine = body.engine.parse().map_err(HttpError::from)?;
    let workspace = pathguard::validate(&body.workspace, &state.config.allow.workspace_roots)?;
    let creds = pathguard::validate(&body.creds, &state.config.allow.creds_roots)?;

    let fingerprint = MountFingerprint {
        engine,
        workspace,
        creds,
        read_only_root: body.read_only,
        uid_gid: body.uidgid,
    };
    let info = state
        .warm
        .ensure(&fingerprint)
        .await
        .map_err(ApiError::runtime)?;
    Ok(Json(
        serde_json::to_value(WarmSummary::from_info(&info)).unwrap_or_default(),
    ))
}

pub async fn warm_destroy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.warm.destroy(&id).await?;
    Ok(Json(json!({"ok": true})))
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CredsCheckQuery {
    engine: String,
    creds: String,
}

pub async fn creds_check(
    State(state): State<AppState>,
    Query(query): Query<CredsCheckQuery>,
) -> ApiResult<Json<Value>> {
    let engine: Engine = query.engine.parse().map_err(HttpError::from)?;
    let creds = pathguard::validate(&query.creds, &state.config.allow.creds_roots)?;

    let readiness = tokio::task::spawn_blocking(move || check_readiness(engine, &creds))
        .await
        .map_err(ApiError::runtime)?;
    Ok(Json(serde_json::to_value(readiness).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
pub struct WriteEnvBody {
    creds: String,
    #[serde(default)]
    updates: BTreeMap<String, String>,
}

pub async fn creds_write_env(
    State(state): State<AppState>,
    Json(body): Json<WriteEnvBody>,
) -> ApiResult<Json<Value>> {
    let creds = pathguard::validate(&body.creds, &state.config.allow.creds_roots)?;

    let updates = body.updates;
    let env = tokio::task::spawn_blocking(move || write_env(&creds, &updates))
        .await
        .map_err(ApiError::runtime)?
        .map_err(ApiError::runtime)?;
    Ok(Json(json!({"ok": true, "env": env})))
}

// ---------------------------------------------------------------------------
// Bidirectional TTY socket
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ControlFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    cols: u16,
    #[serde(default)]
    rows: u16,
}

pub async fn ws_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    match state.orchestrator.get(&id).await {
        Some(run) => upgrade.on_upgrade(move |socket| ws_session(state, run, socket)),
        None => HttpError(ApiError::NotFound(id)).into_response(),
    }
}

/// Text frames are parsed as JSON control (`{type:"resize", cols, rows}`);
/// everything else is raw bytes to stdin. Outbound frames are raw binary TTY
/// bytes, transcript tail first.
async fn ws_session(state: AppState, run: Arc<Run>, socket: WebSocket) {
    let (mut to_client, mut from_client) = socket.split();
    let mut rx = run.subscribe();

    if let Ok(tail) = transcript::tail(&run.transcript_path, TAIL_BYTES).await {
        if !tail.is_empty() && to_client.send(Message::Binary(tail.into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            chunk = rx.recv() => match chunk {
                Ok(RunChunk::Bytes(bytes)) => {
                    if to_client.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                Ok(RunChunk::Terminal(marker)) => {
                    let _ = to_client.send(Message::Binary(marker.into_bytes().into())).await;
                    break;
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(run_id = run.id.as_str(), skipped, "tty socket lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
            msg = from_client.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(ctl) = serde_json::from_str::<ControlFrame>(text.as_str()) {
                        if ctl.kind == "resize" {
                            let _ = state.orchestrator.resize(&run.id, ctl.cols, ctl.rows).await;
                            continue;
                        }
                    }
                    let _ = state.orchestrator.input(&run.id, text.as_bytes()).await;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let _ = state.orchestrator.input(&run.id, &bytes).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(run_id = run.id.as_str(), err = %err, "tty socket error");
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn control_frame_parses_resize() {
        let frame: ControlFrame =
            serde_json::from_str(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!(frame.kind, "resize");
        assert_eq!(frame.cols, 120);
        assert_eq!(frame.rows, 40);
    }

    #[test]
    fn outcome_json_marks_fallback() {
        assert_eq!(outcome_json(StopOutcome::Done).0["fallback"], Value::Null);
        assert_eq!(outcome_json(StopOutcome::Fallback).0["fallback"], true);
    }

    #[test]
    fn list_transcripts_newest_first() {
        let tmp = TempDir::new().unwrap();
        let runs = tmp.path().join(".runs");
        std::fs::create_dir_all(&runs).unwrap();
        std::fs::write(runs.join("codex-2026-01-01.log"), b"a").unwrap();
        std::fs::write(runs.join("codex-2026-02-01.log"), b"b").unwrap();
        std::fs::write(runs.join("notes.txt"), b"ignored").unwrap();

        let transcripts = list_transcripts(tmp.path());
        assert_eq!(transcripts.len(), 2);
        assert!(transcripts[0].ends_with("codex-2026-02-01.log"));
    }

    #[test]
    fn recent_files_skips_dot_dirs_and_old_files() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join(".runs")).unwrap();
        std::fs::write(tmp.path().join(".runs/t.log"), b"x").unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::write(tmp.path().join("src/new.rs"), b"x").unwrap();

        let since = SystemTime::now() - Duration::from_secs(60);
        let recent = recent_files(tmp.path(), since, 10);
        assert_eq!(recent.len(), 1);
        assert!(recent[0].ends_with("src/new.rs"));

        let future = SystemTime::now() + Duration::from_secs(60);
        assert!(recent_files(tmp.path(), future, 10).is_empty());
    }

    #[test]
    fn recent_files_respects_cap() {
        let tmp = TempDir::new().unwrap();
        for i in 0..5 {
            std::fs::write(tmp.path().join(format!("f{i}.txt")), b"x").unwrap();
        }
        let since = SystemTime::now() - Duration::from_secs(60);
        assert_eq!(recent_files(tmp.path(), since, 3).len(), 3);
    }
}
