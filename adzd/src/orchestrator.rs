//! Run orchestrator: the state machine that owns every live session.
//!
//! A Run is one engine process inside one container, reached either by
//! creating a fresh container or by exec-ing into a warm one. The
//! orchestrator registers the Run, pumps its TTY output to the transcript,
//! every listener, and the artifact scanner, and guarantees that exactly one
//! terminal transition fires no matter which exit path wins.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use adz_core::fingerprint::LABEL_RUN_ID;
use adz_core::{
    AdzConfig, ApiError, Artifact, ArtifactNotice, BusEvent, Engine, LifecycleEvent,
    LifecycleKind, LineScanner, MountFingerprint, pathguard,
};

use crate::bus::EventBus;
use crate::docker::{Attached, CreateSpec, DockerDriver, ExecSpec, MountInfo};
use crate::transcript::TranscriptWriter;
use crate::warm::WarmPool;

/// Marker delivered to listeners when a Run reaches a terminal state.
pub const EXIT_MARKER_PREFIX: &str = "[[PROCESS EXITED]] status=";
/// Marker written to transcript and listeners on idle expiry.
pub const IDLE_MARKER: &str = "[[AUTO-STOP]] idle timeout exceeded\n";

/// Tail size served to late-attaching followers.
pub const TAIL_BYTES: u64 = 64 * 1024;

const CHUNK_CAPACITY: usize = 256;
const READ_BUF_SIZE: usize = 8192;
const STOP_GRACE_SEC: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Fresh,
    WarmExec,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Fresh => "fresh",
            RunMode::WarmExec => "warm-exec",
        }
    }

    pub fn is_warm(self) -> bool {
        self == RunMode::WarmExec
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Exited,
    Stopped,
    Killed,
    IdleStopped,
    Closed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Exited => "exited",
            RunStatus::Stopped => "stopped",
            RunStatus::Killed => "killed",
            RunStatus::IdleStopped => "idle-stopped",
            RunStatus::Closed => "closed",
        }
    }
}

/// One frame on a Run's listener channel.
#[derive(Debug, Clone)]
pub enum RunChunk {
    Bytes(Vec<u8>),
    /// Terminal marker; the stream is over after this frame.
    Terminal(String),
}

pub struct Run {
    pub id: String,
    pub fingerprint: MountFingerprint,
    pub container_id: String,
    pub container_name: String,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub transcript_path: PathBuf,
    attached: Attached,
    transcript: TranscriptWriter,
    chunks: broadcast::Sender<RunChunk>,
    /// Serializes TTY writes: HTTP input and the terminal socket may race.
    write_lock: Mutex<()>,
    last_activity: std::sync::Mutex<Instant>,
    terminated: AtomicBool,
}

impl Run {
    pub fn engine(&self) -> Engine {
        self.fingerprint.engine
    }

    pub fn workspace_str(&self) -> String {
        self.fingerprint.workspace.display().to_string()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunChunk> {
        self.chunks.subscribe()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().expect("activity lock").elapsed()
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("activity lock") = Instant::now();
    }

    async fn write_stdin(&self, bytes: &[u8]) -> Result<(), ApiError> {
        let _guard = self.write_lock.lock().await;
        self.attached
            .pty
            .write_all(bytes)
            .await
            .map_err(|err| ApiError::WriteFailed(err.to_string()))?;
        self.touch();
        Ok(())
    }

    /// Claim the single terminal transition. Only the winner runs the
    /// teardown sequence; everyone else treats the op as an idempotent no-op.
    fn claim_terminal(&self) -> bool {
        self.terminated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn broadcast_terminal(&self, status: RunStatus) {
        let marker = format!("{EXIT_MARKER_PREFIX}{}", status.as_str());
        let _ = self.chunks.send(RunChunk::Terminal(marker));
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Started {
    pub run_id: String,
    pub container_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub engine: Engine,
    pub workspace: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMeta {
    pub run_id: String,
    pub engine: Engine,
    pub workspace: String,
    pub creds: String,
    pub mode: &'static str,
    pub container_id: String,
    pub container_name: String,
    pub started_at: DateTime<Utc>,
    pub transcript_path: String,
    pub mounts: Vec<MountInfo>,
}

/// Validated start request, already past the HTTP boundary's shape checks.
pub struct StartRequest {
    pub engine: String,
    pub workspace: String,
    pub creds: String,
    pub read_only: bool,
    pub uid_gid: Option<String>,
    pub extra_env: Vec<(String, String)>,
    pub prefer_warm: bool,
    pub argv: Vec<String>,
}

/// Result of a terminal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The Run was torn down (or a terminal transition was already in
    /// flight, which callers cannot distinguish and should not care about).
    Done,
    /// The Run was unknown, but containers labeled with the run id were
    /// found and removed.
    Fallback,
}

#[derive(Clone)]
pub struct Orchestrator {
    runs: Arc<RwLock<HashMap<String, Arc<Run>>>>,
    driver: Arc<DockerDriver>,
    warm: WarmPool,
    bus: EventBus,
    config: Arc<AdzConfig>,
}

impl Orchestrator {
    pub fn new(
        driver: Arc<DockerDriver>,
        warm: WarmPool,
        bus: EventBus,
        config: Arc<AdzConfig>,
    ) -> Self {
        Self {
            runs: Arc::new(RwLock::new(HashMap::new())),
            driver,
            warm,
            bus,
            config,
        }
    }

    pub async fn get(&self, run_id: &str) -> Option<Arc<Run>> {
        self.runs.read().await.get(run_id).cloned()
    }

    async fn remove(&self, run_id: &str) {
        self.runs.write().await.remove(run_id);
    }

    async fn snapshot(&self) -> Vec<Arc<Run>> {
        self.runs.read().await.values().cloned().collect()
    }

    fn emit(&self, run: &Run, kind: LifecycleKind) {
        self.bus.publish(BusEvent::Lifecycle(LifecycleEvent {
            kind,
            run_id: run.id.clone(),
            engine: run.engine(),
            workspace: run.workspace_str(),
            warm: run.mode.is_warm(),
            timestamp: Utc::now(),
        }));
    }

    fn emit_artifact(&self, run: &Run, artifact: Artifact) {
        self.bus.publish(BusEvent::Artifact(ArtifactNotice {
            artifact,
            run_id: run.id.clone(),
            engine: run.engine(),
            workspace: run.workspace_str(),
        }));
    }

    /// Start a new Run: fresh container, or exec into a warm one when the
    /// pool has a fingerprint match and the caller did not opt out.
    pub async fn start(&self, req: StartRequest) -> Result<Started, ApiError> {
        let engine: Engine = req.engine.parse()?;
        let workspace = pathguard::validate(&req.workspace, &self.config.allow.workspace_roots)?;
        let creds = pathguard::validate(&req.creds, &self.config.allow.creds_roots)?;

        let fingerprint = MountFingerprint {
            engine,
            workspace: workspace.clone(),
            creds,
            read_only_root: req.read_only,
            uid_gid: req.uid_gid.clone(),
        };

        let runs_dir = workspace.join(".runs");
        tokio::fs::create_dir_all(&runs_dir)
            .await
            .map_err(ApiError::runtime)?;
        let ts_safe = ts_safe_now();
        let transcript_path = runs_dir.join(format!("{}-{}.log", engine.as_str(), ts_safe));
        let transcript = TranscriptWriter::open(&transcript_path)
            .await
            .map_err(ApiError::runtime)?;

        let run_id = Uuid::new_v4().to_string();
        let suffix = Uuid::new_v4().simple().to_string()[..8].to_string();
        let fresh_name = format!("adz-{}-{}-{}", engine.as_str(), ts_safe, suffix);

        let mut warm_hit = None;
        if req.prefer_warm {
            match self.warm.find(&fingerprint).await {
                Ok(hit) => warm_hit = hit,
                Err(err) => {
                    warn!(err = %err, "warm pool lookup failed, starting fresh");
                }
            }
        }

        let (attached, mode, container_id, container_name) = match warm_hit {
            Some(info) => {
                let spec = ExecSpec {
                    engine,
                    extra_env: &req.extra_env,
                    argv: &req.argv,
                };
                let attached = self
                    .driver
                    .exec_in_warm(&info.id, &spec)
                    .await
                    .map_err(ApiError::runtime)?;
                (attached, RunMode::WarmExec, info.id, info.name)
            }
            None => {
                let spec = CreateSpec {
                    fingerprint: &fingerprint,
                    run_id: &run_id,
                    name: &fresh_name,
                    extra_env: &req.extra_env,
                    argv: &req.argv,
                };
                let attached = self
                    .driver
                    .create_fresh(&spec)
                    .await
                    .map_err(ApiError::runtime)?;
                let id = self
                    .driver
                    .resolve_id(&fresh_name)
                    .await
                    .unwrap_or_else(|| fresh_name.clone());
                (attached, RunMode::Fresh, id, fresh_name.clone())
            }
        };

        let (chunks, _) = broadcast::channel(CHUNK_CAPACITY);
        let run = Arc::new(Run {
            id: run_id.clone(),
            fingerprint,
            container_id,
            container_name: container_name.clone(),
            mode,
            started_at: Utc::now(),
            transcript_path,
            attached,
            transcript,
            chunks,
            write_lock: Mutex::new(()),
            last_activity: std::sync::Mutex::new(Instant::now()),
            terminated: AtomicBool::new(false),
        });

        self.runs.write().await.insert(run_id.clone(), run.clone());
        self.emit(&run, LifecycleKind::RunStarted);

        let orch = self.clone();
        let pump_run = run.clone();
        tokio::spawn(async move {
            pump(orch, pump_run).await;
        });

        info!(
            run_id = run_id.as_str(),
            container = container_name.as_str(),
            engine = engine.as_str(),
            mode = mode.as_str(),
            "run started"
        );
        Ok(Started {
            run_id,
            container_name,
        })
    }

    /// Write bytes to the Run's TTY.
    pub async fn input(&self, run_id: &str, bytes: &[u8]) -> Result<(), ApiError> {
        let run = self
            .get(run_id)
            .await
            .ok_or_else(|| ApiError::NotFound(run_id.to_string()))?;
        run.write_stdin(bytes).await
    }

    /// Resize the Run's TTY. Cosmetic: resize failures are swallowed.
    pub async fn resize(&self, run_id: &str, cols: u16, rows: u16) -> Result<(), ApiError> {
        let run = self
            .get(run_id)
            .await
            .ok_or_else(|| ApiError::NotFound(run_id.to_string()))?;
        if let Err(err) = self.driver.resize(&run.attached, cols, rows) {
            debug!(run_id, err = %err, "resize failed");
        }
        Ok(())
    }

    /// Graceful stop. Warm containers always survive their Run.
    pub async fn stop(&self, run_id: &str) -> Result<StopOutcome, ApiError> {
        let Some(run) = self.get(run_id).await else {
            return self.fallback_teardown(run_id).await;
        };
        if !run.claim_terminal() {
            return Ok(StopOutcome::Done);
        }

        self.graceful_teardown(&run).await;
        self.finish_terminal(&run, RunStatus::Stopped, LifecycleKind::RunStopped)
            .await;
        Ok(StopOutcome::Done)
    }

    /// Immediate kill. Cleanup is best-effort; the Run leaves the registry
    /// unconditionally.
    pub async fn kill(&self, run_id: &str) -> Result<StopOutcome, ApiError> {
        let Some(run) = self.get(run_id).await else {
            return self.fallback_teardown(run_id).await;
        };
        if !run.claim_terminal() {
            return Ok(StopOutcome::Done);
        }

        match run.mode {
            RunMode::WarmExec => {
                self.driver
                    .exec_detached(
                        &run.container_id,
                        "pkill -9 -x codex; pkill -9 -x gemini; pkill -9 -x opencode; true",
                    )
                    .await;
            }
            RunMode::Fresh => {
                let _ = self.driver.kill(&run.container_id).await;
                let _ = self.driver.remove(&run.container_id, true).await;
            }
        }
        self.finish_terminal(&run, RunStatus::Killed, LifecycleKind::RunKilled)
            .await;
        Ok(StopOutcome::Done)
    }

    /// Unconditional teardown used by UI shutdown: the attach stream dies
    /// first, then the container side is cleaned with a broader process
    /// match.
    pub async fn close(&self, run_id: &str) -> Result<StopOutcome, ApiError> {
        let Some(run) = self.get(run_id).await else {
            return self.fallback_teardown(run_id).await;
        };
        if !run.claim_terminal() {
            return Ok(StopOutcome::Done);
        }

        {
            let mut child = run.attached.child.lock().await;
            let _ = child.start_kill();
        }

        match run.mode {
            RunMode::WarmExec => {
                self.driver
                    .exec_detached(
                        &run.container_id,
                        "pkill -9 -f entrypoint; pkill -9 -x codex; pkill -9 -x gemini; pkill -9 -x opencode; true",
                    )
                    .await;
            }
            RunMode::Fresh => {
                let _ = self.driver.kill(&run.container_id).await;
                let _ = self.driver.remove(&run.container_id, true).await;
            }
        }
        self.finish_terminal(&run, RunStatus::Closed, LifecycleKind::RunClosed)
            .await;
        Ok(StopOutcome::Done)
    }

    /// Sweep for idle Runs and stop them, emitting `run-idle-stopped`.
    pub async fn sweep_idle(&self, timeout: Duration) {
        for run in self.snapshot().await {
            if run.idle_for() < timeout {
                continue;
            }
            if !run.claim_terminal() {
                continue;
            }

            info!(
                run_id = run.id.as_str(),
                idle_sec = run.idle_for().as_secs(),
                "stopping idle run"
            );
            run.transcript.append(IDLE_MARKER.as_bytes()).await;
            let _ = run
                .chunks
                .send(RunChunk::Bytes(IDLE_MARKER.as_bytes().to_vec()));

            self.graceful_teardown(&run).await;
            self.finish_terminal(&run, RunStatus::IdleStopped, LifecycleKind::RunIdleStopped)
                .await;
        }
    }

    /// Stop every registered Run. Returns how many terminal transitions this
    /// call performed.
    pub async fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for run in self.snapshot().await {
            if matches!(self.stop(&run.id).await, Ok(StopOutcome::Done)) {
                stopped += 1;
            }
        }
        stopped
    }

    pub async fn kill_all(&self) -> usize {
        let mut killed = 0;
        for run in self.snapshot().await {
            if matches!(self.kill(&run.id).await, Ok(StopOutcome::Done)) {
                killed += 1;
            }
        }
        killed
    }

    /// Close every registered Run (daemon shutdown path).
    pub async fn close_all(&self) {
        for run in self.snapshot().await {
            let _ = self.close(&run.id).await;
        }
    }

    pub async fn list(&self) -> Vec<RunSummary> {
        let mut out = Vec::new();
        for run in self.snapshot().await {
            let status = match run.mode {
                // The registry only holds running Runs, but fresh containers
                // can die out from under us; re-resolve from the driver.
                RunMode::Fresh => self
                    .driver
                    .inspect(&run.container_id)
                    .await
                    .map(|info| info.status)
                    .unwrap_or_else(|_| RunStatus::Running.as_str().to_string()),
                RunMode::WarmExec => RunStatus::Running.as_str().to_string(),
            };
            out.push(RunSummary {
                run_id: run.id.clone(),
                engine: run.engine(),
                workspace: run.workspace_str(),
                status,
                started_at: run.started_at,
            });
        }
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        out
    }

    pub async fn meta(&self, run_id: &str) -> Result<RunMeta, ApiError> {
        let run = self
            .get(run_id)
            .await
            .ok_or_else(|| ApiError::NotFound(run_id.to_string()))?;
        let mounts = self
            .driver
            .inspect(&run.container_id)
            .await
            .map(|info| info.mounts)
            .unwrap_or_default();

        Ok(RunMeta {
            run_id: run.id.clone(),
            engine: run.engine(),
            workspace: run.workspace_str(),
            creds: run.fingerprint.creds.display().to_string(),
            mode: run.mode.as_str(),
            container_id: run.container_id.clone(),
            container_name: run.container_name.clone(),
            started_at: run.started_at,
            transcript_path: run.transcript_path.display().to_string(),
            mounts,
        })
    }

    /// Graceful container-side teardown shared by stop and idle-stop.
    async fn graceful_teardown(&self, run: &Run) {
        match run.mode {
            RunMode::WarmExec => {
                // Interrupt the engine, then ask the shell to leave. The warm
                // container itself stays up.
                let _ = run.write_stdin(b"\x03").await;
                let _ = run.write_stdin(b"exit\n").await;
            }
            RunMode::Fresh => {
                let _ = self.driver.stop(&run.container_id, STOP_GRACE_SEC).await;
                let _ = self.driver.remove(&run.container_id, true).await;
            }
        }
    }

    async fn finish_terminal(&self, run: &Arc<Run>, status: RunStatus, kind: LifecycleKind) {
        run.broadcast_terminal(status);
        self.remove(&run.id).await;
        self.emit(run, kind);
    }

    /// Label-based cleanup for terminal ops on unknown run ids: the registry
    /// is process-local, so a restart can leave labeled containers behind.
    async fn fallback_teardown(&self, run_id: &str) -> Result<StopOutcome, ApiError> {
        let filter = format!("label={LABEL_RUN_ID}={run_id}");
        let ids = match self.driver.list(std::slice::from_ref(&filter), true).await {
            Ok(ids) => ids,
            Err(err) => {
                // Fallback is best-effort: an unreachable runtime cannot hold
                // a labeled container we could tear down anyway.
                warn!(run_id, err = %err, "fallback lookup failed");
                return Err(ApiError::NotFound(run_id.to_string()));
            }
        };
        if ids.is_empty() {
            return Err(ApiError::NotFound(run_id.to_string()));
        }

        for id in &ids {
            let _ = self.driver.stop(id, STOP_GRACE_SEC).await;
            let _ = self.driver.remove(id, true).await;
        }
        info!(
            run_id,
            count = ids.len(),
            "fallback teardown removed labeled containers"
        );
        Ok(StopOutcome::Fallback)
    }
}

/// Per-Run output pump: the sole reader of the attach stream and the sole
/// mutator of the listener channel.
async fn pump(orch: Orchestrator, run: Arc<Run>) {
    let mut scanner = LineScanner::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        match run.attached.pty.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                run.touch();
                let chunk = &buf[..n];
                run.transcript.append(chunk).await;
                let _ = run.chunks.send(RunChunk::Bytes(chunk.to_vec()));
                for artifact in scanner.scan(chunk) {
                    orch.emit_artifact(&run, artifact);
                }
            }
            Err(err) => {
                // EIO is the PTY's end-of-stream once the client exits.
                if err.raw_os_error() != Some(libc::EIO) {
                    warn!(run_id = run.id.as_str(), err = %err, "attach stream read failed");
                }
                break;
            }
        }
    }

    for artifact in scanner.finish() {
        orch.emit_artifact(&run, artifact);
    }

    // Reap the runtime client. For fresh runs its exit status is the
    // container's.
    let exit = {
        let mut child = run.attached.child.lock().await;
        child.wait().await.ok()
    };
    run.transcript.flush().await;

    if run.claim_terminal() {
        debug!(
            run_id = run.id.as_str(),
            code = exit.as_ref().and_then(|status| status.code()),
            "attach stream ended"
        );
        run.broadcast_terminal(RunStatus::Exited);
        orch.remove(&run.id).await;
        orch.emit(&run, LifecycleKind::RunExited);

        if run.mode == RunMode::Fresh {
            // Auto-remove usually beat us here; force-remove makes sure.
            let _ = orch.driver.remove(&run.container_id, true).await;
        }
    }
}

/// Wall-clock timestamp safe for file and container names.
fn ts_safe_now() -> String {
    Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ").to_string()
}
