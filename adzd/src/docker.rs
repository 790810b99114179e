//! Thin capability layer over the container runtime.
//!
//! The runtime is driven through its CLI with `tokio::process`. Attach
//! streams run the CLI client on the slave side of a host PTY pair, so the
//! client's exit status is the container (or exec) exit status and resize is
//! a winsize ioctl plus SIGWINCH. This is the only module that spells the
//! word "docker"; everything else consumes the verbs below.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use adz_core::fingerprint::{LABEL_RUN_ID, MountFingerprint};
use adz_core::Engine;

use crate::pty::{self, DEFAULT_COLS, DEFAULT_ROWS, PtyMaster};

const RUNTIME_BIN: &str = "docker";
/// `/tmp` overlay when the root filesystem is read-only: 256 MiB, noexec+nosuid.
const TMPFS_TMP: &str = "/tmp:rw,noexec,nosuid,size=268435456";

const WORKSPACE_MOUNT: &str = "/workspace";
const CREDS_MOUNT: &str = "/home/agent/.creds";

/// Spec for a fresh run container.
pub struct CreateSpec<'a> {
    pub fingerprint: &'a MountFingerprint,
    pub run_id: &'a str,
    pub name: &'a str,
    pub extra_env: &'a [(String, String)],
    pub argv: &'a [String],
}

/// Spec for an exec session inside a warm container.
pub struct ExecSpec<'a> {
    pub engine: Engine,
    pub extra_env: &'a [(String, String)],
    pub argv: &'a [String],
}

/// A started container or exec session, attached via its PTY master.
pub struct Attached {
    pub pty: Arc<PtyMaster>,
    pub child: Mutex<Child>,
    pub pid: Option<i32>,
}

/// Everything the orchestrator needs from `inspect`.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub status: String,
    pub labels: HashMap<String, String>,
    pub mounts: Vec<MountInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MountInfo {
    pub source: String,
    pub destination: String,
    pub rw: bool,
}

#[derive(Deserialize)]
struct RawInspect {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "State")]
    state: RawState,
    #[serde(rename = "Config")]
    config: RawConfig,
    #[serde(rename = "Mounts", default)]
    mounts: Vec<RawMount>,
}

#[derive(Deserialize)]
struct RawState {
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct RawMount {
    #[serde(rename = "Source", default)]
    source: String,
    #[serde(rename = "Destination", default)]
    destination: String,
    #[serde(rename = "RW", default)]
    rw: bool,
}

pub struct DockerDriver {
    image: String,
    /// Image entrypoint, resolved once; exec sessions re-run it.
    entrypoint: OnceCell<Vec<String>>,
}

impl DockerDriver {
    pub fn new(image: String) -> Self {
        Self {
            image,
            entrypoint: OnceCell::new(),
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Ping the runtime. Callers decide whether absence is fatal.
    pub async fn ensure_available(&self) -> anyhow::Result<()> {
        let output = Command::new(RUNTIME_BIN)
            .arg("info")
            .output()
            .await
            .with_context(|| format!("container runtime `{RUNTIME_BIN}` not found"))?;
        if !output.status.success() {
            bail!("container runtime is not running");
        }
        debug!("container runtime available");
        Ok(())
    }

    /// Remove leftover run containers from a previous process. Run history is
    /// not persisted, so anything still labeled with a run id is unowned.
    /// Warm containers carry no run id and are left alone.
    pub async fn cleanup_orphans(&self) {
        let ids = match self
            .list(&[format!("label={LABEL_RUN_ID}")], true)
            .await
        {
            Ok(ids) => ids,
            Err(err) => {
                warn!(err = %err, "failed to list orphaned run containers");
                return;
            }
        };

        for id in &ids {
            let _ = self.remove(id, true).await;
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "removed orphaned run containers");
        }
    }

    /// Create and start a fresh run container, attached over a PTY.
    pub async fn create_fresh(&self, spec: &CreateSpec<'_>) -> anyhow::Result<Attached> {
        let args = build_fresh_args(&self.image, spec);
        debug!(name = spec.name, "starting fresh run container");
        spawn_attached(&args)
    }

    /// Start the image's entrypoint inside a warm container, attached over a
    /// PTY. Falls back to the engine binary when the image declares no
    /// entrypoint.
    pub async fn exec_in_warm(
        &self,
        warm_ref: &str,
        spec: &ExecSpec<'_>,
    ) -> anyhow::Result<Attached> {
        let entrypoint = self.image_entrypoint().await;
        let command: Vec<String> = if entrypoint.is_empty() {
            vec![spec.engine.as_str().to_string()]
        } else {
            entrypoint
        };
        let args = build_exec_args(warm_ref, &command, spec);
        debug!(warm = warm_ref, "starting exec session in warm container");
        spawn_attached(&args)
    }

    /// Create and start a warm container running an indefinite sleep.
    /// Returns the new container's id.
    pub async fn create_warm(
        &self,
        fingerprint: &MountFingerprint,
        name: &str,
    ) -> anyhow::Result<String> {
        let args = build_warm_args(&self.image, fingerprint, name);
        let output = run_cli(&args).await?;
        Ok(output.trim().to_string())
    }

    pub async fn stop(&self, container: &str, grace_sec: u32) -> anyhow::Result<()> {
        run_cli(&[
            "stop".into(),
            "-t".into(),
            grace_sec.to_string(),
            container.into(),
        ])
        .await
        .map(drop)
    }

    pub async fn kill(&self, container: &str) -> anyhow::Result<()> {
        run_cli(&["kill".into(), container.into()]).await.map(drop)
    }

    pub async fn remove(&self, container: &str, force: bool) -> anyhow::Result<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".into());
        }
        args.push(container.into());
        run_cli(&args).await.map(drop)
    }

    pub async fn inspect(&self, container: &str) -> anyhow::Result<ContainerInfo> {
        let output = run_cli(&["inspect".into(), container.into()]).await?;
        let mut parsed: Vec<RawInspect> =
            serde_json::from_str(&output).context("parse inspect output")?;
        let raw = if parsed.is_empty() {
            bail!("inspect returned no entries for {container}");
        } else {
            parsed.remove(0)
        };

        Ok(ContainerInfo {
            id: raw.id,
            name: raw.name.trim_start_matches('/').to_string(),
            status: raw.state.status,
            labels: raw.config.labels.unwrap_or_default(),
            mounts: raw
                .mounts
                .into_iter()
                .map(|m| MountInfo {
                    source: m.source,
                    destination: m.destination,
                    rw: m.rw,
                })
                .collect(),
        })
    }

    /// Resolve a container name to its id, retrying briefly: `run` may still
    /// be registering the container when we first ask.
    pub async fn resolve_id(&self, name: &str) -> Option<String> {
        for _ in 0..10 {
            if let Ok(info) = self.inspect(name).await {
                return Some(info.id);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        None
    }

    /// List container ids matching the given `--filter` expressions.
    pub async fn list(&self, filters: &[String], all: bool) -> anyhow::Result<Vec<String>> {
        let mut args = vec!["ps".to_string(), "--format".into(), "{{.ID}}".into()];
        if all {
            args.push("-a".into());
        }
        for filter in filters {
            args.push("--filter".into());
            args.push(filter.clone());
        }
        let output = run_cli(&args).await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Run a shell command inside a container, detached from any TTY.
    /// Best-effort: failures are logged and swallowed.
    pub async fn exec_detached(&self, container: &str, command: &str) {
        let result = run_cli(&[
            "exec".into(),
            container.into(),
            "sh".into(),
            "-c".into(),
            command.into(),
        ])
        .await;
        if let Err(err) = result {
            debug!(container, err = %err, "detached exec failed");
        }
    }

    /// Resize the PTY behind an attach stream.
    pub fn resize(&self, attached: &Attached, cols: u16, rows: u16) -> std::io::Result<()> {
        attached.pty.resize(cols, rows)?;
        if let Some(pid) = attached.pid {
            pty::notify_resize(pid);
        }
        Ok(())
    }

    async fn image_entrypoint(&self) -> Vec<String> {
        self.entrypoint
            .get_or_init(|| async {
                let result = run_cli(&[
                    "image".into(),
                    "inspect".into(),
                    "--format".into(),
                    "{{json .Config.Entrypoint}}".into(),
                    self.image.clone(),
                ])
                .await;
                match result {
                    Ok(output) => {
                        serde_json::from_str::<Option<Vec<String>>>(output.trim())
                            .ok()
                            .flatten()
                            .unwrap_or_default()
                    }
                    Err(err) => {
                        warn!(image = %self.image, err = %err, "failed to read image entrypoint");
                        Vec::new()
                    }
                }
            })
            .await
            .clone()
    }
}

/// Run a CLI invocation to completion, returning stdout. Failures carry the
/// runtime's stderr.
async fn run_cli(args: &[String]) -> anyhow::Result<String> {
    let output = Command::new(RUNTIME_BIN)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("failed to run {RUNTIME_BIN} {}", args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{RUNTIME_BIN} {} failed: {}",
            args.first().map(String::as_str).unwrap_or(""),
            stderr.trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Spawn a CLI client on the slave side of a fresh PTY pair.
fn spawn_attached(args: &[String]) -> anyhow::Result<Attached> {
    let (master, slave) = pty::pair(DEFAULT_COLS, DEFAULT_ROWS)?;
    let stdin = slave.try_clone().context("dup pty slave")?;
    let stdout = slave.try_clone().context("dup pty slave")?;

    let child = Command::new(RUNTIME_BIN)
        .args(args)
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(slave))
        .spawn()
        .context("spawn container runtime client")?;
    let pid = child.id().map(|p| p as i32);

    Ok(Attached {
        pty: Arc::new(master),
        child: Mutex::new(child),
        pid,
    })
}

fn push_env(args: &mut Vec<String>, key: &str, value: &str) {
    args.push("-e".into());
    args.push(format!("{key}={value}"));
}

fn push_common_config(args: &mut Vec<String>, fingerprint: &MountFingerprint) {
    args.push("-v".into());
    args.push(format!(
        "{}:{}",
        fingerprint.workspace.display(),
        WORKSPACE_MOUNT
    ));
    args.push("-v".into());
    args.push(format!("{}:{}", fingerprint.creds.display(), CREDS_MOUNT));

    if fingerprint.read_only_root {
        args.push("--read-only".into());
        args.push("--tmpfs".into());
        args.push(TMPFS_TMP.into());
    }

    if let Some(uid_gid) = &fingerprint.uid_gid {
        args.push("--user".into());
        args.push(uid_gid.clone());
    }

    args.push("-w".into());
    args.push(WORKSPACE_MOUNT.into());
}

fn push_labels(args: &mut Vec<String>, labels: &[(String, String)]) {
    for (key, value) in labels {
        args.push("-l".into());
        args.push(format!("{key}={value}"));
    }
}

pub(crate) fn build_fresh_args(image: &str, spec: &CreateSpec<'_>) -> Vec<String> {
    let fingerprint = spec.fingerprint;
    let mut args: Vec<String> = vec![
        "run".into(),
        "--rm".into(),
        "-i".into(),
        "-t".into(),
        "--name".into(),
        spec.name.into(),
    ];

    push_env(&mut args, "ENGINE", fingerprint.engine.as_str());
    push_env(&mut args, "TERM", "xterm-256color");
    for (key, value) in spec.extra_env {
        push_env(&mut args, key, value);
    }

    push_common_config(&mut args, fingerprint);
    push_labels(&mut args, &fingerprint.run_labels(spec.run_id));

    args.push(image.into());
    args.extend(spec.argv.iter().cloned());
    args
}

pub(crate) fn build_warm_args(
    image: &str,
    fingerprint: &MountFingerprint,
    name: &str,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "-d".into(),
        "--name".into(),
        name.into(),
        "--entrypoint".into(),
        "sleep".into(),
    ];

    push_env(&mut args, "ENGINE", fingerprint.engine.as_str());
    push_common_config(&mut args, fingerprint);
    push_labels(&mut args, &fingerprint.warm_labels());

    args.push(image.into());
    args.push("infinity".into());
    args
}

pub(crate) fn build_exec_args(
    warm_ref: &str,
    command: &[String],
    spec: &ExecSpec<'_>,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["exec".into(), "-i".into(), "-t".into()];

    push_env(&mut args, "ENGINE", spec.engine.as_str());
    push_env(&mut args, "TERM", "xterm-256color");
    for (key, value) in spec.extra_env {
        push_env(&mut args, key, value);
    }

    args.push("-w".into());
    args.push(WORKSPACE_MOUNT.into());
    args.push(warm_ref.into());
    args.extend(command.iter().cloned());
    args.extend(spec.argv.iter().cloned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fingerprint(read_only: bool, uid_gid: Option<&str>) -> MountFingerprint {
        MountFingerprint {
            engine: Engine::Codex,
            workspace: PathBuf::from("/srv/ws"),
            creds: PathBuf::from("/srv/creds"),
            read_only_root: read_only,
            uid_gid: uid_gid.map(String::from),
        }
    }

    #[test]
    fn fresh_args_mount_workspace_and_creds() {
        let fp = fingerprint(false, None);
        let spec = CreateSpec {
            fingerprint: &fp,
            run_id: "r-1",
            name: "adz-codex-x",
            extra_env: &[],
            argv: &[],
        };
        let args = build_fresh_args("runner:latest", &spec);

        assert!(args.contains(&"--rm".to_string()));
        assert!(args.contains(&"-t".to_string()));
        assert!(args.contains(&"/srv/ws:/workspace".to_string()));
        assert!(args.contains(&"/srv/creds:/home/agent/.creds".to_string()));
        assert!(args.contains(&"ENGINE=codex".to_string()));
        assert!(args.contains(&"TERM=xterm-256color".to_string()));
        assert!(args.contains(&"adz.runId=r-1".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("adz.warm")));
        assert_eq!(args.last().unwrap(), "runner:latest");
    }

    #[test]
    fn fresh_args_read_only_adds_tmpfs() {
        let fp = fingerprint(true, Some("1000:1000"));
        let spec = CreateSpec {
            fingerprint: &fp,
            run_id: "r-1",
            name: "adz-codex-x",
            extra_env: &[],
            argv: &[],
        };
        let args = build_fresh_args("runner:latest", &spec);

        assert!(args.contains(&"--read-only".to_string()));
        assert!(args.contains(&TMPFS_TMP.to_string()));
        assert!(args.contains(&"--user".to_string()));
        assert!(args.contains(&"1000:1000".to_string()));
    }

    #[test]
    fn fresh_args_append_argv_after_image() {
        let fp = fingerprint(false, None);
        let argv = vec!["--resume".to_string(), "last".to_string()];
        let spec = CreateSpec {
            fingerprint: &fp,
            run_id: "r-1",
            name: "adz-codex-x",
            extra_env: &[],
            argv: &argv,
        };
        let args = build_fresh_args("runner:latest", &spec);
        let image_idx = args.iter().position(|a| a == "runner:latest").unwrap();
        assert_eq!(&args[image_idx + 1..], ["--resume", "last"]);
    }

    #[test]
    fn warm_args_sleep_forever_with_warm_labels() {
        let fp = fingerprint(false, None);
        let args = build_warm_args("runner:latest", &fp, "adz-warm-codex-1");

        assert!(args.contains(&"-d".to_string()));
        assert!(args.contains(&"--entrypoint".to_string()));
        assert!(args.contains(&"sleep".to_string()));
        assert_eq!(args.last().unwrap(), "infinity");
        assert!(args.contains(&"adz.warm=true".to_string()));
        assert!(args.contains(&"adz.readonly=0".to_string()));
        assert!(args.contains(&"adz.uidgid=".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("adz.runId")));
    }

    #[test]
    fn exec_args_target_warm_container_with_engine_env() {
        let command = vec!["/entrypoint.sh".to_string()];
        let argv = vec!["chat".to_string()];
        let spec = ExecSpec {
            engine: Engine::Gemini,
            extra_env: &[("FOO".to_string(), "bar".to_string())],
            argv: &argv,
        };
        let args = build_exec_args("abc123", &command, &spec);

        assert_eq!(args[0], "exec");
        assert!(args.contains(&"ENGINE=gemini".to_string()));
        assert!(args.contains(&"FOO=bar".to_string()));
        let target_idx = args.iter().position(|a| a == "abc123").unwrap();
        assert_eq!(&args[target_idx + 1..], ["/entrypoint.sh", "chat"]);
    }

    #[test]
    fn inspect_payload_parses() {
        let raw = r#"[{
            "Id": "abc",
            "Name": "/adz-codex-1",
            "State": {"Status": "running"},
            "Config": {"Labels": {"adz.engine": "codex"}},
            "Mounts": [{"Source": "/srv/ws", "Destination": "/workspace", "RW": true}]
        }]"#;
        let parsed: Vec<RawInspect> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed[0].id, "abc");
        assert_eq!(parsed[0].state.status, "running");
        assert_eq!(parsed[0].mounts[0].destination, "/workspace");
    }
}
