//! Mount fingerprint: the tuple that decides whether two container
//! configurations are interchangeable, and its container-label encoding.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::engine::Engine;

pub const LABEL_ENGINE: &str = "adz.engine";
pub const LABEL_WORKSPACE: &str = "adz.workspace";
pub const LABEL_CREDS: &str = "adz.creds";
pub const LABEL_RUN_ID: &str = "adz.runId";
pub const LABEL_WARM: &str = "adz.warm";
pub const LABEL_READONLY: &str = "adz.readonly";
pub const LABEL_UIDGID: &str = "adz.uidgid";

/// Two fingerprints are equal iff every field is byte-equal after path
/// normalization; callers construct them from already-normalized paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MountFingerprint {
    pub engine: Engine,
    pub workspace: PathBuf,
    pub creds: PathBuf,
    pub read_only_root: bool,
    /// Optional `uid:gid` the container process runs as.
    pub uid_gid: Option<String>,
}

impl MountFingerprint {
    fn readonly_label(&self) -> &'static str {
        if self.read_only_root { "1" } else { "0" }
    }

    fn uidgid_label(&self) -> &str {
        self.uid_gid.as_deref().unwrap_or("")
    }

    /// Labels for a fresh run container. Never includes `adz.warm`.
    pub fn run_labels(&self, run_id: &str) -> Vec<(String, String)> {
        vec![
            (LABEL_ENGINE.into(), self.engine.as_str().into()),
            (LABEL_WORKSPACE.into(), self.workspace.display().to_string()),
            (LABEL_CREDS.into(), self.creds.display().to_string()),
            (LABEL_RUN_ID.into(), run_id.into()),
        ]
    }

    /// Labels for a warm container. Never includes `adz.runId`.
    pub fn warm_labels(&self) -> Vec<(String, String)> {
        vec![
            (LABEL_WARM.into(), "true".into()),
            (LABEL_ENGINE.into(), self.engine.as_str().into()),
            (LABEL_WORKSPACE.into(), self.workspace.display().to_string()),
            (LABEL_CREDS.into(), self.creds.display().to_string()),
            (LABEL_READONLY.into(), self.readonly_label().into()),
            (LABEL_UIDGID.into(), self.uidgid_label().into()),
        ]
    }

    /// Whether a warm container's label set denotes exactly this fingerprint.
    /// Labels fully determine identity, so no further inspection is needed.
    pub fn matches_warm_labels(&self, labels: &HashMap<String, String>) -> bool {
        self.warm_labels()
            .iter()
            .all(|(key, value)| labels.get(key).map(String::as_str) == Some(value.as_str()))
    }
}
