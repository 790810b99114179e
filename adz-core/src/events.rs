//! Structured events published on the daemon's shared bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::engine::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleKind {
    RunStarted,
    RunExited,
    RunStopped,
    RunKilled,
    RunIdleStopped,
    RunClosed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub kind: LifecycleKind,
    pub run_id: String,
    pub engine: Engine,
    pub workspace: String,
    pub warm: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactNotice {
    #[serde(flatten)]
    pub artifact: Artifact,
    pub run_id: String,
    pub engine: Engine,
    pub workspace: String,
}

/// Everything that travels on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BusEvent {
    Lifecycle(LifecycleEvent),
    Artifact(ArtifactNotice),
}

impl BusEvent {
    /// SSE event name for this payload.
    pub fn stream_name(&self) -> &'static str {
        match self {
            BusEvent::Lifecycle(_) => "lifecycle",
            BusEvent::Artifact(_) => "artifact",
        }
    }
}
