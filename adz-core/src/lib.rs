pub mod artifact;
pub mod config;
pub mod creds;
pub mod engine;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod pathguard;

pub use artifact::{Artifact, LineScanner};
pub use config::{AdzConfig, AllowConfig, ReaperConfig, RuntimeConfig, ServerConfig, load_config};
pub use creds::{Found, Readiness, check_readiness, read_env, write_env};
pub use engine::Engine;
pub use error::ApiError;
pub use events::{ArtifactNotice, BusEvent, LifecycleEvent, LifecycleKind};
pub use fingerprint::{
    LABEL_CREDS, LABEL_ENGINE, LABEL_READONLY, LABEL_RUN_ID, LABEL_UIDGID, LABEL_WARM,
    LABEL_WORKSPACE, MountFingerprint,
};
pub use pathguard::{normalize, validate};
