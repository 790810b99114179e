//! Warm pool manager: long-lived idle containers indexed by mount
//! fingerprint, reusable for fast exec-based attach.

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use adz_core::fingerprint::{
    LABEL_CREDS, LABEL_ENGINE, LABEL_READONLY, LABEL_UIDGID, LABEL_WARM, LABEL_WORKSPACE,
    MountFingerprint,
};
use adz_core::ApiError;

use crate::docker::{ContainerInfo, DockerDriver};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmSummary {
    pub id: String,
    pub name: String,
    pub engine: String,
    pub workspace: String,
    pub creds: String,
    pub read_only: bool,
    pub uidgid: String,
    pub status: String,
}

impl WarmSummary {
    pub(crate) fn from_info(info: &ContainerInfo) -> Self {
        let label = |key: &str| info.labels.get(key).cloned().unwrap_or_default();
        Self {
            id: info.id.clone(),
            name: info.name.clone(),
            engine: label(LABEL_ENGINE),
            workspace: label(LABEL_WORKSPACE),
            creds: label(LABEL_CREDS),
            read_only: label(LABEL_READONLY) == "1",
            uidgid: label(LABEL_UIDGID),
            status: info.status.clone(),
        }
    }
}

#[derive(Clone)]
pub struct WarmPool {
    driver: Arc<DockerDriver>,
}

impl WarmPool {
    pub fn new(driver: Arc<DockerDriver>) -> Self {
        Self { driver }
    }

    async fn running_warm_ids(&self, fingerprint: Option<&MountFingerprint>) -> anyhow::Result<Vec<String>> {
        let mut filters = vec![format!("label={LABEL_WARM}=true")];
        if let Some(fp) = fingerprint {
            filters.push(format!("label={LABEL_ENGINE}={}", fp.engine.as_str()));
        }
        self.driver.list(&filters, false).await
    }

    /// Find a running warm container whose labels equal the fingerprint.
    /// Labels fully determine identity, so the first match is the match.
    pub async fn find(&self, fingerprint: &MountFingerprint) -> anyhow::Result<Option<ContainerInfo>> {
        for id in self.running_warm_ids(Some(fingerprint)).await? {
            let info = match self.driver.inspect(&id).await {
                Ok(info) => info,
                Err(err) => {
                    warn!(container = id.as_str(), err = %err, "warm candidate vanished");
                    continue;
                }
            };
            if fingerprint.matches_warm_labels(&info.labels) {
                return Ok(Some(info));
            }
        }
        Ok(None)
    }

    /// Return the warm container for this fingerprint, creating and starting
    /// one when absent.
    pub async fn ensure(&self, fingerprint: &MountFingerprint) -> anyhow::Result<ContainerInfo> {
        if let Some(existing) = self.find(fingerprint).await? {
            return Ok(existing);
        }

        let suffix: String = Uuid::new_v4().simple().to_string()[..8].to_string();
        let name = format!("adz-warm-{}-{}", fingerprint.engine.as_str(), suffix);
        let id = self
            .driver
            .create_warm(fingerprint, &name)
            .await
            .context("create warm container")?;
        info!(container = name.as_str(), engine = fingerprint.engine.as_str(), "warm container started");

        self.driver.inspect(&id).await
    }

    pub async fn list(&self) -> anyhow::Result<Vec<WarmSummary>> {
        let mut out = Vec::new();
        for id in self.running_warm_ids(None).await? {
            match self.driver.inspect(&id).await {
                Ok(info) => out.push(WarmSummary::from_info(&info)),
                Err(err) => warn!(container = id.as_str(), err = %err, "warm container vanished"),
            }
        }
        Ok(out)
    }

    /// Stop and remove a warm container. Refuses ids that are not labeled
    /// warm, so run containers cannot be destroyed through this path.
    pub async fn destroy(&self, id: &str) -> Result<(), ApiError> {
        let info = self
            .driver
            .inspect(id)
            .await
            .map_err(|_| ApiError::NotFound(id.to_string()))?;
        if info.labels.get(LABEL_WARM).map(String::as_str) != Some("true") {
            return Err(ApiError::NotFound(id.to_string()));
        }

        self.driver
            .remove(&info.id, true)
            .await
            .map_err(ApiError::runtime)?;
        info!(container = info.name.as_str(), "warm container destroyed");
        Ok(())
    }
}
