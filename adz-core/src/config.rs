use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AdzConfig {
    pub server: ServerConfig,
    pub runtime: RuntimeConfig,
    pub reaper: ReaperConfig,
    pub allow: AllowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Image reference every session container is created from.
    pub image: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            image: "adz-cli-runner:latest".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Runs idle for at least this long are stopped. Zero disables the reaper.
    pub idle_timeout_sec: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            idle_timeout_sec: 1800,
        }
    }
}

/// Allow-list roots for the two host directories a session may mount.
/// Empty lists mean every request is rejected.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AllowConfig {
    pub workspace_roots: Vec<PathBuf>,
    pub creds_roots: Vec<PathBuf>,
}

impl AdzConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.bind_host, self.server.port)
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(host) = std::env::var("BIND_HOST") {
            if !host.trim().is_empty() {
                self.server.bind_host = host;
            }
        }

        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.trim().parse() {
                self.server.port = port;
            }
        }

        if let Ok(image) = std::env::var("CLI_RUNNER_IMAGE") {
            if !image.trim().is_empty() {
                self.runtime.image = image;
            }
        }

        if let Ok(timeout) = std::env::var("IDLE_TIMEOUT_SEC") {
            if let Ok(timeout) = timeout.trim().parse() {
                self.reaper.idle_timeout_sec = timeout;
            }
        }

        if let Ok(roots) = std::env::var("ALLOW_WORKSPACE_ROOTS") {
            self.allow.workspace_roots = split_roots(&roots);
        }

        if let Ok(roots) = std::env::var("ALLOW_CREDS_ROOTS") {
            self.allow.creds_roots = split_roots(&roots);
        }

        self
    }
}

fn split_roots(raw: &str) -> Vec<PathBuf> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<AdzConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(AdzConfig::default().with_env_overrides());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let parsed: AdzConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    Ok(parsed.with_env_overrides())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_bind_loopback_8080() {
        let cfg = AdzConfig::default();
        assert_eq!(cfg.bind_addr(), "127.0.0.1:8080");
        assert_eq!(cfg.reaper.idle_timeout_sec, 1800);
        assert!(cfg.allow.workspace_roots.is_empty());
    }

    #[test]
    fn parse_toml_uses_defaults_for_missing_fields() {
        let parsed: AdzConfig = toml::from_str(
            r#"
            [server]
            port = 9999

            [allow]
            workspace_roots = ["/srv/ws"]
            "#,
        )
        .expect("parse toml");

        assert_eq!(parsed.server.port, 9999);
        assert_eq!(parsed.server.bind_host, "127.0.0.1");
        assert_eq!(parsed.allow.workspace_roots, vec![PathBuf::from("/srv/ws")]);
        assert!(parsed.allow.creds_roots.is_empty());
    }

    #[test]
    fn split_roots_trims_and_drops_empties() {
        let roots = split_roots(" /a , /b ,, ");
        assert_eq!(roots, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }
}
