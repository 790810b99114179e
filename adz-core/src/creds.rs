//! Credential store: a `KEY=VALUE` text file inside the per-user credentials
//! pocket, plus per-engine readiness rules over that file and the pocket's
//! engine state directories.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::Engine;

const ENV_FILE: &str = ".env";

/// Subdirectories that hold persistent engine state inside the pocket.
pub const STATE_DIRS: [&str; 4] = ["codex", "gemini", "opencode", "gcloud"];

/// Per-engine readiness verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Readiness {
    pub engine: Engine,
    pub ready: bool,
    pub reasons: Vec<String>,
    pub found: Found,
}

/// What the check actually observed in the pocket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Found {
    /// Credential keys present with a non-empty value.
    pub keys: Vec<String>,
    /// State subdirectories that exist and are non-empty.
    pub dirs: Vec<String>,
}

/// Parse `<creds_dir>/.env`. A missing file yields an empty map; other I/O
/// failures surface to the caller. Lines without `=` are ignored, `#` lines
/// are comments, and surrounding single or double quotes are stripped. There
/// is no escape processing. Empty values are kept — an empty string is the
/// explicit way to clear a key.
pub fn read_env(creds_dir: &Path) -> io::Result<BTreeMap<String, String>> {
    let path = creds_dir.join(ENV_FILE);
    let content = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "env file not found");
            return Ok(BTreeMap::new());
        }
        Err(err) => return Err(err),
    };

    Ok(parse_env(&content))
}

fn parse_env(content: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some(eq_idx) = trimmed.find('=') else {
            continue;
        };
        let key = trimmed[..eq_idx].trim();
        if key.is_empty() {
            continue;
        }
        let mut value = trimmed[eq_idx + 1..].trim();
        if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
            || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
        {
            value = &value[1..value.len() - 1];
        }
        map.insert(key.to_string(), value.to_string());
    }
    map
}

/// Overlay `updates` on the current map and rewrite the whole file, creating
/// `creds_dir` when missing. Keys are never deleted; writing an empty string
/// is the explicit clear. Returns the resulting map.
pub fn write_env(
    creds_dir: &Path,
    updates: &BTreeMap<String, String>,
) -> anyhow::Result<BTreeMap<String, String>> {
    let mut map = read_env(creds_dir)?;
    for (key, value) in updates {
        map.insert(key.clone(), value.clone());
    }

    fs::create_dir_all(creds_dir)?;

    let mut rendered = String::new();
    for (key, value) in &map {
        rendered.push_str(key);
        rendered.push('=');
        rendered.push_str(value);
        rendered.push('\n');
    }

    // Write-then-rename so readers never observe a torn file.
    let path = creds_dir.join(ENV_FILE);
    let tmp = creds_dir.join(format!("{ENV_FILE}.tmp"));
    fs::write(&tmp, rendered)?;
    fs::rename(&tmp, &path)?;

    Ok(map)
}

/// Per-engine readiness per the rules:
/// - codex: `OPENAI_API_KEY` set or `codex/` non-empty;
/// - gemini: `GEMINI_API_KEY` set, or `gemini/` or `gcloud/` non-empty;
/// - opencode: any of `OPENAI_API_KEY`, `ANTHROPIC_API_KEY`,
///   `GEMINI_API_KEY` set, or `opencode/` non-empty.
///
/// I/O failures never error out: they make the verdict not-ready with a
/// `readiness-indeterminate` reason.
pub fn check_readiness(engine: Engine, creds_dir: &Path) -> Readiness {
    let mut reasons = Vec::new();
    let mut found = Found::default();
    let mut indeterminate = false;

    let env = match read_env(creds_dir) {
        Ok(env) => env,
        Err(err) => {
            reasons.push(format!("readiness-indeterminate: reading .env failed: {err}"));
            indeterminate = true;
            BTreeMap::new()
        }
    };

    let key_set = |key: &str| env.get(key).is_some_and(|v| !v.is_empty());

    for dir in STATE_DIRS {
        match dir_non_empty(&creds_dir.join(dir)) {
            Ok(true) => found.dirs.push(dir.to_string()),
            Ok(false) => {}
            Err(err) => {
                reasons.push(format!("readiness-indeterminate: scanning {dir}/ failed: {err}"));
                indeterminate = true;
            }
        }
    }

    let (keys, dirs): (&[&str], &[&str]) = match engine {
        Engine::Codex => (&["OPENAI_API_KEY"], &["codex"]),
        Engine::Gemini => (&["GEMINI_API_KEY"], &["gemini", "gcloud"]),
        Engine::Opencode => (
            &["OPENAI_API_KEY", "ANTHROPIC_API_KEY", "GEMINI_API_KEY"],
            &["opencode"],
        ),
    };

    let mut ready = false;
    for key in keys {
        if key_set(key) {
            found.keys.push((*key).to_string());
            reasons.push(format!("{key} is set"));
            ready = true;
        }
    }
    for dir in dirs {
        if found.dirs.iter().any(|d| d == dir) {
            reasons.push(format!("{dir}/ has state"));
            ready = true;
        }
    }

    if !ready && !indeterminate {
        for key in keys {
            reasons.push(format!("{key} not set"));
        }
        for dir in dirs {
            reasons.push(format!("{dir}/ is empty or missing"));
        }
    }

    Readiness {
        engine,
        ready: ready && !indeterminate,
        reasons,
        found,
    }
}

fn dir_non_empty(path: &Path) -> io::Result<bool> {
    match fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn updates(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn read_env_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(read_env(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn parse_skips_comments_and_bare_lines() {
        let map = parse_env("# comment\nnot a pair\nKEY=value\n");
        assert_eq!(map.len(), 1);
        assert_eq!(map["KEY"], "value");
    }

    #[test]
    fn parse_strips_quotes_and_keeps_empty_values() {
        let map = parse_env("A=\"quoted\"\nB='single'\nC=\n");
        assert_eq!(map["A"], "quoted");
        assert_eq!(map["B"], "single");
        assert_eq!(map["C"], "");
    }

    #[test]
    fn write_then_read_round_trips() {
        let tmp = TempDir::new().unwrap();
        let creds = tmp.path().join("pocket");
        let written = write_env(&creds, &updates(&[("OPENAI_API_KEY", "sk-1"), ("X", "")])).unwrap();
        assert_eq!(written["OPENAI_API_KEY"], "sk-1");

        let read = read_env(&creds).unwrap();
        assert_eq!(read, written);
        assert_eq!(read["X"], "");
    }

    #[test]
    fn write_overlays_without_deleting() {
        let tmp = TempDir::new().unwrap();
        write_env(tmp.path(), &updates(&[("A", "1"), ("B", "2")])).unwrap();
        let after = write_env(tmp.path(), &updates(&[("B", ""), ("C", "3")])).unwrap();
        assert_eq!(after["A"], "1");
        assert_eq!(after["B"], "");
        assert_eq!(after["C"], "3");
    }

    #[test]
    fn codex_ready_via_api_key() {
        let tmp = TempDir::new().unwrap();
        write_env(tmp.path(), &updates(&[("OPENAI_API_KEY", "sk-1")])).unwrap();

        let readiness = check_readiness(Engine::Codex, tmp.path());
        assert!(readiness.ready);
        assert_eq!(readiness.found.keys, vec!["OPENAI_API_KEY"]);
    }

    #[test]
    fn codex_not_ready_when_key_cleared() {
        let tmp = TempDir::new().unwrap();
        write_env(tmp.path(), &updates(&[("OPENAI_API_KEY", "")])).unwrap();

        let readiness = check_readiness(Engine::Codex, tmp.path());
        assert!(!readiness.ready);
        assert!(readiness.reasons.iter().any(|r| r.contains("not set")));
    }

    #[test]
    fn codex_ready_via_state_dir() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("codex")).unwrap();
        std::fs::write(tmp.path().join("codex/auth.json"), "{}").unwrap();

        let readiness = check_readiness(Engine::Codex, tmp.path());
        assert!(readiness.ready);
        assert_eq!(readiness.found.dirs, vec!["codex"]);
    }

    #[test]
    fn empty_state_dir_does_not_count() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("gemini")).unwrap();

        let readiness = check_readiness(Engine::Gemini, tmp.path());
        assert!(!readiness.ready);
        assert!(readiness.found.dirs.is_empty());
    }

    #[test]
    fn gemini_ready_via_gcloud() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("gcloud")).unwrap();
        std::fs::write(tmp.path().join("gcloud/config"), "x").unwrap();

        assert!(check_readiness(Engine::Gemini, tmp.path()).ready);
    }

    #[test]
    fn opencode_accepts_any_provider_key() {
        let tmp = TempDir::new().unwrap();
        write_env(tmp.path(), &updates(&[("ANTHROPIC_API_KEY", "sk-ant")])).unwrap();

        let readiness = check_readiness(Engine::Opencode, tmp.path());
        assert!(readiness.ready);
    }

    #[test]
    fn readiness_is_pure() {
        let tmp = TempDir::new().unwrap();
        write_env(tmp.path(), &updates(&[("GEMINI_API_KEY", "g-1")])).unwrap();

        let first = check_readiness(Engine::Gemini, tmp.path());
        let second = check_readiness(Engine::Gemini, tmp.path());
        assert_eq!(first, second);
    }
}
