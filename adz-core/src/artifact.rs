//! Artifact scanner: a line-oriented detector over the engine's output
//! stream. Emits file paths, URLs, pull-request URLs, and auth warnings.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>\)\]]+"#).expect("url regex"));

static PR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)github\.com/[^/\s]+/[^/\s]+/pull/").expect("pr regex"));

static FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/workspace/[\w./-]+").expect("file regex"));

static AUTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)invalid (api )?key|unauthorized|401|permission denied|unauthenticated")
        .expect("auth regex")
});

/// A structured datum extracted from the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum Artifact {
    File(String),
    Url(String),
    Pr(String),
    AuthWarning(String),
}

/// Stateful per-run scanner. Output chunks can split lines arbitrarily, so a
/// residual buffer carries the unterminated tail of each chunk into the next;
/// events fire only on complete lines, and `finish` drains the leftover at
/// stream end.
#[derive(Debug, Default)]
pub struct LineScanner {
    residual: String,
}

impl LineScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one output chunk; returns the artifacts found on the complete
    /// lines it closed.
    pub fn scan(&mut self, chunk: &[u8]) -> Vec<Artifact> {
        self.residual.push_str(&String::from_utf8_lossy(chunk));

        let mut out = Vec::new();
        while let Some(pos) = self.residual.find('\n') {
            let line: String = self.residual.drain(..=pos).collect();
            scan_line(line.trim_end_matches(['\n', '\r']), &mut out);
        }
        out
    }

    /// Drain the residual buffer at stream end.
    pub fn finish(&mut self) -> Vec<Artifact> {
        let mut out = Vec::new();
        if !self.residual.is_empty() {
            let line = std::mem::take(&mut self.residual);
            scan_line(line.trim_end_matches('\r'), &mut out);
        }
        out
    }
}

fn scan_line(line: &str, out: &mut Vec<Artifact>) {
    if line.is_empty() {
        return;
    }

    for m in URL_RE.find_iter(line) {
        let url = m.as_str().to_string();
        if PR_RE.is_match(&url) {
            out.push(Artifact::Pr(url));
        } else {
            out.push(Artifact::Url(url));
        }
    }

    for m in FILE_RE.find_iter(line) {
        out.push(Artifact::File(m.as_str().to_string()));
    }

    if AUTH_RE.is_match(line) {
        out.push(Artifact::AuthWarning(line.trim().to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(input: &str) -> Vec<Artifact> {
        let mut scanner = LineScanner::new();
        let mut out = scanner.scan(input.as_bytes());
        out.extend(scanner.finish());
        out
    }

    #[test]
    fn detects_plain_url() {
        let found = scan_all("see https://example.com/docs for details\n");
        assert_eq!(found, vec![Artifact::Url("https://example.com/docs".into())]);
    }

    #[test]
    fn pull_request_url_is_pr_not_url() {
        let found = scan_all("opened https://github.com/x/y/pull/3\n");
        assert_eq!(found, vec![Artifact::Pr("https://github.com/x/y/pull/3".into())]);
    }

    #[test]
    fn pr_match_is_case_insensitive() {
        let found = scan_all("https://GitHub.com/Org/Repo/PULL/12\n");
        assert!(matches!(found[0], Artifact::Pr(_)));
    }

    #[test]
    fn detects_workspace_file_paths() {
        let found = scan_all("wrote /workspace/src/main.rs and /workspace/notes.md\n");
        assert_eq!(
            found,
            vec![
                Artifact::File("/workspace/src/main.rs".into()),
                Artifact::File("/workspace/notes.md".into()),
            ]
        );
    }

    #[test]
    fn detects_auth_warnings() {
        for line in [
            "Error: invalid API key",
            "request failed: 401",
            "permission denied while reading config",
            "grpc status UNAUTHENTICATED",
            "response: Unauthorized",
        ] {
            let found = scan_all(&format!("{line}\n"));
            assert!(
                found.iter().any(|a| matches!(a, Artifact::AuthWarning(_))),
                "expected auth warning for {line:?}"
            );
        }
    }

    #[test]
    fn auth_warning_carries_trimmed_line() {
        let found = scan_all("  401 from upstream  \n");
        assert_eq!(found, vec![Artifact::AuthWarning("401 from upstream".into())]);
    }

    #[test]
    fn line_split_across_chunks_emits_once_complete() {
        let mut scanner = LineScanner::new();
        assert!(scanner.scan(b"https://exam").is_empty());
        let found = scanner.scan(b"ple.com/a\r\n");
        assert_eq!(found, vec![Artifact::Url("https://example.com/a".into())]);
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut scanner = LineScanner::new();
        assert!(scanner.scan(b"made /workspace/out.txt").is_empty());
        let found = scanner.finish();
        assert_eq!(found, vec![Artifact::File("/workspace/out.txt".into())]);
    }

    #[test]
    fn multiple_events_per_line() {
        let found = scan_all("401 at https://api.example.com while writing /workspace/log\n");
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn empty_lines_emit_nothing() {
        assert!(scan_all("\n\r\n\n").is_empty());
    }
}
