use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// The closed set of terminal programs a session may run. Nothing else is
/// ever accepted at the HTTP boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Codex,
    Gemini,
    Opencode,
}

impl Engine {
    pub const ALL: [Engine; 3] = [Engine::Codex, Engine::Gemini, Engine::Opencode];

    pub fn as_str(self) -> &'static str {
        match self {
            Engine::Codex => "codex",
            Engine::Gemini => "gemini",
            Engine::Opencode => "opencode",
        }
    }
}

impl std::str::FromStr for Engine {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "codex" => Ok(Engine::Codex),
            "gemini" => Ok(Engine::Gemini),
            "opencode" => Ok(Engine::Opencode),
            other => Err(ApiError::InvalidEngine(other.to_string())),
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_engines() {
        for engine in Engine::ALL {
            assert_eq!(engine.as_str().parse::<Engine>().unwrap(), engine);
        }
    }

    #[test]
    fn rejects_unknown_engine() {
        assert!("claude".parse::<Engine>().is_err());
        assert!("CODEX".parse::<Engine>().is_err());
        assert!("".parse::<Engine>().is_err());
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Engine::Opencode).unwrap(), "\"opencode\"");
    }
}
