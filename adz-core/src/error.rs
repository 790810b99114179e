use thiserror::Error;

/// Error taxonomy surfaced over the HTTP boundary. Every variant maps to a
/// stable `kind` string that clients can branch on.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unknown engine: {0:?}")]
    InvalidEngine(String),

    #[error("path is not absolute: {0}")]
    InvalidPath(String),

    #[error("path is not under any allowed root: {0}")]
    PathNotAllowed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("tty write failed: {0}")]
    WriteFailed(String),
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::InvalidEngine(_) => "invalid-engine",
            ApiError::InvalidPath(_) => "invalid-path",
            ApiError::PathNotAllowed(_) => "path-not-allowed",
            ApiError::NotFound(_) => "not-found",
            ApiError::Runtime(_) => "runtime-error",
            ApiError::WriteFailed(_) => "write-failed",
        }
    }

    /// HTTP status code for this kind.
    pub fn status(&self) -> u16 {
        match self {
            ApiError::InvalidEngine(_) | ApiError::InvalidPath(_) | ApiError::PathNotAllowed(_) => {
                400
            }
            ApiError::NotFound(_) => 404,
            ApiError::Runtime(_) | ApiError::WriteFailed(_) => 500,
        }
    }

    pub fn runtime(err: impl std::fmt::Display) -> Self {
        ApiError::Runtime(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinct() {
        let errors = [
            ApiError::InvalidEngine("x".into()),
            ApiError::InvalidPath("x".into()),
            ApiError::PathNotAllowed("x".into()),
            ApiError::NotFound("x".into()),
            ApiError::Runtime("x".into()),
            ApiError::WriteFailed("x".into()),
        ];
        let mut kinds: Vec<_> = errors.iter().map(|e| e.kind()).collect();
        kinds.sort_unstable();
        kinds.dedup();
        assert_eq!(kinds.len(), errors.len());
    }

    #[test]
    fn validation_errors_are_400() {
        assert_eq!(ApiError::InvalidEngine("x".into()).status(), 400);
        assert_eq!(ApiError::PathNotAllowed("x".into()).status(), 400);
        assert_eq!(ApiError::NotFound("x".into()).status(), 404);
        assert_eq!(ApiError::Runtime("x".into()).status(), 500);
    }
}
