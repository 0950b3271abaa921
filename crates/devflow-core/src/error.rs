// Error taxonomy shared across all DevFlow components

use thiserror::Error;

/// Result type alias for domain operations
pub type Result<T> = std::result::Result<T, DomainError>;

/// Classifies an error for propagation and wire mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Client-correctable input
    Validation,
    /// Referenced entity absent
    NotFound,
    /// Uniqueness or version violation
    Conflict,
    /// Transient or environmental failure
    Failure,
    Unauthorized,
    Forbidden,
    /// Programmer error; details are never surfaced to clients
    Unexpected,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Failure => "failure",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Unexpected => "unexpected",
        };
        write!(f, "{}", s)
    }
}

/// A failed domain operation: machine-readable code, human message, taxonomy kind
#[derive(Debug, Clone, Error)]
#[error("[{code}] {message}")]
pub struct DomainError {
    pub code: String,
    pub message: String,
    pub kind: ErrorKind,
}

impl DomainError {
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            kind,
        }
    }

    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, code, message)
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Failure, code, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unexpected, "Unexpected", message)
    }

    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl From<anyhow::Error> for DomainError {
    fn from(err: anyhow::Error) -> Self {
        DomainError::unexpected(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_kind_and_code() {
        let err = DomainError::validation("Workflow.Name", "name too short");
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.code, "Workflow.Name");
        assert!(err.to_string().contains("name too short"));
    }

    #[test]
    fn chaining_with_result_combinators() {
        fn parse(n: i32) -> Result<i32> {
            if n < 0 {
                Err(DomainError::validation("Test.Negative", "negative"))
            } else {
                Ok(n)
            }
        }

        let doubled = parse(2).map(|n| n * 2).and_then(parse);
        assert_eq!(doubled.unwrap(), 4);

        let failed = parse(-1).map(|n| n * 2);
        assert_eq!(failed.unwrap_err().kind, ErrorKind::Validation);
    }
}
