use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    // construction
    #[error("Shape error: {0}")]
    Shape(String),
    #[error("Arity error: operator '{operator}' expects {expected} tensors, got {got}")]
    Arity { operator: String, expected: usize, got: usize },
    #[error("Duplicate name: '{0}' is already declared in this graph")]
    DuplicateName(String),
    #[error("Unknown name: {0}")]
    UnknownName(String),
    #[error("Cycle detected: {0}")]
    Cycle(String),

    // runtime
    #[error("Batch size error: expected {expected} samples, got {got}")]
    BatchSize { expected: usize, got: usize },
    #[error("Placement error: {0}")]
    Placement(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Compute error in '{operator}': {message}")]
    Compute { operator: String, message: String },
    #[error("Aborted: {0}")]
    Aborted(String),

    //
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Lock poisoned")]
    Lock,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transport failures are the only condition the engine retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Errors raised while declaring a graph. These are configuration bugs and
    /// abort graph construction.
    pub fn is_construction(&self) -> bool {
        matches!(
            self,
            Self::Shape(_) | Self::Arity { .. } | Self::DuplicateName(_) | Self::UnknownName(_) | Self::Cycle(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(Error::Transport("reset".into()).is_transient());
        assert!(!Error::Placement("rank 9".into()).is_transient());
        assert!(Error::Arity {
            operator: "add".into(),
            expected: 2,
            got: 1
        }
        .is_construction());
        assert!(!Error::BatchSize { expected: 4, got: 3 }.is_construction());
    }

    #[test]
    fn display() {
        let e = Error::Arity {
            operator: "sum".into(),
            expected: 2,
            got: 3,
        };
        assert_eq!(e.to_string(), "Arity error: operator 'sum' expects 2 tensors, got 3");
    }
}
