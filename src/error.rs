use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON parse error while {context}: {source}")]
    Json {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("configuration error: {message}")]
    Config { message: String },
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("cannot {operation} while search is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    #[error("no decoded utterance with id '{id}'")]
    UnknownUtterance { id: String },
    #[error("utterance '{id}' produced no hypothesis")]
    NoHypothesis { id: String },
    #[error("corrupt lattice: {message}")]
    CorruptLattice { message: String },
    #[error("search invariant violated: {message}")]
    InvariantViolation { message: String },
    #[error("malformed lattice text at line {line}: {message}")]
    LatticeFormat { line: usize, message: String },
}

impl DecoderError {
    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    pub(crate) fn json(context: &'static str, source: serde_json::Error) -> Self {
        Self::Json { context, source }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_state(operation: &'static str, state: &'static str) -> Self {
        Self::InvalidState { operation, state }
    }

    pub(crate) fn corrupt_lattice(message: impl Into<String>) -> Self {
        Self::CorruptLattice {
            message: message.into(),
        }
    }

    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    pub(crate) fn lattice_format(line: usize, message: impl Into<String>) -> Self {
        Self::LatticeFormat {
            line,
            message: message.into(),
        }
    }

    /// Configuration and invariant errors mean no hypothesis can be trusted;
    /// everything else is tied to a single call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::InvariantViolation { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = DecoderError::io(
            "read decoder config",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        let msg = err.to_string();
        assert!(msg.contains("read decoder config"));
        assert!(msg.contains("missing"));
    }

    #[test]
    fn invalid_state_names_operation() {
        let err = DecoderError::invalid_state("step", "idle");
        assert_eq!(err.to_string(), "cannot step while search is idle");
        assert!(!err.is_fatal());
    }

    #[test]
    fn invariant_errors_are_fatal() {
        assert!(DecoderError::invariant("cycle").is_fatal());
        assert!(DecoderError::config("empty vocabulary").is_fatal());
        assert!(!DecoderError::invalid_input("short frame").is_fatal());
        assert!(!DecoderError::corrupt_lattice("nan alpha").is_fatal());
    }
}
