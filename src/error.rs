use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Unified error type for the backend.
///
/// `Codegen` covers unsupported-input errors: an IR shape, type, or feature
/// with no lowering rule. `Internal` covers consistency failures detected by
/// the instruction encoder's verifier; these indicate a bug in the code
/// generator, not in the input program, and carry the tail of the emitted
/// instruction stream when one is available.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Codegen {
        message: String,
        backtrace: Option<Backtrace>,
    },
    Internal {
        message: String,
        trace: Vec<String>,
        backtrace: Option<Backtrace>,
    },
}

/// Convenience result alias used across the backend.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Construct a new code generation error.
    pub fn codegen(message: impl Into<String>) -> Self {
        Self::Codegen {
            message: message.into(),
            backtrace: capture_backtrace(),
        }
    }

    /// Construct a new internal consistency error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            trace: Vec::new(),
            backtrace: capture_backtrace(),
        }
    }

    /// Construct an internal error carrying the instruction trace emitted so
    /// far, so the failing emission sequence stays diagnosable.
    pub fn internal_with_trace(message: impl Into<String>, trace: Vec<String>) -> Self {
        Self::Internal {
            message: message.into(),
            trace,
            backtrace: capture_backtrace(),
        }
    }

    /// Return the captured backtrace, if any.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self {
            Error::Codegen { backtrace, .. } | Error::Internal { backtrace, .. } => {
                backtrace.as_ref()
            }
            Error::Io(_) => None,
        }
    }
}

fn capture_backtrace() -> Option<Backtrace> {
    if cfg!(debug_assertions) {
        Some(Backtrace::force_capture())
    } else {
        None
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {err}"),
            Error::Codegen { message, .. } => write!(f, "codegen error: {message}"),
            Error::Internal { message, trace, .. } => {
                write!(f, "internal error: {message}")?;
                if !trace.is_empty() {
                    write!(f, "\ninstruction stream:")?;
                    for line in trace {
                        write!(f, "\n  {line}")?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Codegen { .. } | Error::Internal { .. } => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(error)
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn display_includes_instruction_trace() {
        let err = Error::internal_with_trace(
            "operand stack mismatch",
            vec!["i32.const 1".into(), "struct.get 3 0".into()],
        );
        let text = err.to_string();
        assert!(text.contains("operand stack mismatch"), "{text}");
        assert!(text.contains("struct.get 3 0"), "{text}");
    }

    #[test]
    fn codegen_errors_do_not_chain_a_source() {
        let err = Error::codegen("no lowering rule for construct");
        assert!(std::error::Error::source(&err).is_none());
    }
}
