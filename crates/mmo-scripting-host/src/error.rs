use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::value::ScriptValue;

/// Message reported when the watchdog aborts a script
pub const EXECUTION_LIMIT_MESSAGE: &str = "Execution limit exceeded.";

/// Category of a script failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Source could not be compiled
    CompileError,
    /// An exception escaped while the script was running
    RuntimeError,
    /// The watchdog aborted the script
    TimeoutError,
    /// A script or bootstrap file could not be read
    IOError,
    /// A builtin the host relies on is missing from the namespace
    IntegrationError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::CompileError => "CompileError",
            ErrorKind::RuntimeError => "RuntimeError",
            ErrorKind::TimeoutError => "TimeoutError",
            ErrorKind::IOError => "IOError",
            ErrorKind::IntegrationError => "IntegrationError",
        };
        f.write_str(name)
    }
}

/// Error produced by any path that runs script code
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScriptError {
    #[error("{message}")]
    Compile { message: String },

    #[error("{message}")]
    Runtime { message: String },

    #[error("{}", EXECUTION_LIMIT_MESSAGE)]
    Timeout,

    #[error("Error: {} {message}", path.display())]
    Io { path: PathBuf, message: String },

    #[error("{message}")]
    Integration { message: String },
}

impl ScriptError {
    pub fn compile(message: impl Into<String>) -> Self {
        ScriptError::Compile {
            message: message.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        ScriptError::Runtime {
            message: message.into(),
        }
    }

    pub fn integration(message: impl Into<String>) -> Self {
        ScriptError::Integration {
            message: message.into(),
        }
    }

    /// A resource that does not exist on disk
    pub fn missing_file(path: impl Into<PathBuf>) -> Self {
        ScriptError::Io {
            path: path.into(),
            message: "No such file.".to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ScriptError::Compile { .. } => ErrorKind::CompileError,
            ScriptError::Runtime { .. } => ErrorKind::RuntimeError,
            ScriptError::Timeout => ErrorKind::TimeoutError,
            ScriptError::Io { .. } => ErrorKind::IOError,
            ScriptError::Integration { .. } => ErrorKind::IntegrationError,
        }
    }
}

/// Result of a unit of script work, as seen by the host
///
/// Exactly one of the value or the error is meaningful. Hosts that only care
/// about the `(value, error text)` pair can use [`ExecutionOutcome::value`] and
/// [`ExecutionOutcome::error_text`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    result: Result<ScriptValue, ScriptError>,
}

impl ExecutionOutcome {
    pub fn ok(value: ScriptValue) -> Self {
        Self { result: Ok(value) }
    }

    pub fn err(error: ScriptError) -> Self {
        Self { result: Err(error) }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn is_err(&self) -> bool {
        self.result.is_err()
    }

    /// The produced value, or `Undefined` when the work failed
    pub fn value(&self) -> ScriptValue {
        match &self.result {
            Ok(value) => value.clone(),
            Err(_) => ScriptValue::Undefined,
        }
    }

    /// The error text, empty on success
    pub fn error_text(&self) -> String {
        match &self.result {
            Ok(_) => String::new(),
            Err(err) => err.to_string(),
        }
    }

    pub fn error(&self) -> Option<&ScriptError> {
        self.result.as_ref().err()
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        self.error().map(ScriptError::kind)
    }

    pub fn as_result(&self) -> Result<&ScriptValue, &ScriptError> {
        self.result.as_ref()
    }

    pub fn into_result(self) -> Result<ScriptValue, ScriptError> {
        self.result
    }
}

impl From<Result<ScriptValue, ScriptError>> for ExecutionOutcome {
    fn from(result: Result<ScriptValue, ScriptError>) -> Self {
        Self { result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_uses_sentinel_message() {
        let outcome = ExecutionOutcome::err(ScriptError::Timeout);
        assert_eq!(outcome.error_text(), "Execution limit exceeded.");
        assert_eq!(outcome.kind(), Some(ErrorKind::TimeoutError));
        assert_eq!(outcome.value(), ScriptValue::Undefined);
    }

    #[test]
    fn test_missing_file_message() {
        let err = ScriptError::missing_file("resources/js/lib.js");
        assert_eq!(err.to_string(), "Error: resources/js/lib.js No such file.");
        assert_eq!(err.kind(), ErrorKind::IOError);
    }

    #[test]
    fn test_success_has_empty_error_text() {
        let outcome = ExecutionOutcome::ok(ScriptValue::Number(2.0));
        assert!(outcome.is_ok());
        assert!(outcome.error_text().is_empty());
        assert_eq!(outcome.value(), ScriptValue::Number(2.0));
    }
}
