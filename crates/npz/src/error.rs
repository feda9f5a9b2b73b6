use std::fmt::{self, Display};

use strum::IntoStaticStr;

/// Result type alias for operations that can produce a runtime error.
pub type RunResult<T> = Result<T, RunError>;

/// Broad classification of a runtime failure.
///
/// The string representation matches the variant name and is used as the
/// error prefix in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum RunErrorKind {
    /// Wrong operand or receiver type for an operation.
    Type,
    /// Function called with the wrong number of arguments.
    Arity,
    /// Call frame limit exceeded.
    StackOverflow,
    /// Unknown global, property, library, or namespace entry.
    UndefinedName,
    /// Index outside the bounds of a list.
    Index,
    /// Failure reported from a native library callback.
    Native,
}

/// A runtime error raised by the VM or a native callback.
///
/// Runtime errors are plain values; nothing is printed when one is created.
/// Probing lookups (e.g. checking an instance field before falling back to a
/// class method) simply discard the error, and only errors that reach the
/// interpreter's caller are rendered, together with a stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunError {
    kind: RunErrorKind,
    message: String,
}

impl RunError {
    /// Creates a new runtime error of the given kind.
    pub fn new(kind: RunErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a type error.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(RunErrorKind::Type, message)
    }

    /// Shorthand for an undefined-name error.
    pub fn undefined(message: impl Into<String>) -> Self {
        Self::new(RunErrorKind::UndefinedName, message)
    }

    /// Shorthand for an error from a native callback.
    pub fn native(message: impl Into<String>) -> Self {
        Self::new(RunErrorKind::Native, message)
    }

    /// Returns the error classification.
    #[must_use]
    pub fn kind(&self) -> RunErrorKind {
        self.kind
    }

    /// Returns the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Builds a [`RunError`] with a formatted message.
///
/// The universal error-reporting entry for the VM and native libraries:
/// `runtime_error!(Type, "Operands must be numbers.")` or with format args.
#[macro_export]
macro_rules! runtime_error {
    ($kind:ident, $($arg:tt)*) => {
        $crate::error::RunError::new($crate::error::RunErrorKind::$kind, format!($($arg)*))
    };
}

/// One frame of a runtime stack trace, innermost last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Source line of the instruction that was executing.
    pub line: u32,
    /// Function name, or `None` for top-level script code.
    pub function: Option<String>,
}

impl Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(name) => write!(f, "[line {}] in {name}()", self.line),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

/// A runtime error together with the call stack at the point of failure.
///
/// Produced when a [`RunError`] escapes the interpreter loop; the VM resets
/// its stack and frames before surfacing this to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    /// The underlying error.
    pub error: RunError,
    /// Stack frames, outermost first.
    pub trace: Vec<StackFrame>,
}

impl Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.error)?;
        for frame in &self.trace {
            writeln!(f, "{frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Exception {}

/// A single compile-time diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Source line the diagnostic refers to.
    pub line: u32,
    /// Token text the diagnostic points at, if any.
    pub at: Option<String>,
    /// Human-readable message.
    pub message: String,
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        match self.at.as_deref() {
            Some("") => write!(f, " at end")?,
            Some(at) => write!(f, " at '{at}'")?,
            None => {}
        }
        write!(f, ": {}", self.message)
    }
}

/// Compilation failure: the collected parser/compiler diagnostics.
///
/// The compiler recovers from parse errors via synchronization and keeps
/// going, so a single failed compile can carry several diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    /// All diagnostics reported for the unit, in source order.
    pub diagnostics: Vec<Diagnostic>,
}

impl Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.diagnostics.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{d}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

/// Errors raised while loading a serialized bytecode stream.
///
/// Any deviation from the canonical format is fatal; the loader never
/// attempts recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// The stream ended before a record was complete.
    UnexpectedEof,
    /// A record tag did not match what the grammar requires at this point.
    UnexpectedTag { expected: &'static str, found: u8 },
    /// A length or count field was negative or implausibly large.
    BadCount { what: &'static str, count: i64 },
    /// A string payload held bytes that do not form UTF-8 text.
    BadString,
}

impl Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "malformed bytecode: ran out of bytes"),
            Self::UnexpectedTag { expected, found } => {
                write!(f, "malformed bytecode: expected {expected}, found tag {found:#04x}")
            }
            Self::BadCount { what, count } => {
                write!(f, "malformed bytecode: bad {what} count {count}")
            }
            Self::BadString => write!(f, "malformed bytecode: string is not valid UTF-8"),
        }
    }
}

impl std::error::Error for LoadError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_formatting() {
        let d = Diagnostic {
            line: 3,
            at: Some("}".to_owned()),
            message: "Expected expression.".to_owned(),
        };
        assert_eq!(d.to_string(), "[line 3] Error at '}': Expected expression.");

        let at_end = Diagnostic {
            line: 7,
            at: Some(String::new()),
            message: "Expected ';' after statement.".to_owned(),
        };
        assert_eq!(at_end.to_string(), "[line 7] Error at end: Expected ';' after statement.");
    }

    #[test]
    fn exception_trace_order() {
        let exc = Exception {
            error: runtime_error!(Type, "Operands must be numbers."),
            trace: vec![
                StackFrame { line: 1, function: None },
                StackFrame {
                    line: 4,
                    function: Some("inner".to_owned()),
                },
            ],
        };
        let text = exc.to_string();
        assert!(text.starts_with("Operands must be numbers.\n"));
        assert!(text.contains("[line 1] in script"));
        assert!(text.contains("[line 4] in inner()"));
    }
}
