use std::{
    borrow::Cow,
    cell::RefCell,
    io::{self, Write as _},
};

use crate::error::RunError;

/// Trait for handling interpreter output from the `print`/`println` natives.
///
/// Implement this trait to capture or redirect output from embedded npz code.
/// The default implementation `StdPrint` writes to stdout.
pub trait PrintWriter {
    /// Called once for each stringified argument passed to `print`.
    ///
    /// This method writes only the given argument's text; separators (spaces
    /// between arguments) and the trailing newline are emitted via
    /// [`PrintWriter::stdout_push`].
    fn stdout_write(&mut self, output: Cow<'_, str>) -> Result<(), RunError>;

    /// Adds a single character to stdout.
    ///
    /// Generally called to add the spaces and newlines within print output.
    fn stdout_push(&mut self, end: char) -> Result<(), RunError>;
}

thread_local! {
    /// Thread-local stdout buffer for `StdPrint`.
    ///
    /// Buffering keeps interpreter output ordered after stderr diagnostics
    /// when both streams are redirected to the same pipe.
    static STDOUT_BUFFER: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Default `PrintWriter` that writes to stdout.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn stdout_write(&mut self, output: Cow<'_, str>) -> Result<(), RunError> {
        STDOUT_BUFFER.with(|buffer| buffer.borrow_mut().push_str(&output));
        Ok(())
    }

    fn stdout_push(&mut self, end: char) -> Result<(), RunError> {
        STDOUT_BUFFER.with(|buffer| {
            let mut buffer = buffer.borrow_mut();
            buffer.push(end);
            // Flush on line boundaries so interactive runs see output promptly.
            if end == '\n' {
                let _ = io::stdout().write_all(buffer.as_bytes());
                let _ = io::stdout().flush();
                buffer.clear();
            }
        });
        Ok(())
    }
}

impl Drop for StdPrint {
    fn drop(&mut self) {
        STDOUT_BUFFER.with(|buffer| {
            let mut buffer = buffer.borrow_mut();
            if buffer.is_empty() {
                return;
            }
            let _ = io::stdout().write_all(buffer.as_bytes());
            let _ = io::stdout().flush();
            buffer.clear();
        });
    }
}

/// A `PrintWriter` that collects all output into a string.
///
/// Useful for testing or capturing interpreter output programmatically.
#[derive(Debug, Default)]
pub struct CollectStringPrint(String);

impl CollectStringPrint {
    /// Creates a new empty `CollectStringPrint`.
    #[must_use]
    pub fn new() -> Self {
        Self(String::new())
    }

    /// Returns the collected output as a string slice.
    #[must_use]
    pub fn output(&self) -> &str {
        self.0.as_str()
    }

    /// Consumes the writer and returns the collected output.
    #[must_use]
    pub fn into_output(self) -> String {
        self.0
    }
}

impl PrintWriter for CollectStringPrint {
    fn stdout_write(&mut self, output: Cow<'_, str>) -> Result<(), RunError> {
        self.0.push_str(&output);
        Ok(())
    }

    fn stdout_push(&mut self, end: char) -> Result<(), RunError> {
        self.0.push(end);
        Ok(())
    }
}

/// `PrintWriter` that ignores all output.
///
/// Useful for suppressing print output during testing or benchmarking.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn stdout_write(&mut self, _output: Cow<'_, str>) -> Result<(), RunError> {
        Ok(())
    }

    fn stdout_push(&mut self, _end: char) -> Result<(), RunError> {
        Ok(())
    }
}
