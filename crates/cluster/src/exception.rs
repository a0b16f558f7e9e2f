//! Errors raised by remote code and how they are reported locally.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An error raised by a remote method, reduced to its kind and message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Error kind, e.g. `ValueError`.
    pub kind: String,
    /// Human readable message.
    pub message: String,
}

impl RemoteError {
    /// Creates a remote error.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// A `ValueError`.
    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    /// A `TypeError`.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    /// An `AttributeError` for a missing member.
    pub fn attribute_error(name: &str) -> Self {
        Self::new("AttributeError", format!("no attribute '{}'", name))
    }

    /// A `NameError` for a missing global or function.
    pub fn name_error(name: &str) -> Self {
        Self::new("NameError", format!("name '{}' is not defined", name))
    }

    /// Signals exhaustion of a remote iterator. Never reported.
    pub fn stop_iteration() -> Self {
        Self::new("StopIteration", "")
    }

    /// Returns true for an `AttributeError`.
    pub fn is_attribute_error(&self) -> bool {
        self.kind == "AttributeError"
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for RemoteError {}

/// Wire record for a failed call: the original error plus traceback text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteException {
    /// The reconstructible original error.
    pub error: RemoteError,
    /// Formatted traceback lines from the serving side.
    pub traceback: Vec<String>,
}

impl RemoteException {
    /// Builds the exception record for `error` raised by `method` on
    /// `object_id`.
    pub fn capture(error: RemoteError, object_id: u64, method: &str) -> Self {
        let traceback = vec![
            "Traceback (most recent call last):".to_string(),
            format!("  remote call '{}' on object {}", method, object_id),
            error.to_string(),
        ];
        Self { error, traceback }
    }

    /// Traceback as one block of text.
    pub fn text(&self) -> String {
        self.traceback.join("\n")
    }
}

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "remote exception: {}", self.error)
    }
}

impl std::error::Error for RemoteException {}

/// What a waiting caller receives when the remote call raised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMode {
    /// Report the traceback, then return the original error.
    #[default]
    Original,
    /// Return the original error without reporting.
    Quiet,
    /// Return the uniform wrapper without reporting.
    Wrapped,
}

/// Receives remote exceptions that are surfaced in [`ErrorMode::Original`].
pub trait ExceptionReporter: Send + Sync {
    /// Report `exc` raised on `peer`.
    fn report(&self, peer: &str, exc: &RemoteException);
}

/// Default reporter: prints the traceback to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrReporter;

impl StderrReporter {
    /// Formats the report printed for `exc`, or `None` when nothing should
    /// be printed.
    pub fn format(peer: &str, exc: &RemoteException) -> Option<String> {
        if exc.error.kind == "StopIteration" || exc.traceback.is_empty() {
            return None;
        }
        Some(format!("*** Remote exception from {}:\n{}", peer, exc.text()))
    }
}

impl ExceptionReporter for StderrReporter {
    fn report(&self, peer: &str, exc: &RemoteException) {
        if let Some(text) = Self::format(peer, exc) {
            eprintln!("{}", text);
        }
    }
}
