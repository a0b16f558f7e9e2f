//! Request and response records carried in REQUEST and RESPONSE frames.

use serde::{Deserialize, Serialize};

use crate::exception::RemoteException;
use crate::value::{Kwargs, Value};

/// Logical thread a request runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreadTarget {
    /// No thread: the request runs on the server's reading task.
    Inline,
    /// A throwaway worker, discarded after the request.
    Single,
    /// A persistent, ordered logical thread.
    Id(u64),
}

impl std::fmt::Display for ThreadTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadTarget::Inline => f.write_str("inline"),
            ThreadTarget::Single => f.write_str("single"),
            ThreadTarget::Id(id) => write!(f, "{}", id),
        }
    }
}

/// An outbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Request id; `None` for requests that expect no response.
    pub id: Option<u64>,
    /// Object ids whose proxies were dropped since the last request.
    pub garbage: Vec<u64>,
    pub thread: ThreadTarget,
    /// Target object id; 0 is the root object.
    pub target: Option<u64>,
    pub method: Option<String>,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

impl RequestRecord {
    /// A call of `method` on `target`.
    pub fn call(
        id: u64,
        garbage: Vec<u64>,
        thread: ThreadTarget,
        target: u64,
        method: impl Into<String>,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Self {
        Self {
            id: Some(id),
            garbage,
            thread,
            target: Some(target),
            method: Some(method.into()),
            args,
            kwargs,
        }
    }

    /// Asks the server to retire logical thread `thread` once its queue has
    /// drained.
    pub fn terminate(thread: u64) -> Self {
        Self {
            id: None,
            garbage: Vec::new(),
            thread: ThreadTarget::Id(thread),
            target: None,
            method: None,
            args: Vec::new(),
            kwargs: Kwargs::new(),
        }
    }

    /// Returns true for a thread termination request.
    pub fn is_termination(&self) -> bool {
        self.id.is_none() && self.target.is_none() && self.method.is_none()
    }
}

/// Result of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Value(Value),
    Exception(RemoteException),
}

/// The answer to a [`RequestRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub id: u64,
    pub outcome: Outcome,
}
