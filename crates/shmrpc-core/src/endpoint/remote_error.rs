//! Errors that cross the process boundary.
//!
//! A failing handler is reported to the client as `"Name: message"` text in
//! a `-` response. Known names map back to a [`RemoteErrorKind`]; anything
//! else becomes [`RemoteErrorKind::Generic`] with the text preserved.

use crate::error::ShmRpcError;
use std::fmt;

/// Category of a handler failure, recognised by its wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    InvalidArgument,
    NotFound,
    Type,
    PermissionDenied,
    Timeout,
    NotImplemented,
    MethodNotFound,
    Panic,
    Generic,
}

impl RemoteErrorKind {
    pub fn wire_name(self) -> &'static str {
        match self {
            RemoteErrorKind::InvalidArgument => "ValueError",
            RemoteErrorKind::NotFound => "KeyError",
            RemoteErrorKind::Type => "TypeError",
            RemoteErrorKind::PermissionDenied => "PermissionError",
            RemoteErrorKind::Timeout => "TimeoutError",
            RemoteErrorKind::NotImplemented => "NotImplementedError",
            RemoteErrorKind::MethodNotFound => "MethodNotFound",
            RemoteErrorKind::Panic => "Panic",
            RemoteErrorKind::Generic => "Exception",
        }
    }

    pub fn from_wire_name(name: &str) -> Self {
        match name {
            "ValueError" => RemoteErrorKind::InvalidArgument,
            "KeyError" | "IndexError" | "LookupError" => RemoteErrorKind::NotFound,
            "TypeError" => RemoteErrorKind::Type,
            "PermissionError" => RemoteErrorKind::PermissionDenied,
            "TimeoutError" => RemoteErrorKind::Timeout,
            "NotImplementedError" => RemoteErrorKind::NotImplemented,
            "MethodNotFound" | "AttributeError" => RemoteErrorKind::MethodNotFound,
            "Panic" => RemoteErrorKind::Panic,
            _ => RemoteErrorKind::Generic,
        }
    }
}

/// A handler error as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{raw}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    /// Error name as sent by the server (empty if there was none).
    pub name: String,
    pub message: String,
    /// The full text as received.
    pub raw: String,
}

impl RemoteError {
    /// Rebuild an error from `"Name: message"` text.
    pub fn parse(text: &str) -> Self {
        let split = text
            .split_once(": ")
            .filter(|(name, _)| is_error_name(name));

        match split {
            Some((name, message)) => Self {
                kind: RemoteErrorKind::from_wire_name(name),
                name: name.to_string(),
                message: message.to_string(),
                raw: text.to_string(),
            },
            None => Self {
                kind: RemoteErrorKind::Generic,
                name: String::new(),
                message: text.to_string(),
                raw: text.to_string(),
            },
        }
    }
}

fn is_error_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Error returned by a method handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    name: String,
    message: String,
}

impl HandlerError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            name: kind.wire_name().to_string(),
            message: message.into(),
        }
    }

    /// An error with an application-defined name. Clients see it as `Generic`
    /// unless the name is one of the known ones.
    pub fn custom(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        let name = if is_error_name(&name) {
            name
        } else {
            RemoteErrorKind::Generic.wire_name().to_string()
        };
        Self {
            name,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotFound, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Type, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::PermissionDenied, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Timeout, message)
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotImplemented, message)
    }

    pub fn kind(&self) -> RemoteErrorKind {
        RemoteErrorKind::from_wire_name(&self.name)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Text carried in a `-` response.
    pub fn to_wire(&self) -> String {
        format!("{}: {}", self.name, self.message)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Lets handlers use `?` on library calls (for example a nested client call).
impl From<ShmRpcError> for HandlerError {
    fn from(err: ShmRpcError) -> Self {
        match err {
            ShmRpcError::Remote(remote) => Self {
                name: if remote.name.is_empty() {
                    RemoteErrorKind::Generic.wire_name().to_string()
                } else {
                    remote.name
                },
                message: remote.message,
            },
            ShmRpcError::Codec { .. } => Self::type_error(err.to_string()),
            ShmRpcError::LockTimeout { .. } => Self::timeout(err.to_string()),
            other => Self::new(RemoteErrorKind::Generic, other.to_string()),
        }
    }
}
