//! Error types for the stream core.
//!
//! Every fault that reaches a downstream [`Subscriber`](crate::stream::Subscriber)
//! is an [`Error`]. The [`ErrorKind`] says what went wrong; the
//! [`ErrorCategory`] groups kinds by who is responsible, which is what the
//! drivers use to decide whether a fault ends the stream or is redirected.

use std::any::Any;
use std::sync::Arc;

/// The kind of stream error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// `request(0)`: demand must be positive.
    InvalidDemand,
    /// A subscriber received a second `on_subscribe`.
    DuplicateSubscription,
    /// The source cursor failed while answering `has_more` or `next_source`.
    CursorFault,
    /// The source cursor reported more sources but produced none.
    MissingSource,
    /// The companion factory failed.
    CompanionFactory,
    /// The companion factory returned no companion stream.
    MissingCompanion,
    /// A producer failed.
    Upstream,
    /// The companion stream failed.
    Companion,
    /// A collaborator panicked; the panic was captured.
    Panicked,
    /// An error raised by user code (producers, factories, tests).
    User,
}

impl ErrorKind {
    /// Returns the category this kind belongs to.
    #[must_use]
    pub const fn category(self) -> ErrorCategory {
        match self {
            Self::InvalidDemand | Self::DuplicateSubscription => ErrorCategory::ProtocolViolation,
            Self::CursorFault
            | Self::MissingSource
            | Self::CompanionFactory
            | Self::MissingCompanion
            | Self::Panicked => ErrorCategory::CollaboratorFault,
            Self::Upstream | Self::User => ErrorCategory::UpstreamFailure,
            Self::Companion => ErrorCategory::CompanionFailure,
        }
    }

    /// Short lowercase label used in `Display` output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidDemand => "invalid demand",
            Self::DuplicateSubscription => "duplicate subscription",
            Self::CursorFault => "source cursor fault",
            Self::MissingSource => "missing source",
            Self::CompanionFactory => "companion factory fault",
            Self::MissingCompanion => "missing companion",
            Self::Upstream => "upstream failure",
            Self::Companion => "companion failure",
            Self::Panicked => "collaborator panicked",
            Self::User => "error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse grouping of error kinds by origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The Reactive-Streams handshake was violated. Fatal.
    ProtocolViolation,
    /// A cursor or factory supplied by the caller failed. Fatal, and the
    /// collaborator is not consulted again.
    CollaboratorFault,
    /// A producer failed. Fatal under concat, recoverable under retry.
    UpstreamFailure,
    /// The retry companion failed. Fatal.
    CompanionFailure,
}

/// A stream error.
///
/// Errors are cheap to clone so the same fault can be handed to a companion
/// stream and logged without copying its message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: Arc<str>,
}

impl Error {
    /// Creates a new error with the given kind and message.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<Arc<str>>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a user error, the kind producers raise.
    #[must_use]
    pub fn user(message: impl Into<Arc<str>>) -> Self {
        Self::new(ErrorKind::User, message)
    }

    /// Creates an invalid-demand protocol violation for `request(n)`.
    #[must_use]
    pub fn invalid_demand(n: u64) -> Self {
        Self::new(
            ErrorKind::InvalidDemand,
            format!("request({n}): demand must be positive"),
        )
    }

    /// Creates a duplicate-subscription protocol violation.
    #[must_use]
    pub fn duplicate_subscription() -> Self {
        Self::new(
            ErrorKind::DuplicateSubscription,
            "on_subscribe called on an already subscribed subscriber",
        )
    }

    /// Converts a captured panic payload into an error.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::new(ErrorKind::Panicked, message)
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns the message without the kind prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns `true` if this is a protocol violation.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(self.category(), ErrorCategory::ProtocolViolation)
    }

    /// Re-tags the error with a new kind, keeping the message.
    #[must_use]
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }
}

/// A specialized `Result` for stream operations.
pub type Result<T> = std::result::Result<T, Error>;
