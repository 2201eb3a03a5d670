use std::{fmt, time::Duration};

use kube_core::ErrorResponse;

use crate::subscriber::{ResourceKind, Scope};

/// The cluster operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    List,
    Watch,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::List => "list",
            Self::Watch => "watch",
        })
    }
}

/// A failed list or watch, with the operation, resource kind and scope it targeted.
#[derive(Debug, thiserror::Error)]
#[error("failed to {op} {kind} in {scope}")]
pub struct Error {
    pub op: Operation,
    pub kind: ResourceKind,
    pub scope: Scope,
    #[source]
    pub cause: Cause,
}

#[derive(Debug, thiserror::Error)]
pub enum Cause {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    /// The watch stream ended before its timeout without delivering anything.
    #[error("watch closed early")]
    Closed,
    #[error(transparent)]
    Kube(#[from] kube_client::Error),
    /// An error object delivered inside an open watch stream.
    #[error("server reported {}: {}", .0.code, .0.message)]
    Rejected(ErrorResponse),
}

/// How the caller should react to an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The cursor is too old; the scope must be re-listed.
    StateGap,
    /// The namespace was deleted underneath us; drop the scope.
    RaceNotFound,
    /// Anything else; retry with backoff.
    Transient,
}

impl Error {
    pub fn new(op: Operation, kind: ResourceKind, scope: Scope, cause: impl Into<Cause>) -> Self {
        Self {
            op,
            kind,
            scope,
            cause: cause.into(),
        }
    }

    fn status_code(&self) -> Option<u16> {
        match &self.cause {
            Cause::Kube(kube_client::Error::Api(resp)) | Cause::Rejected(resp) => Some(resp.code),
            _ => None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self.status_code() {
            Some(410) => ErrorClass::StateGap,
            // Cluster-scoped lookups never race with namespace deletion.
            Some(404) if self.scope.namespace().is_some() => ErrorClass::RaceNotFound,
            _ => ErrorClass::Transient,
        }
    }
}

impl From<ErrorResponse> for Cause {
    fn from(resp: ErrorResponse) -> Self {
        Self::Rejected(resp)
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> ErrorResponse {
    ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} ({code})"),
        reason: reason.to_string(),
        code,
    }
}
