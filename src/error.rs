//! Classified errors for the controller core.
//!
//! Startup and binary code returns `anyhow::Result`. The types here exist because the
//! lifecycle manager and the synchronizer branch on the *kind* of failure:
//! a connection-level control-plane error tears the link down, a single request error
//! is retried or deferred, and a configuration error is fatal before any loop starts.

use std::time::Duration;

use thiserror::Error;

/// obs-websocket request status code for a missing scene, input, or scene item.
pub const STATUS_RESOURCE_NOT_FOUND: u16 = 600;

/// Failure talking to the production application's control plane.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ControlPlaneError {
    /// The link could not be opened, or dropped while in use.
    #[error("control plane connection failed: {0}")]
    Connection(String),

    /// A call did not complete within its deadline. Treated as connection-level.
    #[error("control plane request {request} timed out after {after:?}")]
    Timeout { request: String, after: Duration },

    /// Handshake rejected the configured credential.
    #[error("control plane authentication failed: {0}")]
    Auth(String),

    /// The peer sent something we could not interpret.
    #[error("control plane protocol error: {0}")]
    Protocol(String),

    /// A scene or source named in the request no longer exists.
    #[error("{request}: not found ({detail})")]
    NotFound { request: String, detail: String },

    /// A single request was rejected; the link itself is fine.
    #[error("{request} failed with status {code}: {comment}")]
    Request {
        request: String,
        code: u16,
        comment: String,
    },
}

impl ControlPlaneError {
    /// True when the failure means the link is unusable and must be reopened.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            ControlPlaneError::Connection(_)
                | ControlPlaneError::Timeout { .. }
                | ControlPlaneError::Auth(_)
                | ControlPlaneError::Protocol(_)
        )
    }

    /// True when the failure suggests the cached scene topology has drifted.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ControlPlaneError::NotFound { .. })
    }

    pub(crate) fn from_status(request: &str, code: u16, comment: Option<String>) -> Self {
        let comment = comment.unwrap_or_default();
        if code == STATUS_RESOURCE_NOT_FOUND {
            ControlPlaneError::NotFound {
                request: request.to_string(),
                detail: comment,
            }
        } else {
            ControlPlaneError::Request {
                request: request.to_string(),
                code,
                comment,
            }
        }
    }
}

/// Missing or invalid settings. Fatal at startup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("missing required setting '{0}'")]
    Missing(&'static str),

    #[error("invalid setting '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("source '{0}' does not exist in any scene")]
    UnknownSource(String),
}
