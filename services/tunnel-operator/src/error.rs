//! Operator error type
//!
//! Every collaborator returns [`Error`]; the reconciler surfaces it to the
//! controller runtime, which requeues through `error_policy`.

use thiserror::Error;

/// Errors that can occur while converging a Tunnel
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API call failed
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Cloudflare API call failed
    #[error("Cloudflare API error ({status:?}): {message}")]
    Cloudflare {
        /// HTTP status, when the request reached the API
        status: Option<u16>,
        message: String,
    },

    /// HTTP transport failed before a response was received
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON encoding or decoding failed
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML encoding or decoding failed
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The declaration conflicts with provider state and cannot be remediated automatically
    #[error("Tunnel conflict: {0}")]
    Conflict(String),

    /// A persisted artifact the operator relies on is missing
    #[error("Missing artifact: {0}")]
    MissingArtifact(String),

    /// Invalid or incomplete operator configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn cloudflare(status: Option<u16>, message: impl Into<String>) -> Self {
        Error::Cloudflare {
            status,
            message: message.into(),
        }
    }

    /// True when the remote side reported the object as absent.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Cloudflare { status, .. } => *status == Some(404),
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// True when the store rejected a write because the object already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(resp)) if resp.code == 409 && resp.reason == "AlreadyExists")
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
