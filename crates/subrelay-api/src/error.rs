use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use subrelay_registry::RegistryError;
use thiserror::Error;
use tracing::{error, warn};

use crate::models::RegisterResponse;

/// Errors surfaced to HTTP clients
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("malformed request body: {0}")]
    MalformedBody(String),

    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("not all parameters provided: missing {0}")]
    MissingParameter(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MalformedBody(_)
            | ApiError::UnknownParameter(_)
            | ApiError::MissingParameter(_) => StatusCode::BAD_REQUEST,
            ApiError::Registry(e) => match e {
                RegistryError::InvalidToken => StatusCode::FORBIDDEN,
                RegistryError::InvalidSubdomain(_)
                | RegistryError::InvalidScheme(_)
                | RegistryError::InvalidPublicKey
                | RegistryError::CredentialMismatch { .. } => StatusCode::BAD_REQUEST,
                RegistryError::SubdomainConflict { .. } => StatusCode::CONFLICT,
                RegistryError::LockTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
                RegistryError::Io { .. } | RegistryError::AgentDocument { .. } => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the client; server-side details stay in the log
    fn public_message(&self) -> String {
        match self {
            ApiError::Registry(RegistryError::Io { .. })
            | ApiError::Registry(RegistryError::AgentDocument { .. })
            | ApiError::Internal(_) => "internal error, please retry".to_string(),
            ApiError::Registry(RegistryError::LockTimeout { .. }) => {
                "server busy, please retry".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Registration failed: {}", self);
        } else {
            warn!("Registration rejected: {}", self);
        }

        (status, Json(RegisterResponse::error(self.public_message()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::UnknownParameter("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(RegistryError::InvalidToken).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::from(RegistryError::SubdomainConflict {
                subdomain: "foo".into(),
                port: 100
            })
            .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(RegistryError::LockTimeout {
                path: PathBuf::from("registry.lock"),
                waited: Duration::from_secs(10)
            })
            .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_io_details_not_leaked() {
        let err = ApiError::from(RegistryError::Io {
            context: "failed to write /srv/secret/path".into(),
            source: io::Error::new(io::ErrorKind::Other, "disk full"),
        });
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.public_message().contains("/srv/secret"));
    }

    #[test]
    fn test_conflict_message() {
        let err = ApiError::from(RegistryError::SubdomainConflict {
            subdomain: "foo".into(),
            port: 100,
        });
        assert_eq!(err.public_message(), "subdomain already registered: foo");
    }
}
