//! Error types for the registration engine

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors produced while resolving, reconciling or persisting a registration
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid token")]
    InvalidToken,

    #[error("invalid subdomain provided: {0:?}")]
    InvalidSubdomain(String),

    #[error("invalid scheme provided: {0:?}")]
    InvalidScheme(String),

    #[error("invalid public key provided")]
    InvalidPublicKey,

    #[error("subdomain already registered: {subdomain}")]
    SubdomainConflict {
        subdomain: String,
        /// Port currently holding the subdomain
        port: u16,
    },

    #[error("registration carries a {got} credential but this relay expects a {expected}")]
    CredentialMismatch {
        expected: &'static str,
        got: &'static str,
    },

    #[error("timed out after {}s waiting for lock {}", .waited.as_secs(), .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("agent registry {} is not a valid document: {source}", .path.display())]
    AgentDocument {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

impl RegistryError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// A failed registration
///
/// Site files purged by the scan (or a stale binding already removed) stay
/// deleted, so `removed > 0` means the reverse proxy still has to reload.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RegisterFailure {
    #[source]
    pub error: RegistryError,
    pub removed: usize,
}

impl From<RegistryError> for RegisterFailure {
    fn from(error: RegistryError) -> Self {
        Self { error, removed: 0 }
    }
}
