//! Registrar configuration

use crate::credentials::DEFAULT_KEY_MARKER;
use crate::lock::DEFAULT_LOCK_TIMEOUT;
use crate::site_dir::DEFAULT_SITE_MARKER;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Deployment variant: how appliances build their tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// `ssh -R` reverse tunnels authorised through a credential file
    SshKey,
    /// Tunnel agents authorised through the agent registry
    Agent,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::SshKey => "ssh-key",
            Variant::Agent => "agent",
        }
    }

    /// Request field carrying the variant specific credential
    pub fn credential_field(&self) -> &'static str {
        match self {
            Variant::SshKey => "public_key",
            Variant::Agent => "scheme",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the variant specific access artifact lives
#[derive(Debug, Clone)]
pub enum AccessConfig {
    SshKey {
        credentials_path: PathBuf,
        key_marker: String,
    },
    Agent {
        registry_path: PathBuf,
    },
}

impl AccessConfig {
    pub fn variant(&self) -> Variant {
        match self {
            AccessConfig::SshKey { .. } => Variant::SshKey,
            AccessConfig::Agent { .. } => Variant::Agent,
        }
    }
}

/// Everything the registrar needs besides the token table
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    /// Directory of rendered site files
    pub sites_dir: PathBuf,
    /// First component of every site file name
    pub site_marker: String,
    pub template_path: PathBuf,
    /// Lock file serialising registrations
    pub lock_path: PathBuf,
    pub lock_timeout: Duration,
    pub access: AccessConfig,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            sites_dir: PathBuf::from("/srv/subrelay/sites"),
            site_marker: DEFAULT_SITE_MARKER.to_string(),
            template_path: PathBuf::from("/srv/subrelay/site.tmpl"),
            lock_path: PathBuf::from("/srv/subrelay/registry.lock"),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            access: AccessConfig::SshKey {
                credentials_path: PathBuf::from("/srv/subrelay/authorized_keys"),
                key_marker: DEFAULT_KEY_MARKER.to_string(),
            },
        }
    }
}
