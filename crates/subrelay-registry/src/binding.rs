//! Validated request values and the resolved site binding

use crate::error::{RegistryError, RegistryResult};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Longest label DNS allows
pub const MAX_SUBDOMAIN_LEN: usize = 63;

/// Prefix every base64-encoded RSA public key starts with
pub const PUBLIC_KEY_PREFIX: &str = "AAAAB";

/// Encoded length of a 4096-bit RSA public key
pub const PUBLIC_KEY_LEN: usize = 716;

fn subdomain_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9-]*$").expect("static pattern"))
}

/// Subdomain label under the relay's base domain
///
/// Letters, digits and hyphens only; stored lower-case since DNS labels are
/// case-insensitive and two spellings must never map to two ports.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Subdomain(String);

impl Subdomain {
    pub fn parse(raw: &str) -> RegistryResult<Self> {
        if raw.is_empty() || raw.len() > MAX_SUBDOMAIN_LEN || !subdomain_pattern().is_match(raw) {
            return Err(RegistryError::InvalidSubdomain(raw.to_string()));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Subdomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Subdomain {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Scheme the reverse proxy uses to reach the tunnel endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(RegistryError::InvalidScheme(other.to_string())),
        }
    }
}

/// Base64 body of an `ssh-rsa` public key
///
/// Only a structural check; the key is never decoded. Restricting it to the
/// base64 alphabet keeps it a single field of a single credential line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey(String);

fn is_base64_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=')
}

impl PublicKey {
    pub fn parse(raw: &str) -> RegistryResult<Self> {
        if !raw.starts_with(PUBLIC_KEY_PREFIX)
            || raw.len() != PUBLIC_KEY_LEN
            || !raw.chars().all(is_base64_char)
        {
            return Err(RegistryError::InvalidPublicKey);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// What the appliance hands over besides token and subdomain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// SSH reverse tunnels: key to add to the credential store
    PublicKey(PublicKey),
    /// Tunnel agents: scheme for the rendered site
    Scheme(Scheme),
}

impl Credential {
    pub fn kind(&self) -> &'static str {
        match self {
            Credential::PublicKey(_) => "public key",
            Credential::Scheme(_) => "scheme",
        }
    }
}

/// A validated register request
#[derive(Debug, Clone)]
pub struct Registration {
    pub token: String,
    pub subdomain: Subdomain,
    pub credential: Credential,
}

impl Registration {
    /// Scheme rendered into the site file
    pub fn scheme(&self) -> Scheme {
        match &self.credential {
            Credential::Scheme(scheme) => *scheme,
            Credential::PublicKey(_) => Scheme::default(),
        }
    }
}

/// The resolved (port, subdomain, scheme) triple
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteBinding {
    pub port: u16,
    pub subdomain: Subdomain,
    pub scheme: Scheme,
}

/// Whether a write path touched its file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Changed,
    Unchanged,
}

impl Change {
    pub fn is_changed(self) -> bool {
        self == Change::Changed
    }
}

impl From<bool> for Change {
    fn from(changed: bool) -> Self {
        if changed {
            Change::Changed
        } else {
            Change::Unchanged
        }
    }
}
