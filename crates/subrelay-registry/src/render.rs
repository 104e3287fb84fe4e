//! Reverse-proxy site template

use crate::binding::{Scheme, Subdomain};
use crate::error::{RegistryError, RegistryResult};
use std::fs;
use std::path::Path;

pub const PORT_PLACEHOLDER: &str = "%%REMOTE_PORT%%";
pub const SUBDOMAIN_PLACEHOLDER: &str = "%%SUBDOMAIN%%";
pub const SCHEME_PLACEHOLDER: &str = "%%SCHEME%%";

/// Static template with three placeholders, loaded once at startup
#[derive(Debug, Clone)]
pub struct SiteTemplate {
    text: String,
}

impl SiteTemplate {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn load(path: &Path) -> RegistryResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            RegistryError::io(format!("failed to read site template {}", path.display()), e)
        })?;
        Ok(Self::new(text))
    }

    /// Plain substitution; every occurrence of each placeholder is replaced
    pub fn render(&self, port: u16, subdomain: &Subdomain, scheme: Scheme) -> String {
        self.text
            .replace(PORT_PLACEHOLDER, &port.to_string())
            .replace(SUBDOMAIN_PLACEHOLDER, subdomain.as_str())
            .replace(SCHEME_PLACEHOLDER, scheme.as_str())
    }
}
