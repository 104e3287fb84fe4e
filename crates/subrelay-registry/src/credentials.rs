//! `authorized_keys`-style credential store for SSH reverse tunnels
//!
//! One line per token:
//!
//! ```text
//! ssh-rsa <public key> <token>@<marker>
//! ```
//!
//! The subdomain is not part of the line; renaming a box leaves this file
//! untouched.

use crate::binding::{Change, PublicKey};
use crate::error::RegistryResult;
use crate::fsutil;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default comment marker appended to the token
pub const DEFAULT_KEY_MARKER: &str = "relay";

const KEY_TYPE: &str = "ssh-rsa";

/// Format the record line (without newline) for a token
pub fn format_record(token: &str, key: &PublicKey, marker: &str) -> String {
    format!("{} {} {}@{}", KEY_TYPE, key.as_str(), token, marker)
}

/// Whether a line belongs to `token`: some field equals the token, with an
/// optional `@host` suffix
fn mentions_token(line: &str, token: &str) -> bool {
    line.split_whitespace().any(|field| {
        let name = field.split_once('@').map_or(field, |(name, _)| name);
        name == token
    })
}

/// Key body following the key-type field, if the line has one
fn embedded_key(line: &str) -> Option<&str> {
    let mut fields = line.split_whitespace();
    fields.find(|field| field.starts_with("ssh-"))?;
    fields.next()
}

/// Apply an upsert to the file content
///
/// Returns the new content and whether it differs. The first line mentioning
/// the token is kept if its key matches and replaced otherwise; any further
/// lines for the same token are dropped; no line at all means append.
pub fn upsert_content(content: &str, token: &str, key: &PublicKey, marker: &str) -> (String, Change) {
    let record = format_record(token, key, marker);
    let mut out = String::with_capacity(content.len() + record.len() + 1);
    let mut found = false;
    let mut changed = false;

    for line in content.lines() {
        if !mentions_token(line, token) {
            out.push_str(line);
            out.push('\n');
            continue;
        }

        if found {
            debug!("Dropping duplicate credential line for token");
            changed = true;
            continue;
        }
        found = true;

        if embedded_key(line) == Some(key.as_str()) {
            out.push_str(line);
        } else {
            out.push_str(&record);
            changed = true;
        }
        out.push('\n');
    }

    if !found {
        out.push_str(&record);
        out.push('\n');
        changed = true;
    }

    if changed {
        (out, Change::Changed)
    } else {
        (content.to_string(), Change::Unchanged)
    }
}

/// Line-oriented credential file
///
/// Callers must hold the state lock; the store itself does no locking.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
    marker: String,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>, marker: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            marker: marker.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Make sure exactly one up-to-date record exists for `token`
    pub fn upsert(&self, token: &str, key: &PublicKey) -> RegistryResult<Change> {
        let content = fsutil::read_or_empty(&self.path)?;
        let (updated, change) = upsert_content(&content, token, key, &self.marker);

        if change.is_changed() {
            fsutil::write_atomic(&self.path, updated.as_bytes())?;
            info!("Updated credential record in {}", self.path.display());
        } else {
            debug!("Credential record already current");
        }

        Ok(change)
    }
}
