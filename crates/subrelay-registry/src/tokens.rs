//! Token allow-list and the fixed token -> port assignment
//!
//! Every token owns exactly one port for as long as it stays in the list:
//! `port = base_port + index`. The table is built once at startup and is
//! never mutated afterwards; share it behind an `Arc`.

use crate::error::{RegistryError, RegistryResult};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::ops::RangeInclusive;
use std::path::Path;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Errors raised while building a token table
#[derive(Debug, Error)]
pub enum TokenTableError {
    #[error("token allow-list is empty")]
    Empty,

    #[error("blank token at position {0}")]
    BlankToken(usize),

    #[error("token listed twice (lines {first} and {second})")]
    Duplicate { first: usize, second: usize },

    #[error("{count} tokens starting at port {base_port} exceed the port range")]
    PortOverflow { base_port: u16, count: usize },

    #[error("failed to read token file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("token file {0} already exists, (re)move it first")]
    AlreadyExists(String),

    #[error("failed to write token file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Immutable token -> port lookup
#[derive(Debug, Clone)]
pub struct TokenTable {
    tokens: Vec<String>,
    index: HashMap<String, usize>,
    base_port: u16,
}

impl TokenTable {
    /// Build a table from an ordered list of tokens
    pub fn new<I, S>(tokens: I, base_port: u16) -> Result<Self, TokenTableError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens: Vec<String> = tokens.into_iter().map(Into::into).collect();
        if tokens.is_empty() {
            return Err(TokenTableError::Empty);
        }

        let last_offset = tokens.len() - 1;
        if last_offset > usize::from(u16::MAX - base_port) {
            return Err(TokenTableError::PortOverflow {
                base_port,
                count: tokens.len(),
            });
        }

        let mut index = HashMap::with_capacity(tokens.len());
        for (i, token) in tokens.iter().enumerate() {
            if token.trim().is_empty() {
                return Err(TokenTableError::BlankToken(i + 1));
            }
            if let Some(first) = index.insert(token.clone(), i) {
                return Err(TokenTableError::Duplicate {
                    first: first + 1,
                    second: i + 1,
                });
            }
        }

        Ok(Self {
            tokens,
            index,
            base_port,
        })
    }

    /// Load a token file: one token per line, blank lines ignored
    pub fn load(path: &Path, base_port: u16) -> Result<Self, TokenTableError> {
        let content = fs::read_to_string(path).map_err(|source| TokenTableError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let table = Self::new(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty()),
            base_port,
        )?;

        info!(
            "Loaded {} tokens from {} (ports {}-{})",
            table.len(),
            path.display(),
            table.ports().start(),
            table.ports().end()
        );

        Ok(table)
    }

    /// Resolve the port permanently assigned to `token`
    pub fn resolve_port(&self, token: &str) -> RegistryResult<u16> {
        self.index
            .get(token)
            .map(|&i| self.port_at(i))
            .ok_or(RegistryError::InvalidToken)
    }

    /// Reverse lookup, mainly for diagnostics
    pub fn token_for_port(&self, port: u16) -> Option<&str> {
        let offset = usize::from(port.checked_sub(self.base_port)?);
        self.tokens.get(offset).map(String::as_str)
    }

    pub fn ports(&self) -> RangeInclusive<u16> {
        self.base_port..=self.port_at(self.tokens.len() - 1)
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn port_at(&self, index: usize) -> u16 {
        // Bounded by the overflow check in `new`
        self.base_port + index as u16
    }
}

/// Generate `count` fresh tokens (upper-case UUIDv4)
pub fn generate_tokens(count: usize) -> Vec<String> {
    (0..count)
        .map(|_| Uuid::new_v4().to_string().to_uppercase())
        .collect()
}

/// Write a new token file with `count` generated tokens
///
/// Refuses to touch an existing file: reordering or replacing tokens would
/// silently move every appliance to a different port.
pub fn write_token_file(path: &Path, count: usize) -> Result<(), TokenTableError> {
    let display = path.display().to_string();
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|source| {
            if source.kind() == io::ErrorKind::AlreadyExists {
                TokenTableError::AlreadyExists(display.clone())
            } else {
                TokenTableError::Write {
                    path: display.clone(),
                    source,
                }
            }
        })?;

    let mut buf = String::with_capacity(count * 37);
    for token in generate_tokens(count) {
        buf.push_str(&token);
        buf.push('\n');
    }

    file.write_all(buf.as_bytes())
        .and_then(|_| file.sync_all())
        .map_err(|source| TokenTableError::Write {
            path: display,
            source,
        })
}
