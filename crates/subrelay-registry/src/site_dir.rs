//! Site directory: the on-disk record of which subdomain is served by which port
//!
//! Each binding is one rendered reverse-proxy file named
//! `<marker>.<subdomain>.<port>`. Scanning happens in two phases:
//! - [`SiteIndex::build`] turns a list of file names into a duplicate-free
//!   snapshot plus the entries that break the bijection (pure)
//! - [`SiteDirectory::purge`] deletes those entries from disk
//!
//! When two files claim the same port or subdomain, the first name in sorted
//! order wins and the later one is purged.

use crate::binding::{Change, Subdomain};
use crate::error::{RegistryError, RegistryResult};
use crate::fsutil;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default file name marker
pub const DEFAULT_SITE_MARKER: &str = "proxy";

/// How a directory entry name was understood
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedName {
    /// Not one of ours (no marker); left alone
    Foreign,
    /// Carries the marker but cannot be a valid binding
    Malformed,
    Site { port: u16, subdomain: Subdomain },
}

/// Canonical artifact file name for a binding
pub fn site_file_name(marker: &str, port: u16, subdomain: &Subdomain) -> String {
    format!("{}.{}.{}", marker, subdomain, port)
}

/// Parse a directory entry name against `<marker>.<subdomain>.<port>`
pub fn parse_site_file_name(marker: &str, name: &str) -> ParsedName {
    let Some(rest) = name
        .strip_prefix(marker)
        .and_then(|rest| rest.strip_prefix('.'))
    else {
        return ParsedName::Foreign;
    };

    let mut parts = rest.split('.');
    let (Some(subdomain), Some(port), None) = (parts.next(), parts.next(), parts.next()) else {
        return ParsedName::Malformed;
    };

    let (Ok(subdomain), Ok(port)) = (Subdomain::parse(subdomain), port.parse::<u16>()) else {
        return ParsedName::Malformed;
    };

    // Reject names that only parse loosely ("Alice", "0100"): the engine would
    // never find them again under their canonical name
    if site_file_name(marker, port, &subdomain) != name {
        return ParsedName::Malformed;
    }

    ParsedName::Site { port, subdomain }
}

/// Why an entry was excluded from the snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorruptionReason {
    Malformed,
    /// The port is already served by another subdomain
    PortTaken { port: u16, holder: Subdomain },
    /// The subdomain is already served by another port
    SubdomainTaken { subdomain: Subdomain, holder: u16 },
}

impl fmt::Display for CorruptionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorruptionReason::Malformed => write!(f, "malformed name"),
            CorruptionReason::PortTaken { port, holder } => {
                write!(f, "port {} already bound to {}", port, holder)
            }
            CorruptionReason::SubdomainTaken { subdomain, holder } => {
                write!(f, "subdomain {} already bound to port {}", subdomain, holder)
            }
        }
    }
}

/// A directory entry that has to go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corruption {
    pub file_name: String,
    pub reason: CorruptionReason,
}

/// Bijection between ports and subdomains
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteIndex {
    port_to_subdomain: BTreeMap<u16, Subdomain>,
    subdomain_to_port: BTreeMap<Subdomain, u16>,
}

/// Result of the pure scan phase
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub index: SiteIndex,
    pub corrupted: Vec<Corruption>,
}

impl SiteIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from directory entry names
    ///
    /// Names are processed in sorted order so the outcome does not depend on
    /// the order the filesystem lists them in.
    pub fn build<I, S>(marker: &str, names: I) -> ScanReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut names: Vec<S> = names.into_iter().collect();
        names.sort_by(|a, b| a.as_ref().cmp(b.as_ref()));

        let mut report = ScanReport::default();
        for name in names {
            let name = name.as_ref();
            let reason = match parse_site_file_name(marker, name) {
                ParsedName::Foreign => continue,
                ParsedName::Malformed => CorruptionReason::Malformed,
                ParsedName::Site { port, subdomain } => {
                    match report.index.insert(port, subdomain) {
                        Ok(()) => continue,
                        Err(reason) => reason,
                    }
                }
            };
            report.corrupted.push(Corruption {
                file_name: name.to_string(),
                reason,
            });
        }

        report
    }

    /// Add a binding unless it clashes with an existing one
    pub fn insert(&mut self, port: u16, subdomain: Subdomain) -> Result<(), CorruptionReason> {
        if let Some(holder) = self.port_to_subdomain.get(&port) {
            return Err(CorruptionReason::PortTaken {
                port,
                holder: holder.clone(),
            });
        }
        if let Some(&holder) = self.subdomain_to_port.get(&subdomain) {
            return Err(CorruptionReason::SubdomainTaken { subdomain, holder });
        }

        self.subdomain_to_port.insert(subdomain.clone(), port);
        self.port_to_subdomain.insert(port, subdomain);
        Ok(())
    }

    /// Drop the binding held by `port`
    pub fn remove_port(&mut self, port: u16) -> Option<Subdomain> {
        let subdomain = self.port_to_subdomain.remove(&port)?;
        self.subdomain_to_port.remove(&subdomain);
        Some(subdomain)
    }

    pub fn subdomain_for(&self, port: u16) -> Option<&Subdomain> {
        self.port_to_subdomain.get(&port)
    }

    pub fn port_for(&self, subdomain: &Subdomain) -> Option<u16> {
        self.subdomain_to_port.get(subdomain).copied()
    }

    /// All bindings ordered by port
    pub fn bindings(&self) -> impl Iterator<Item = (u16, &Subdomain)> {
        self.port_to_subdomain.iter().map(|(&port, s)| (port, s))
    }

    pub fn len(&self) -> usize {
        self.port_to_subdomain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.port_to_subdomain.is_empty()
    }
}

/// Snapshot after corrupted entries were removed from disk
#[derive(Debug, Clone, Default)]
pub struct SiteScan {
    pub index: SiteIndex,
    pub removed: usize,
}

/// Directory holding the rendered site files
#[derive(Debug, Clone)]
pub struct SiteDirectory {
    path: PathBuf,
    marker: String,
}

impl SiteDirectory {
    /// Open the directory, creating it if missing
    pub fn open(path: impl Into<PathBuf>, marker: impl Into<String>) -> RegistryResult<Self> {
        let path = path.into();
        fs::create_dir_all(&path).map_err(|e| {
            RegistryError::io(
                format!("failed to create site directory {}", path.display()),
                e,
            )
        })?;

        Ok(Self {
            path,
            marker: marker.into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn artifact_path(&self, port: u16, subdomain: &Subdomain) -> PathBuf {
        self.path
            .join(site_file_name(&self.marker, port, subdomain))
    }

    /// Names of all regular files in the directory
    pub fn list_names(&self) -> RegistryResult<Vec<String>> {
        let context = || format!("failed to list site directory {}", self.path.display());
        let mut names = Vec::new();

        for entry in fs::read_dir(&self.path).map_err(|e| RegistryError::io(context(), e))? {
            let entry = entry.map_err(|e| RegistryError::io(context(), e))?;
            let is_file = entry
                .file_type()
                .map_err(|e| RegistryError::io(context(), e))?
                .is_file();
            if !is_file {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => debug!("Skipping non UTF-8 site entry {:?}", raw),
            }
        }

        Ok(names)
    }

    /// Pure scan of the current directory listing
    pub fn inspect(&self) -> RegistryResult<ScanReport> {
        Ok(SiteIndex::build(&self.marker, self.list_names()?))
    }

    /// Delete corrupted entries, returning how many were removed
    pub fn purge(&self, corrupted: &[Corruption]) -> RegistryResult<usize> {
        let mut removed = 0;
        for entry in corrupted {
            warn!(
                "Removing corrupted site file {} ({})",
                entry.file_name, entry.reason
            );
            if remove_if_exists(&self.path.join(&entry.file_name))? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Scan and self-heal: returns a clean snapshot of the bijection
    pub fn scan(&self) -> RegistryResult<SiteScan> {
        let report = self.inspect()?;
        let removed = self.purge(&report.corrupted)?;
        debug!(
            "Scanned {}: {} bindings, {} removed",
            self.path.display(),
            report.index.len(),
            removed
        );

        Ok(SiteScan {
            index: report.index,
            removed,
        })
    }

    /// Delete the artifact for a binding; returns whether a file was removed
    pub fn remove(&self, port: u16, subdomain: &Subdomain) -> RegistryResult<bool> {
        remove_if_exists(&self.artifact_path(port, subdomain))
    }

    /// Write the artifact for a binding, skipping identical content
    pub fn write(&self, port: u16, subdomain: &Subdomain, content: &str) -> RegistryResult<Change> {
        fsutil::write_if_changed(&self.artifact_path(port, subdomain), content.as_bytes())
    }
}

fn remove_if_exists(path: &Path) -> RegistryResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(RegistryError::io(
            format!("failed to remove {}", path.display()),
            e,
        )),
    }
}
