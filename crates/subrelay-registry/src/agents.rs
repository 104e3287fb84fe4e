//! Tunnel-agent registry: YAML document of agents and the ports they may open
//!
//! ```yaml
//! agents:
//!   - authKey: 6F1C0D3E-...
//!     ports:
//!       - 14799/tcp
//! ```
//!
//! Keys this crate does not know about are carried through untouched.
//! Agents are only ever added or extended, never edited or removed.

use crate::binding::Change;
use crate::error::{RegistryError, RegistryResult};
use crate::fsutil;
use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Port entry as the tunnel daemon expects it
pub fn port_entry(port: u16) -> String {
    format!("{}/tcp", port)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentDocument {
    #[serde(default)]
    pub agents: Vec<AgentRecord>,
    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    #[serde(rename = "authKey")]
    pub auth_key: String,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(flatten)]
    pub extra: Mapping,
}

impl AgentRecord {
    pub fn new(auth_key: impl Into<String>, port: u16) -> Self {
        Self {
            auth_key: auth_key.into(),
            ports: vec![port_entry(port)],
            extra: Mapping::new(),
        }
    }
}

impl AgentDocument {
    pub fn agent(&self, auth_key: &str) -> Option<&AgentRecord> {
        self.agents.iter().find(|a| a.auth_key == auth_key)
    }

    /// Add the agent, or the port to an existing agent
    pub fn ensure_agent(&mut self, auth_key: &str, port: u16) -> Change {
        let entry = port_entry(port);
        match self.agents.iter_mut().find(|a| a.auth_key == auth_key) {
            Some(agent) if agent.ports.contains(&entry) => Change::Unchanged,
            Some(agent) => {
                agent.ports.push(entry);
                Change::Changed
            }
            None => {
                self.agents.push(AgentRecord::new(auth_key, port));
                Change::Changed
            }
        }
    }
}

/// Agent registry file
///
/// Callers must hold the state lock; the registry itself does no locking.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    path: PathBuf,
}

impl AgentRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> RegistryResult<AgentDocument> {
        let content = fsutil::read_or_empty(&self.path)?;
        if content.trim().is_empty() {
            return Ok(AgentDocument::default());
        }

        serde_yaml::from_str(&content).map_err(|source| RegistryError::AgentDocument {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, document: &AgentDocument) -> RegistryResult<()> {
        let yaml = serde_yaml::to_string(document).map_err(|source| {
            RegistryError::AgentDocument {
                path: self.path.clone(),
                source,
            }
        })?;
        fsutil::write_atomic(&self.path, yaml.as_bytes())
    }

    /// Make sure the agent for `token` exists and may open `port`
    pub fn ensure_agent(&self, token: &str, port: u16) -> RegistryResult<Change> {
        let mut document = self.load()?;
        let change = document.ensure_agent(token, port);

        if change.is_changed() {
            self.save(&document)?;
            info!(
                "Agent registry {} now allows port {} for token",
                self.path.display(),
                port
            );
        } else {
            debug!("Agent already registered for port {}", port);
        }

        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_ensure_agent_in_memory() {
        let mut document = AgentDocument::default();

        assert_eq!(document.ensure_agent("T1", 100), Change::Changed);
        assert_eq!(document.ensure_agent("T1", 100), Change::Unchanged);
        assert_eq!(document.ensure_agent("T2", 101), Change::Changed);

        assert_eq!(document.agents.len(), 2);
        assert_eq!(document.agent("T1").unwrap().ports, vec!["100/tcp"]);
    }

    #[test]
    fn test_existing_agent_extended_not_duplicated() {
        let mut document = AgentDocument::default();
        document.ensure_agent("T1", 100);

        assert_eq!(document.ensure_agent("T1", 200), Change::Changed);
        assert_eq!(document.agents.len(), 1);
        assert_eq!(
            document.agent("T1").unwrap().ports,
            vec!["100/tcp", "200/tcp"]
        );
    }

    #[test]
    fn test_registry_missing_file() {
        let dir = TempDir::new().unwrap();
        let registry = AgentRegistry::new(dir.path().join("agents.yaml"));

        assert!(registry.load().unwrap().agents.is_empty());
        assert_eq!(registry.ensure_agent("T1", 100).unwrap(), Change::Changed);

        let reloaded = registry.load().unwrap();
        assert_eq!(reloaded.agents, vec![AgentRecord::new("T1", 100)]);
    }

    #[test]
    fn test_registry_idempotent_on_disk() {
        let dir = TempDir::new().unwrap();
        let registry = AgentRegistry::new(dir.path().join("agents.yaml"));

        registry.ensure_agent("T1", 100).unwrap();
        let first = fs::read(registry.path()).unwrap();

        assert_eq!(registry.ensure_agent("T1", 100).unwrap(), Change::Unchanged);
        assert_eq!(fs::read(registry.path()).unwrap(), first);
    }

    #[test]
    fn test_registry_preserves_unknown_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agents.yaml");
        fs::write(
            &path,
            "listen: 0.0.0.0:4443\nagents:\n  - authKey: T0\n    ports: [99/tcp]\n    name: first\n",
        )
        .unwrap();
        let registry = AgentRegistry::new(&path);

        registry.ensure_agent("T1", 100).unwrap();

        let document = registry.load().unwrap();
        assert_eq!(document.agents.len(), 2);
        assert_eq!(
            document.extra.get("listen").and_then(|v| v.as_str()),
            Some("0.0.0.0:4443")
        );
        assert_eq!(
            document.agents[0].extra.get("name").and_then(|v| v.as_str()),
            Some("first")
        );

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("authKey: T1"));
        assert!(raw.contains("100/tcp"));
    }

    #[test]
    fn test_registry_invalid_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agents.yaml");
        fs::write(&path, "agents: [unterminated\n").unwrap();

        let result = AgentRegistry::new(&path).ensure_agent("T1", 100);
        assert!(matches!(result, Err(RegistryError::AgentDocument { .. })));
    }
}
