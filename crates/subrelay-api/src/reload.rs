//! Applying new configuration to the reverse proxy and tunnel daemon
//!
//! The registrar only writes files; something still has to tell nginx (and,
//! for new agents, the tunnel daemon) to pick them up.

use std::process::Command;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
}

/// One-shot "apply configuration" collaborator
pub trait Reloader: Send + Sync {
    /// Reload the reverse proxy; also restart the tunnel-agent service when
    /// `restart_agent_service` is set
    fn apply(&self, restart_agent_service: bool) -> Result<(), ReloadError>;
}

/// Reloads through `systemctl`
#[derive(Debug, Clone)]
pub struct SystemdReloader {
    program: String,
    proxy_unit: String,
    agent_unit: Option<String>,
}

impl SystemdReloader {
    pub fn new(proxy_unit: impl Into<String>, agent_unit: Option<String>) -> Self {
        Self {
            program: "systemctl".to_string(),
            proxy_unit: proxy_unit.into(),
            agent_unit,
        }
    }

    /// Use another binary in place of `systemctl`
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn run(&self, action: &str, unit: &str) -> Result<(), ReloadError> {
        let command = format!("{} {} {}", self.program, action, unit);
        debug!("Running {}", command);

        let output = Command::new(&self.program)
            .arg(action)
            .arg(unit)
            .output()
            .map_err(|source| ReloadError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ReloadError::Failed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!("{} {} done", action, unit);
        Ok(())
    }
}

impl Reloader for SystemdReloader {
    fn apply(&self, restart_agent_service: bool) -> Result<(), ReloadError> {
        if restart_agent_service {
            if let Some(agent_unit) = &self.agent_unit {
                self.run("restart", agent_unit)?;
            }
        }
        self.run("reload", &self.proxy_unit)
    }
}

/// Dry-run reloader: logs and does nothing
#[derive(Debug, Clone, Default)]
pub struct NoopReloader;

impl Reloader for NoopReloader {
    fn apply(&self, restart_agent_service: bool) -> Result<(), ReloadError> {
        info!(
            "Reload skipped (restart agents: {})",
            restart_agent_service
        );
        Ok(())
    }
}
