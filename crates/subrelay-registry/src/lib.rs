//! Registration engine for the subdomain relay
//!
//! Binds appliance tokens to fixed tunnel ports and keeps the derived
//! artifacts on disk consistent:
//! - one reverse-proxy site file per (port, subdomain) binding
//! - an `authorized_keys`-style credential file (SSH reverse tunnels), or
//! - a YAML registry of tunnel agents and their ports
//!
//! [`Registrar::register`] is the single entry point that mutates state.

pub mod agents;
pub mod binding;
pub mod config;
pub mod credentials;
pub mod error;
mod fsutil;
pub mod lock;
pub mod reconcile;
pub mod registrar;
pub mod render;
pub mod site_dir;
pub mod tokens;

pub use agents::{AgentDocument, AgentRecord, AgentRegistry};
pub use binding::{Change, Credential, PublicKey, Registration, Scheme, SiteBinding, Subdomain};
pub use config::{AccessConfig, RegistrarConfig, Variant};
pub use credentials::CredentialStore;
pub use error::{RegisterFailure, RegistryError, RegistryResult};
pub use lock::{StateLock, StateLockGuard};
pub use reconcile::{reconcile, Decision};
pub use registrar::{AccessStore, RegisterOutcome, Registrar};
pub use render::SiteTemplate;
pub use site_dir::{Corruption, CorruptionReason, ScanReport, SiteDirectory, SiteIndex, SiteScan};
pub use tokens::{generate_tokens, write_token_file, TokenTable, TokenTableError};
