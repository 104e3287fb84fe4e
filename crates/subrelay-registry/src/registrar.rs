//! The registration transaction: resolve, scan, decide, apply
//!
//! Everything between scanning the site directory and writing the new site
//! file runs under one [`StateLock`], so two appliances racing for the same
//! port or subdomain are serialised and never see a torn directory.

use crate::agents::AgentRegistry;
use crate::binding::{Credential, Registration, SiteBinding};
use crate::config::{AccessConfig, RegistrarConfig, Variant};
use crate::credentials::CredentialStore;
use crate::error::{RegisterFailure, RegistryError, RegistryResult};
use crate::lock::StateLock;
use crate::reconcile::{reconcile, Decision};
use crate::render::SiteTemplate;
use crate::site_dir::{SiteDirectory, SiteIndex, SiteScan};
use crate::tokens::TokenTable;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Variant specific access artifact
#[derive(Debug, Clone)]
pub enum AccessStore {
    SshKeys(CredentialStore),
    Agents(AgentRegistry),
}

impl AccessStore {
    pub fn from_config(config: &AccessConfig) -> Self {
        match config {
            AccessConfig::SshKey {
                credentials_path,
                key_marker,
            } => AccessStore::SshKeys(CredentialStore::new(credentials_path, key_marker)),
            AccessConfig::Agent { registry_path } => {
                AccessStore::Agents(AgentRegistry::new(registry_path))
            }
        }
    }

    pub fn variant(&self) -> Variant {
        match self {
            AccessStore::SshKeys(_) => Variant::SshKey,
            AccessStore::Agents(_) => Variant::Agent,
        }
    }

    fn mismatch(&self, credential: &Credential) -> RegistryError {
        RegistryError::CredentialMismatch {
            expected: match self {
                AccessStore::SshKeys(_) => "public key",
                AccessStore::Agents(_) => "scheme",
            },
            got: credential.kind(),
        }
    }

    fn accepts(&self, credential: &Credential) -> bool {
        matches!(
            (self, credential),
            (AccessStore::SshKeys(_), Credential::PublicKey(_))
                | (AccessStore::Agents(_), Credential::Scheme(_))
        )
    }
}

/// What a successful registration did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterOutcome {
    pub binding: SiteBinding,
    /// Site files deleted (stale binding of this port plus corrupted entries)
    pub removed: usize,
    /// The site file for this binding was created or rewritten
    pub site_written: bool,
    pub credentials_changed: bool,
    pub agents_changed: bool,
}

impl RegisterOutcome {
    /// Anything on disk changed, so the reverse proxy has to reload
    pub fn needs_reload(&self) -> bool {
        self.removed > 0 || self.site_written || self.credentials_changed || self.agents_changed
    }

    /// The tunnel-agent daemon must restart to pick up a new agent
    pub fn needs_agent_restart(&self) -> bool {
        self.agents_changed
    }
}

/// Registration engine over the on-disk state
#[derive(Debug)]
pub struct Registrar {
    tokens: Arc<TokenTable>,
    sites: SiteDirectory,
    template: SiteTemplate,
    access: AccessStore,
    lock: StateLock,
}

impl Registrar {
    pub fn new(config: &RegistrarConfig, tokens: Arc<TokenTable>) -> RegistryResult<Self> {
        let sites = SiteDirectory::open(&config.sites_dir, &config.site_marker)?;
        let template = SiteTemplate::load(&config.template_path)?;

        info!(
            "Registrar ready: variant {}, sites in {}",
            config.access.variant(),
            sites.path().display()
        );

        Ok(Self {
            tokens,
            sites,
            template,
            access: AccessStore::from_config(&config.access),
            lock: StateLock::new(&config.lock_path, config.lock_timeout),
        })
    }

    pub fn variant(&self) -> Variant {
        self.access.variant()
    }

    pub fn tokens(&self) -> &TokenTable {
        &self.tokens
    }

    pub fn sites(&self) -> &SiteDirectory {
        &self.sites
    }

    /// Register or re-register one appliance
    ///
    /// On failure the returned [`RegisterFailure`] still reports how many site
    /// files were deleted before the error, so the caller can reload for them.
    pub fn register(&self, registration: &Registration) -> Result<RegisterOutcome, RegisterFailure> {
        if !self.access.accepts(&registration.credential) {
            return Err(self.access.mismatch(&registration.credential).into());
        }

        let port = self.tokens.resolve_port(&registration.token)?;

        let _guard = self.lock.acquire()?;

        let scan = self.sites.scan()?;
        let mut removed = scan.removed;

        match self.commit(registration, port, &scan.index, &mut removed) {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                if removed > 0 {
                    warn!(
                        "Registration on port {} failed after removing {} site files",
                        port, removed
                    );
                }
                Err(RegisterFailure { error, removed })
            }
        }
    }

    /// Decide and apply under the lock; `removed` counts every deleted site file
    fn commit(
        &self,
        registration: &Registration,
        port: u16,
        index: &SiteIndex,
        removed: &mut usize,
    ) -> RegistryResult<RegisterOutcome> {
        let subdomain = &registration.subdomain;
        let scheme = registration.scheme();

        let stale = match reconcile(index, port, subdomain) {
            Decision::Rejected { holder } => {
                warn!(
                    "Port {} asked for {} which is held by port {}",
                    port, subdomain, holder
                );
                return Err(RegistryError::SubdomainConflict {
                    subdomain: subdomain.to_string(),
                    port: holder,
                });
            }
            Decision::RebindRequired { stale } => Some(stale),
            Decision::Accepted => {
                debug!("Port {} accepted for {}", port, subdomain);
                None
            }
        };

        // Access artifact first: if it fails the old binding is still served
        let (credentials_changed, agents_changed) = match (&self.access, &registration.credential)
        {
            (AccessStore::SshKeys(store), Credential::PublicKey(key)) => {
                (store.upsert(&registration.token, key)?.is_changed(), false)
            }
            (AccessStore::Agents(registry), Credential::Scheme(_)) => {
                (false, registry.ensure_agent(&registration.token, port)?.is_changed())
            }
            (access, credential) => return Err(access.mismatch(credential)),
        };

        if let Some(stale) = stale {
            info!("Port {} moves from {} to {}", port, stale, subdomain);
            if self.sites.remove(port, &stale)? {
                *removed += 1;
            }
        }

        let rendered = self.template.render(port, subdomain, scheme);
        let site_written = self.sites.write(port, subdomain, &rendered)?.is_changed();

        let outcome = RegisterOutcome {
            binding: SiteBinding {
                port,
                subdomain: subdomain.clone(),
                scheme,
            },
            removed: *removed,
            site_written,
            credentials_changed,
            agents_changed,
        };

        info!(
            "Registered {} on port {} ({}; reload: {})",
            subdomain,
            port,
            scheme,
            outcome.needs_reload()
        );

        Ok(outcome)
    }

    /// Self-healing scan under the lock, without registering anything
    pub fn scan(&self) -> RegistryResult<SiteScan> {
        let _guard = self.lock.acquire()?;
        self.sites.scan()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{PublicKey, Scheme, Subdomain, PUBLIC_KEY_LEN, PUBLIC_KEY_PREFIX};
    use std::fs;
    use std::path::Path;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    const TEMPLATE: &str = "%%SUBDOMAIN%% -> %%SCHEME%%://127.0.0.1:%%REMOTE_PORT%%\n";

    fn config(dir: &Path, access: AccessConfig) -> RegistrarConfig {
        fs::write(dir.join("site.tmpl"), TEMPLATE).unwrap();
        RegistrarConfig {
            sites_dir: dir.join("sites"),
            site_marker: "proxy".to_string(),
            template_path: dir.join("site.tmpl"),
            lock_path: dir.join("registry.lock"),
            lock_timeout: Duration::from_secs(5),
            access,
        }
    }

    fn agent_registrar(dir: &Path) -> Registrar {
        let access = AccessConfig::Agent {
            registry_path: dir.join("agents.yaml"),
        };
        let tokens = Arc::new(TokenTable::new(["A", "B"], 100).unwrap());
        Registrar::new(&config(dir, access), tokens).unwrap()
    }

    fn ssh_registrar(dir: &Path) -> Registrar {
        let access = AccessConfig::SshKey {
            credentials_path: dir.join("authorized_keys"),
            key_marker: "relay".to_string(),
        };
        let tokens = Arc::new(TokenTable::new(["A", "B"], 100).unwrap());
        Registrar::new(&config(dir, access), tokens).unwrap()
    }

    fn with_scheme(token: &str, subdomain: &str, scheme: Scheme) -> Registration {
        Registration {
            token: token.to_string(),
            subdomain: Subdomain::parse(subdomain).unwrap(),
            credential: Credential::Scheme(scheme),
        }
    }

    fn with_key(token: &str, subdomain: &str, fill: char) -> Registration {
        let raw = format!(
            "{}{}",
            PUBLIC_KEY_PREFIX,
            fill.to_string().repeat(PUBLIC_KEY_LEN - PUBLIC_KEY_PREFIX.len())
        );
        Registration {
            token: token.to_string(),
            subdomain: Subdomain::parse(subdomain).unwrap(),
            credential: Credential::PublicKey(PublicKey::parse(&raw).unwrap()),
        }
    }

    fn site_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir.join("sites"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_register_then_rebind() {
        let dir = TempDir::new().unwrap();
        let registrar = agent_registrar(dir.path());

        let outcome = registrar
            .register(&with_scheme("A", "alice", Scheme::Http))
            .unwrap();
        assert_eq!(outcome.binding.port, 100);
        assert_eq!(outcome.binding.subdomain.as_str(), "alice");
        assert_eq!(outcome.binding.scheme, Scheme::Http);
        assert!(outcome.needs_reload());
        assert!(outcome.needs_agent_restart());
        assert_eq!(site_names(dir.path()), vec!["proxy.alice.100"]);
        assert_eq!(
            fs::read_to_string(dir.path().join("sites/proxy.alice.100")).unwrap(),
            "alice -> http://127.0.0.1:100\n"
        );

        let outcome = registrar
            .register(&with_scheme("A", "bob", Scheme::Https))
            .unwrap();
        assert_eq!(outcome.binding.port, 100);
        assert_eq!(outcome.removed, 1);
        assert!(!outcome.needs_agent_restart());
        assert_eq!(site_names(dir.path()), vec!["proxy.bob.100"]);
        assert_eq!(
            fs::read_to_string(dir.path().join("sites/proxy.bob.100")).unwrap(),
            "bob -> https://127.0.0.1:100\n"
        );
    }

    #[test]
    fn test_identical_registration_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let registrar = agent_registrar(dir.path());
        let registration = with_scheme("B", "carol", Scheme::Http);

        registrar.register(&registration).unwrap();
        let site = dir.path().join("sites/proxy.carol.101");
        let registry = dir.path().join("agents.yaml");
        let site_before = (fs::read(&site).unwrap(), fs::metadata(&site).unwrap().modified().unwrap());
        let registry_before = fs::read(&registry).unwrap();

        thread::sleep(Duration::from_millis(20));
        let outcome = registrar.register(&registration).unwrap();

        assert!(!outcome.needs_reload());
        assert_eq!(outcome.binding.port, 101);
        assert_eq!(
            (fs::read(&site).unwrap(), fs::metadata(&site).unwrap().modified().unwrap()),
            site_before
        );
        assert_eq!(fs::read(&registry).unwrap(), registry_before);
    }

    #[test]
    fn test_scheme_change_rewrites_site() {
        let dir = TempDir::new().unwrap();
        let registrar = agent_registrar(dir.path());

        registrar
            .register(&with_scheme("A", "alice", Scheme::Http))
            .unwrap();
        let outcome = registrar
            .register(&with_scheme("A", "alice", Scheme::Https))
            .unwrap();

        assert!(outcome.site_written);
        assert_eq!(outcome.removed, 0);
        assert!(!outcome.agents_changed);
    }

    #[test]
    fn test_subdomain_conflict_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let registrar = agent_registrar(dir.path());

        registrar
            .register(&with_scheme("A", "foo", Scheme::Http))
            .unwrap();
        let registry_before = fs::read(dir.path().join("agents.yaml")).unwrap();

        let result = registrar.register(&with_scheme("B", "foo", Scheme::Http));

        match result {
            Err(RegisterFailure {
                error: RegistryError::SubdomainConflict { subdomain, port },
                removed,
            }) => {
                assert_eq!(subdomain, "foo");
                assert_eq!(port, 100);
                assert_eq!(removed, 0);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(site_names(dir.path()), vec!["proxy.foo.100"]);
        assert_eq!(
            fs::read(dir.path().join("agents.yaml")).unwrap(),
            registry_before
        );
    }

    #[test]
    fn test_invalid_token_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let registrar = agent_registrar(dir.path());

        let result = registrar.register(&with_scheme("nope", "alice", Scheme::Http));

        assert!(matches!(
            result,
            Err(RegisterFailure {
                error: RegistryError::InvalidToken,
                removed: 0
            })
        ));
        assert!(site_names(dir.path()).is_empty());
        assert!(!dir.path().join("agents.yaml").exists());
    }

    #[test]
    fn test_corrupted_directory_healed_before_register() {
        let dir = TempDir::new().unwrap();
        let registrar = agent_registrar(dir.path());
        let sites = dir.path().join("sites");
        fs::write(sites.join("proxy.alice.100"), "x").unwrap();
        fs::write(sites.join("proxy.mallory.100"), "x").unwrap();

        let outcome = registrar
            .register(&with_scheme("B", "mallory", Scheme::Http))
            .unwrap();

        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.binding.port, 101);
        assert_eq!(site_names(dir.path()), vec!["proxy.alice.100", "proxy.mallory.101"]);
    }

    #[test]
    fn test_conflict_reports_purged_files() {
        let dir = TempDir::new().unwrap();
        let registrar = agent_registrar(dir.path());
        let sites = dir.path().join("sites");
        fs::write(sites.join("proxy.alice.100"), "x").unwrap();
        fs::write(sites.join("proxy.zed.100"), "x").unwrap();

        let failure = registrar
            .register(&with_scheme("B", "alice", Scheme::Http))
            .unwrap_err();

        assert!(matches!(
            failure.error,
            RegistryError::SubdomainConflict { port: 100, .. }
        ));
        assert_eq!(failure.removed, 1);
        assert_eq!(site_names(dir.path()), vec!["proxy.alice.100"]);
    }

    #[test]
    fn test_failed_agent_update_keeps_old_binding() {
        let dir = TempDir::new().unwrap();
        let registrar = agent_registrar(dir.path());
        registrar
            .register(&with_scheme("A", "alice", Scheme::Http))
            .unwrap();
        fs::write(dir.path().join("agents.yaml"), "agents: [unclosed\n").unwrap();

        let failure = registrar
            .register(&with_scheme("A", "bob", Scheme::Http))
            .unwrap_err();

        assert!(matches!(failure.error, RegistryError::AgentDocument { .. }));
        assert_eq!(failure.removed, 0);
        assert_eq!(site_names(dir.path()), vec!["proxy.alice.100"]);
    }

    #[test]
    fn test_ssh_variant_credentials() {
        let dir = TempDir::new().unwrap();
        let registrar = ssh_registrar(dir.path());
        let keys = dir.path().join("authorized_keys");

        let outcome = registrar.register(&with_key("A", "alice", 'a')).unwrap();
        assert!(outcome.credentials_changed);
        assert!(!outcome.needs_agent_restart());
        assert_eq!(outcome.binding.scheme, Scheme::Http);
        let first = fs::read(&keys).unwrap();

        let outcome = registrar.register(&with_key("A", "alice", 'a')).unwrap();
        assert!(!outcome.needs_reload());
        assert_eq!(fs::read(&keys).unwrap(), first);

        let outcome = registrar.register(&with_key("A", "alice", 'b')).unwrap();
        assert!(outcome.credentials_changed);
        let content = fs::read_to_string(&keys).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.trim_end().ends_with("A@relay"));
    }

    #[test]
    fn test_credential_mismatch_rejected_early() {
        let dir = TempDir::new().unwrap();
        let registrar = ssh_registrar(dir.path());

        let result = registrar.register(&with_scheme("A", "alice", Scheme::Http));

        assert!(matches!(
            result,
            Err(RegisterFailure {
                error: RegistryError::CredentialMismatch { .. },
                ..
            })
        ));
        assert!(site_names(dir.path()).is_empty());
    }

    #[test]
    fn test_concurrent_claims_for_one_subdomain() {
        let dir = TempDir::new().unwrap();
        let registrar = Arc::new(agent_registrar(dir.path()));

        let handles: Vec<_> = ["A", "B"]
            .into_iter()
            .map(|token| {
                let registrar = registrar.clone();
                thread::spawn(move || {
                    registrar
                        .register(&with_scheme(token, "shared", Scheme::Http))
                        .is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(winners, 1);
        let names = site_names(dir.path());
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("proxy.shared."));
    }

    #[test]
    fn test_concurrent_distinct_registrations() {
        let dir = TempDir::new().unwrap();
        let registrar = Arc::new(agent_registrar(dir.path()));

        let handles: Vec<_> = [("A", "alice"), ("B", "bob")]
            .into_iter()
            .map(|(token, subdomain)| {
                let registrar = registrar.clone();
                thread::spawn(move || {
                    registrar
                        .register(&with_scheme(token, subdomain, Scheme::Http))
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(site_names(dir.path()), vec!["proxy.alice.100", "proxy.bob.101"]);
        let registry = AgentRegistry::new(dir.path().join("agents.yaml"))
            .load()
            .unwrap();
        assert_eq!(registry.agents.len(), 2);
    }

    #[test]
    fn test_scan_under_lock() {
        let dir = TempDir::new().unwrap();
        let registrar = agent_registrar(dir.path());
        fs::write(dir.path().join("sites/proxy.x.100"), "x").unwrap();
        fs::write(dir.path().join("sites/proxy.y.100"), "x").unwrap();

        let scan = registrar.scan().unwrap();
        assert_eq!(scan.removed, 1);
        assert_eq!(scan.index.len(), 1);
    }
}
