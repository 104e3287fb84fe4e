//! subrelay - subdomain registration service for a tunnel relay
//!
//! Appliances behind NAT present a pre-issued token and a subdomain; the relay
//! assigns the token's fixed tunnel port and publishes a reverse-proxy site for it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use subrelay_api::{ApiServer, ApiServerConfig, NoopReloader, Reloader, SystemdReloader};
use subrelay_registry::credentials::DEFAULT_KEY_MARKER;
use subrelay_registry::site_dir::DEFAULT_SITE_MARKER;
use subrelay_registry::{
    write_token_file, AccessConfig, Registrar, RegistrarConfig, SiteDirectory, StateLock,
    TokenTable,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOCK_FILE_NAME: &str = "registry.lock";
const DEFAULT_BASE_PORT: u16 = 14799;
const DEFAULT_TOKEN_COUNT: usize = 10000;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("SUBRELAY_GIT_HASH"),
    ", built ",
    env!("SUBRELAY_BUILD_TIME"),
    ")"
);

/// subrelay - publish appliances under subdomains of a tunnel relay
#[derive(Parser, Debug)]
#[command(name = "subrelay")]
#[command(about = "subrelay - publish appliances under subdomains of a tunnel relay")]
#[command(version = VERSION)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// How appliances reach the relay
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum VariantArg {
    /// `ssh -R` reverse tunnels, keys appended to an authorized_keys file
    SshKey,
    /// Tunnel agents listed in a YAML registry
    Agent,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the registration HTTP service
    #[command(long_about = r#"
Run the registration HTTP service.

Every registration is committed under an advisory lock in the state
directory, then the reverse proxy is reloaded through systemctl.

EXAMPLES:
  # SSH reverse tunnels
  subrelay serve --tokens /srv/subrelay/tokens.txt \
    --template /srv/subrelay/site.tmpl \
    --sites-dir /etc/nginx/sites-enabled \
    --credentials /home/relay/.ssh/authorized_keys

  # Tunnel agents
  subrelay serve --variant agent --agents /etc/tunnel/agents.yaml \
    --agent-unit tunnel-agent

ENVIRONMENT VARIABLES:
  SUBRELAY_LISTEN, SUBRELAY_TOKENS, SUBRELAY_BASE_PORT, SUBRELAY_SITES_DIR,
  SUBRELAY_TEMPLATE, SUBRELAY_STATE_DIR, SUBRELAY_VARIANT, SUBRELAY_CREDENTIALS,
  SUBRELAY_AGENTS, SUBRELAY_KEY_MARKER, SUBRELAY_LOCK_TIMEOUT_SECS,
  SUBRELAY_PROXY_UNIT, SUBRELAY_AGENT_UNIT, SUBRELAY_NO_RELOAD
    "#)]
    Serve {
        /// Address to bind the HTTP service
        #[arg(long, env = "SUBRELAY_LISTEN", default_value = "0.0.0.0:8080")]
        listen: SocketAddr,

        /// Token allow-list, one token per line
        #[arg(long, env = "SUBRELAY_TOKENS", default_value = "/srv/subrelay/tokens.txt")]
        tokens: PathBuf,

        /// Tunnel port of the first token
        #[arg(long, env = "SUBRELAY_BASE_PORT", default_value_t = DEFAULT_BASE_PORT)]
        base_port: u16,

        /// Directory of rendered reverse-proxy sites
        #[arg(long, env = "SUBRELAY_SITES_DIR", default_value = "/srv/subrelay/sites")]
        sites_dir: PathBuf,

        /// Site template with %%REMOTE_PORT%%, %%SUBDOMAIN%% and %%SCHEME%%
        #[arg(long, env = "SUBRELAY_TEMPLATE", default_value = "/srv/subrelay/site.tmpl")]
        template: PathBuf,

        /// Directory holding the registry lock
        #[arg(long, env = "SUBRELAY_STATE_DIR", default_value = "/srv/subrelay")]
        state_dir: PathBuf,

        #[arg(long, env = "SUBRELAY_VARIANT", value_enum, default_value = "ssh-key")]
        variant: VariantArg,

        /// authorized_keys file (ssh-key variant, default <state-dir>/authorized_keys)
        #[arg(long, env = "SUBRELAY_CREDENTIALS")]
        credentials: Option<PathBuf>,

        /// Agent registry YAML (agent variant, default <state-dir>/agents.yaml)
        #[arg(long, env = "SUBRELAY_AGENTS")]
        agents: Option<PathBuf>,

        /// Host part of the `<token>@<marker>` key comment
        #[arg(long, env = "SUBRELAY_KEY_MARKER", default_value = DEFAULT_KEY_MARKER)]
        key_marker: String,

        /// Seconds to wait for the registry lock before answering 503
        #[arg(long, env = "SUBRELAY_LOCK_TIMEOUT_SECS", default_value_t = 10)]
        lock_timeout_secs: u64,

        /// systemd unit of the reverse proxy
        #[arg(long, env = "SUBRELAY_PROXY_UNIT", default_value = "nginx")]
        proxy_unit: String,

        /// systemd unit of the tunnel agent service, restarted on new agents
        #[arg(long, env = "SUBRELAY_AGENT_UNIT")]
        agent_unit: Option<String>,

        /// Write files but never call systemctl
        #[arg(long, env = "SUBRELAY_NO_RELOAD")]
        no_reload: bool,
    },

    /// Generate a fresh token allow-list
    GenerateTokens {
        /// Output file, must not exist yet
        #[arg(long, env = "SUBRELAY_TOKENS")]
        out: PathBuf,

        #[arg(long, default_value_t = DEFAULT_TOKEN_COUNT)]
        count: usize,
    },

    /// Print current bindings and remove corrupted site files
    Scan {
        #[arg(long, env = "SUBRELAY_SITES_DIR", default_value = "/srv/subrelay/sites")]
        sites_dir: PathBuf,

        /// Token allow-list; when given, bindings on ports no token owns are flagged
        #[arg(long, env = "SUBRELAY_TOKENS")]
        tokens: Option<PathBuf>,

        #[arg(long, env = "SUBRELAY_BASE_PORT", default_value_t = DEFAULT_BASE_PORT)]
        base_port: u16,

        #[arg(long, env = "SUBRELAY_STATE_DIR", default_value = "/srv/subrelay")]
        state_dir: PathBuf,

        #[arg(long, env = "SUBRELAY_LOCK_TIMEOUT_SECS", default_value_t = 10)]
        lock_timeout_secs: u64,
    },
}

/// Setup logging; RUST_LOG overrides the defaults
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let default_filter = format!(
        "subrelay={level},subrelay_api={level},subrelay_registry={level},tower_http={level}",
        level = log_level
    );

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Serve {
            listen,
            tokens,
            base_port,
            sites_dir,
            template,
            state_dir,
            variant,
            credentials,
            agents,
            key_marker,
            lock_timeout_secs,
            proxy_unit,
            agent_unit,
            no_reload,
        } => {
            let table = TokenTable::load(&tokens, base_port)
                .with_context(|| format!("Failed to load tokens from {}", tokens.display()))?;
            info!(
                "Loaded {} tokens, ports {}-{}",
                table.len(),
                table.ports().start(),
                table.ports().end()
            );

            let access = match variant {
                VariantArg::SshKey => AccessConfig::SshKey {
                    credentials_path: credentials
                        .unwrap_or_else(|| state_dir.join("authorized_keys")),
                    key_marker,
                },
                VariantArg::Agent => AccessConfig::Agent {
                    registry_path: agents.unwrap_or_else(|| state_dir.join("agents.yaml")),
                },
            };

            let config = RegistrarConfig {
                sites_dir,
                site_marker: DEFAULT_SITE_MARKER.to_string(),
                template_path: template,
                lock_path: state_dir.join(LOCK_FILE_NAME),
                lock_timeout: Duration::from_secs(lock_timeout_secs),
                access,
            };
            let registrar = Registrar::new(&config, Arc::new(table))
                .context("Failed to initialise registrar")?;

            let reloader: Arc<dyn Reloader> = if no_reload {
                info!("Reloads disabled");
                Arc::new(NoopReloader)
            } else {
                if variant == VariantArg::Agent && agent_unit.is_none() {
                    warn!("No --agent-unit given, new agents will need a manual restart");
                }
                Arc::new(SystemdReloader::new(proxy_unit, agent_unit))
            };

            let server = ApiServer::new(
                ApiServerConfig { bind_addr: listen },
                Arc::new(registrar),
                reloader,
            );
            server.start().await?;
        }

        Commands::GenerateTokens { out, count } => {
            write_token_file(&out, count)
                .with_context(|| format!("Failed to generate tokens into {}", out.display()))?;
            info!("Wrote {} tokens to {}", count, out.display());
        }

        Commands::Scan {
            sites_dir,
            tokens,
            base_port,
            state_dir,
            lock_timeout_secs,
        } => {
            let table = tokens
                .map(|path| {
                    TokenTable::load(&path, base_port).with_context(|| {
                        format!("Failed to load tokens from {}", path.display())
                    })
                })
                .transpose()?;

            let sites = SiteDirectory::open(&sites_dir, DEFAULT_SITE_MARKER)
                .context("Failed to open site directory")?;
            let lock = StateLock::new(
                state_dir.join(LOCK_FILE_NAME),
                Duration::from_secs(lock_timeout_secs),
            );

            let scan = {
                let _guard = lock.acquire().context("Failed to lock registry")?;
                sites.scan().context("Failed to scan site directory")?
            };

            let mut orphaned = 0;
            for (port, subdomain) in scan.index.bindings() {
                let owned = table
                    .as_ref()
                    .map_or(true, |table| table.token_for_port(port).is_some());
                if owned {
                    println!("{}\t{}", port, subdomain);
                } else {
                    orphaned += 1;
                    println!("{}\t{}\t(no token)", port, subdomain);
                }
            }
            if orphaned > 0 {
                warn!("{} bindings sit on ports outside the token allow-list", orphaned);
            }
            info!(
                "{} bindings, {} corrupted files removed",
                scan.index.len(),
                scan.removed
            );
        }
    }

    Ok(())
}
