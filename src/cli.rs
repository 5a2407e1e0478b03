//! Command line: `rdvp serve | genkey | sharekey`.
//!
//! Every `serve` flag can also come from an `RDVP_*` environment variable or
//! from the flag file named by `--config`. Go-style single-dash long flags
//! (`-pk`, `-type`) are accepted.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::parser::ValueSource;
use clap::{ArgAction, Args, CommandFactory, FromArgMatches, Parser, Subcommand};

use crate::config::{load_flag_file, ConfigError, NodeConfig, DEFAULT_LISTEN};
use crate::error::NodeError;
use crate::identity::{self, KeyType, DEFAULT_RSA_BITS};
use crate::lifecycle::Node;
use crate::observability::logging::{self, LogConfig, LogDestination, LogFormat, DEFAULT_FILTER};
use crate::store::{sweeper::DEFAULT_SWEEP_INTERVAL, IN_MEMORY, MAX_TTL};

#[derive(Parser, Debug)]
#[command(name = "rdvp", version, about = "Rendezvous and relay node")]
#[command(args_override_self = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the rendezvous and relay node
    #[command(after_help = "EXAMPLE\n  rdvp genkey > rdvp.key\n  rdvp serve -pk `cat rdvp.key` -db ./rdvp-store")]
    Serve(ServeArgs),
    /// Generate a private key and print it as base64
    Genkey(GenkeyArgs),
    /// Print the PeerId of a private key
    Sharekey(SharekeyArgs),
}

/// Logging flags shared by every command.
#[derive(Args, Debug, Clone)]
pub struct LogArgs {
    /// Log filter directives
    #[arg(long = "log-filters", alias = "log.filters", env = "RDVP_LOG_FILTERS", default_value = DEFAULT_FILTER)]
    pub log_filters: String,

    /// json, console, color, light-console or light-color
    #[arg(long = "log-format", alias = "log.format", env = "RDVP_LOG_FORMAT", default_value_t = LogFormat::Color)]
    pub log_format: LogFormat,

    /// stderr, stdout or a file path
    #[arg(long = "log-file", alias = "log.file", env = "RDVP_LOG_FILE", default_value_t = LogDestination::Stderr)]
    pub log_file: LogDestination,
}

impl LogArgs {
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            filters: self.log_filters.clone(),
            format: self.log_format,
            destination: self.log_file.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Listen multiaddrs, comma separated
    #[arg(short = 'l', long = "listen", env = "RDVP_LISTEN", default_value = DEFAULT_LISTEN)]
    pub listen: String,

    /// Multiaddrs announced instead of the listeners, comma separated
    #[arg(long, env = "RDVP_ANNOUNCE", default_value = "")]
    pub announce: String,

    /// Private key from `rdvp genkey`; ephemeral when absent
    #[arg(long = "pk", env = "RDVP_PK", hide_env_values = true)]
    pub pk: Option<String>,

    /// Record store: `:memory:` or a database path
    #[arg(long, env = "RDVP_DB", default_value = IN_MEMORY)]
    pub db: String,

    /// Metrics listener (host:port); disabled when empty
    #[arg(long, env = "RDVP_METRICS")]
    pub metrics: Option<String>,

    /// Broker address, e.g. tcp://127.0.0.1:8080
    #[arg(long = "emitter-server", env = "RDVP_EMITTER_SERVER")]
    pub emitter_server: Option<String>,

    /// Broker admin key
    #[arg(long = "emitter-admin-key", env = "RDVP_EMITTER_ADMIN_KEY", hide_env_values = true)]
    pub emitter_admin_key: Option<String>,

    /// Broker address given to clients instead of --emitter-server
    #[arg(long = "emitter-public-addr", env = "RDVP_EMITTER_PUBLIC_ADDR")]
    pub emitter_public_addr: Option<String>,

    /// Fail instead of running local-only when the broker is unreachable
    #[arg(
        long = "emitter-mandatory",
        env = "RDVP_EMITTER_MANDATORY",
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value_t = false,
        default_missing_value = "true"
    )]
    pub emitter_mandatory: bool,

    /// Concurrent relay circuits; unlimited when unset
    #[arg(long = "relay-max-circuits", env = "RDVP_RELAY_MAX_CIRCUITS")]
    pub relay_max_circuits: Option<usize>,

    /// Bytes per relay circuit; unlimited when unset
    #[arg(long = "relay-max-data", env = "RDVP_RELAY_MAX_DATA", value_name = "BYTES")]
    pub relay_max_data: Option<u64>,

    /// Relay circuit lifetime; unlimited when unset
    #[arg(long = "relay-max-duration", env = "RDVP_RELAY_MAX_DURATION", value_name = "SECS")]
    pub relay_max_duration: Option<u64>,

    /// Longest registration TTL
    #[arg(long = "max-ttl", env = "RDVP_MAX_TTL", value_name = "SECS", default_value_t = MAX_TTL.as_secs())]
    pub max_ttl: u64,

    /// Interval between expired-record sweeps
    #[arg(long = "sweep-interval", env = "RDVP_SWEEP_INTERVAL", value_name = "SECS", default_value_t = DEFAULT_SWEEP_INTERVAL.as_secs())]
    pub sweep_interval: u64,

    /// Concurrent connections per listener
    #[arg(long = "max-connections", env = "RDVP_MAX_CONNECTIONS", default_value_t = crate::net::host::DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Flag file (plain `name value` lines or a TOML table)
    #[arg(long, env = "RDVP_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub log: LogArgs,
}

impl ServeArgs {
    /// The node configuration these flags describe.
    pub fn node_config(&self) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.network.listen = self.listen.clone();
        config.network.announce = self.announce.clone();
        config.network.max_connections = self.max_connections;
        config.identity.private_key = non_empty(&self.pk);
        config.store.location = self.db.clone();
        config.store.max_ttl_secs = self.max_ttl;
        config.store.sweep_interval_secs = self.sweep_interval;
        config.sync.emitter.server = non_empty(&self.emitter_server);
        config.sync.emitter.admin_key = non_empty(&self.emitter_admin_key);
        config.sync.emitter.public_addr = non_empty(&self.emitter_public_addr);
        config.sync.emitter.mandatory = self.emitter_mandatory;
        config.relay.max_circuits = self.relay_max_circuits;
        config.relay.max_data_bytes = self.relay_max_data;
        config.relay.max_duration_secs = self.relay_max_duration;
        config.metrics.listen = non_empty(&self.metrics);
        config
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
}

#[derive(Args, Debug, Clone)]
pub struct GenkeyArgs {
    /// Ed25519, ECDSA, Secp256k1 or RSA
    #[arg(long = "type", env = "RDVP_KEY_TYPE", default_value = "Ed25519")]
    pub key_type: String,

    /// Key length in bits (RSA only)
    #[arg(long, env = "RDVP_KEY_LENGTH", default_value_t = DEFAULT_RSA_BITS)]
    pub length: usize,

    #[command(flatten)]
    pub log: LogArgs,
}

#[derive(Args, Debug, Clone)]
pub struct SharekeyArgs {
    /// Private key from `rdvp genkey`
    #[arg(long = "pk", env = "RDVP_PK", hide_env_values = true)]
    pub pk: String,

    #[command(flatten)]
    pub log: LogArgs,
}

/// Parsed command line, plus the arguments it came from.
#[derive(Debug)]
pub struct Invocation {
    pub cli: Cli,
    argv: Vec<OsString>,
}

/// Parse the command line. Errors are usage errors.
pub fn parse_from<I, T>(args: I) -> Result<Invocation, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let argv = normalize_args(args);
    let matches = Cli::command().try_get_matches_from(&argv)?;
    let cli = Cli::from_arg_matches(&matches)?;
    Ok(Invocation { cli, argv })
}

/// Rewrite Go-style `-name` long flags to `--name`.
pub fn normalize_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let longs = long_flag_names();
    let mut done = false;
    args.into_iter()
        .map(Into::into)
        .enumerate()
        .map(|(index, arg)| {
            if index == 0 || done {
                return arg;
            }
            let Some(text) = arg.to_str() else {
                return arg;
            };
            if text == "--" {
                done = true;
                return arg;
            }
            match text.strip_prefix('-') {
                Some(rest) if !rest.starts_with('-') && rest.len() > 1 => {
                    let name = rest.split('=').next().unwrap_or(rest);
                    if longs.iter().any(|l| l == name) {
                        OsString::from(format!("-{text}"))
                    } else {
                        arg
                    }
                }
                _ => arg,
            }
        })
        .collect()
}

fn long_flag_names() -> Vec<String> {
    let cmd = Cli::command();
    cmd.get_subcommands()
        .flat_map(|sub| sub.get_arguments())
        .flat_map(|arg| {
            let mut names: Vec<String> = arg.get_long().map(str::to_string).into_iter().collect();
            if let Some(aliases) = arg.get_all_aliases() {
                names.extend(aliases.into_iter().map(str::to_string));
            }
            names
        })
        .collect()
}

impl Invocation {
    /// Execute the command.
    pub async fn run(self) -> Result<(), NodeError> {
        match &self.cli.command {
            Command::Serve(args) => {
                let args = match &args.config {
                    Some(path) => apply_flag_file(&self.argv, path.clone())?,
                    None => args.clone(),
                };
                init_logging(&args.log)?;
                serve(args).await
            }
            Command::Genkey(args) => {
                init_logging(&args.log)?;
                let key_type: KeyType = args.key_type.parse()?;
                let identity = identity::generate(key_type, args.length)?;
                println!("{}", identity.export());
                Ok(())
            }
            Command::Sharekey(args) => {
                init_logging(&args.log)?;
                let identity = identity::load(&args.pk)?;
                println!("{}", identity.peer_id());
                Ok(())
            }
        }
    }
}

fn init_logging(args: &LogArgs) -> Result<(), NodeError> {
    logging::init(&args.log_config())?;
    Ok(())
}

async fn serve(args: ServeArgs) -> Result<(), NodeError> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rdvp starting");
    let config = args.node_config();
    tracing::debug!(config = ?config, "Configuration loaded");
    let node = Node::build(config).await?;
    node.run().await
}

/// Re-parse `argv` with values from the flag file for every `serve` flag
/// that neither the command line nor the environment set.
fn apply_flag_file(argv: &[OsString], path: PathBuf) -> Result<ServeArgs, ConfigError> {
    let cmd = Cli::command();
    let matches = cmd
        .clone()
        .try_get_matches_from(argv)
        .map_err(|e| flag_error(&path, e))?;
    let Some(serve_matches) = matches.subcommand_matches("serve") else {
        return Err(ConfigError::Parse {
            path,
            line: 0,
            reason: "flag files only apply to serve".to_string(),
        });
    };
    let Some(serve_cmd) = cmd.find_subcommand("serve") else {
        return Err(ConfigError::Parse {
            path,
            line: 0,
            reason: "serve command missing".to_string(),
        });
    };

    let mut known: Vec<String> = Vec::new();
    for arg in serve_cmd.get_arguments() {
        if arg.get_id() == "config" {
            continue;
        }
        known.extend(arg.get_long().map(str::to_string));
        known.extend(arg.get_short().map(|c| c.to_string()));
        if let Some(aliases) = arg.get_all_aliases() {
            known.extend(aliases.into_iter().map(str::to_string));
        }
    }
    let known_refs: Vec<&str> = known.iter().map(String::as_str).collect();
    let pairs = load_flag_file(&path, &known_refs)?;

    let mut extra: Vec<OsString> = Vec::new();
    for (key, value) in pairs {
        let Some(arg) = serve_cmd.get_arguments().find(|arg| {
            arg.get_long() == Some(key.as_str())
                || arg.get_short().is_some_and(|c| key.len() == 1 && key.starts_with(c))
                || arg
                    .get_all_aliases()
                    .is_some_and(|aliases| aliases.contains(&key.as_str()))
        }) else {
            continue;
        };
        let explicit = matches!(
            serve_matches.value_source(arg.get_id().as_str()),
            Some(ValueSource::CommandLine) | Some(ValueSource::EnvVariable)
        );
        if explicit {
            continue;
        }
        let Some(long) = arg.get_long() else {
            continue;
        };
        if value.is_empty() && arg.get_num_args().is_some_and(|n| n.min_values() == 0) {
            extra.push(format!("--{long}").into());
        } else {
            extra.push(format!("--{long}={value}").into());
        }
    }

    let mut argv = argv.to_vec();
    argv.extend(extra);
    let cli = Cli::try_parse_from(&argv).map_err(|e| flag_error(&path, e))?;
    match cli.command {
        Command::Serve(args) => Ok(args),
        _ => Err(ConfigError::Parse {
            path,
            line: 0,
            reason: "flag files only apply to serve".to_string(),
        }),
    }
}

fn flag_error(path: &std::path::Path, e: clap::Error) -> ConfigError {
    ConfigError::Parse {
        path: path.to_path_buf(),
        line: 0,
        reason: e.to_string().trim().to_string(),
    }
}
