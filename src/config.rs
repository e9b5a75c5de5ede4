use crate::address;
use crate::amount::AmountValidator;
use crate::chains::Ed25519Signer;
use crate::types::{RelayError, RelayerConfig};
use clap::{Arg, Command};
use config::{Config, Environment, File, FileFormat};
use log::{info, warn, LevelFilter};
use std::path::Path;

const DEFAULTS: &str = r#"
[source]
indexer_url = "http://127.0.0.1:3001"
network = "testnet"
package_id = ""
chain_tag = "sui"
event_names = ["asset_moved_event"]
poll_interval_ms = 1000
page_size = 100
request_timeout_secs = 20
reconnect_initial_ms = 500
reconnect_max_ms = 30000

[destination]
rpc_url = "http://127.0.0.1:9944"
ss58_format = 42
signing_key = ""
transfer_shape = "transfer"
request_timeout_secs = 30
status_poll_ms = 2000

[processing]
max_attempts = 3
retry_initial_ms = 1000
retry_max_ms = 30000
submit_timeout_ms = 30000
max_concurrent_submissions = 16
shutdown_grace_secs = 30

[storage]

[monitoring]
log_level = "info"
metrics_interval_secs = 60
"#;

/// Configuration builder for the relayer
pub struct ConfigBuilder {
    config: Config,
}

/// CLI arguments
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config_file: Option<String>,
    pub indexer_url: Option<String>,
    pub rpc_url: Option<String>,
    pub log_level: Option<String>,
    pub store_path: Option<String>,
}

impl CliArgs {
    pub fn parse() -> Self {
        let matches = Command::new("dubhe-relayer")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Relays asset movements from a Dubhe source chain to a Substrate destination chain")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .env("RELAYER_CONFIG_FILE"),
            )
            .arg(
                Arg::new("indexer-url")
                    .long("indexer-url")
                    .value_name("URL")
                    .help("Source chain indexer URL")
                    .env("INDEXER_URL"),
            )
            .arg(
                Arg::new("rpc-url")
                    .long("rpc-url")
                    .value_name("URL")
                    .help("Destination chain RPC URL")
                    .env("DESTINATION_RPC_URL"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)")
                    .env("LOG_LEVEL"),
            )
            .arg(
                Arg::new("store")
                    .long("store")
                    .value_name("FILE")
                    .help("Submission record file; records stay in memory when unset")
                    .env("RELAYER_STORE"),
            )
            .get_matches();

        Self {
            config_file: matches.get_one::<String>("config").cloned(),
            indexer_url: matches.get_one::<String>("indexer-url").cloned(),
            rpc_url: matches.get_one::<String>("rpc-url").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            store_path: matches.get_one::<String>("store").cloned(),
        }
    }
}

fn config_error(context: &str) -> impl Fn(config::ConfigError) -> RelayError + '_ {
    move |e| RelayError::Config(format!("{}: {}", context, e))
}

impl ConfigBuilder {
    /// Load configuration from the process arguments and environment.
    pub fn load() -> Result<RelayerConfig, RelayError> {
        Self::load_with(&CliArgs::parse())
    }

    /// Defaults, then a config file, then `RELAYER_*` environment variables, then CLI overrides.
    pub fn load_with(cli_args: &CliArgs) -> Result<RelayerConfig, RelayError> {
        let mut builder = ConfigBuilder::with_defaults()?;

        match &cli_args.config_file {
            Some(path) => builder.load_file(path)?,
            None => builder.try_load_default_files()?,
        }

        builder.load_environment()?;
        builder.apply_cli_overrides(cli_args)?;

        let config: RelayerConfig = builder
            .config
            .try_deserialize()
            .map_err(config_error("Configuration parsing error"))?;

        validate_config(&config)?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    fn with_defaults() -> Result<Self, RelayError> {
        let config = Config::builder()
            .add_source(File::from_str(DEFAULTS, FileFormat::Toml))
            .build()
            .map_err(config_error("Default config error"))?;
        Ok(Self { config })
    }

    fn load_file(&mut self, path: &str) -> Result<(), RelayError> {
        if !Path::new(path).exists() {
            return Err(RelayError::Config(format!("Config file not found: {}", path)));
        }

        info!("Loading configuration from: {}", path);

        self.config = Config::builder()
            .add_source(self.config.clone())
            .add_source(File::new(path, FileFormat::Toml))
            .build()
            .map_err(config_error("Config file error"))?;

        Ok(())
    }

    fn try_load_default_files(&mut self) -> Result<(), RelayError> {
        let default_paths = ["./relayer.toml", "/etc/dubhe/relayer.toml"];

        for path in &default_paths {
            if Path::new(path).exists() {
                info!("Found default config file: {}", path);
                return self.load_file(path);
            }
        }

        warn!("No config file found, using defaults and environment variables");
        Ok(())
    }

    /// `RELAYER_SECTION__KEY`, e.g. `RELAYER_DESTINATION__SIGNING_KEY`
    fn load_environment(&mut self) -> Result<(), RelayError> {
        self.config = Config::builder()
            .add_source(self.config.clone())
            .add_source(
                Environment::with_prefix("RELAYER")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("source.event_names")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_error("Environment config error"))?;

        Ok(())
    }

    fn apply_cli_overrides(&mut self, cli_args: &CliArgs) -> Result<(), RelayError> {
        let overrides = [
            ("source.indexer_url", &cli_args.indexer_url),
            ("destination.rpc_url", &cli_args.rpc_url),
            ("monitoring.log_level", &cli_args.log_level),
            ("storage.path", &cli_args.store_path),
        ];

        let mut builder = Config::builder().add_source(self.config.clone());
        for (key, value) in overrides {
            if let Some(value) = value {
                builder = builder
                    .set_override(key, value.as_str())
                    .map_err(config_error("CLI override error"))?;
            }
        }

        self.config = builder.build().map_err(config_error("CLI config build error"))?;
        Ok(())
    }
}

/// Validate configuration
pub fn validate_config(config: &RelayerConfig) -> Result<(), RelayError> {
    if config.source.indexer_url.trim().is_empty() {
        return Err(RelayError::Config("Indexer URL is required".to_string()));
    }
    if config.source.event_names.is_empty() {
        return Err(RelayError::Config(
            "At least one source event name is required".to_string(),
        ));
    }
    if config.source.chain_tag.trim().is_empty() {
        return Err(RelayError::Config("Source chain tag is required".to_string()));
    }

    if config.destination.rpc_url.trim().is_empty() {
        return Err(RelayError::Config(
            "Destination RPC URL is required".to_string(),
        ));
    }
    if config.destination.signing_key.trim().is_empty() {
        return Err(RelayError::Config(
            "Destination signing key is required".to_string(),
        ));
    }
    Ed25519Signer::from_hex_seed(&config.destination.signing_key)?;
    address::encode_key(&[0u8; address::PUBLIC_KEY_LEN], config.destination.ss58_format)
        .map_err(|e| RelayError::Config(format!("Unusable ss58_format: {}", e)))?;

    if config.processing.max_attempts == 0 {
        return Err(RelayError::Config(
            "processing.max_attempts must be at least 1".to_string(),
        ));
    }
    if config.processing.max_concurrent_submissions == 0 {
        return Err(RelayError::Config(
            "processing.max_concurrent_submissions must be at least 1".to_string(),
        ));
    }
    AmountValidator::from_setting(config.processing.max_amount.as_deref())?;

    if config.monitoring.log_level.trim().parse::<LevelFilter>().is_err() {
        return Err(RelayError::Config(format!(
            "Unknown monitoring.log_level '{}'",
            config.monitoring.log_level
        )));
    }

    Ok(())
}

/// Global log filter for a level name; unknown names fall back to `info`.
pub fn log_level_filter(level: &str) -> LevelFilter {
    level.trim().parse().unwrap_or(LevelFilter::Info)
}
