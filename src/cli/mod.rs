// CLI module for cloudq
/// Command execution handlers
pub mod commands;
/// Output formatting utilities
pub mod output;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use crate::config::{BackendConfig, CloudqConfig, LogFormat};

const DEFAULT_API_URL: &str = "http://localhost:9400";

/// Command-line interface for cloudq
#[derive(Parser)]
#[command(name = "cloudq")]
#[command(author, version, about = "Durable message queue with leases, redelivery and dead-letter queues", long_about = None)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short, global = true, env = "CLOUDQ_CONFIG")]
    pub config: Option<PathBuf>,

    /// The command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the cloudq server
    Start(StartArgs),

    /// Queue management commands
    #[command(subcommand)]
    Queue(QueueCommands),

    /// Send a message
    Send {
        /// Queue name
        queue: String,

        /// Message body (UTF-8 text)
        body: String,

        #[command(flatten)]
        api: ApiArgs,
    },

    /// Lease messages from a queue
    Receive {
        /// Queue name
        queue: String,

        /// Consumer token identifying this receiver
        #[arg(long, env = "CLOUDQ_CONSUMER")]
        consumer: String,

        /// Maximum number of messages (1-10)
        #[arg(long, short = 'n', default_value = "1")]
        max_messages: usize,

        #[command(flatten)]
        api: ApiArgs,

        /// Output format (table | json)
        #[arg(long, short, default_value = "table")]
        format: String,
    },

    /// Acknowledge a leased message
    Ack {
        /// Message id
        message_id: String,

        /// Consumer token that holds the lease
        #[arg(long, env = "CLOUDQ_CONSUMER")]
        consumer: String,

        #[command(flatten)]
        api: ApiArgs,
    },

    /// Push a lease deadline further out
    Extend {
        /// Message id
        message_id: String,

        /// Consumer token that holds the lease
        #[arg(long, env = "CLOUDQ_CONSUMER")]
        consumer: String,

        /// Seconds added to the later of the current deadline and now
        #[arg(long, default_value = "30")]
        seconds: u32,

        #[command(flatten)]
        api: ApiArgs,
    },

    /// Give a lease back without counting a receive
    Release {
        /// Message id
        message_id: String,

        /// Consumer token that holds the lease
        #[arg(long, env = "CLOUDQ_CONSUMER")]
        consumer: String,

        #[command(flatten)]
        api: ApiArgs,
    },

    /// Show dead letters without leasing them
    DeadLetters {
        /// Dead-letter queue name
        queue: String,

        /// Maximum number of records
        #[arg(long, default_value = "10")]
        limit: usize,

        #[command(flatten)]
        api: ApiArgs,

        /// Output format (table | json)
        #[arg(long, short, default_value = "table")]
        format: String,
    },

    /// Move dead letters back to their original queue
    Redrive {
        /// Dead-letter queue name
        queue: String,

        /// Maximum number of messages to move
        #[arg(long, default_value = "10")]
        limit: usize,

        #[command(flatten)]
        api: ApiArgs,
    },

    /// Health check
    Health {
        #[command(flatten)]
        api: ApiArgs,
    },

    /// Show overall statistics
    Stats {
        #[command(flatten)]
        api: ApiArgs,

        /// Output format (table | json)
        #[arg(long, short, default_value = "table")]
        format: String,
    },

    /// Print the effective configuration as TOML
    Config,
}

/// Where the REST API lives
#[derive(Args, Clone)]
pub struct ApiArgs {
    /// REST API URL
    #[arg(long, env = "CLOUDQ_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,
}

/// Flags for `cloudq start`; each one overrides the configuration file
#[derive(Args, Default)]
pub struct StartArgs {
    /// Bind address (use 0.0.0.0 for all interfaces)
    #[arg(long, env = "CLOUDQ_BIND_ADDRESS")]
    pub bind_address: Option<String>,

    /// REST API port
    #[arg(long, env = "CLOUDQ_API_PORT")]
    pub api_port: Option<u16>,

    /// Metrics port
    #[arg(long, env = "CLOUDQ_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Disable the metrics server
    #[arg(long)]
    pub no_metrics: bool,

    /// Storage backend (memory | sqlite)
    #[arg(long, env = "CLOUDQ_BACKEND")]
    pub backend: Option<String>,

    /// SQLite database path (implies the sqlite backend)
    #[arg(long, env = "CLOUDQ_DB_PATH")]
    pub db_path: Option<String>,

    /// Log level or filter directive
    #[arg(long, env = "CLOUDQ_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format (text | json)
    #[arg(long, env = "CLOUDQ_LOG_FORMAT")]
    pub log_format: Option<String>,
}

impl StartArgs {
    /// Apply the flags that were given on top of `config`.
    pub fn apply(&self, config: &mut CloudqConfig) -> anyhow::Result<()> {
        if let Some(bind_address) = &self.bind_address {
            config.server.bind_address = bind_address.clone();
        }
        if let Some(port) = self.api_port {
            config.server.api_port = port;
        }
        if let Some(port) = self.metrics_port {
            config.metrics.port = port;
        }
        if self.no_metrics {
            config.metrics.enabled = false;
        }

        match self.backend.as_deref().map(str::to_ascii_lowercase).as_deref() {
            None => {}
            Some("memory") => {
                if !matches!(config.storage.backend, BackendConfig::InMemory { .. }) {
                    config.storage.backend = BackendConfig::default();
                }
            }
            Some("sqlite") => {
                if !matches!(config.storage.backend, BackendConfig::Sqlite { .. }) {
                    config.storage.backend = BackendConfig::Sqlite {
                        database_path: "cloudq.db".to_string(),
                        max_connections: 10,
                    };
                }
            }
            Some(other) => anyhow::bail!("Unknown backend '{}', expected memory or sqlite", other),
        }

        if let Some(path) = &self.db_path {
            match &mut config.storage.backend {
                BackendConfig::Sqlite { database_path, .. } => *database_path = path.clone(),
                backend @ BackendConfig::InMemory { .. } => {
                    if self.backend.is_some() {
                        anyhow::bail!("--db-path only applies to the sqlite backend");
                    }
                    *backend = BackendConfig::Sqlite {
                        database_path: path.clone(),
                        max_connections: 10,
                    };
                }
            }
        }

        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.logging.format = match format.to_ascii_lowercase().as_str() {
                "text" => LogFormat::Text,
                "json" => LogFormat::Json,
                other => anyhow::bail!("Unknown log format '{}', expected text or json", other),
            };
        }

        Ok(())
    }
}

/// Queue management subcommands
#[derive(Subcommand)]
pub enum QueueCommands {
    /// List queues
    List {
        /// Only queues whose name starts with this prefix
        #[arg(long)]
        prefix: Option<String>,

        #[command(flatten)]
        api: ApiArgs,

        /// Output format (table | json)
        #[arg(long, short, default_value = "table")]
        format: String,
    },

    /// Create a new queue
    Create {
        /// Queue name
        name: String,

        /// Strict FIFO ordering
        #[arg(long)]
        fifo: bool,

        /// Lease duration in seconds
        #[arg(long)]
        visibility_timeout: Option<u32>,

        /// Receives before a message is dead-lettered
        #[arg(long)]
        max_receives: Option<u32>,

        /// Message retention in seconds
        #[arg(long)]
        retention: Option<u32>,

        /// Largest accepted body in bytes
        #[arg(long)]
        max_message_size: Option<usize>,

        /// Queue capacity
        #[arg(long)]
        max_messages: Option<usize>,

        /// Dead-letter queue name
        #[arg(long)]
        dlq: Option<String>,

        #[command(flatten)]
        api: ApiArgs,
    },

    /// Delete a queue
    Delete {
        /// Queue name
        name: String,

        /// Delete even if the queue still holds messages
        #[arg(long)]
        force: bool,

        #[command(flatten)]
        api: ApiArgs,
    },

    /// Show queue statistics
    Stats {
        /// Queue name
        name: String,

        #[command(flatten)]
        api: ApiArgs,

        /// Output format (table | json)
        #[arg(long, short, default_value = "table")]
        format: String,
    },

    /// Change queue settings
    Update {
        /// Queue name
        name: String,

        /// Lease duration in seconds
        #[arg(long)]
        visibility_timeout: Option<u32>,

        /// Receives before a message is dead-lettered
        #[arg(long)]
        max_receives: Option<u32>,

        /// Message retention in seconds
        #[arg(long)]
        retention: Option<u32>,

        /// Largest accepted body in bytes
        #[arg(long)]
        max_message_size: Option<usize>,

        /// Queue capacity
        #[arg(long)]
        max_messages: Option<usize>,

        /// New dead-letter queue
        #[arg(long, conflicts_with = "no_dlq")]
        dlq: Option<String>,

        /// Detach the dead-letter queue
        #[arg(long)]
        no_dlq: bool,

        #[command(flatten)]
        api: ApiArgs,
    },
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Load the configuration file (or defaults), apply `start` flags and validate.
    pub fn load_config(&self) -> anyhow::Result<CloudqConfig> {
        let mut config = match &self.config {
            Some(path) => CloudqConfig::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => CloudqConfig::default(),
        };

        if let Commands::Start(args) = &self.command {
            args.apply(&mut config)?;
        }

        config.validate()?;
        Ok(config)
    }
}
