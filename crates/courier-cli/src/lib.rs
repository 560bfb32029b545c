//! # Courier CLI
//!
//! Command-line administration for Courier durable queues.
//!
//! This module provides CLI commands for:
//! - Provisioning, verifying, purging and removing queue storage
//! - Inspecting ready and scheduled counts per physical store
//! - Listing, replaying and deleting dead-lettered envelopes
//! - Showing the resolved transport configuration

use clap::{Parser, Subcommand};
use courier_runtime::database::{BrokerQueue, DatabaseQueue, DatabaseTransport, QueueStore};
use courier_runtime::dead_letter::DeadLetterStore;
use courier_runtime::{
    ConfigurationError, EnvelopeId, JsonEnvelopeSerializer, LoggingConfig, TransportError,
    TransportSettings,
};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// ============================================================================
// CLI Structure
// ============================================================================

/// Courier CLI - Administration of durable message queues
#[derive(Parser)]
#[command(name = "courier")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Administration of Courier durable queues")]
#[command(
    long_about = "Courier moves envelopes between endpoints with at-least-once delivery. This tool manages the database storage behind its queues."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "COURIER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level, overrides `logging.level`
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the queue tables in every store
    Setup {
        /// Queue name or `postgresql://` endpoint URI
        queue: String,
    },

    /// Drop the queue tables from every store
    Teardown {
        /// Queue name or `postgresql://` endpoint URI
        queue: String,
    },

    /// Delete every ready and scheduled envelope of the queue
    Purge {
        /// Queue name or `postgresql://` endpoint URI
        queue: String,
    },

    /// Verify the queue tables without changing them
    Check {
        /// Queue name or `postgresql://` endpoint URI
        queue: String,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show ready and scheduled counts per store
    Stats {
        /// Queue name or `postgresql://` endpoint URI
        queue: String,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Dead letter management commands
    DeadLetters {
        #[command(subcommand)]
        action: DeadLetterCommands,
    },

    /// Validate configuration
    Config {
        /// Show resolved configuration
        #[arg(short, long)]
        show: bool,

        /// Output format for configuration
        #[arg(short = 'f', long, default_value = "yaml")]
        format: ConfigFormat,
    },
}

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON output
    Json,
    /// YAML output
    Yaml,
}

/// Configuration format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// JSON format
    Json,
    /// TOML format
    Toml,
}

// ============================================================================
// Dead Letter Commands
// ============================================================================

/// Dead letter subcommands; each applies to every known store
#[derive(Subcommand, Debug)]
pub enum DeadLetterCommands {
    /// List the oldest dead letters
    List {
        /// Maximum number of dead letters per store
        #[arg(short, long, default_value = "50")]
        limit: usize,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Move every replayable dead letter back to its queue
    Replay,

    /// Flag dead letters for replay
    MarkReplayable {
        /// Envelope ids
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Delete dead letters
    Delete {
        /// Envelope ids
        #[arg(required = true)]
        ids: Vec<String>,

        /// Confirm the deletion
        #[arg(short, long)]
        yes: bool,
    },
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Command failed: {message}")]
    CommandFailed { message: String },

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Output error: {0}")]
    Output(#[from] anyhow::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Transport(TransportError::ConfigurationError(_)) => 1,
            Self::Transport(_) => 2,
            Self::CommandFailed { .. } => 3,
            Self::InvalidArgument { .. } => 4,
            Self::Io(_) => 5,
            Self::Output(_) => 6,
        }
    }
}

// ============================================================================
// Output Types
// ============================================================================

/// Dead letter as shown to operators; the body is omitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetterSummary {
    pub store: String,
    pub id: String,
    pub queue_name: String,
    pub message_type: String,
    pub exception_type: String,
    pub exception_message: String,
    pub sent_at: chrono::DateTime<chrono::Utc>,
    pub replayable: bool,
    pub expires: Option<chrono::DateTime<chrono::Utc>>,
}

fn render<T: Serialize>(value: &T, format: OutputFormat) -> anyhow::Result<String> {
    Ok(match format {
        OutputFormat::Json | OutputFormat::Text => serde_json::to_string_pretty(value)?,
        OutputFormat::Yaml => serde_yaml::to_string(value)?,
    })
}

/// Render settings with the connection string masked
pub fn render_settings(
    settings: &TransportSettings,
    format: ConfigFormat,
) -> anyhow::Result<String> {
    let mut settings = settings.clone();
    if let Some(postgres) = settings.postgres.as_mut() {
        if !postgres.connection_string.is_empty() {
            postgres.connection_string = "********".to_string();
        }
    }

    Ok(match format {
        ConfigFormat::Yaml => serde_yaml::to_string(&settings)?,
        ConfigFormat::Json => serde_json::to_string_pretty(&settings)?,
        ConfigFormat::Toml => toml::to_string_pretty(&settings)?,
    })
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    let mut settings = TransportSettings::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level.clone() {
        settings.logging.level = level;
    }
    settings.logging.json_format |= cli.json_logs;

    initialize_logging(&settings.logging);

    let mut stdout = std::io::stdout().lock();

    if let Commands::Config { show, format } = cli.command {
        return execute_config_command(&settings, show, format, &mut stdout);
    }

    if settings.postgres.is_none() {
        return Err(CliError::Configuration(ConfigurationError::Missing {
            key: "postgres.connection_string".to_string(),
        }));
    }

    let transport = DatabaseTransport::connect(Arc::new(settings)).await?;
    execute_command(cli.command, &transport, &mut stdout).await
}

/// Initialize logging on stderr so command output stays machine-readable
fn initialize_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(filter);

    // A subscriber may already be installed
    let _ = if logging.json_format {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Resolve a queue name or endpoint URI to its endpoint
pub fn resolve_queue(
    transport: &DatabaseTransport,
    queue: &str,
) -> Result<Arc<DatabaseQueue>, CliError> {
    if queue.contains("://") {
        let uri = courier_runtime::EndpointUri::parse(queue)?;
        Ok(transport.find_endpoint(&uri)?)
    } else {
        Ok(transport.queue(queue)?)
    }
}

fn parse_ids(ids: &[String]) -> Result<Vec<EnvelopeId>, CliError> {
    ids.iter()
        .map(|id| {
            EnvelopeId::from_str(id).map_err(|e| CliError::InvalidArgument {
                arg: id.clone(),
                message: e.to_string(),
            })
        })
        .collect()
}

/// Execute a command that needs the transport
pub async fn execute_command(
    command: Commands,
    transport: &DatabaseTransport,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    match command {
        Commands::Setup { queue } => {
            let queue = resolve_queue(transport, &queue)?;
            info!(queue = %queue.table().queue_name, "Setting up queue");
            queue.setup().await?;
            writeln!(out, "Queue '{}' is set up", queue.table().queue_name)?;
            Ok(())
        }
        Commands::Teardown { queue } => {
            let queue = resolve_queue(transport, &queue)?;
            info!(queue = %queue.table().queue_name, "Tearing down queue");
            queue.teardown().await?;
            writeln!(out, "Queue '{}' is removed", queue.table().queue_name)?;
            Ok(())
        }
        Commands::Purge { queue } => {
            let queue = resolve_queue(transport, &queue)?;
            info!(queue = %queue.table().queue_name, "Purging queue");
            queue.purge().await?;
            writeln!(out, "Queue '{}' is empty", queue.table().queue_name)?;
            Ok(())
        }
        Commands::Check { queue, format } => execute_check_command(transport, &queue, format, out).await,
        Commands::Stats { queue, format } => execute_stats_command(transport, &queue, format, out).await,
        Commands::DeadLetters { action } => execute_dead_letter_command(transport, action, out).await,
        Commands::Config { show, format } => {
            execute_config_command(transport.settings(), show, format, out)
        }
    }
}

async fn execute_check_command(
    transport: &DatabaseTransport,
    queue: &str,
    format: OutputFormat,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let queue = resolve_queue(transport, queue)?;
    let check = queue.check().await?;

    match format {
        OutputFormat::Text => {
            writeln!(out, "ready table:     {}", present(check.ready_table_exists))?;
            writeln!(out, "scheduled table: {}", present(check.scheduled_table_exists))?;
            for column in &check.missing_columns {
                writeln!(out, "missing column:  {column}")?;
            }
        }
        _ => writeln!(out, "{}", render(&check, format)?)?,
    }

    if check.is_ok() {
        Ok(())
    } else {
        Err(CliError::CommandFailed {
            message: format!("storage of queue '{}' is incomplete", queue.table().queue_name),
        })
    }
}

fn present(exists: bool) -> &'static str {
    if exists {
        "present"
    } else {
        "missing"
    }
}

async fn execute_stats_command(
    transport: &DatabaseTransport,
    queue: &str,
    format: OutputFormat,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let queue = resolve_queue(transport, queue)?;
    let attributes = queue.attributes().await?;

    match format {
        OutputFormat::Text => {
            writeln!(out, "{:<32} {:>10} {:>10}", "STORE", "READY", "SCHEDULED")?;
            for attribute in &attributes {
                writeln!(
                    out,
                    "{:<32} {:>10} {:>10}",
                    attribute.store, attribute.count, attribute.scheduled_count
                )?;
            }
        }
        _ => writeln!(out, "{}", render(&attributes, format)?)?,
    }

    Ok(())
}

async fn execute_dead_letter_command(
    transport: &DatabaseTransport,
    action: DeadLetterCommands,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let stores = transport.stores().all().await?;

    match action {
        DeadLetterCommands::List { limit, format } => {
            let mut summaries = Vec::new();
            for store in &stores {
                for record in store.dead_letters(limit).await? {
                    summaries.push(DeadLetterSummary {
                        store: store.identifier().to_string(),
                        id: record.id.to_string(),
                        queue_name: record.queue_name,
                        message_type: record.message_type,
                        exception_type: record.exception_type,
                        exception_message: record.exception_message,
                        sent_at: record.sent_at,
                        replayable: record.replayable,
                        expires: record.expires,
                    });
                }
            }
            debug!(count = summaries.len(), "Listed dead letters");

            match format {
                OutputFormat::Text => {
                    for summary in &summaries {
                        writeln!(
                            out,
                            "{} {} {} {}{}: {}",
                            summary.id,
                            summary.queue_name,
                            summary.message_type,
                            summary.exception_type,
                            if summary.replayable { " [replayable]" } else { "" },
                            summary.exception_message
                        )?;
                    }
                }
                _ => writeln!(out, "{}", render(&summaries, format)?)?,
            }
            Ok(())
        }
        DeadLetterCommands::Replay => {
            let mut replayed = 0;
            for store in &stores {
                replayed += store.replay_dead_letters(&JsonEnvelopeSerializer).await?;
            }
            info!(replayed, "Replayed dead letters");
            writeln!(out, "Replayed {replayed} dead letter(s)")?;
            Ok(())
        }
        DeadLetterCommands::MarkReplayable { ids } => {
            let ids = parse_ids(&ids)?;
            let mut marked = 0;
            for store in &stores {
                marked += store.mark_replayable(&ids).await?;
            }
            writeln!(out, "Marked {marked} dead letter(s) as replayable")?;
            Ok(())
        }
        DeadLetterCommands::Delete { ids, yes } => {
            if !yes {
                return Err(CliError::InvalidArgument {
                    arg: "--yes".to_string(),
                    message: "deleting dead letters requires confirmation".to_string(),
                });
            }
            let ids = parse_ids(&ids)?;
            let mut deleted = 0;
            for store in &stores {
                deleted += store.delete_dead_letters(&ids).await?;
            }
            info!(deleted, "Deleted dead letters");
            writeln!(out, "Deleted {deleted} dead letter(s)")?;
            Ok(())
        }
    }
}

/// Execute config command; settings were validated when loaded
pub fn execute_config_command(
    settings: &TransportSettings,
    show: bool,
    format: ConfigFormat,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    if show {
        writeln!(out, "{}", render_settings(settings, format)?)?;
    } else {
        writeln!(out, "Configuration is valid")?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
