//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod publish;
mod status;

use anyhow::{Context, Result};
use clap::Subcommand;
use std::sync::Arc;

use crate::config::Config;
use agent_broker::Broker;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Publish test grading requests
    Publish {
        /// Number of messages to publish
        #[arg(short = 'n', long, default_value_t = 500)]
        count: u32,

        /// Message body; `{i}` is replaced by the message index
        #[arg(short, long, default_value = "Hello world {i}!")]
        template: String,
    },
    /// Show queue depth and consumer count
    Status {
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
///
/// # Arguments
/// * `command` - The command to execute
/// * `config` - The CLI configuration
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    let broker = connect(config).await?;

    let result = match command {
        Commands::Publish { count, template } => {
            publish::publish_messages(broker.as_ref(), count, &template).await
        }
        Commands::Status { json } => status::show_status(broker.as_ref(), config, json).await,
    };

    broker.close().await.ok();
    result
}

async fn connect(config: &Config) -> Result<Arc<dyn Broker>> {
    agent_broker::connect(&config.broker_url, config.topology.clone())
        .await
        .with_context(|| {
            format!(
                "Failed to connect to {}",
                agent_broker::redact_url(&config.broker_url)
            )
        })
}
