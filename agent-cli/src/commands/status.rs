//! Status command handler

use agent_broker::{Broker, QueueStatus};
use anyhow::{Context, Result};
use colored::*;

use crate::config::Config;

/// Show the depth of the grading queue
pub async fn show_status(broker: &dyn Broker, config: &Config, json: bool) -> Result<()> {
    let status = broker
        .queue_status()
        .await
        .context("Failed to query queue status")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    print_status(config, &status);
    Ok(())
}

fn print_status(config: &Config, status: &QueueStatus) {
    println!(
        "{} Queue {}",
        "▸".cyan(),
        config.topology.queue.bold()
    );
    println!(
        "    Exchange:     {} ({})",
        config.topology.exchange,
        config.topology.routing_key.dimmed()
    );
    println!("    Messages:     {}", colorize_depth(status.messages));
    println!("    Consumers:    {}", colorize_consumers(status.consumers));
}

/// An empty queue is healthy; a backlog is worth a look
fn colorize_depth(messages: u32) -> ColoredString {
    match messages {
        0 => "0".green(),
        n => n.to_string().yellow(),
    }
}

fn colorize_consumers(consumers: u32) -> ColoredString {
    match consumers {
        0 => "0 (no agent is listening)".red(),
        n => n.to_string().green(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_broker::{ConsumerOptions, MemoryBroker, Topology};

    #[tokio::test]
    async fn test_status_reports_queue() {
        let broker = MemoryBroker::new(Topology::default());
        broker.publish(b"one").await.unwrap();
        broker.publish(b"two").await.unwrap();
        let _consumer = broker
            .open_consumer(ConsumerOptions::new("agent-0"))
            .await
            .unwrap();

        let status = broker.queue_status().await.unwrap();
        assert_eq!(status, QueueStatus { messages: 2, consumers: 1 });

        let config = Config {
            broker_url: "memory://".to_string(),
            topology: Topology::default(),
        };
        show_status(&broker, &config, true).await.unwrap();
    }

    #[test]
    fn test_colorize_consumers() {
        colored::control::set_override(false);
        assert_eq!(colorize_consumers(0).to_string(), "0 (no agent is listening)");
        assert_eq!(colorize_consumers(3).to_string(), "3");
    }
}
