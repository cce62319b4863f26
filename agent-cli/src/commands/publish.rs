//! Publish command handler
//!
//! Enqueues a batch of test grading requests, like a course site would.

use agent_broker::Broker;
use anyhow::{Context, Result};
use colored::*;

/// Publish `count` messages rendered from `template`
pub async fn publish_messages(broker: &dyn Broker, count: u32, template: &str) -> Result<()> {
    println!(
        "{}",
        format!("Publishing {} message(s) to {}", count, broker.describe()).bold()
    );

    for i in 0..count {
        let body = render(template, i);
        broker
            .publish(body.as_bytes())
            .await
            .with_context(|| format!("Failed to publish message {}", i))?;
    }

    println!("{} Published {} message(s)", "✓".green(), count);
    Ok(())
}

/// Substitutes the message index into the template
fn render(template: &str, index: u32) -> String {
    template.replace("{i}", &index.to_string())
}
