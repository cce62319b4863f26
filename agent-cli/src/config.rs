//! Configuration module
//!
//! Handles CLI configuration: where the broker is and which queue to use.

use agent_broker::Topology;

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Broker URL, possibly carrying credentials
    pub broker_url: String,

    /// Exchange, queue and routing key shared with the agents
    pub topology: Topology,
}
