//! Agent Runner binary
//!
//! Loads configuration, connects to the broker, starts the worker pool and
//! runs until interrupted.

use agent_broker::Broker;
use agent_core::{
    CommandGraderConfig, FailurePolicy, GraderConfig, HttpGraderConfig, SleepGraderConfig,
};
use agent_runner::config::{Config, DEFAULT_POST_URL};
use agent_runner::lifecycle::{self, ExitReason};
use agent_runner::pool::WorkerPool;
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Grader variants selectable from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum GraderKind {
    Http,
    Sleep,
    Command,
}

#[derive(Debug, Parser)]
#[command(name = "agent-runner")]
#[command(about = "Consumes grading requests from a broker and grades them", long_about = None)]
#[command(version)]
struct Cli {
    /// Number of concurrent workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Grader to use
    #[arg(long, value_enum)]
    grader: Option<GraderKind>,

    /// Endpoint the http grader POSTs to
    #[arg(long)]
    post_url: Option<String>,

    /// Lower bound of the sleep grader delay, in seconds
    #[arg(long)]
    sleep_min: Option<f64>,

    /// Upper bound (exclusive) of the sleep grader delay, in seconds
    #[arg(long)]
    sleep_max: Option<f64>,

    /// Program run by the command grader, followed by its arguments
    #[arg(long, num_args = 1.., value_name = "PROGRAM")]
    grader_command: Option<Vec<String>>,

    /// Timeout for the http or command grader, in seconds
    #[arg(long)]
    grader_timeout: Option<f64>,

    /// Broker URL (amqp://, amqps:// or memory://)
    #[arg(long)]
    broker_url: Option<String>,

    /// Broker username
    #[arg(long)]
    broker_user: Option<String>,

    /// Broker password
    #[arg(long)]
    broker_password: Option<String>,

    /// Queue to consume from
    #[arg(long)]
    queue: Option<String>,

    /// Exchange the queue is bound to
    #[arg(long)]
    exchange: Option<String>,

    /// Routing key binding the queue to the exchange
    #[arg(long)]
    routing_key: Option<String>,

    /// Exchange receiving dead-lettered messages
    #[arg(long)]
    dead_letter_exchange: Option<String>,

    /// Settlement of messages whose grading failed (acknowledge, requeue, dead-letter)
    #[arg(long)]
    failure_policy: Option<FailurePolicy>,

    /// Seconds to wait for in-flight grading on shutdown
    #[arg(long)]
    shutdown_grace: Option<f64>,

    /// Enable debug logging
    #[arg(long)]
    debug_logging: bool,
}

impl Cli {
    /// Applies command-line overrides on top of `config`
    fn apply(self, config: &mut Config) -> Result<()> {
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(url) = self.broker_url {
            config.broker_url = url;
        }
        if let Some(user) = self.broker_user {
            config.broker_username = Some(user);
        }
        if let Some(password) = self.broker_password {
            config.broker_password = Some(password);
        }
        if let Some(queue) = self.queue {
            config.topology.queue = queue;
        }
        if let Some(exchange) = self.exchange {
            config.topology.exchange = exchange;
        }
        if let Some(routing_key) = self.routing_key {
            config.topology.routing_key = routing_key;
        }
        if let Some(dlx) = self.dead_letter_exchange {
            config.topology.dead_letter_exchange = Some(dlx);
        }
        if let Some(policy) = self.failure_policy {
            config.failure_policy = policy;
        }
        if let Some(grace) = self.shutdown_grace {
            config.shutdown_grace =
                Duration::try_from_secs_f64(grace).context("Invalid --shutdown-grace")?;
        }

        let kind = self
            .grader
            .or(self.grader_command.as_ref().map(|_| GraderKind::Command));

        let selected = kind.unwrap_or(match config.grader {
            GraderConfig::Http(_) => GraderKind::Http,
            GraderConfig::Sleep(_) => GraderKind::Sleep,
            GraderConfig::Command(_) => GraderKind::Command,
        });
        if self.post_url.is_some() && selected != GraderKind::Http {
            anyhow::bail!("--post-url only applies to the http grader");
        }
        if (self.sleep_min.is_some() || self.sleep_max.is_some()) && selected != GraderKind::Sleep {
            anyhow::bail!("--sleep-min and --sleep-max only apply to the sleep grader");
        }
        if self.grader_timeout.is_some() && selected == GraderKind::Sleep {
            anyhow::bail!("--grader-timeout does not apply to the sleep grader");
        }

        let mut grader = match (kind, &config.grader) {
            (None, current)
            | (Some(GraderKind::Http), current @ GraderConfig::Http(_))
            | (Some(GraderKind::Sleep), current @ GraderConfig::Sleep(_)) => current.clone(),
            (Some(GraderKind::Http), _) => {
                GraderConfig::Http(HttpGraderConfig::new(DEFAULT_POST_URL))
            }
            (Some(GraderKind::Sleep), _) => GraderConfig::Sleep(SleepGraderConfig::default()),
            (Some(GraderKind::Command), current) => match self.grader_command {
                Some(argv) => {
                    let mut argv = argv.into_iter();
                    let program = argv.next().context("--grader-command needs a program")?;
                    GraderConfig::Command(CommandGraderConfig::new(program, argv.collect()))
                }
                None => match current {
                    GraderConfig::Command(_) => current.clone(),
                    _ => anyhow::bail!("--grader-command is required for the command grader"),
                },
            },
        };

        match &mut grader {
            GraderConfig::Http(http) => {
                if let Some(url) = self.post_url {
                    http.url = url;
                }
                if let Some(timeout) = self.grader_timeout {
                    http.timeout_secs = timeout;
                }
            }
            GraderConfig::Sleep(sleep) => {
                if let Some(min) = self.sleep_min {
                    sleep.min_secs = min;
                }
                if let Some(max) = self.sleep_max {
                    sleep.max_secs = max;
                }
            }
            GraderConfig::Command(command) => {
                if let Some(timeout) = self.grader_timeout {
                    command.timeout_secs = timeout;
                }
            }
        }

        config.grader = grader;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_filter = if cli.debug_logging {
        "agent_runner=debug,agent_broker=debug"
    } else {
        "agent_runner=info,agent_broker=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Agent Runner");

    let config = load_config(cli)?;
    let broker_uri = config.broker_uri()?;
    info!(
        "Loaded configuration: agent_id={}, broker={}, queue={}, workers={}, grader={}",
        config.agent_id,
        agent_broker::redact_url(&broker_uri),
        config.topology.queue,
        config.workers,
        config.grader.kind()
    );

    let broker = connect_with_retry(&config, &broker_uri).await?;
    info!("Connected to {}", broker.describe());

    let pool = WorkerPool::new(Arc::clone(&broker), config.pool_settings())
        .start(&config.grader)
        .context("Failed to start worker pool")?;

    let (reason, report) =
        lifecycle::run_until(pool, lifecycle::shutdown_signal(), config.shutdown_grace).await;

    let summary = report.summary();
    info!(
        "Processed {} message(s) ({} failed) in {:.1}s",
        summary.graded + summary.failed,
        summary.failed,
        report.uptime_secs
    );
    debug!("Final worker report: {}", serde_json::to_string(&report)?);

    if let Err(e) = broker.close().await {
        warn!("Failed to close broker connection: {}", e);
    }

    if reason == ExitReason::WorkersDown {
        anyhow::bail!("all workers are down");
    }
    Ok(())
}

/// Loads configuration from the environment and applies CLI overrides
fn load_config(cli: Cli) -> Result<Config> {
    let mut config = Config::from_env().context("Failed to load configuration from environment")?;
    cli.apply(&mut config)?;
    config.validate()?;
    Ok(config)
}

/// Connects to the broker with retry logic and exponential backoff
///
/// Handles the broker not being reachable yet when the agent starts
/// (common in container environments).
async fn connect_with_retry(config: &Config, uri: &str) -> Result<Arc<dyn Broker>> {
    let policy = config.reconnect;
    let display_url = agent_broker::redact_url(uri);

    let mut attempt = 0;
    let mut delay = policy.initial_delay;

    loop {
        attempt += 1;

        match agent_broker::connect(uri, config.topology.clone()).await {
            Ok(broker) => {
                if attempt > 1 {
                    info!("Connected to broker after {} attempt(s)", attempt);
                }
                return Ok(broker);
            }
            Err(e) => {
                if attempt >= policy.max_attempts {
                    error!(
                        "Failed to connect to broker after {} attempts",
                        policy.max_attempts
                    );
                    return Err(
                        anyhow::Error::new(e).context(format!("Failed to connect to {}", display_url))
                    );
                }

                warn!(
                    "Failed to connect to {} (attempt {}/{}): {}",
                    display_url, attempt, policy.max_attempts, e
                );
                warn!("Retrying in {:?}...", delay);

                tokio::time::sleep(delay).await;
                delay = policy.next_delay(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(args: &[&str]) -> Result<Config> {
        let cli = Cli::try_parse_from(std::iter::once("agent-runner").chain(args.iter().copied()))?;
        let mut config = Config::default();
        cli.apply(&mut config)?;
        Ok(config)
    }

    #[test]
    fn test_no_flags_keep_config() {
        let config = apply(&[]).unwrap();
        assert_eq!(config.workers, 10);
        assert_eq!(config.grader, GraderConfig::default());
    }

    #[test]
    fn test_workers_and_broker_flags() {
        let config = apply(&[
            "-w",
            "4",
            "--broker-url",
            "memory://",
            "--queue",
            "submissions",
            "--failure-policy",
            "requeue",
            "--shutdown-grace",
            "2.5",
        ])
        .unwrap();

        assert_eq!(config.workers, 4);
        assert_eq!(config.broker_url, "memory://");
        assert_eq!(config.topology.queue, "submissions");
        assert_eq!(config.failure_policy, FailurePolicy::Requeue);
        assert_eq!(config.shutdown_grace, Duration::from_millis(2500));
    }

    #[test]
    fn test_sleep_grader_flags() {
        let config = apply(&["--grader", "sleep", "--sleep-min", "0.1", "--sleep-max", "0.5"]).unwrap();
        assert_eq!(
            config.grader,
            GraderConfig::Sleep(SleepGraderConfig::new(0.1, 0.5))
        );
    }

    #[test]
    fn test_post_url_overrides_http_grader() {
        let config = apply(&["--post-url", "http://localhost:1710/grade"]).unwrap();
        match config.grader {
            GraderConfig::Http(http) => assert_eq!(http.url, "http://localhost:1710/grade"),
            other => panic!("unexpected grader: {:?}", other),
        }
    }

    #[test]
    fn test_grader_command_implies_command_grader() {
        let config = apply(&["--grader-command", "python3", "grade.py", "--grader-timeout", "5"])
            .unwrap();
        match config.grader {
            GraderConfig::Command(command) => {
                assert_eq!(command.program, "python3");
                assert_eq!(command.args, vec!["grade.py".to_string()]);
                assert_eq!(command.timeout_secs, 5.0);
            }
            other => panic!("unexpected grader: {:?}", other),
        }
    }

    #[test]
    fn test_command_grader_requires_program() {
        assert!(apply(&["--grader", "command"]).is_err());
    }

    #[test]
    fn test_flags_for_another_grader_rejected() {
        assert!(apply(&["--grader", "sleep", "--post-url", "http://localhost:1710/"]).is_err());
        assert!(apply(&["--sleep-min", "0.1"]).is_err());
        assert!(apply(&["--grader-command", "cat", "--sleep-max", "1"]).is_err());
        assert!(apply(&["--grader", "sleep", "--grader-timeout", "5"]).is_err());
        assert!(apply(&["--grader", "http", "--grader-timeout", "5"]).is_ok());
    }

    #[test]
    fn test_invalid_flags_rejected() {
        assert!(apply(&["--failure-policy", "shrug"]).is_err());
        assert!(apply(&["--grader", "telepathy"]).is_err());
    }
}
