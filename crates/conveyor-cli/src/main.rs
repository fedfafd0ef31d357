//! Conveyor server binary: loads configuration, wires the engine to its
//! phase agents, and serves the gateway until interrupted.

use clap::{Parser, Subcommand};
use conveyor_agent::HttpAgent;
use conveyor_core::{AgentRegistry, Phase, TaskStore};
use conveyor_engine::{
    Autoscaler, AutoscalerConfig, CircuitBreakerConfig, CircuitBreakerRegistry, DeadLetterQueue,
    ExecutorPool, ExecutorPoolConfig, HealthMonitor, HealthThresholds, PoolMetrics, RetryPolicy,
    Scheduler, SchedulerConfig, WorkflowRunner,
};
use conveyor_gateway::{AppState, GatewayServer};
use conveyor_store::MemoryTaskStore;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conveyor", about = "Conveyor — autonomous workflow execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conveyor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine and gateway
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Parse the config file and print the effective settings
    CheckConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct ConveyorConfig {
    server: ServerConfig,
    pool: ExecutorPoolConfig,
    scheduler: SchedulerConfig,
    retry: RetryPolicy,
    circuit_breaker: CircuitBreakerConfig,
    autoscaler: AutoscalerConfig,
    health: HealthThresholds,
    agents: AgentsConfig,
}

impl Default for ConveyorConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            pool: ExecutorPoolConfig::default(),
            scheduler: SchedulerConfig::default(),
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            autoscaler: AutoscalerConfig::default(),
            health: HealthThresholds::default(),
            agents: AgentsConfig::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ServerConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// One HTTP phase agent: the breaker is keyed by `name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AgentEndpoint {
    name: String,
    endpoint: String,
}

impl AgentEndpoint {
    fn localhost(name: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            endpoint: format!("http://127.0.0.1:{port}/execute"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct AgentsConfig {
    test_generation: AgentEndpoint,
    staging_deployment: AgentEndpoint,
    guardian_review: AgentEndpoint,
    validation: AgentEndpoint,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            test_generation: AgentEndpoint::localhost("testgen", 9001),
            staging_deployment: AgentEndpoint::localhost("deployer", 9002),
            guardian_review: AgentEndpoint::localhost("guardian", 9003),
            validation: AgentEndpoint::localhost("validator", 9004),
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<ConveyorConfig> {
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            let config = toml::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Config file not found, using defaults");
            Ok(ConveyorConfig::default())
        }
        Err(e) => Err(anyhow::anyhow!("cannot read {}: {e}", path.display())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Serve { host, port } => serve(config, host, port).await,
        Commands::CheckConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn serve(config: ConveyorConfig, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let host = host.unwrap_or(config.server.host);
    let port = port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;

    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());

    let client = reqwest::Client::new();
    let mut registry = AgentRegistry::new();
    for (phase, agent) in [
        (Phase::TestGeneration, &config.agents.test_generation),
        (Phase::StagingDeployment, &config.agents.staging_deployment),
        (Phase::GuardianReview, &config.agents.guardian_review),
        (Phase::Validation, &config.agents.validation),
    ] {
        info!(phase = %phase, name = %agent.name, endpoint = %agent.endpoint, "Registered agent");
        registry = registry.register(
            phase,
            agent.name.clone(),
            Arc::new(HttpAgent::with_client(client.clone(), agent.endpoint.clone())),
        );
    }

    let metrics = Arc::new(PoolMetrics::new(config.pool.initial_max_concurrent));
    let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker));
    let dlq = Arc::new(DeadLetterQueue::new());

    let runner = Arc::new(WorkflowRunner::new(
        Arc::clone(&store),
        Arc::new(registry),
        Arc::clone(&breakers),
        config.retry,
        Arc::clone(&dlq),
        Arc::clone(&metrics),
        config.pool.agent_timeout(),
    ));
    let pool = Arc::new(ExecutorPool::new(
        config.pool,
        Arc::clone(&store),
        Scheduler::new(config.scheduler),
        runner,
        Arc::clone(&metrics),
    ));
    let health = Arc::new(HealthMonitor::new(
        config.health,
        Arc::clone(&metrics),
        Arc::clone(&breakers),
        Arc::clone(&dlq),
    ));
    let autoscaler = Arc::new(Autoscaler::new(
        config.autoscaler,
        Arc::clone(&metrics),
        Arc::clone(&pool),
    ));

    let pool_handle = tokio::spawn(Arc::clone(&pool).run());
    let health_handle = tokio::spawn(health.clone().run());
    let autoscaler_handle = tokio::spawn(autoscaler.run());

    let state = Arc::new(AppState {
        store,
        metrics,
        health,
        dlq,
    });
    let gateway_handle = tokio::spawn(GatewayServer::serve(addr, state));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining");

    pool.shutdown();
    pool_handle.await??;
    health_handle.abort();
    autoscaler_handle.abort();
    gateway_handle.abort();

    info!("Bye");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let config = load_config(Path::new("/nonexistent/conveyor.toml")).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.agents.guardian_review.name, "guardian");
    }

    #[test]
    fn test_load_config_partial_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[server]
port = 9999

[pool]
initial_max_concurrent = 8

[retry]
max_retries = 5

[agents.validation]
name = "validator-eu"
endpoint = "http://validator.internal/execute"
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.pool.initial_max_concurrent, 8);
        assert_eq!(config.pool.candidate_page_size, 10);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.agents.validation.name, "validator-eu");
        assert_eq!(config.agents.test_generation.name, "testgen");
    }

    #[test]
    fn test_load_config_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "server = 12").unwrap();
        assert!(load_config(file.path()).is_err());
    }
}
