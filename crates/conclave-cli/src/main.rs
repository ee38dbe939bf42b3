use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use conclave_core::continuation::{IterationState, ToolOutcome};
use conclave_core::{AgentRegistry, ChannelRouter, ContinuationEngine, ContinuationPolicy};

mod config;

use config::ConclaveConfig;

#[derive(Parser)]
#[command(name = "conclave")]
#[command(version)]
#[command(about = "Conclave: concurrent agents sharing one session")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config directory and default config
    Init,

    /// Show current configuration
    Config,

    /// List configured agents
    Agents,

    /// Split model output into channel messages and print them as JSON
    Route {
        /// Raw model output
        text: String,

        /// Treat the text as a streaming fragment
        #[arg(long)]
        partial: bool,

        /// Agent id stamped on the messages
        #[arg(long, default_value = "cli")]
        agent: String,
    },

    /// Evaluate whether a turn would continue after this output
    Continue {
        /// Model output of the latest iteration
        text: String,

        /// A tool ran during the iteration
        #[arg(long)]
        tool_ran: bool,

        /// Iterations executed so far, including this one
        #[arg(long, default_value_t = 1)]
        iteration: u32,

        /// Override the configured continuation policy
        #[arg(long)]
        policy: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => cmd_init(),
        Commands::Config => cmd_config(&cli.config),
        Commands::Agents => cmd_agents(&cli.config),
        Commands::Route { text, partial, agent } => cmd_route(&text, partial, &agent),
        Commands::Continue {
            text,
            tool_ran,
            iteration,
            policy,
        } => cmd_continue(&cli.config, &text, tool_ran, iteration, policy.as_deref()),
    }
}

fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        std::fs::write(&config_path, config::DEFAULT_CONFIG)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        info!("Created default config at {}", config_path.display());
    }

    println!("Conclave initialized at {}", config_dir.display());
    println!("Edit {} to configure your agents.", config_path.display());
    Ok(())
}

/// Config from `--config`, the default location, or the built-in defaults
fn load_config(path: &Option<PathBuf>) -> Result<ConclaveConfig> {
    if path.is_none() && !config::config_dir().join("config.toml").exists() {
        debug!("No config file found; using built-in defaults");
        return ConclaveConfig::parse(config::DEFAULT_CONFIG);
    }
    ConclaveConfig::load(path)
}

fn cmd_config(path: &Option<PathBuf>) -> Result<()> {
    let cfg = load_config(path)?;
    let runtime = cfg.runtime_config();

    println!("Conclave Configuration");
    println!("──────────────────────");
    println!("  Max iterations:      {}", runtime.max_iterations);
    println!("  Continuation policy: {}", runtime.continuation_policy);
    println!("  Stop grace:          {:?}", runtime.stop_grace);
    println!("  Result history:      {}", runtime.result_history);
    println!("  Max tool output:     {} bytes", runtime.max_tool_output);
    println!("  Stream partials:     {}", runtime.stream_partials);
    println!(
        "  Default agent:       {}",
        cfg.session.default_agent.as_deref().unwrap_or("(none)")
    );
    println!("  Event capacity:      {}", cfg.gateway.event_capacity);
    println!("  Agents:              {}", cfg.agents.len());
    Ok(())
}

fn cmd_agents(path: &Option<PathBuf>) -> Result<()> {
    let cfg = load_config(path)?;
    let registry = cfg.registry();
    let default_agent = cfg.session.default_agent.as_deref();

    for profile in registry.list() {
        let marker = if Some(profile.id.as_str()) == default_agent { "*" } else { " " };
        println!("{} {:<12} {}", marker, profile.id, profile.name);
        if !profile.description.is_empty() {
            println!("    {}", profile.description);
        }
        if let Some(model) = &profile.model {
            println!("    model: {}", model);
        }
        if !profile.handoff_keywords.is_empty() {
            println!("    handoff: {}", profile.handoff_keywords.join(", "));
        }
        if !profile.denied_tools.is_empty() {
            println!("    denied tools: {}", profile.denied_tools.join(", "));
        }
    }
    Ok(())
}

fn cmd_route(text: &str, partial: bool, agent: &str) -> Result<()> {
    let router = ChannelRouter::new(agent);
    let messages = router.route_response(text, partial);
    debug!("Routed {} message(s)", messages.len());
    println!("{}", serde_json::to_string_pretty(&messages)?);
    Ok(())
}

fn cmd_continue(
    path: &Option<PathBuf>,
    text: &str,
    tool_ran: bool,
    iteration: u32,
    policy: Option<&str>,
) -> Result<()> {
    let cfg = load_config(path)?;
    let runtime = cfg.runtime_config();
    let policy = match policy {
        Some(p) => ContinuationPolicy::from_string(p).with_context(|| format!("Unknown continuation policy '{}'", p))?,
        None => runtime.continuation_policy,
    };
    let engine = ContinuationEngine::new(runtime.max_iterations, policy);

    let mut state = IterationState::new();
    for _ in 0..iteration {
        state.record_iteration();
    }
    let tool_results: Vec<ToolOutcome> = if tool_ran {
        vec![ToolOutcome {
            call_id: "cli".to_string(),
            name: "cli".to_string(),
            output: String::new(),
            is_error: false,
        }]
    } else {
        Vec::new()
    };

    let decision = engine.evaluate(text, &tool_results, &state);
    if decision.is_forced_stop() {
        warn!("Iteration {} hit the ceiling of {}", iteration, engine.max_iterations());
    }
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}
