use agent_sessions::{
    load_config, AgentType, BackendFactory, CommandModelClient, Orchestrator, OrchestratorConfig,
    SpawnOptions,
};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

/// Spawn one supervised agent session and stream its lifecycle events.
#[derive(Parser)]
#[command(name = "agent-sessions", version, about)]
struct Cli {
    /// Path to a YAML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Agent type: shell, claude, aider, gemini, codex
    #[arg(short, long, default_value = "shell")]
    agent: String,

    /// Working directory for the session
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Task to send once the session is ready
    #[arg(short, long)]
    task: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => OrchestratorConfig::default(),
    };
    let agent_type: AgentType = cli.agent.parse()?;

    let backend = BackendFactory::create(&config).await?;
    let model = Arc::new(CommandModelClient::new(&config.model_command)?);
    let orchestrator = Orchestrator::new(backend, model, config)?;

    orchestrator
        .on_session_event(Arc::new(|event| {
            match event.name.as_str() {
                // raw output is streamed separately below
                "output" => {}
                _ => println!("[{}] {} {}", event.session_id, event.name, event.data),
            }
            Ok(())
        }))
        .await;

    orchestrator.start().await?;
    println!(
        "🎯 agent-sessions started ({} backend)",
        orchestrator.backend_kind()
    );
    println!("🛑 Press Ctrl+C to stop");

    let session = orchestrator
        .spawn_session(SpawnOptions {
            working_dir: cli.cwd,
            initial_task: cli.task,
            ..SpawnOptions::new(agent_type)
        })
        .await
        .context("Failed to spawn session")?;
    println!("🚀 Session {} ({}) spawned", session.id, session.agent_type);

    let _output = orchestrator
        .subscribe_to_output(
            &session.id,
            Arc::new(|chunk| {
                print!("{chunk}");
            }),
        )
        .await?;

    signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c")?;
    println!("\n🛑 Received Ctrl+C, shutting down...");

    let metrics = orchestrator.agent_metrics().await;
    for (agent, m) in &metrics {
        println!(
            "📊 {agent}: spawned={} completed={} (fast={} classified={}) stalls={} avg={}ms",
            m.spawned,
            m.completed,
            m.completed_fast_path,
            m.completed_via_classifier,
            m.stalls,
            m.avg_completion_ms
        );
    }

    orchestrator.shutdown().await;
    Ok(())
}
