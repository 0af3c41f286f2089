/// Loopway command line runner
///
/// Loads a serialized workflow and either executes it with the built-in Lua
/// block executor or prints how its loops will be scheduled.

use anyhow::Result;
use clap::{Parser, Subcommand};
use loopway::{
    config::{Config, LoggingConfig},
    runtime::{ExecutionEngine, LuaBlockExecutor, LuaSandbox},
    workflow::WorkflowStorage,
};
use serde_json::json;
use std::{path::PathBuf, sync::Arc};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "loopway", version, about = "Run block workflows with loop regions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute a workflow file and print the collected outputs as JSON
    Run {
        /// Path to the serialized workflow (JSON)
        workflow: PathBuf,
        /// Bound for loops without `iterations`
        #[arg(long)]
        default_iterations: Option<usize>,
        /// Maximum scheduling passes
        #[arg(long)]
        max_passes: Option<usize>,
    },
    /// Print execution order, entry blocks and loop structure of a workflow file
    Inspect {
        /// Path to the serialized workflow (JSON)
        workflow: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::default();
    init_tracing(&config.logging);

    match cli.command {
        Command::Run {
            workflow,
            default_iterations,
            max_passes,
        } => {
            if let Some(n) = default_iterations {
                config.engine.default_iterations = n;
            }
            if let Some(n) = max_passes {
                config.engine.max_passes = n;
            }

            let workflow = WorkflowStorage::read_file(&workflow).await?;
            let executor = LuaBlockExecutor::new(LuaSandbox::new(config.engine.lua_memory_limit));
            let engine = ExecutionEngine::new(Arc::new(executor), config.engine.clone());

            let result = engine.execute_workflow(workflow).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Inspect { workflow } => {
            let workflow = WorkflowStorage::read_file(&workflow).await?;
            let engine = ExecutionEngine::new(Arc::new(LuaBlockExecutor::default()), config.engine.clone());
            let loop_manager = engine.loop_manager_for(&workflow);
            let plan = engine.build_plan(&workflow, &loop_manager)?;

            let loops: Vec<_> = loop_manager
                .loops()
                .iter()
                .map(|(id, lp)| {
                    json!({
                        "id": id,
                        "type": lp.loop_type,
                        "nodes": lp.nodes,
                        "iterations": loop_manager.get_iterations(id),
                        "entry": loop_manager.find_entry_block(lp, &workflow.connections),
                    })
                })
                .collect();
            let feedback: Vec<_> = workflow
                .connections
                .iter()
                .filter(|c| loop_manager.is_feedback_path(c, &workflow.blocks))
                .map(|c| json!({ "source": c.source, "target": c.target }))
                .collect();

            let report = json!({
                "workflow": workflow.id,
                "order": plan.order,
                "entryBlocks": plan.entry_blocks,
                "loops": loops,
                "feedbackPaths": feedback,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

/// Install the fmt subscriber; logs go to stderr so stdout stays valid JSON
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();
}
