//! Reflex CLI - run tasks through the Reflex kernel from the shell
//!
//! # Quick Start
//!
//! ```bash
//! # Gate and execute a task on the native engine
//! reflex run "echo" --engine native
//!
//! # Seed the stabilizer, then replay
//! reflex run "what is six times seven" --flags '{"stabilizer_seed": true, "stabilizer_response": "42"}'
//!
//! # Classify a blocker explanation
//! reflex classify "missing skill: transcribe"
//! ```
//!
//! Logging goes to stderr and honours `RUST_LOG`; results are printed to
//! stdout as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use reflex_kernel::{EchoSkill, KernelConfig, KernelDeps, KernelOutcome, ProtocolParser, ReflexKernel, TaskRequest};

/// Reflex - gated task intake with self-provisioning capsule execution
#[derive(Parser)]
#[command(name = "reflex")]
#[command(author = "Reflex Contributors")]
#[command(version)]
#[command(about = "Run tasks through the Reflex gate pipeline and capsule engines", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// JSON kernel configuration (REFLEX_* environment variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Engine for top-level capsules: legacy, native or governed
    #[arg(short, long, global = true)]
    engine: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one task through the pipeline and the selected engine
    Run {
        /// Task text
        task: String,

        /// Context object as JSON
        #[arg(long, default_value = "{}")]
        context: String,

        /// Flags object as JSON
        #[arg(long, default_value = "{}")]
        flags: String,

        /// Autonomy level
        #[arg(short, long, default_value = "L0")]
        level: String,

        /// Reuse a capsule id
        #[arg(long)]
        capsule_id: Option<String>,
    },

    /// Run a JSON array of task requests concurrently
    Batch {
        /// File holding the requests
        path: PathBuf,
    },

    /// Show engine health and configured gates
    Health,

    /// Classify a blocker explanation into a need
    Classify {
        /// Explanation text
        text: String,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Classify { text } => {
            let need = ProtocolParser::new().classify(&text);
            print_json(&need)?;
        }
        Commands::Config => {
            let config = load_config(cli.config.as_ref(), cli.engine.as_deref())?;
            print_json(&config)?;
        }
        Commands::Health => {
            let kernel = build_kernel(cli.config.as_ref(), cli.engine.as_deref())?;
            print_json(&kernel.health().await)?;
        }
        Commands::Run {
            task,
            context,
            flags,
            level,
            capsule_id,
        } => {
            let kernel = build_kernel(cli.config.as_ref(), cli.engine.as_deref())?;
            let mut request = TaskRequest::new(task)
                .with_context(parse_object("--context", &context)?)
                .with_flags(parse_object("--flags", &flags)?)
                .with_level(level);
            if let Some(id) = capsule_id {
                request = request.with_capsule_id(id);
            }

            let outcome = kernel.handle(request).await;
            print_json(&outcome)?;
            exit_on_failure(&[outcome]);
        }
        Commands::Batch { path } => {
            let kernel = Arc::new(build_kernel(cli.config.as_ref(), cli.engine.as_deref())?);
            let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            let requests: Vec<TaskRequest> =
                serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;

            let outcomes = kernel.handle_batch(requests).await;
            print_json(&outcomes)?;
            exit_on_failure(&outcomes);
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>, engine: Option<&str>) -> anyhow::Result<KernelConfig> {
    let mut config = KernelConfig::load(path.map(PathBuf::as_path)).context("loading kernel configuration")?;
    if let Some(engine) = engine {
        config.engine_mode = engine.to_string();
    }
    debug!(engine = %config.engine_mode, gates = ?config.gates, "configuration loaded");
    Ok(config)
}

fn build_kernel(path: Option<&PathBuf>, engine: Option<&str>) -> anyhow::Result<ReflexKernel> {
    let config = load_config(path, engine)?;
    let deps = KernelDeps {
        skills: vec![Arc::new(EchoSkill)],
        ..KernelDeps::default()
    };
    ReflexKernel::from_config(config, deps).context("building kernel")
}

fn parse_object(flag: &str, raw: &str) -> anyhow::Result<Value> {
    let value: Value = serde_json::from_str(raw).with_context(|| format!("{} is not valid JSON", flag))?;
    if !value.is_object() {
        anyhow::bail!("{} must be a JSON object", flag);
    }
    Ok(value)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Non-zero exit when any capsule failed or a worker aborted; denials are answers, not failures
fn exit_on_failure(outcomes: &[KernelOutcome]) {
    let failed = outcomes.iter().any(|outcome| match outcome {
        KernelOutcome::Executed { result, .. } => !result.ok,
        KernelOutcome::Aborted { .. } => true,
        _ => false,
    });
    if failed {
        std::process::exit(1);
    }
}
