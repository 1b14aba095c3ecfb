use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relay_dispatch::{
    completion::ScriptFile,
    interpreter::OutputInterpreter,
    prelude::*,
    unit::Trigger,
};
use serde_json::json;
use shared_event_bus::FileEventPublisher;
use shared_logging::LogLevel;
use tokio::runtime::Runtime;

#[derive(Parser, Debug)]
#[command(name = "relay", version, about = "Decision-unit dispatch driver")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Lists configured units in candidate order.
    Units {
        #[arg(long)]
        config: PathBuf,
        /// Only units bound to this trigger.
        #[arg(long)]
        trigger: Option<String>,
    },
    /// Interprets raw completion text; `-` reads stdin.
    Interpret {
        #[arg(long, default_value = "-")]
        file: PathBuf,
    },
    /// Dispatches one event against scripted completions and an in-memory store.
    Dispatch(DispatchArgs),
}

#[derive(Parser, Debug)]
struct DispatchArgs {
    #[arg(long)]
    config: PathBuf,
    /// JSON dispatch context.
    #[arg(long)]
    context: PathBuf,
    /// JSON script of completion responses.
    #[arg(long)]
    responses: PathBuf,
    /// Dispatch directly to this unit.
    #[arg(long)]
    unit: Option<String>,
    #[arg(long)]
    log_file: Option<PathBuf>,
    #[arg(long)]
    event_log: Option<PathBuf>,
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Units { config, trigger } => handle_units(&config, trigger.as_deref()),
        Commands::Interpret { file } => handle_interpret(&file),
        Commands::Dispatch(args) => {
            let runtime = Runtime::new().context("starting runtime")?;
            runtime.block_on(handle_dispatch(args))
        }
    }
}

fn handle_units(path: &Path, trigger: Option<&str>) -> Result<()> {
    let config = RelayConfig::load(path)?;
    let registry = config.build_registry()?;
    let units = match trigger {
        Some(raw) => registry.find_by_trigger(&Trigger::from(raw)),
        None => registry.all_units(),
    };
    for unit in units {
        let triggers: Vec<&str> = unit.triggers.iter().map(Trigger::label).collect();
        println!(
            "{} | {:?} | priority {} | threshold {:.2} | {} | [{}]",
            unit.name,
            unit.tier,
            unit.priority,
            unit.confidence_threshold,
            if unit.enabled { "enabled" } else { "disabled" },
            triggers.join(", ")
        );
    }
    Ok(())
}

fn handle_interpret(path: &Path) -> Result<()> {
    let raw = read_input(path)?;
    let interpretation = OutputInterpreter::default().interpret_detailed(&raw);
    let report = json!({
        "output": interpretation.output,
        "attempts": interpretation.attempts,
        "used_fallback": interpretation.used_fallback,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn handle_dispatch(args: DispatchArgs) -> Result<()> {
    let config = RelayConfig::load(&args.config)?;
    let context: DispatchContext = serde_json::from_str(&read_input(&args.context)?)
        .with_context(|| format!("parsing context {}", args.context.display()))?;
    let script: ScriptFile = serde_json::from_str(&read_input(&args.responses)?)
        .with_context(|| format!("parsing responses {}", args.responses.display()))?;

    let timeouts = config.engine_timeouts();
    let safety = Arc::new(SafetyGate::new(config.safety_settings()));
    let engine = ExecutionEngine::new(
        Arc::new(config.build_renderer()),
        Arc::new(ScriptedCompletionService::from_script(script)),
        Arc::clone(&safety),
    )
    .with_completion_timeout(timeouts.completion);
    let store = Arc::new(MemoryTargetStore::new());
    let executor = ActionExecutor::new(Arc::clone(&store) as _).with_action_timeout(timeouts.action);
    let limiter = Arc::new(RateLimiter::new(config.limiter_settings(), config.proactive_rules()));

    let mut builder = Dispatcher::builder(
        Arc::new(config.build_registry()?),
        Arc::new(engine),
        Arc::new(executor),
    )
    .limiter(limiter)
    .safety(safety);
    if args.log_file.is_some() || args.event_log.is_some() {
        let min_level = LogLevel::parse(&args.log_level)
            .with_context(|| format!("unknown log level '{}'", args.log_level))?;
        let mut telemetry = DispatchTelemetry::builder("relay").min_level(min_level);
        if let Some(path) = &args.log_file {
            telemetry = telemetry.log_path(path);
        }
        if let Some(path) = &args.event_log {
            telemetry = telemetry.event_publisher(Arc::new(FileEventPublisher::new(path)?));
        }
        builder = builder.telemetry(Arc::new(telemetry.build()?));
    }
    let dispatcher = builder.build();

    let outcome = match &args.unit {
        Some(unit) => dispatcher.dispatch_to(unit, &context).await?,
        None => dispatcher.dispatch(&context).await,
    };
    let report = json!({
        "dispatch_id": context.dispatch_id,
        "outcome": outcome,
        "messages": store.messages(),
        "notifications": store.notifications(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn read_input(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf).context("reading stdin")?;
        return Ok(buf);
    }
    fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}
