use chrono::Utc;
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use skirmish_cloud::ProviderRegistry;
use skirmish_core::{load_plan, ConfigError, EventSink, NullSink};
use skirmishd::{
    Coordinator, CoordinatorError, EventLogError, JsonlEventLog, Orchestrator, OrchestratorError,
    SignalBridge,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "skirmish", version, about = "Run a fault-injection plan against cloud compute")]
struct Cli {
    /// Plan file (.toml, .yaml or .yml)
    #[arg(short = 'p', long = "plan-path")]
    plan_path: PathBuf,

    /// Directory for the JSONL run journal
    #[arg(long)]
    journal: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Debug, thiserror::Error)]
enum MainError {
    #[error("failed to load plan: {0}")]
    Plan(#[from] ConfigError),
    #[error("failed to prepare journal at {path}: {source}")]
    Journal {
        path: PathBuf,
        #[source]
        source: EventLogError,
    },
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("failed to install signal handlers: {source}")]
    Signals {
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Fault(#[from] CoordinatorError),
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        LevelFilter::Error
    } else {
        match cli.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .init();
}

fn open_sink(journal: Option<&PathBuf>) -> Result<Arc<dyn EventSink>, MainError> {
    let Some(path) = journal else {
        return Ok(Arc::new(NullSink));
    };
    let log = JsonlEventLog::new(path);
    log.ensure_layout().map_err(|source| MainError::Journal {
        path: path.clone(),
        source,
    })?;
    info!("journaling events to {}", log.journal_path().display());
    Ok(Arc::new(log))
}

fn run(cli: Cli) -> Result<(), MainError> {
    let started_at = Utc::now();
    let (plan, issues) = load_plan(&cli.plan_path)?;
    for issue in &issues {
        warn!("plan {}: {}", issue.code, issue.message);
    }

    let events = open_sink(cli.journal.as_ref())?;
    let registry = ProviderRegistry::with_defaults(Arc::clone(&events));
    let mut orchestrator = Orchestrator::new(registry, Arc::clone(&events));
    orchestrator.initialise(&plan)?;
    let orchestrator = Arc::new(orchestrator);

    let root = Arc::new(Coordinator::new("run", events));
    {
        let orchestrator = Arc::clone(&orchestrator);
        root.register(move || orchestrator.shutdown());
    }
    let signals = SignalBridge::install(Arc::clone(&orchestrator), Arc::clone(&root))
        .map_err(|source| MainError::Signals { source })?;

    let outcome = root.supervise(|| orchestrator.execute(&plan));
    signals.close();
    let summary = outcome??;

    let elapsed = Utc::now().signed_duration_since(started_at);
    info!(
        "run finished in {}s: {} step(s), {} operation(s){}",
        elapsed.num_seconds(),
        summary.steps_started,
        summary.minions_launched,
        if summary.cancelled { ", cancelled" } else { "" }
    );
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);
    if let Err(err) = run(cli) {
        error!("skirmish failed: {err}");
        std::process::exit(1);
    }
}
