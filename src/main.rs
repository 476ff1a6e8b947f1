use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::Level;

use timesift_core::config::DatastoreConfig;
use timesift_core::ids::SketchId;
use timesift_engine::analyzers;
use timesift_engine::{AnalysisRunner, AnalyzerConfig, FlushPolicy, ViewQueryGate};
use timesift_store::Database;
use timesift_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "timesift", about = "Run timeline analyzers against a search index")]
struct Cli {
    /// Default log level; RUST_LOG takes precedence.
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List registered analyzers.
    List,
    /// Run every instance of an analyzer against an index.
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    analyzer: String,

    #[arg(long)]
    index: String,

    #[arg(long)]
    sketch: Option<SketchId>,

    /// Relational database holding sketches, views and analyses.
    #[arg(long)]
    db: Option<PathBuf>,

    #[arg(long)]
    elastic_host: Option<String>,

    #[arg(long)]
    elastic_port: Option<u16>,

    /// Flush queued writes even when the analyzer fails.
    #[arg(long)]
    flush_always: bool,

    /// Let views be saved from a query DSL alone.
    #[arg(long)]
    allow_dsl_views: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let telemetry = TelemetryConfig {
        log_level: cli.log_level,
        json: cli.json_logs,
        ..TelemetryConfig::default()
    };
    if let Err(e) = init_telemetry(&telemetry) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Command::List => {
            list();
            Ok(true)
        }
        Command::Run(args) => run(args).await,
    };
    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %e, "timesift failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn list() {
    let registry = analyzers::builtin_registry();
    for descriptor in registry.descriptors() {
        let scope = if descriptor.is_sketch_analyzer { "sketch" } else { "index" };
        println!(
            "{:<12} {:<20} {:<6} {} instance(s)",
            descriptor.name,
            descriptor.display_name,
            scope,
            descriptor.get_kwargs().instances().len()
        );
    }
}

/// Returns whether every instance succeeded.
async fn run(args: RunArgs) -> Result<bool, Box<dyn Error>> {
    let mut datastore = DatastoreConfig::from_env()?;
    if let Some(host) = args.elastic_host {
        datastore.host = host;
    }
    if let Some(port) = args.elastic_port {
        datastore.port = port;
    }
    let config = AnalyzerConfig {
        datastore,
        flush_policy: if args.flush_always {
            FlushPolicy::Always
        } else {
            FlushPolicy::OnSuccess
        },
        view_gate: if args.allow_dsl_views {
            ViewQueryGate::Corrected
        } else {
            ViewQueryGate::Literal
        },
    };

    let db_path = args.db.unwrap_or_else(default_db_path);
    let db = Database::open(&db_path)?;
    tracing::info!(path = %db_path.display(), "database opened");

    let runner = AnalysisRunner::new(Arc::new(analyzers::builtin_registry()), db, config);
    let outcomes = runner.run(&args.analyzer, &args.index, args.sketch).await?;

    let mut all_ok = true;
    for outcome in &outcomes {
        let params = instance_label(&outcome.args);
        match &outcome.result {
            Ok(summary) => println!("[ok]    {} {params}: {summary}", outcome.analyzer),
            Err(e) => {
                all_ok = false;
                println!("[error] {} {params}: {e}", outcome.analyzer);
            }
        }
    }
    Ok(all_ok)
}

fn instance_label(args: &timesift_engine::AnalyzerArgs) -> String {
    match args.get("name").and_then(|name| name.as_str()) {
        Some(name) => format!("({name})"),
        None if args.is_empty() => String::new(),
        None => format!("({} args)", args.len()),
    }
}

fn default_db_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".timesift")
        .join("timesift.db")
}
