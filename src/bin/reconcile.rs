use clap::Parser;
use filing_period_reconciler::{
    BatchReport, EntityId, MemoryStore, ReconcileError, ReconcilerConfig, ReconciliationRunner,
    Result, RunOptions, StopToken,
};
use crossbeam::channel;
use log::{error, info, warn};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

const STORE_ENV: &str = "RECONCILER_STORE";
const CONFIG_ENV: &str = "RECONCILER_CONFIG";
const STOP_POLL: Duration = Duration::from_millis(500);

/// Derive missing Q4 values from annual filings and normalize cumulative
/// cash-flow quarters.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Store snapshot (JSON). Falls back to $RECONCILER_STORE
    #[arg(long)]
    store: Option<PathBuf>,

    /// Reconciler configuration (JSON). Falls back to $RECONCILER_CONFIG, then defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Entity identifier (CIK) to process; repeatable. Defaults to every entity on file
    #[arg(long = "entity")]
    entities: Vec<String>,

    /// Only process this fiscal year; repeatable
    #[arg(long = "fiscal-year")]
    fiscal_years: Vec<i32>,

    /// Delete previously derived values and derive them again
    #[arg(long)]
    recalculate: bool,

    /// Worker threads; overrides the configuration
    #[arg(long)]
    workers: Option<usize>,

    /// Write the JSON batch report here instead of stdout
    #[arg(long)]
    report: Option<PathBuf>,

    /// Run without writing the store back
    #[arg(long)]
    dry_run: bool,

    /// Stop taking new entities once this file exists; finished entities are kept
    #[arg(long)]
    stop_file: Option<PathBuf>,

    /// Print the configuration JSON schema and exit
    #[arg(long)]
    config_schema: bool,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn log_level(&self) -> log::LevelFilter {
        if self.quiet {
            return log::LevelFilter::Warn;
        }
        match self.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    env_logger::builder()
        .format_timestamp_millis()
        .filter_level(args.log_level())
        .init();

    match run(&args) {
        Ok(report) if report.totals().errors > 0 || report.totals().entities_failed > 0 => {
            warn!("Finished with errors; see report for details");
            std::process::exit(2);
        }
        Ok(_) => {}
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    }
}

fn run(args: &Args) -> Result<BatchReport> {
    if args.config_schema {
        println!("{}", ReconcilerConfig::schema_as_json()?);
        return Ok(BatchReport::default());
    }

    let mut config = match path_or_env(&args.config, CONFIG_ENV) {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            ReconcilerConfig::from_json_file(&path)?
        }
        None => ReconcilerConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }

    let store_path = path_or_env(&args.store, STORE_ENV).ok_or_else(|| {
        ReconcileError::InvalidConfig(format!("--store <file> or ${} is required", STORE_ENV))
    })?;
    info!("Loading store snapshot from {}", store_path.display());
    let store = MemoryStore::load_json(&store_path)?;

    let runner = ReconciliationRunner::new(&store, &config)?;
    let entities = if args.entities.is_empty() {
        runner.discover_entities()?
    } else {
        args.entities.iter().map(EntityId::new).collect()
    };
    let options = RunOptions {
        fiscal_years: args.fiscal_years.clone(),
        recalculate: args.recalculate,
    };

    let stop = StopToken::new();
    let watcher = args.stop_file.clone().map(|path| {
        if path.exists() {
            warn!("Stop file {} already exists; no entity will start", path.display());
        }
        let (done_tx, done_rx) = channel::bounded::<()>(0);
        let token = stop.clone();
        let handle = thread::spawn(move || token.watch_file(&path, STOP_POLL, &done_rx));
        (done_tx, handle)
    });

    let report = runner.run_batch(&entities, &options, &stop);

    if let Some((done_tx, handle)) = watcher {
        drop(done_tx);
        if handle.join().is_err() {
            warn!("Stop-file watcher panicked");
        }
    }
    if report.stopped {
        warn!(
            "Batch stopped; {} entities not started: {}",
            report.not_started.len(),
            report
                .not_started
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    if args.dry_run {
        info!("Dry run: store snapshot left unchanged");
    } else {
        store.save_json(&store_path)?;
        info!("Wrote store snapshot to {}", store_path.display());
    }

    let json = report.to_json()?;
    match &args.report {
        Some(path) => {
            fs::write(path, json)?;
            info!("Wrote report to {}", path.display());
        }
        None => println!("{json}"),
    }

    Ok(report)
}

fn path_or_env(arg: &Option<PathBuf>, var: &str) -> Option<PathBuf> {
    arg.clone()
        .or_else(|| env::var(var).ok().filter(|v| !v.is_empty()).map(PathBuf::from))
}
