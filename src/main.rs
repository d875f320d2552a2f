mod checkpoint;
mod collaborators;
mod config;
mod conflict;
mod data_dir;
mod error;
mod feature;
mod integrity;
mod merge;
mod orchestrator;
mod process;
mod pysource;
mod queue;
mod registry;
mod signals;
mod status;
mod target;

use clap::{Parser, Subcommand};
use collaborators::{CommandGenerator, GitVcs, PytestRunner, TracingTelemetry};
use config::{CliOverrides, StitchConfig};
use conflict::{Assessment, ConflictAnalyzer};
use data_dir::DataDir;
use error::{Result, StitchError};
use feature::FeatureStatus;
use orchestrator::{Collaborators, Orchestrator};
use queue::FeatureQueue;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use target::{Candidate, TargetResolver};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Integrate generated features into a source tree one at a time, in
/// dependency order, refusing merges that would lose code and rolling back
/// anything that breaks the build or the tests.
#[derive(Parser, Debug)]
#[command(name = "stitch", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "stitch.toml", global = true)]
    config: PathBuf,

    /// Debug logging (resolver matches, conflict scores, subprocesses)
    #[arg(short, long, global = true)]
    debug: bool,

    /// Only errors and the final summary
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the .stitch/ data directory and a default stitch.toml
    Init,
    /// Add the features of a plan file to the queue
    Import {
        /// Plan JSON: { "features": [{ "id", "name", "dependencies", "target_files" }] }
        plan: PathBuf,
    },
    /// Integrate runnable features in dependency order
    Run {
        /// Analyse and print decisions without writing anything
        #[arg(long)]
        dry_run: bool,
        /// Stop after this many features
        #[arg(long, value_name = "N")]
        max_features: Option<u32>,
        /// Keep going after a feature fails
        #[arg(long)]
        continue_on_failure: bool,
        /// Treat every lint finding as blocking
        #[arg(long)]
        strict: bool,
        /// Allow HIGH-risk strategies that discard candidates
        #[arg(long)]
        allow_high_risk: bool,
    },
    /// Show queue state and the last run
    Status {
        /// One line per feature with dependencies and errors
        #[arg(long)]
        verbose: bool,
    },
    /// Return failed and blocked features to the queue
    Reset {
        /// Reset every feature to pending and forget generated output
        #[arg(long, conflicts_with = "feature_id")]
        all: bool,
        /// Reset only this feature
        feature_id: Option<String>,
    },
    /// Re-queue one failed or blocked feature
    Retry {
        feature_id: String,
        /// Ignore the integration attempt ceiling
        #[arg(long)]
        force: bool,
    },
    /// Print conflict groups, strategies and risk across the backlog
    Analyze,
}

impl Cli {
    fn to_overrides(&self) -> CliOverrides {
        match &self.command {
            Commands::Run {
                dry_run,
                max_features,
                continue_on_failure,
                strict,
                allow_high_risk,
            } => CliOverrides {
                dry_run: *dry_run,
                max_features: *max_features,
                continue_on_failure: *continue_on_failure,
                strict: *strict,
                allow_high_risk: *allow_high_risk,
            },
            _ => CliOverrides::default(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Log level: --quiet = error only, --debug = debug+, default = info+
    let level = if cli.quiet {
        "error"
    } else if cli.debug {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    match dispatch(&cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

/// Load, override and validate configuration.
fn load_config(cli: &Cli) -> Result<StitchConfig> {
    let mut config = StitchConfig::load(&cli.config)?;
    config.apply_cli_overrides(&cli.to_overrides());
    tracing::debug!(?config, "resolved configuration");

    let problems = config.validate();
    if !problems.is_empty() {
        return Err(StitchError::Usage(format!(
            "configuration validation failed:\n  {}",
            problems.join("\n  ")
        )));
    }
    Ok(config)
}

async fn dispatch(cli: &Cli) -> Result<i32> {
    if let Commands::Init = cli.command {
        return init(cli);
    }

    let config = load_config(cli)?;
    let data_dir = DataDir::new(config.data_dir());
    data_dir.ensure_initialized()?;
    let mut queue = FeatureQueue::open(&data_dir.queue())?;

    match &cli.command {
        Commands::Init => init(cli),
        Commands::Import { plan } => {
            let report = queue.import_from_plan(plan)?;
            println!(
                "Imported {} feature(s), skipped {} duplicate(s)",
                report.added.len(),
                report.skipped.len()
            );
            for id in &report.skipped {
                println!("  skipped: {id}");
            }
            Ok(0)
        }
        Commands::Run { .. } => run(config, data_dir, queue).await,
        Commands::Status { verbose } => {
            status::display_queue(&queue, *verbose);
            if let Err(e) = status::display_run(&data_dir.run_status()) {
                tracing::warn!(error = %e, "could not read run status");
            }
            Ok(0)
        }
        Commands::Reset { all: true, .. } => {
            let n = queue.reset_all()?;
            println!("Reset {n} feature(s) to pending");
            Ok(0)
        }
        Commands::Reset {
            feature_id: Some(id),
            ..
        } => {
            let to = queue.reset(id)?;
            println!("Reset {id} -> {to}");
            Ok(0)
        }
        Commands::Reset { .. } => {
            let ids = queue.reset_failed()?;
            if ids.is_empty() {
                println!("Nothing to reset");
            }
            for id in &ids {
                let status = queue.get(id).map(|f| f.status.to_string()).unwrap_or_default();
                println!("Reset {id} -> {status}");
            }
            Ok(0)
        }
        Commands::Retry { feature_id, force } => {
            retry(&mut queue, feature_id, *force, config.run.max_integration_attempts)
        }
        Commands::Analyze => analyze(&config, &queue),
    }
}

fn init(cli: &Cli) -> Result<i32> {
    let config = StitchConfig::load(&cli.config).unwrap_or_default();
    let dd = DataDir::new(config.data_dir());
    dd.ensure_initialized()?;
    println!("Initialized data directory: {}", dd.root().display());
    if let Some(path) = dd.write_default_config(&cli.config)? {
        println!("Wrote default config: {}", path.display());
    }
    Ok(0)
}

async fn run(config: StitchConfig, data_dir: DataDir, queue: FeatureQueue) -> Result<i32> {
    let root = config.root().to_path_buf();
    let dry_run = config.run.dry_run;

    let token = CancellationToken::new();
    let signals = signals::SignalHandler::install(token.clone());
    signals.watch_stop_file(root.join(&config.shutdown.stop_file), Duration::from_secs(1));

    let collaborators = Collaborators {
        generator: Arc::new(CommandGenerator::new(
            config.generator.clone(),
            &root,
            data_dir.clone(),
        )),
        tests: Arc::new(PytestRunner::new(&config.checkpoint, &root)),
        vcs: Arc::new(GitVcs::new(&root)),
        telemetry: Arc::new(TracingTelemetry::default()),
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        features = queue.len(),
        dry_run,
        "stitch starting"
    );

    let registry = registry::RunRegistry::new();
    let handle = registry.spawn(Orchestrator::new(config, queue, collaborators), &token);
    let status_path = data_dir.run_status();
    let mirror = (!dry_run).then(|| {
        tokio::spawn(status::mirror_progress(
            status::StatusFile::new(status_path.clone()),
            handle.run_id.clone(),
            handle.progress(),
        ))
    });

    let outcome = handle.join().await?;
    if let Some(mirror) = mirror {
        match mirror.await {
            Ok(data) => status::write_final(&status_path, data, &outcome.summary),
            Err(e) => tracing::warn!(error = %e, "status writer stopped early"),
        }
    }

    outcome.summary.print();
    Ok(if outcome.has_failures { 1 } else { 0 })
}

fn retry(queue: &mut FeatureQueue, id: &str, force: bool, max_attempts: u32) -> Result<i32> {
    let feature = queue
        .get(id)
        .ok_or_else(|| StitchError::NotFound(format!("feature '{id}'")))?;
    if feature.integration_attempts >= max_attempts && !force {
        return Err(StitchError::Usage(format!(
            "{id} has used {}/{max_attempts} integration attempts; pass --force to retry anyway",
            feature.integration_attempts
        )));
    }
    let to = queue.reset(id)?;
    let attempts = queue.record_integration_attempt(id)?;
    println!("Retrying {id} from {to} (attempt {attempts}/{max_attempts})");
    Ok(0)
}

/// Conflict picture of every feature with generated output, without writing.
fn analyze(config: &StitchConfig, queue: &FeatureQueue) -> Result<i32> {
    let resolver = TargetResolver::new(&config.resolver);
    let analyzer = ConflictAnalyzer::new(&config.conflict);

    let mut candidates = Vec::new();
    for feature in queue
        .features()
        .filter(|f| f.status != FeatureStatus::Complete)
    {
        for source in &feature.generated_files {
            match Candidate::load(feature, source) {
                Ok(c) => candidates.push(c),
                Err(e) => println!("unreadable: {} ({e})", source.display()),
            }
        }
    }
    if candidates.is_empty() {
        println!("No generated output to analyse.");
        return Ok(0);
    }

    let (groups, unresolved) = conflict::group_candidates(&resolver, candidates);
    let mut blocked = 0;
    for group in &groups {
        let dest = config.root().join(&group.target);
        let features = group.feature_names().join(", ");
        match analyzer.assess(&dest, group) {
            Assessment::AlreadyIntegrated => {
                println!("{}: already integrated [{features}]", group.target.display());
            }
            Assessment::NewFile => {
                println!("{}: new file [{features}]", group.target.display());
            }
            Assessment::Resolve {
                strategy,
                report,
                blocked: reason,
            } => {
                match report {
                    Some(report) => print!("{report}"),
                    None => println!("{}: strategy={strategy}", group.target.display()),
                }
                println!("  features: {features}");
                if let Some(reason) = reason {
                    blocked += 1;
                    println!("  BLOCKED: {reason}");
                }
            }
        }
    }
    for c in &unresolved {
        println!("manual review: {} [{}]", c.source.display(), c.feature_name);
    }
    println!(
        "{} target(s), {} blocked, {} unresolved file(s)",
        groups.len(),
        blocked,
        unresolved.len()
    );
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use feature::Feature;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags_become_overrides() {
        let cli = Cli::parse_from([
            "stitch",
            "run",
            "--dry-run",
            "--max-features",
            "3",
            "--continue-on-failure",
            "--strict",
        ]);
        let o = cli.to_overrides();
        assert!(o.dry_run);
        assert_eq!(o.max_features, Some(3));
        assert!(o.continue_on_failure);
        assert!(o.strict);
        assert!(!o.allow_high_risk);
    }

    #[test]
    fn test_status_verbose_and_reset_all_parse() {
        let cli = Cli::parse_from(["stitch", "status", "--verbose"]);
        assert!(matches!(cli.command, Commands::Status { verbose: true }));
        let cli = Cli::parse_from(["stitch", "reset", "--all"]);
        assert!(matches!(cli.command, Commands::Reset { all: true, .. }));
        assert!(Cli::try_parse_from(["stitch", "reset", "--all", "f1"]).is_err());
    }

    fn failed_queue(attempts: u32) -> FeatureQueue {
        let mut queue = FeatureQueue::in_memory();
        queue.add_feature(Feature::new("f1", "Parser")).unwrap();
        queue.transition("f1", FeatureStatus::Developing).unwrap();
        queue.mark_failed("f1", "boom").unwrap();
        for _ in 0..attempts {
            queue.record_integration_attempt("f1").unwrap();
        }
        queue
    }

    #[test]
    fn test_retry_respects_attempt_ceiling() {
        let mut queue = failed_queue(3);
        let err = retry(&mut queue, "f1", false, 3).unwrap_err();
        assert!(matches!(err, StitchError::Usage(_)));
        assert_eq!(queue.get("f1").unwrap().status, FeatureStatus::Failed);

        assert_eq!(retry(&mut queue, "f1", true, 3).unwrap(), 0);
        let f = queue.get("f1").unwrap();
        assert_eq!(f.status, FeatureStatus::Pending);
        assert_eq!(f.integration_attempts, 4);
    }

    #[test]
    fn test_retry_unknown_feature() {
        let mut queue = FeatureQueue::in_memory();
        assert!(matches!(
            retry(&mut queue, "nope", false, 3).unwrap_err(),
            StitchError::NotFound(_)
        ));
    }
}
