//! `reflector` CLI: turns benchmark failures into published behavior spec revisions.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use reflector::cycle::Orchestrator;
use reflector::error::is_halting;
use reflector::exit_codes;
use reflector::io::config::{ReflectorConfig, load_config};
use reflector::io::init::{InitOptions, ReflectorPaths, default_config_path, init_reflector};
use reflector::io::registry::open_registry;
use reflector::io::transform::CommandTransform;
use reflector::logging;
use reflector::looping::{LoopStop, RunMode, run_loop};
use reflector::status::read_status;

#[derive(Parser, Debug)]
#[command(
    name = "reflector",
    version,
    about = "Feed benchmark failures back into the agent's behavior spec"
)]
struct Cli {
    /// Workspace root that relative config paths resolve against.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// Config file (default: <root>/.reflector/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default config and seed behavior spec.
    Init {
        /// Overwrite an existing config and spec.
        #[arg(short, long)]
        force: bool,
    },
    /// Watch the job tree and run the feedback loop.
    Run(RunArgs),
    /// Print a summary of the job tree and loop state without side effects.
    Status,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Run a single pass and exit.
    #[arg(long)]
    one_shot: bool,
    /// Seconds between passes (overrides config).
    #[arg(long)]
    poll_interval: Option<u64>,
    /// Failures per batch before analysis (overrides config).
    #[arg(long)]
    threshold: Option<usize>,
    /// Clear the processed index before the first pass.
    #[arg(long)]
    reset_processed: bool,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| default_config_path(&cli.root));
    match cli.command {
        Command::Init { force } => cmd_init(&cli.root, config_path, force),
        Command::Run(args) => cmd_run(&cli.root, config_path, &args),
        Command::Status => cmd_status(&cli.root, config_path),
    }
}

fn cmd_init(root: &Path, config_path: PathBuf, force: bool) -> Result<i32> {
    let config = load_config(&config_path)?;
    let paths = ReflectorPaths::resolve(root, config_path, &config);
    init_reflector(&paths, &config, &InitOptions { force })?;
    println!("config={}", paths.config_path.display());
    println!("spec={}", paths.spec_path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, config_path: PathBuf, args: &RunArgs) -> Result<i32> {
    let config = apply_overrides(load_config(&config_path)?, args)?;
    let paths = ReflectorPaths::resolve(root, config_path, &config);
    if !paths.spec_path.exists() {
        bail!(
            "missing behavior spec {} (run `reflector init` first)",
            paths.spec_path.display()
        );
    }

    let transform = CommandTransform::new(config.collaborator.command.clone())?;
    let registry = open_registry(&paths, &config)?;
    let shutdown = Arc::new(AtomicBool::new(false));
    install_interrupt_handler(Arc::clone(&shutdown))?;

    let mut orchestrator = match Orchestrator::open(&paths, &config, &transform, &registry) {
        Ok(orchestrator) => orchestrator,
        Err(err) if is_halting(&err) => {
            eprintln!("{err:#}");
            return Ok(exit_codes::HALTED);
        }
        Err(err) => return Err(err),
    };
    if args.reset_processed {
        orchestrator.reset_processed()?;
        println!("reset processed index");
    }

    let mode = if args.one_shot {
        RunMode::OneShot
    } else {
        RunMode::Continuous {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
        }
    };
    info!(
        jobs = %paths.jobs_dir.display(),
        staging = %paths.staging_dir.display(),
        threshold = config.failure_threshold,
        ?mode,
        "reflector started"
    );

    let outcome = run_loop(&mut orchestrator, mode, &shutdown, |pass| {
        println!("{}", pass.summary_line());
    })?;
    match outcome.stop {
        LoopStop::OneShotComplete | LoopStop::Shutdown => Ok(exit_codes::OK),
        LoopStop::Halted { reason } => {
            eprintln!("halted: {reason}");
            Ok(exit_codes::HALTED)
        }
    }
}

fn cmd_status(root: &Path, config_path: PathBuf) -> Result<i32> {
    let config = load_config(&config_path)?;
    let paths = ReflectorPaths::resolve(root, config_path, &config);
    let registry = open_registry(&paths, &config)?;
    let summary = read_status(&paths, &config, &registry)?;
    print!("{}", summary.render());
    Ok(exit_codes::OK)
}

fn apply_overrides(mut config: ReflectorConfig, args: &RunArgs) -> Result<ReflectorConfig> {
    if let Some(secs) = args.poll_interval {
        config.poll_interval_secs = secs;
    }
    if let Some(threshold) = args.threshold {
        config.failure_threshold = threshold;
    }
    config.validate().context("invalid command line override")?;
    Ok(config)
}

fn install_interrupt_handler(shutdown: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        if shutdown.swap(true, Ordering::SeqCst) {
            warn!("second interrupt received, still waiting for the current pass");
        } else {
            warn!("interrupt received, finishing the current pass");
        }
    })
    .context("install interrupt handler")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_flags() {
        let cli = Cli::parse_from([
            "reflector",
            "run",
            "--one-shot",
            "--poll-interval",
            "5",
            "--threshold",
            "3",
            "--reset-processed",
        ]);
        match cli.command {
            Command::Run(args) => {
                assert!(args.one_shot);
                assert!(args.reset_processed);
                assert_eq!(args.poll_interval, Some(5));
                assert_eq!(args.threshold, Some(3));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parse_global_root_after_subcommand() {
        let cli = Cli::parse_from(["reflector", "status", "--root", "/tmp/ws"]);
        assert_eq!(cli.root, PathBuf::from("/tmp/ws"));
        assert!(matches!(cli.command, Command::Status));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["reflector", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn zero_threshold_override_is_rejected() {
        let args = RunArgs {
            threshold: Some(0),
            ..RunArgs::default()
        };
        assert!(apply_overrides(ReflectorConfig::default(), &args).is_err());
    }

    #[test]
    fn overrides_replace_config_values() {
        let args = RunArgs {
            poll_interval: Some(2),
            threshold: Some(4),
            ..RunArgs::default()
        };
        let config = apply_overrides(ReflectorConfig::default(), &args).expect("override");
        assert_eq!(config.poll_interval_secs, 2);
        assert_eq!(config.failure_threshold, 4);
    }
}
