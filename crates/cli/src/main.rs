mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use kiln_lib::install::InstallError;

use crate::cmd::{CommonOptions, InstallOptions, cmd_fetch, cmd_install, cmd_plan};

/// kiln - Declarative package-build orchestrator
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Increase log verbosity (-v info, -vv debug); RUST_LOG overrides
  #[arg(short, long, global = true, action = ArgAction::Count)]
  verbose: u8,

  /// Installation root (default: $KILN_ROOT, else the data directory)
  #[arg(long, global = true)]
  root: Option<PathBuf>,

  /// Download cache (default: $KILN_CACHE, else the cache directory)
  #[arg(long, global = true)]
  cache: Option<PathBuf>,

  /// Print machine-readable JSON
  #[arg(long, global = true)]
  json: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Args)]
struct TargetArgs {
  /// Formulas to operate on
  #[arg(required = true)]
  targets: Vec<String>,

  /// Directory holding the formula descriptors
  #[arg(short = 'f', long = "formulas", default_value = "formulas")]
  formulas: PathBuf,

  /// Enable a feature flag (repeatable)
  #[arg(long = "with", value_name = "FLAG")]
  flags: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
  /// Build and install formulas with their dependencies
  Install {
    #[command(flatten)]
    target: TargetArgs,

    /// Keep build sandboxes for debugging
    #[arg(long)]
    keep_sandbox: bool,

    /// Build parallelism passed to make (default: number of CPUs)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Maximum concurrent downloads
    #[arg(long)]
    fetch_jobs: Option<usize>,

    /// Timeout per download (e.g. 30s, 5m)
    #[arg(long, value_parser = humantime::parse_duration)]
    fetch_timeout: Option<Duration>,
  },

  /// Show the install order without building anything
  Plan {
    #[command(flatten)]
    target: TargetArgs,
  },

  /// Download and verify sources into the cache
  Fetch {
    #[command(flatten)]
    target: TargetArgs,
  },
}

fn init_logging(verbose: u8) {
  let default = match verbose {
    0 => "warn",
    1 => "info",
    _ => "debug",
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_logging(cli.verbose);

  let common = |target: TargetArgs| CommonOptions {
    root: cli.root.clone(),
    cache: cli.cache.clone(),
    formulas: target.formulas,
    targets: target.targets,
    flags: target.flags,
    json: cli.json,
  };

  let result = match cli.command {
    Commands::Install {
      target,
      keep_sandbox,
      jobs,
      fetch_jobs,
      fetch_timeout,
    } => cmd_install(
      &common(target),
      &InstallOptions {
        keep_sandbox,
        jobs,
        fetch_jobs,
        fetch_timeout,
      },
    ),
    Commands::Plan { target } => cmd_plan(&common(target)),
    Commands::Fetch { target } => cmd_fetch(&common(target)),
  };

  match result {
    Ok(code) => exit_code(code),
    Err(e) => {
      output::failure(&format!("{:#}", e));
      let code = e
        .chain()
        .find_map(|cause| cause.downcast_ref::<InstallError>())
        .map(InstallError::exit_code)
        .unwrap_or(1);
      exit_code(code)
    }
  }
}

fn exit_code(code: i32) -> ExitCode {
  ExitCode::from(u8::try_from(code).unwrap_or(1))
}
