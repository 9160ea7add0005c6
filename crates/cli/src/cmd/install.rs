//! Implementation of the `kiln install` command.
//!
//! Resolves, fetches, builds and finishes the requested formulas. The process
//! exit code reflects the first failure in plan order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tracing::warn;

use kiln_lib::fetch::Fetcher;
use kiln_lib::install::{InstallReport, install};

use super::CommonOptions;
use crate::output::{self, glyph};

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
  pub keep_sandbox: bool,
  pub jobs: Option<usize>,
  pub fetch_jobs: Option<usize>,
  pub fetch_timeout: Option<Duration>,
}

/// Execute the install command.
///
/// Returns the exit code for the run: 0 when every formula installed or was
/// already installed, otherwise the code of the first failure.
pub fn cmd_install(options: &CommonOptions, install_options: &InstallOptions) -> Result<i32> {
  let formulas = options.load()?;

  let mut config = options.config();
  config.keep_sandbox = install_options.keep_sandbox;
  if let Some(jobs) = install_options.jobs {
    config.jobs = jobs.max(1);
  }
  if let Some(fetch_jobs) = install_options.fetch_jobs {
    config.fetch_parallelism = fetch_jobs.max(1);
  }
  if let Some(timeout) = install_options.fetch_timeout {
    config.fetch_timeout = timeout;
  }

  let fetcher = Fetcher::with_timeout(&config.cache, config.fetch_timeout).context("Failed to create fetcher")?;
  let started = Instant::now();

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt.block_on(async {
    tokio::select! {
      result = install(&formulas, &options.targets, &config, Arc::new(fetcher)) => Some(result),
      _ = tokio::signal::ctrl_c() => None,
    }
  });

  // Dropping the install future above removed the running sandbox and killed its children.
  let Some(report) = report else {
    warn!("interrupted, partially built prefix will be removed on the next run");
    bail!("Interrupted");
  };
  let report = report.context("Install failed")?;

  if options.json {
    output::emit_json(&report_json(&report))?;
  } else {
    print_report(&report, started.elapsed());
  }

  Ok(report.exit_code())
}

fn print_report(report: &InstallReport, elapsed: Duration) {
  for installed in &report.installed {
    output::done(&format!(
      "{} {} {} {}",
      installed.name,
      installed.version,
      glyph::ARROW,
      installed.prefix.display()
    ));
    for (from, to) in &installed.finish.renamed {
      println!("    {} {} {}", from.display(), glyph::ARROW, to.display());
    }
  }

  for (name, error) in &report.failed {
    output::failure(&format!("{}: {} ({})", name, error, error.kind()));
    if let Some(tail) = error.output_tail()
      && !tail.is_empty()
    {
      output::build_output(tail);
    }
  }

  for skipped in &report.skipped {
    output::caution(&format!("Skipped {}", skipped));
  }

  if report.installed.is_empty() && report.failed.is_empty() && report.skipped.is_empty() {
    output::note("Nothing to do, everything is already installed.");
  }

  println!();
  output::summary("Installed", report.installed.len());
  output::summary("Already installed", report.already_installed.len());
  output::summary("Failed", report.failed.len());
  output::summary("Skipped", report.skipped.len());
  output::summary("Time", output::format_elapsed(elapsed));
}

fn report_json(report: &InstallReport) -> serde_json::Value {
  let failed: Vec<_> = report
    .failed
    .iter()
    .map(|(name, error)| {
      let failure = error.build_failure();
      serde_json::json!({
        "formula": name,
        "kind": error.kind(),
        "exit_code": error.exit_code(),
        "error": error.to_string(),
        "command": failure.map(|f| &f.command),
        "command_exit_code": failure.and_then(|f| f.exit_code),
        "output_tail": error.output_tail(),
      })
    })
    .collect();

  serde_json::json!({
    "plan": report.plan,
    "installed": report.installed,
    "already_installed": report.already_installed,
    "failed": failed,
    "skipped": report.skipped,
    "exit_code": report.exit_code(),
  })
}
