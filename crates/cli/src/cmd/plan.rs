//! Implementation of the `kiln plan` command.
//!
//! Resolves the targets against the formula directory and prints the install
//! order without fetching or building anything.

use anyhow::{Context, Result};
use owo_colors::{OwoColorize, Stream};

use kiln_lib::install::plan;
use kiln_lib::resolve::PlanStatus;

use super::CommonOptions;
use crate::output::{self, glyph};

pub fn cmd_plan(options: &CommonOptions) -> Result<i32> {
  let formulas = options.load()?;
  let config = options.config();

  let resolution = plan(&formulas, &options.targets, &config).context("Failed to resolve install plan")?;

  if options.json {
    output::emit_json(&resolution.order)?;
    return Ok(0);
  }

  let pending = resolution.pending().count();
  if pending == 0 {
    output::note("Everything is already installed.");
  }

  for entry in &resolution.order {
    match entry.status {
      PlanStatus::Pending => println!(
        "  {} {} {}",
        glyph::PENDING.if_supports_color(Stream::Stdout, |s| s.green()),
        entry.name,
        entry.version
      ),
      PlanStatus::Installed => println!(
        "  {} {} {} {}",
        glyph::DONE.if_supports_color(Stream::Stdout, |s| s.dimmed()),
        entry.name,
        entry.version,
        "(installed)".if_supports_color(Stream::Stdout, |s| s.dimmed())
      ),
    }
  }

  if pending > 0 {
    println!();
    println!("{} formula(s) to install into {}", pending, config.root.display());
  }

  Ok(0)
}
