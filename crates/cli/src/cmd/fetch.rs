//! Implementation of the `kiln fetch` command.
//!
//! Downloads and verifies the sources of every pending formula in the plan,
//! filling the cache without building anything.

use std::sync::Arc;

use anyhow::{Context, Result};

use kiln_lib::fetch::Fetcher;
use kiln_lib::install::fetch_sources;

use super::CommonOptions;
use crate::output::{self, glyph};

pub fn cmd_fetch(options: &CommonOptions) -> Result<i32> {
  let formulas = options.load()?;
  let config = options.config();
  let fetcher = Fetcher::with_timeout(&config.cache, config.fetch_timeout).context("Failed to create fetcher")?;

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let paths = rt
    .block_on(fetch_sources(&formulas, &options.targets, &config, Arc::new(fetcher)))
    .context("Fetch failed")?;

  if options.json {
    let items: Vec<_> = paths
      .iter()
      .map(|(name, path)| serde_json::json!({ "formula": name, "path": path }))
      .collect();
    output::emit_json(&items)?;
    return Ok(0);
  }

  for (name, path) in &paths {
    println!("  {} {} {}", name, glyph::ARROW, path.display());
  }
  output::done(&format!("{} source(s) available in {}", paths.len(), config.cache.display()));

  Ok(0)
}
