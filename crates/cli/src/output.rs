//! Terminal reporting for kiln commands.
//!
//! Results go to stdout. Failures, warnings and captured build output go to
//! stderr, so stdout stays machine-readable under `--json`.

use std::fmt::Display;
use std::time::Duration;

use anyhow::Context;
use owo_colors::{OwoColorize, Stream};

pub mod glyph {
  pub const DONE: &str = "✓";
  pub const FAILED: &str = "✗";
  pub const CAUTION: &str = "!";
  pub const NOTE: &str = "·";
  pub const ARROW: &str = "→";
  pub const PENDING: &str = "+";
  /// Prefixes each line of captured build output.
  pub const GUTTER: &str = "│";
}

/// Width of the label column in the run summary.
const SUMMARY_LABEL_WIDTH: usize = 20;

/// Compact elapsed time: `850ms`, `4.2s`, `3m07s`, `1h02m`.
pub fn format_elapsed(elapsed: Duration) -> String {
  let secs = elapsed.as_secs();
  match secs {
    0 => format!("{}ms", elapsed.subsec_millis()),
    1..60 => format!("{}.{}s", secs, elapsed.subsec_millis() / 100),
    60..3600 => format!("{}m{:02}s", secs / 60, secs % 60),
    _ => format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60),
  }
}

pub fn done(message: &str) {
  println!("{} {}", glyph::DONE.if_supports_color(Stream::Stdout, |s| s.green()), message);
}

pub fn failure(message: &str) {
  eprintln!(
    "{} {}",
    glyph::FAILED.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.bold())
  );
}

pub fn caution(message: &str) {
  eprintln!("{} {}", glyph::CAUTION.if_supports_color(Stream::Stderr, |s| s.yellow()), message);
}

pub fn note(message: &str) {
  println!("{} {}", glyph::NOTE.if_supports_color(Stream::Stdout, |s| s.cyan()), message);
}

fn summary_text(label: &str, value: &dyn Display) -> String {
  format!("  {:<width$}{}", format!("{label}:"), value, width = SUMMARY_LABEL_WIDTH)
}

/// One aligned line of the end-of-run summary.
pub fn summary(label: &str, value: impl Display) {
  let line = summary_text(label, &value);
  println!("{}", line.if_supports_color(Stream::Stdout, |s| s.dimmed()));
}

pub fn build_output(tail: &str) {
  for line in tail.lines() {
    eprintln!("    {} {}", glyph::GUTTER.if_supports_color(Stream::Stderr, |s| s.dimmed()), line);
  }
}

pub fn emit_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize report")?;
  println!("{json}");
  Ok(())
}
