//! Configure argument computation.

use std::path::Path;

use crate::formula::{ConfigureSpec, FlagSet};

/// Arguments passed to the configure script, in a fixed order:
/// `--prefix`, `--target`, `--host`, `--enable-languages`, `--program-suffix`,
/// then the declared extra arguments (placeholders not yet substituted).
pub fn configure_args(spec: &ConfigureSpec, prefix: &Path, version_suffix: Option<&str>, flags: &FlagSet) -> Vec<String> {
  let mut args = vec![format!("--prefix={}", prefix.display())];

  if let Some(target) = &spec.target {
    args.push(format!("--target={target}"));
  }
  if let Some(host) = &spec.host {
    args.push(format!("--host={host}"));
  }

  let languages = enabled_languages(spec, flags);
  if !languages.is_empty() {
    args.push(format!("--enable-languages={}", languages.join(",")));
  }

  if spec.program_suffix
    && let Some(suffix) = version_suffix
  {
    args.push(format!("--program-suffix=-{suffix}"));
  }

  args.extend(spec.args.iter().cloned());
  args
}

/// Declared languages, then those of enabled flags in flag-name order, without repeats.
pub fn enabled_languages<'a>(spec: &'a ConfigureSpec, flags: &FlagSet) -> Vec<&'a str> {
  let from_flags = spec
    .flag_languages
    .iter()
    .filter(|(flag, _)| flags.contains(*flag))
    .flat_map(|(_, languages)| languages);

  let mut languages: Vec<&str> = Vec::new();
  for language in spec.languages.iter().chain(from_flags) {
    if !languages.contains(&language.as_str()) {
      languages.push(language);
    }
  }
  languages
}
