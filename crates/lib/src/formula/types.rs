//! Formula descriptor types.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::consts::UNVERSIONED;
use crate::fetch::checksum::Checksum;
use crate::platform::{Platform, PlatformPredicate};

/// Feature flags enabled for a run (`--with java`).
pub type FlagSet = BTreeSet<String>;

static VERSION_IN_FILENAME: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"(?:^|[-_])v?(\d+(?:\.\d+)+[a-z]?\d*)").expect("valid version regex"));
static MAJOR_MINOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+\.\d+").expect("valid suffix regex"));

const ARCHIVE_EXTENSIONS: &[&str] = &[
  ".tar.gz", ".tar.xz", ".tar.bz2", ".tar.zst", ".tgz", ".txz", ".tbz2", ".tar", ".zip",
];

/// A declarative descriptor of one installable package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Formula {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub homepage: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub mirror: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub checksum: Option<Checksum>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub version: Option<String>,
  #[serde(default)]
  pub dependencies: Vec<Dependency>,
  #[serde(default)]
  pub patches: Vec<PatchSpec>,
  /// Declared options, flag name to description.
  #[serde(default)]
  pub feature_flags: BTreeMap<String, String>,
  #[serde(default)]
  pub env: Vec<EnvRule>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub configure: Option<ConfigureSpec>,
  #[serde(default)]
  pub steps: Vec<Step>,
  #[serde(default)]
  pub finish: FinishRules,
}

impl Formula {
  /// The effective version: declared, else parsed from the URL file name.
  pub fn version(&self) -> String {
    if let Some(version) = &self.version {
      return version.clone();
    }
    self
      .url
      .as_deref()
      .and_then(version_from_url)
      .unwrap_or_else(|| UNVERSIONED.to_string())
  }

  /// The `major.minor` part of the version, used to tell variants apart.
  pub fn version_suffix(&self) -> Option<String> {
    version_suffix(&self.version())
  }

  /// Dependencies whose condition holds for this run.
  pub fn active_dependencies<'a>(
    &'a self,
    flags: &'a FlagSet,
    platform: &'a Platform,
  ) -> impl Iterator<Item = &'a Dependency> + 'a {
    self.dependencies.iter().filter(move |dep| condition_holds(&dep.when, flags, platform))
  }

  /// Patches selected for this run, in declaration order.
  pub fn active_patches<'a>(&'a self, flags: &'a FlagSet, platform: &'a Platform) -> Vec<&'a PatchSpec> {
    self
      .patches
      .iter()
      .filter(|patch| condition_holds(&patch.when, flags, platform))
      .collect()
  }

  /// Environment rules selected for this run, in declaration order.
  pub fn active_env<'a>(&'a self, flags: &'a FlagSet, platform: &'a Platform) -> Vec<&'a EnvRule> {
    self
      .env
      .iter()
      .filter(|rule| condition_holds(&rule.when, flags, platform))
      .collect()
  }

  /// Every feature flag mentioned in a condition or language rule.
  pub(crate) fn referenced_flags(&self) -> BTreeSet<&str> {
    let conditions = self
      .dependencies
      .iter()
      .filter_map(|d| d.when.as_ref())
      .chain(self.patches.iter().filter_map(|p| p.when.as_ref()))
      .chain(self.env.iter().filter_map(|e| e.when.as_ref()));

    let mut flags: BTreeSet<&str> = conditions.flat_map(|c| c.flags.iter().map(String::as_str)).collect();
    if let Some(configure) = &self.configure {
      flags.extend(configure.flag_languages.keys().map(String::as_str));
    }
    flags
  }
}

/// Parse a version out of a source URL's file name (`gcc-4.8.2.tar.bz2` is `4.8.2`).
pub fn version_from_url(url: &str) -> Option<String> {
  let file = url.split(['?', '#']).next()?.rsplit('/').next()?;
  let stem = ARCHIVE_EXTENSIONS
    .iter()
    .find_map(|ext| file.strip_suffix(ext))
    .unwrap_or(file);
  VERSION_IN_FILENAME
    .captures(stem)
    .and_then(|caps| caps.get(1))
    .map(|m| m.as_str().to_string())
}

/// The first `major.minor` match in `version`.
pub fn version_suffix(version: &str) -> Option<String> {
  MAJOR_MINOR.find(version).map(|m| m.as_str().to_string())
}

fn condition_holds(when: &Option<Condition>, flags: &FlagSet, platform: &Platform) -> bool {
  when.as_ref().is_none_or(|c| c.evaluate(flags, platform))
}

/// A condition attached to a dependency, patch or environment rule.
///
/// Holds when any listed flag is enabled (or none are listed) and the platform
/// predicate, if present, matches.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Condition {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub flags: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub platform: Option<PlatformPredicate>,
}

impl Condition {
  pub fn evaluate(&self, flags: &FlagSet, platform: &Platform) -> bool {
    let flags_ok = self.flags.is_empty() || self.flags.iter().any(|f| flags.contains(f));
    let platform_ok = self.platform.as_ref().is_none_or(|p| p.matches(platform));
    flags_ok && platform_ok
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
  /// Needed only while building the dependent.
  Build,
  /// Needed by the installed dependent.
  #[default]
  Run,
}

impl std::fmt::Display for DependencyKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      DependencyKind::Build => write!(f, "build"),
      DependencyKind::Run => write!(f, "run"),
    }
  }
}

/// A declared dependency on another formula.
///
/// Accepts either a bare name or a table:
///
/// ```toml
/// dependencies = [
///   "gmp",
///   { name = "ecj", when = { flags = ["java", "all-languages"] } },
///   { name = "cctools", kind = "build", when = { platform = { os = "macos", version_lt = "10.5" } } },
/// ]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "DependencyRepr")]
pub struct Dependency {
  pub name: String,
  pub kind: DependencyKind,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub when: Option<Condition>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DependencyRepr {
  Name(String),
  Full(DependencyTable),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DependencyTable {
  name: String,
  #[serde(default)]
  kind: DependencyKind,
  #[serde(default)]
  when: Option<Condition>,
}

impl From<DependencyRepr> for Dependency {
  fn from(repr: DependencyRepr) -> Self {
    match repr {
      DependencyRepr::Name(name) => Dependency {
        name,
        kind: DependencyKind::Run,
        when: None,
      },
      DependencyRepr::Full(t) => Dependency {
        name: t.name,
        kind: t.kind,
        when: t.when,
      },
    }
  }
}

/// Where a patch's unified diff comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchSource {
  /// Path to a diff file; relative paths are resolved against the descriptor's directory on load.
  File(PathBuf),
  Inline(String),
}

/// A unified diff applied to the extracted source tree before building.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PatchRepr", into = "PatchRepr")]
pub struct PatchSpec {
  pub source: PatchSource,
  /// Leading path components stripped from diff file names (`patch -pN`).
  pub strip: usize,
  pub when: Option<Condition>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PatchRepr {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  file: Option<PathBuf>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  inline: Option<String>,
  #[serde(default = "default_strip")]
  strip: usize,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  when: Option<Condition>,
}

fn default_strip() -> usize {
  1
}

impl TryFrom<PatchRepr> for PatchSpec {
  type Error = String;

  fn try_from(repr: PatchRepr) -> Result<Self, Self::Error> {
    let source = match (repr.file, repr.inline) {
      (Some(file), None) => PatchSource::File(file),
      (None, Some(inline)) => PatchSource::Inline(inline),
      (Some(_), Some(_)) => return Err("patch must set exactly one of 'file' or 'inline', not both".to_string()),
      (None, None) => return Err("patch must set one of 'file' or 'inline'".to_string()),
    };
    Ok(PatchSpec {
      source,
      strip: repr.strip,
      when: repr.when,
    })
  }
}

impl From<PatchSpec> for PatchRepr {
  fn from(spec: PatchSpec) -> Self {
    let (file, inline) = match spec.source {
      PatchSource::File(path) => (Some(path), None),
      PatchSource::Inline(text) => (None, Some(text)),
    };
    PatchRepr {
      file,
      inline,
      strip: spec.strip,
      when: spec.when,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvAction {
  Set(String),
  Unset,
}

/// One environment override applied to the build's overlay.
///
/// ```toml
/// [[env]]
/// name = "LD"
/// unset = true
///
/// [[env]]
/// name = "AS"
/// value = "$${formula:cctools}/bin/as"
/// tool = true
/// when = { platform = { os = "macos", version_lt = "10.5" } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EnvRepr", into = "EnvRepr")]
pub struct EnvRule {
  pub name: String,
  pub action: EnvAction,
  /// The value names an executable that must exist when the build starts.
  pub tool: bool,
  pub when: Option<Condition>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnvRepr {
  name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  value: Option<String>,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  unset: bool,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  tool: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  when: Option<Condition>,
}

impl TryFrom<EnvRepr> for EnvRule {
  type Error = String;

  fn try_from(repr: EnvRepr) -> Result<Self, Self::Error> {
    let action = match (repr.value, repr.unset) {
      (Some(value), false) => EnvAction::Set(value),
      (None, true) => EnvAction::Unset,
      (Some(_), true) => return Err(format!("env '{}' cannot both set a value and unset", repr.name)),
      (None, false) => return Err(format!("env '{}' needs 'value' or 'unset = true'", repr.name)),
    };
    if repr.tool && action == EnvAction::Unset {
      return Err(format!("env '{}' is marked as a tool but unsets the variable", repr.name));
    }
    Ok(EnvRule {
      name: repr.name,
      action,
      tool: repr.tool,
      when: repr.when,
    })
  }
}

impl From<EnvRule> for EnvRepr {
  fn from(rule: EnvRule) -> Self {
    let (value, unset) = match rule.action {
      EnvAction::Set(value) => (Some(value), false),
      EnvAction::Unset => (None, true),
    };
    EnvRepr {
      name: rule.name,
      value,
      unset,
      tool: rule.tool,
      when: rule.when,
    }
  }
}

/// A declarative autoconf-style configure step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigureSpec {
  /// Script path, relative to the build directory.
  #[serde(default = "default_script")]
  pub script: String,
  /// Out-of-tree build directory below the source root, created before configuring.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub build_dir: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub target: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub host: Option<String>,
  /// Front-ends always passed to `--enable-languages`.
  #[serde(default)]
  pub languages: Vec<String>,
  /// Front-ends added when a flag is enabled.
  #[serde(default)]
  pub flag_languages: BTreeMap<String, Vec<String>>,
  /// Append `--program-suffix=-<major.minor>`.
  #[serde(default)]
  pub program_suffix: bool,
  #[serde(default)]
  pub args: Vec<String>,
}

fn default_script() -> String {
  "./configure".to_string()
}

/// One recipe step. Steps default to the configure build directory, or the source root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StepRepr", into = "StepRepr")]
pub struct Step {
  pub command: StepCommand,
  pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepCommand {
  Program { program: String, args: Vec<String> },
  Shell(String),
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepRepr {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  program: Option<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  args: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  shell: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  cwd: Option<String>,
}

impl TryFrom<StepRepr> for Step {
  type Error = String;

  fn try_from(repr: StepRepr) -> Result<Self, Self::Error> {
    let command = match (repr.program, repr.shell) {
      (Some(program), None) => StepCommand::Program { program, args: repr.args },
      (None, Some(script)) if repr.args.is_empty() => StepCommand::Shell(script),
      (None, Some(_)) => return Err("shell steps take no 'args'".to_string()),
      (Some(_), Some(_)) => return Err("step must set exactly one of 'program' or 'shell'".to_string()),
      (None, None) => return Err("step must set one of 'program' or 'shell'".to_string()),
    };
    Ok(Step { command, cwd: repr.cwd })
  }
}

impl From<Step> for StepRepr {
  fn from(step: Step) -> Self {
    match step.command {
      StepCommand::Program { program, args } => StepRepr {
        program: Some(program),
        args,
        shell: None,
        cwd: step.cwd,
      },
      StepCommand::Shell(script) => StepRepr {
        program: None,
        args: Vec::new(),
        shell: Some(script),
        cwd: step.cwd,
      },
    }
  }
}

/// Post-install adjustments applied to the installed prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FinishRules {
  /// Globs, relative to the prefix, of files renamed to embed the version suffix.
  #[serde(default)]
  pub version_suffix: Vec<String>,
  /// Extra paths, relative to the prefix, removed after install. The info
  /// index trees are always removed on top of these.
  #[serde(default)]
  pub remove: Vec<String>,
}
