//! Install orchestration.
//!
//! [`install`] drives a whole run:
//! 1. take the installation-root lock, so only one installer mutates the root;
//! 2. detect installed formulas by their completion markers and resolve the plan;
//! 3. prefetch every pending source concurrently (bounded by `fetch_parallelism`);
//! 4. walk the plan in order, building each formula in its own sandbox.
//!
//! Resolution errors abort before anything is fetched or built. After that,
//! a failing formula only takes its dependents down with it: they are
//! skipped, while independent formulas still install.

mod marker;
mod types;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::fetch::{Checksum, FetchError, SourceFetch};
use crate::finish;
use crate::formula::{Formula, FormulaSet};
use crate::lock::FileLock;
use crate::recipe;
use crate::resolve::{self, PlanStatus, ResolveContext, Resolution};
use crate::sandbox::{self, BuildContext};

pub use marker::{CompletionMarker, MarkerStatus, is_installed, read_marker, write_marker};
pub use types::{ErrorKind, InstallConfig, InstallError, InstallReport, InstalledFormula, SkippedFormula};

type FetchResults = HashMap<String, Result<PathBuf, FetchError>>;

/// Names of formulas whose prefix carries a completion marker.
pub fn installed_formulas(formulas: &FormulaSet, config: &InstallConfig) -> BTreeSet<String> {
  formulas
    .iter()
    .filter(|formula| is_installed(&config.prefix(formula)))
    .map(|formula| formula.name.clone())
    .collect()
}

/// Resolve the install plan for `targets` without side effects.
pub fn plan(formulas: &FormulaSet, targets: &[String], config: &InstallConfig) -> Result<Resolution, InstallError> {
  let ctx = ResolveContext {
    flags: config.flags.clone(),
    platform: config.platform.clone(),
    installed: installed_formulas(formulas, config),
  };
  Ok(resolve::resolve(formulas, targets, &ctx)?)
}

/// Download (or reuse from the cache) the sources of every pending formula in the plan.
///
/// Returns the local paths by formula name; the first fetch error in plan order fails the call.
pub async fn fetch_sources<F>(
  formulas: &FormulaSet,
  targets: &[String],
  config: &InstallConfig,
  fetcher: Arc<F>,
) -> Result<Vec<(String, PathBuf)>, InstallError>
where
  F: SourceFetch + 'static,
{
  let resolution = plan(formulas, targets, config)?;
  let mut results = prefetch(formulas, &resolution, fetcher, config.fetch_parallelism).await;

  let mut paths = Vec::new();
  for entry in resolution.pending() {
    match results.remove(&entry.name) {
      Some(Ok(path)) => paths.push((entry.name.clone(), path)),
      Some(Err(e)) => return Err(e.into()),
      None => {}
    }
  }
  Ok(paths)
}

/// Install `targets` and their dependencies into `config.root`.
///
/// Returns `Err` only for run-level failures (lock contention, resolution);
/// per-formula failures are collected in the report.
pub async fn install<F>(
  formulas: &FormulaSet,
  targets: &[String],
  config: &InstallConfig,
  fetcher: Arc<F>,
) -> Result<InstallReport, InstallError>
where
  F: SourceFetch + 'static,
{
  let _lock = FileLock::acquire_root(&config.root, "install")?;

  let resolution = plan(formulas, targets, config)?;
  info!(
    targets = ?targets,
    formulas = resolution.order.len(),
    pending = resolution.pending().count(),
    "install plan resolved"
  );

  let mut sources = prefetch(formulas, &resolution, fetcher, config.fetch_parallelism).await;

  let mut report = InstallReport {
    plan: resolution.order.clone(),
    ..Default::default()
  };
  // Formula -> the failed formula that blocks it (itself, if it failed).
  let mut blocked: HashMap<String, String> = HashMap::new();

  for entry in &resolution.order {
    if entry.status == PlanStatus::Installed {
      debug!(formula = %entry.name, "already installed");
      report.already_installed.push(entry.name.clone());
      continue;
    }
    let Some(formula) = formulas.get(&entry.name) else {
      continue;
    };

    let dependencies = resolution.graph.dependencies(&formula.name);
    if let Some(cause) = dependencies.iter().find_map(|(dep, _)| blocked.get(*dep)) {
      warn!(formula = %formula.name, failed_dependency = %cause, "skipping, dependency failed");
      let cause = cause.clone();
      report.skipped.push(SkippedFormula {
        name: formula.name.clone(),
        failed_dependency: cause.clone(),
      });
      blocked.insert(formula.name.clone(), cause);
      continue;
    }

    let dependency_prefixes = dependencies
      .iter()
      .filter_map(|(dep, _)| formulas.get(dep))
      .map(|dep| (dep.name.clone(), config.prefix(dep)))
      .collect();
    let source = sources.remove(&formula.name);

    match install_one(formula, source, dependency_prefixes, config).await {
      Ok(installed) => {
        info!(formula = %formula.name, prefix = ?installed.prefix, "installed");
        report.installed.push(installed);
      }
      Err(e) => {
        error!(formula = %formula.name, kind = %e.kind(), error = %e, "install failed");
        blocked.insert(formula.name.clone(), formula.name.clone());
        report.failed.push((formula.name.clone(), e));
      }
    }
  }

  Ok(report)
}

/// Fetch the sources of all pending formulas, at most `parallelism` at a time.
async fn prefetch<F>(formulas: &FormulaSet, resolution: &Resolution, fetcher: Arc<F>, parallelism: usize) -> FetchResults
where
  F: SourceFetch + 'static,
{
  let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
  let mut join_set = JoinSet::new();

  for entry in resolution.pending() {
    let Some(formula) = formulas.get(&entry.name) else {
      continue;
    };
    let (Some(url), Some(checksum)) = (&formula.url, &formula.checksum) else {
      continue;
    };
    let name = formula.name.clone();
    let url = url.clone();
    let mirror = formula.mirror.clone();
    let checksum: Checksum = checksum.clone();
    let fetcher = fetcher.clone();
    let semaphore = semaphore.clone();

    join_set.spawn(async move {
      // Acquire semaphore permit inside the task
      let Ok(_permit) = semaphore.acquire().await else {
        return (name, Err(FetchError::Task("fetch semaphore closed".to_string())));
      };
      let result = fetcher.fetch(&url, mirror.as_deref(), &checksum).await;
      (name, result)
    });
  }

  let mut results = HashMap::new();
  while let Some(joined) = join_set.join_next().await {
    match joined {
      Ok((name, result)) => {
        if let Err(e) = &result {
          warn!(formula = %name, error = %e, "fetch failed");
        }
        results.insert(name, result);
      }
      Err(e) => error!(error = %e, "fetch task panicked"),
    }
  }
  results
}

/// Build, finish and mark one formula.
///
/// On any failure before the finisher the prefix is removed again. A
/// finisher failure keeps the prefix and marks it as a conflict instead.
async fn install_one(
  formula: &Formula,
  source: Option<Result<PathBuf, FetchError>>,
  dependency_prefixes: BTreeMap<String, PathBuf>,
  config: &InstallConfig,
) -> Result<InstalledFormula, InstallError> {
  let prefix = config.prefix(formula);
  remove_stale_prefix(&prefix).await?;

  let source = match source {
    Some(result) => Some(result?),
    None if formula.url.is_some() => {
      return Err(FetchError::Task(format!("no fetch result for {}", formula.name)).into());
    }
    None => None,
  };

  let ctx = BuildContext {
    prefix: prefix.clone(),
    flags: config.flags.clone(),
    platform: config.platform.clone(),
    jobs: config.jobs,
    keep_sandbox: config.keep_sandbox,
    dependency_prefixes,
    sandbox_parent: config.sandbox_parent.clone(),
  };

  if let Err(e) = build(formula, source.as_deref(), &ctx).await {
    remove_prefix(&prefix).await;
    return Err(e);
  }

  let finish_formula = formula.clone();
  let finish_prefix = prefix.clone();
  let finished = tokio::task::spawn_blocking(move || finish::finish(&finish_formula, &finish_prefix))
    .await
    .map_err(|e| InstallError::Task(e.to_string()))?;

  match finished {
    Ok(report) => {
      write_marker(&prefix, &CompletionMarker::new(formula, MarkerStatus::Complete))?;
      Ok(InstalledFormula {
        name: formula.name.clone(),
        version: formula.version(),
        prefix,
        finish: report,
      })
    }
    Err(e) => {
      warn!(formula = %formula.name, prefix = ?prefix, "finisher failed, marking prefix for manual resolution");
      write_marker(&prefix, &CompletionMarker::new(formula, MarkerStatus::Conflict))?;
      Err(e.into())
    }
  }
}

/// Prepare the sandbox, run the recipe and make sure the prefix exists.
///
/// The sandbox is dropped (and removed) on every path out of here.
async fn build(formula: &Formula, source: Option<&Path>, ctx: &BuildContext) -> Result<(), InstallError> {
  let sandbox = sandbox::prepare(formula, source, ctx).await?;
  let invocations = recipe::invocations(formula, &sandbox, &ctx.prefix, &ctx.flags)?;
  let result = recipe::run(formula, &invocations).await;
  drop(sandbox);

  if let Some(failure) = result.failure {
    return Err(failure.into());
  }
  tokio::fs::create_dir_all(&ctx.prefix)
    .await
    .map_err(|source| InstallError::Io {
      path: ctx.prefix.clone(),
      source,
    })
}

/// Remove a prefix left behind by an interrupted build.
async fn remove_stale_prefix(prefix: &Path) -> Result<(), InstallError> {
  if !prefix.exists() || is_installed(prefix) {
    return Ok(());
  }
  info!(prefix = ?prefix, "removing stale prefix without completion marker");
  tokio::fs::remove_dir_all(prefix).await.map_err(|source| InstallError::Io {
    path: prefix.to_path_buf(),
    source,
  })
}

async fn remove_prefix(prefix: &Path) {
  if let Err(e) = tokio::fs::remove_dir_all(prefix).await
    && e.kind() != std::io::ErrorKind::NotFound
  {
    warn!(prefix = ?prefix, error = %e, "failed to remove prefix of failed build");
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use crate::consts::COMPLETE_MARKER;
  use crate::fetch::Fetcher;
  use crate::formula::parse_formula;
  use crate::util::testutil::{CountingFetcher, file_url, source_tarball};
  use tempfile::TempDir;

  struct Fixture {
    temp: TempDir,
    config: InstallConfig,
  }

  impl Fixture {
    fn new() -> Self {
      let temp = TempDir::new().unwrap();
      let mut config = InstallConfig::new(temp.path().join("root"), temp.path().join("cache"));
      config.sandbox_parent = Some(temp.path().join("sandboxes"));
      config.jobs = 2;
      Self { temp, config }
    }

    fn fetcher(&self) -> Arc<Fetcher> {
      Arc::new(Fetcher::new(&self.config.cache).unwrap())
    }

    fn path(&self, relative: &str) -> PathBuf {
      self.temp.path().join(relative)
    }
  }

  fn set(texts: &[&str]) -> FormulaSet {
    texts.iter().map(|t| parse_formula(t, None).unwrap()).collect()
  }

  fn targets(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
  }

  const INSTALL_STEP: &str = r#"
[[steps]]
shell = "mkdir -p $${prefix}/bin && echo $${name} > $${prefix}/bin/$${name}"
"#;

  #[tokio::test]
  async fn installs_dependency_before_dependent() {
    let fixture = Fixture::new();
    let order_log = fixture.path("order.log");
    let step = |name: &str| {
      format!(
        "name = \"{name}\"\nversion = \"1.0\"\n{}\n[[steps]]\nshell = \"echo {name} >> {}\"\n",
        if name == "app" { "dependencies = [\"lib\"]" } else { "" },
        order_log.display()
      )
    };
    let formulas = set(&[&step("app"), &step("lib")]);

    let report = install(&formulas, &targets(&["app"]), &fixture.config, fixture.fetcher())
      .await
      .unwrap();

    assert!(report.is_success());
    assert_eq!(std::fs::read_to_string(&order_log).unwrap(), "lib\napp\n");
    assert!(is_installed(&fixture.path("root/lib/1.0")));
    assert!(is_installed(&fixture.path("root/app/1.0")));
  }

  #[tokio::test]
  async fn failed_dependency_skips_dependents_and_keeps_independent() {
    let fixture = Fixture::new();
    let formulas = set(&[
      "name = \"a\"\nversion = \"1.0\"\n[[steps]]\nshell = \"mkdir -p $${prefix} && echo broken; exit 2\"\n",
      &format!("name = \"b\"\nversion = \"1.0\"\ndependencies = [\"a\"]\n{INSTALL_STEP}"),
      &format!("name = \"c\"\nversion = \"1.0\"\n{INSTALL_STEP}"),
    ]);

    let report = install(&formulas, &targets(&["b", "c"]), &fixture.config, fixture.fetcher())
      .await
      .unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "a");
    assert_eq!(report.failed[0].1.output_tail(), Some("broken"));
    assert_eq!(report.exit_code(), 8);
    assert_eq!(
      report.skipped,
      vec![SkippedFormula {
        name: "b".into(),
        failed_dependency: "a".into()
      }]
    );
    assert_eq!(report.installed.len(), 1);
    assert_eq!(report.installed[0].name, "c");
    assert!(!fixture.path("root/a/1.0").exists(), "failed prefix must be removed");
    assert!(!fixture.path("root/b/1.0").exists());
    let leftovers = std::fs::read_dir(fixture.path("sandboxes")).unwrap().count();
    assert_eq!(leftovers, 0);
  }

  #[tokio::test]
  async fn flag_conditional_dependency_is_excluded_without_flag() {
    let fixture = Fixture::new();
    let formulas = set(&[
      &format!(
        "name = \"gcc\"\nversion = \"4.8.2\"\ndependencies = [{{ name = \"gmp\", when = {{ flags = [\"java\"] }} }}]\n[feature_flags]\njava = \"Build the gcj front-end\"\n{INSTALL_STEP}"
      ),
      "name = \"gmp\"\nversion = \"5.1\"\n[[steps]]\nshell = \"exit 1\"\n",
    ]);

    let report = install(&formulas, &targets(&["gcc"]), &fixture.config, fixture.fetcher())
      .await
      .unwrap();

    assert!(report.is_success());
    let planned: Vec<_> = report.plan.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(planned, vec!["gcc"]);
  }

  #[tokio::test]
  async fn second_run_reports_already_installed() {
    let fixture = Fixture::new();
    let formulas = set(&[&format!("name = \"tool\"\nversion = \"2.0\"\n{INSTALL_STEP}")]);

    install(&formulas, &targets(&["tool"]), &fixture.config, fixture.fetcher())
      .await
      .unwrap();
    let second = install(&formulas, &targets(&["tool"]), &fixture.config, fixture.fetcher())
      .await
      .unwrap();

    assert!(second.installed.is_empty());
    assert_eq!(second.already_installed, vec!["tool"]);
  }

  #[tokio::test]
  async fn stale_prefix_is_removed_before_rebuild() {
    let fixture = Fixture::new();
    let stale = fixture.path("root/tool/2.0/leftover.o");
    std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
    std::fs::write(&stale, "half-built").unwrap();
    let formulas = set(&[&format!("name = \"tool\"\nversion = \"2.0\"\n{INSTALL_STEP}")]);

    let report = install(&formulas, &targets(&["tool"]), &fixture.config, fixture.fetcher())
      .await
      .unwrap();

    assert!(report.is_success());
    assert!(!stale.exists());
    assert!(fixture.path("root/tool/2.0/bin/tool").is_file());
  }

  #[tokio::test]
  async fn two_versions_coexist_with_suffixes() {
    let fixture = Fixture::new();
    let make = |version: &str| {
      format!(
        "name = \"avr-gcc\"\nversion = \"{version}\"\n[[steps]]\nshell = \"mkdir -p $${{prefix}}/lib && touch $${{prefix}}/lib/libiberty.a\"\n[finish]\nversion_suffix = [\"**/libiberty.*\"]\n"
      )
    };

    for version in ["4.8.2", "4.9.1"] {
      let formulas = set(&[&make(version)]);
      let report = install(&formulas, &targets(&["avr-gcc"]), &fixture.config, fixture.fetcher())
        .await
        .unwrap();
      assert!(report.is_success());
    }

    assert!(fixture.path("root/avr-gcc/4.8.2/lib/libiberty-4.8.a").is_file());
    assert!(fixture.path("root/avr-gcc/4.9.1/lib/libiberty-4.9.a").is_file());
  }

  #[tokio::test]
  async fn finisher_conflict_marks_prefix() {
    let fixture = Fixture::new();
    let formulas = set(&[
      "name = \"avr-gcc\"\nversion = \"4.8.2\"\n[[steps]]\nshell = \"mkdir -p $${prefix}/lib && touch $${prefix}/lib/libiberty.a $${prefix}/lib/libiberty-4.8.a\"\n[finish]\nversion_suffix = [\"**/libiberty.*\"]\n",
    ]);

    let report = install(&formulas, &targets(&["avr-gcc"]), &fixture.config, fixture.fetcher())
      .await
      .unwrap();

    assert_eq!(report.exit_code(), 9);
    let marker = read_marker(&fixture.path("root/avr-gcc/4.8.2")).unwrap().unwrap();
    assert_eq!(marker.status, MarkerStatus::Conflict);
  }

  #[tokio::test]
  async fn cycle_fails_before_any_fetch() {
    let fixture = Fixture::new();
    let checksum = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    let formulas = set(&[
      &format!("name = \"a\"\nurl = \"https://example.invalid/a-1.0.tar.gz\"\nchecksum = \"{checksum}\"\ndependencies = [\"b\"]\n"),
      &format!("name = \"b\"\nurl = \"https://example.invalid/b-1.0.tar.gz\"\nchecksum = \"{checksum}\"\ndependencies = [\"a\"]\n"),
    ]);
    let fetcher = Arc::new(CountingFetcher::default());

    let err = install(&formulas, &targets(&["a"]), &fixture.config, fetcher.clone())
      .await
      .unwrap_err();

    assert_eq!(err.exit_code(), 3);
    assert_eq!(fetcher.calls(), 0);
    assert!(!fixture.path("root/a").exists());
  }

  #[tokio::test]
  async fn fetched_source_is_built_in_sandbox() {
    let fixture = Fixture::new();
    let (archive, checksum) = source_tarball(
      &fixture.path("mirror"),
      "hello-1.0",
      &[("hello-1.0/install.sh", "mkdir -p \"$1/bin\" && echo hello > \"$1/bin/hello\"\n")],
    );
    let formulas = set(&[&format!(
      "name = \"hello\"\nurl = \"{}\"\nchecksum = \"{checksum}\"\n[[steps]]\nprogram = \"/bin/sh\"\nargs = [\"install.sh\", \"$${{prefix}}\"]\n",
      file_url(&archive)
    )]);

    let report = install(&formulas, &targets(&["hello"]), &fixture.config, fixture.fetcher())
      .await
      .unwrap();

    assert!(report.is_success(), "{:?}", report.failed);
    assert_eq!(report.installed[0].version, "1.0");
    assert_eq!(
      std::fs::read_to_string(fixture.path("root/hello/1.0/bin/hello")).unwrap(),
      "hello\n"
    );
    assert!(fixture.path(&format!("root/hello/1.0/{COMPLETE_MARKER}")).is_file());
  }

  #[tokio::test]
  async fn checksum_mismatch_exits_six() {
    let fixture = Fixture::new();
    let (archive, _) = source_tarball(&fixture.path("mirror"), "hello-1.0", &[("hello-1.0/README", "hi\n")]);
    let wrong = "sha256:0000000000000000000000000000000000000000000000000000000000000000";
    let formulas = set(&[&format!(
      "name = \"hello\"\nurl = \"{}\"\nchecksum = \"{wrong}\"\n",
      file_url(&archive)
    )]);

    let report = install(&formulas, &targets(&["hello"]), &fixture.config, fixture.fetcher())
      .await
      .unwrap();

    assert_eq!(report.exit_code(), 6);
    assert!(!fixture.path("root/hello").exists());
  }

  #[tokio::test]
  async fn root_lock_contention_is_an_error() {
    let fixture = Fixture::new();
    let _held = FileLock::acquire_root(&fixture.config.root, "other").unwrap();
    let formulas = set(&["name = \"x\"\n"]);

    let err = install(&formulas, &targets(&["x"]), &fixture.config, fixture.fetcher())
      .await
      .unwrap_err();

    assert!(matches!(err, InstallError::Lock(_)));
  }

  #[tokio::test]
  async fn fetch_sources_returns_cached_paths() {
    let fixture = Fixture::new();
    let (archive, checksum) = source_tarball(&fixture.path("mirror"), "gmp-5.1.3", &[("gmp-5.1.3/README", "gmp\n")]);
    let formulas = set(&[&format!(
      "name = \"gmp\"\nurl = \"{}\"\nchecksum = \"{checksum}\"\n",
      file_url(&archive)
    )]);

    let paths = fetch_sources(&formulas, &targets(&["gmp"]), &fixture.config, fixture.fetcher())
      .await
      .unwrap();

    assert_eq!(paths.len(), 1);
    assert!(paths[0].1.starts_with(&fixture.config.cache));
  }
}
