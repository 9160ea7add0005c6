//! Integration tests for `kiln plan`.

use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn plan_orders_dependencies_first() {
  let env = TestEnv::from_fixture("chain");

  let output = env.kiln_cmd("plan").arg("mpfr").output().unwrap();
  assert!(output.status.success());

  let stdout = String::from_utf8(output.stdout).unwrap();
  let gmp = stdout.find("gmp").unwrap();
  let mpfr = stdout.find("mpfr").unwrap();
  assert!(gmp < mpfr, "unexpected order:\n{stdout}");
  assert!(stdout.contains("2 formula(s) to install"));
}

#[test]
fn plan_json_lists_entries() {
  let env = TestEnv::from_fixture("chain");

  let output = env.kiln_cmd("plan").arg("--json").arg("mpfr").output().unwrap();
  assert!(output.status.success());

  let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  let entries = plan.as_array().unwrap();
  assert_eq!(entries.len(), 2);
  assert_eq!(entries[0]["name"], "gmp");
  assert_eq!(entries[0]["version"], "5.1.3");
  assert_eq!(entries[0]["status"], "pending");
  assert_eq!(entries[1]["name"], "mpfr");
}

#[test]
fn plan_detects_cycle() {
  let env = TestEnv::from_fixture("cycle");

  env
    .kiln_cmd("plan")
    .arg("a")
    .assert()
    .code(3)
    .stderr(predicate::str::contains("dependency cycle"));
}

#[cfg(unix)]
#[test]
fn plan_marks_installed_formulas() {
  let env = TestEnv::from_fixture("chain");
  env.kiln_cmd("install").arg("gmp").assert().success();

  let output = env.kiln_cmd("plan").arg("--json").arg("mpfr").output().unwrap();
  let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(plan[0]["status"], "installed");
  assert_eq!(plan[1]["status"], "pending");
}
