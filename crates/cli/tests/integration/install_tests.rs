//! Integration tests for `kiln install`.

#![cfg(unix)]

use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn installs_dependency_chain() {
  let env = TestEnv::from_fixture("chain");

  env
    .kiln_cmd("install")
    .arg("mpfr")
    .assert()
    .success()
    .stdout(predicate::str::contains("gmp 5.1.3"))
    .stdout(predicate::str::contains("mpfr 3.1.2"));

  assert!(env.is_installed("gmp", "5.1.3"));
  assert!(env.is_installed("mpfr", "3.1.2"));

  // mpfr's build read gmp's prefix, so gmp must have been finished first.
  let lib = std::fs::read_to_string(env.prefix("mpfr", "3.1.2").join("lib/libmpfr.a")).unwrap();
  assert_eq!(lib.trim(), "gmp");
  assert!(env.sandboxes().is_empty());
}

#[test]
fn second_install_is_a_no_op() {
  let env = TestEnv::from_fixture("chain");

  env.kiln_cmd("install").arg("mpfr").assert().success();

  env
    .kiln_cmd("install")
    .arg("mpfr")
    .assert()
    .success()
    .stdout(predicate::str::contains("already installed"));
}

#[test]
fn cycle_exits_with_code_three() {
  let env = TestEnv::from_fixture("cycle");

  env
    .kiln_cmd("install")
    .arg("a")
    .assert()
    .code(3)
    .stderr(predicate::str::contains("dependency cycle"));

  assert!(!env.root().join("a").exists());
  assert!(!env.root().join("b").exists());
}

#[test]
fn build_failure_reports_output_and_skips_dependents() {
  let env = TestEnv::from_fixture("broken");

  env
    .kiln_cmd("install")
    .args(["gcc", "make"])
    .assert()
    .code(8)
    .stderr(predicate::str::contains("BuildFailure"))
    .stderr(predicate::str::contains("no acceptable C compiler found"))
    .stderr(predicate::str::contains("Skipped gcc"));

  assert!(!env.prefix("binutils", "2.24").exists());
  assert!(!env.prefix("gcc", "4.8.2").exists());
  assert!(env.is_installed("make", "4.0"));
}

#[test]
fn build_failure_json_report() {
  let env = TestEnv::from_fixture("broken");

  let output = env
    .kiln_cmd("install")
    .arg("--json")
    .arg("binutils")
    .output()
    .unwrap();
  assert_eq!(output.status.code(), Some(8));

  let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(report["exit_code"], 8);
  assert_eq!(report["failed"][0]["formula"], "binutils");
  assert_eq!(report["failed"][0]["kind"], "build");
  assert_eq!(report["failed"][0]["command_exit_code"], 2);
  assert!(
    report["failed"][0]["command"]
      .as_str()
      .unwrap()
      .contains("no acceptable C compiler found")
  );
  let tail = report["failed"][0]["output_tail"].as_str().unwrap();
  assert!(tail.contains("checking for C compiler"));
}

#[test]
fn keep_sandbox_leaves_build_directory() {
  let env = TestEnv::from_fixture("broken");

  env
    .kiln_cmd("install")
    .arg("--keep-sandbox")
    .arg("binutils")
    .assert()
    .code(8);

  assert_eq!(env.sandboxes().len(), 1);
}

#[test]
fn feature_flag_pulls_in_conditional_dependency() {
  let env = TestEnv::from_fixture("flags");

  env.kiln_cmd("install").arg("gcc").assert().success();
  assert!(env.is_installed("gcc", "4.8.2"));
  assert!(!env.prefix("ecj", "4.5").exists());

  let env = TestEnv::from_fixture("flags");
  env
    .kiln_cmd("install")
    .args(["--with", "java", "gcc"])
    .assert()
    .success();
  assert!(env.is_installed("ecj", "4.5"));
}

#[test]
fn fetched_source_is_verified_and_built() {
  use sha2::{Digest, Sha256};

  let env = TestEnv::empty();
  let archive = env.temp.path().join("hello-2.9.tar.gz");
  write_tarball(&archive, "hello-2.9", &[("install.sh", "mkdir -p \"$1/bin\" && echo hi > \"$1/bin/hello\"\n")]);
  let checksum = hex::encode(Sha256::digest(std::fs::read(&archive).unwrap()));

  env.write_formula(
    "hello",
    &format!(
      "name = \"hello\"\nurl = \"file://{}\"\nchecksum = \"sha256:{checksum}\"\n\n[[steps]]\nprogram = \"/bin/sh\"\nargs = [\"$${{src}}/install.sh\", \"$${{prefix}}\"]\n",
      archive.display()
    ),
  );

  env.kiln_cmd("install").arg("hello").assert().success();
  assert!(env.prefix("hello", "2.9").join("bin/hello").exists());
}

#[test]
fn checksum_mismatch_exits_with_code_six() {
  let env = TestEnv::empty();
  let archive = env.temp.path().join("hello-2.9.tar.gz");
  write_tarball(&archive, "hello-2.9", &[("README", "hello\n")]);

  env.write_formula(
    "hello",
    &format!(
      "name = \"hello\"\nurl = \"file://{}\"\nchecksum = \"sha256:{}\"\n",
      archive.display(),
      "0".repeat(64)
    ),
  );

  env
    .kiln_cmd("install")
    .arg("hello")
    .assert()
    .code(6)
    .stderr(predicate::str::contains("ChecksumMismatchError"));
  assert!(!env.prefix("hello", "2.9").exists());
}

fn write_tarball(path: &std::path::Path, top: &str, files: &[(&str, &str)]) {
  let file = std::fs::File::create(path).unwrap();
  let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
  let mut builder = tar::Builder::new(encoder);
  for (name, content) in files {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder
      .append_data(&mut header, format!("{top}/{name}"), content.as_bytes())
      .unwrap();
  }
  builder.into_inner().unwrap().finish().unwrap();
}
