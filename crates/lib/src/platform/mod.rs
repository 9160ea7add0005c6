//! Host platform detection and platform predicates.
//!
//! Formulas condition dependencies, environment rules and patches on the
//! host platform (for instance "macOS older than 10.5"). Those conditions are
//! expressed as [`PlatformPredicate`]s and evaluated once against a
//! [`Platform`] value, never re-checked while a build runs.

pub mod arch;
pub mod os;
pub mod paths;

use std::cmp::Ordering;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::consts::ENV_OS_VERSION;

pub use arch::Arch;
pub use os::Os;

/// Description of the host a build runs on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Platform {
  pub os: Option<Os>,
  pub arch: Option<Arch>,
  /// Version of the running OS: the kernel release on Linux and the BSDs,
  /// the product version on macOS (`"10.4.11"`, never the Darwin release).
  pub os_version: Option<String>,
}

impl Platform {
  /// Create a platform description from explicit values.
  pub fn new(os: Os, arch: Arch, os_version: Option<&str>) -> Self {
    Self {
      os: Some(os),
      arch: Some(arch),
      os_version: os_version.map(str::to_string),
    }
  }

  /// Detect the current platform at runtime.
  ///
  /// `KILN_OS_VERSION` overrides the detected OS version.
  pub fn current() -> Self {
    let os_version = std::env::var(ENV_OS_VERSION).ok().or_else(detect_os_version);
    Self {
      os: Os::current(),
      arch: Arch::current(),
      os_version,
    }
  }

  /// Returns the platform triple string (e.g., "aarch64-darwin")
  pub fn triple(&self) -> String {
    let arch = self.arch.map(|a| a.as_str()).unwrap_or("unknown");
    let os = self.os.map(|o| o.as_str()).unwrap_or("unknown");
    format!("{arch}-{os}")
  }
}

impl fmt::Display for Platform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.os_version {
      Some(version) => write!(f, "{} ({})", self.triple(), version),
      None => write!(f, "{}", self.triple()),
    }
  }
}

/// Holds the product version on macOS; `uname` only reports the Darwin kernel release.
#[cfg_attr(not(unix), allow(dead_code))]
const SYSTEM_VERSION_PLIST: &str = "/System/Library/CoreServices/SystemVersion.plist";

#[cfg_attr(not(unix), allow(dead_code))]
static PRODUCT_VERSION: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"<key>ProductVersion</key>\s*<string>\s*([0-9][0-9.]*)\s*</string>").expect("valid plist regex")
});

#[cfg(unix)]
fn detect_os_version() -> Option<String> {
  let uname = rustix::system::uname();
  let release = uname.release().to_string_lossy().trim().to_string();
  if cfg!(target_os = "macos") {
    return std::fs::read_to_string(SYSTEM_VERSION_PLIST)
      .ok()
      .and_then(|plist| product_version_from_plist(&plist))
      .or_else(|| macos_version_from_darwin(&release));
  }
  if release.is_empty() { None } else { Some(release) }
}

/// `ProductVersion` from a `SystemVersion.plist` document.
#[cfg_attr(not(unix), allow(dead_code))]
fn product_version_from_plist(plist: &str) -> Option<String> {
  PRODUCT_VERSION.captures(plist).map(|c| c[1].to_string())
}

/// macOS `major.minor` for a Darwin kernel release (Darwin 9 is 10.5, Darwin 20 is 11).
#[cfg_attr(not(unix), allow(dead_code))]
fn macos_version_from_darwin(release: &str) -> Option<String> {
  let major: u64 = release.split('.').next()?.parse().ok()?;
  match major {
    5..=19 => Some(format!("10.{}", major - 4)),
    20.. => Some(format!("{}.0", major - 9)),
    _ => None,
  }
}

#[cfg(not(unix))]
fn detect_os_version() -> Option<String> {
  None
}

/// A condition on the host platform.
///
/// Every field that is set must match. Version bounds compare dotted numeric
/// versions component-wise; a bound never matches when the host version is
/// unknown.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformPredicate {
  #[serde(default, deserialize_with = "deserialize_parsed", skip_serializing_if = "Option::is_none")]
  pub os: Option<Os>,
  #[serde(default, deserialize_with = "deserialize_parsed", skip_serializing_if = "Option::is_none")]
  pub arch: Option<Arch>,
  /// Host OS version strictly below this bound.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub version_lt: Option<String>,
  /// Host OS version at or above this bound.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub version_ge: Option<String>,
}

impl PlatformPredicate {
  pub fn matches(&self, platform: &Platform) -> bool {
    if let Some(os) = self.os
      && platform.os != Some(os)
    {
      return false;
    }
    if let Some(arch) = self.arch
      && platform.arch != Some(arch)
    {
      return false;
    }
    if let Some(bound) = &self.version_lt {
      match &platform.os_version {
        Some(v) if compare_versions(v, bound) == Ordering::Less => {}
        _ => return false,
      }
    }
    if let Some(bound) = &self.version_ge {
      match &platform.os_version {
        Some(v) if compare_versions(v, bound) != Ordering::Less => {}
        _ => return false,
      }
    }
    true
  }
}

impl Serialize for Os {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(self.as_str())
  }
}

impl Serialize for Arch {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(self.as_str())
  }
}

fn deserialize_parsed<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
  D: Deserializer<'de>,
  T: std::str::FromStr<Err = String>,
{
  let raw = Option::<String>::deserialize(deserializer)?;
  raw.map(|s| s.parse::<T>().map_err(serde::de::Error::custom)).transpose()
}

/// Compare two dotted versions numerically (`"10.4.11" < "10.5"`).
///
/// Each component compares by its leading digits; missing components count
/// as zero, so `"10.5"` equals `"10.5.0"`. Anything after `-` or `+` is
/// ignored.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
  let parse = |s: &str| -> Vec<u64> {
    let core = s.split(['-', '+']).next().unwrap_or(s);
    core
      .split('.')
      .map(|part| {
        let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse().unwrap_or(0)
      })
      .collect()
  };
  let (left, right) = (parse(a), parse(b));
  let len = left.len().max(right.len());
  for i in 0..len {
    let l = left.get(i).copied().unwrap_or(0);
    let r = right.get(i).copied().unwrap_or(0);
    match l.cmp(&r) {
      Ordering::Equal => continue,
      other => return other,
    }
  }
  Ordering::Equal
}
