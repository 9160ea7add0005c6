//! Crate-wide constants.

/// Directory name used under the XDG data and cache homes.
pub const APP_NAME: &str = "kiln";

/// Marker file written into a prefix once a formula is fully installed.
pub const COMPLETE_MARKER: &str = ".kiln-complete";

/// Lock file guarding the installation root.
pub const ROOT_LOCK_FILENAME: &str = ".lock";

/// Number of output lines kept in a `BuildFailure` for post-mortem diagnosis.
pub const OUTPUT_TAIL_LINES: usize = 40;

/// Info index trees the finisher removes from every prefix.
pub const INFO_TREES: &[&str] = &["share/info", "info"];

/// Version used for prefixes when neither the descriptor nor the URL name one.
pub const UNVERSIONED: &str = "unversioned";

/// 1980-01-01T00:00:00Z, the ZIP epoch.
pub const SOURCE_DATE_EPOCH: &str = "315532800";

pub const ENV_ROOT: &str = "KILN_ROOT";
pub const ENV_CACHE: &str = "KILN_CACHE";
pub const ENV_OS_VERSION: &str = "KILN_OS_VERSION";
