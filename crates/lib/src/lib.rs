//! kiln-lib: declarative package builds
//!
//! This crate provides everything behind the `kiln` command:
//! - `Formula`: a declarative descriptor of one package, loaded from TOML
//! - `resolve`: dependency resolution into an install plan
//! - `fetch`: source download with mirror fallback and a checksum-keyed cache
//! - `sandbox`: disposable build directories with patched sources
//! - `recipe`: sequential execution of the build commands
//! - `finish`: post-install renames so several versions can coexist
//! - `install`: the orchestrator tying the steps together

pub mod consts;
pub mod fetch;
pub mod finish;
pub mod formula;
pub mod install;
pub mod lock;
pub mod placeholder;
pub mod platform;
pub mod recipe;
pub mod resolve;
pub mod sandbox;
pub mod util;
