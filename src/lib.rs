//! The upd update engine.
//!
//! upd keeps a directory of files up-to-date according to a declarative
//! manifest: source file patterns, parameterized command line templates, and
//! rules mapping captured inputs onto output paths. Each run expands the
//! manifest into a dependency graph of output files, decides which outputs
//! are stale using a persistent content-addressed log, and runs the update
//! commands concurrently on a fixed pool of workers.

#![warn(rust_2018_idioms)]
#![allow(clippy::too_many_arguments)]

pub mod captured_string;
pub mod cli;
pub mod cmd;
pub mod command_line;
pub mod depfile;
pub mod dir_cache;
pub mod glob;
pub mod hash_cache;
pub mod io;
pub mod manifest;
pub mod path;
pub mod path_glob;
pub mod report;
pub mod substitution;
pub mod update;
pub mod update_log;
pub mod update_map;
pub mod update_plan;
pub mod worker;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
