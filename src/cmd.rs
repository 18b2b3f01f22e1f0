//! The top-level command driver: what the binary runs once options are
//! parsed.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::DirBuilderExt;

use itertools::Itertools;
use log::info;
use thiserror::Error;

use crate::cli::{Action, Options};
use crate::dir_cache::DirectoryCache;
use crate::hash_cache::FileHashCache;
use crate::io::{find_root_path, getcwd, CannotFindRootError, CACHE_FOLDER, ROOTFILE_NAME};
use crate::manifest::{self, ManifestError};
use crate::path::{get_local_path, PathOutOfRootError};
use crate::report;
use crate::update::{UpdateContext, UpdateError};
use crate::update_log;
use crate::update_map::{gen_update_map, UpdateMapError};
use crate::update_plan::{build_update_plan, execute_update_plan, UpdatePlan};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    CannotFindRoot(#[from] CannotFindRootError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    UpdateMap(#[from] UpdateMapError),
    #[error("unknown output file: {0}")]
    UnknownTarget(String),
    #[error("specify at least one target to update")]
    NoTargets,
    #[error(transparent)]
    PathOutOfRoot(#[from] PathOutOfRootError),
    #[error(transparent)]
    Log(#[from] update_log::Error),
    #[error(transparent)]
    Update(#[from] UpdateError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Run the action selected on the command line.
pub fn run(options: &Options) -> Result<(), Error> {
    match options.action {
        Action::Version => {
            println!("upd version {}", crate::version());
            Ok(())
        }
        Action::Help => {
            crate::cli::print_help();
            Ok(())
        }
        Action::Init => {
            fs::OpenOptions::new().write(true).create(true).open(ROOTFILE_NAME)?;
            Ok(())
        }
        Action::Root => {
            let working_path = getcwd()?;
            let root_path = find_root_path(&working_path)?;
            println!("{}", root_path);
            Ok(())
        }
        Action::Update | Action::DotGraph | Action::ShellScript => {
            let working_path = getcwd()?;
            let root_path = find_root_path(&working_path)?;
            update_files(&root_path, &working_path, options)
        }
    }
}

/// Plan and perform (or report) the update of the requested targets.
pub fn update_files(
    root_path: &str,
    working_path: &str,
    options: &Options,
) -> Result<(), Error> {
    let manifest = manifest::read_from_file(root_path)?;
    let updm = gen_update_map(root_path, &manifest)?;
    let output_files_by_path = &updm.output_files_by_path;

    let mut plan = UpdatePlan::default();
    for relative_path in &options.relative_target_paths {
        let local_target_path = get_local_path(root_path, relative_path, working_path)?;
        if !output_files_by_path.contains_key(&local_target_path) {
            return Err(Error::UnknownTarget(relative_path.clone()));
        }
        build_update_plan(&mut plan, output_files_by_path, &local_target_path);
    }
    if options.update_all_files {
        for local_target_path in output_files_by_path.keys().sorted() {
            build_update_plan(&mut plan, output_files_by_path, local_target_path);
        }
    } else if plan.pending_output_file_paths.is_empty() {
        return Err(Error::NoTargets);
    }

    match options.action {
        Action::DotGraph => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            report::output_dot_graph(
                &mut out,
                &updm,
                &mut plan,
                &manifest.command_line_templates,
            )?;
            out.flush()?;
            return Ok(());
        }
        Action::ShellScript => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            report::output_shell_script(
                &mut out,
                &updm,
                &mut plan,
                &manifest.command_line_templates,
            )?;
            out.flush()?;
            return Ok(());
        }
        _ => {}
    }

    info!("updating {} pending output file(s)", plan.pending_output_file_paths.len());
    let cache_dir_path = format!("{}/{}", root_path, CACHE_FOLDER);
    match fs::DirBuilder::new().mode(0o700).create(&cache_dir_path) {
        Ok(()) => {}
        Err(ref error) if error.kind() == io::ErrorKind::AlreadyExists => {}
        Err(error) => return Err(error.into()),
    }
    let log_file_path = format!("{}/log", cache_dir_path);
    let temp_log_file_path = format!("{}/log_rewritten", cache_dir_path);

    let log_cache = update_log::Cache::from_log_file(&log_file_path)?;
    let mut cx = UpdateContext {
        root_path: root_path.to_string(),
        log_cache,
        hash_cache: FileHashCache::new(),
        dir_cache: DirectoryCache::new(root_path),
        print_commands: options.print_commands,
        concurrency: options.concurrency,
    };

    let pool = crate::worker::WorkerPool::new(cx.concurrency);
    let execute_result = execute_update_plan(
        &mut cx,
        &updm,
        &mut plan,
        &manifest.command_line_templates,
        working_path,
        pool,
    );

    // The log is compacted even after a failed run so that everything
    // successfully updated stays cached for the next one.
    let UpdateContext { log_cache, .. } = cx;
    let records = log_cache.into_records();
    update_log::rewrite_file(&log_file_path, &temp_log_file_path, &records)?;

    execute_result.map_err(Error::from)
}
