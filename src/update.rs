//! Deciding whether files need updating, and preparing single-file updates.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io;
use std::thread;

use log::{debug, warn};
use thiserror::Error;

use crate::command_line::{
    reify_command_line, CommandLine, CommandLineParameters, CommandLineTemplate,
    CommandLineTemplateVariable,
};
use crate::depfile;
use crate::dir_cache::{DirCreateError, DirectoryCache};
use crate::hash_cache::{hash_seq, hash_str, FileHashCache, HashStream};
use crate::path::{dirname, get_relative_path};
use crate::update_log;
use crate::update_map::UpdateMap;

/// Everything the update of files needs around: the project root, the
/// persistent log, the content and directory caches, and the run options.
/// Owned by the executor thread only; workers never see it.
pub struct UpdateContext {
    /// Absolute path of the directory containing all the files we deal
    /// with. "Local" paths across the engine are relative to it.
    pub root_path: String,
    pub log_cache: update_log::Cache,
    pub hash_cache: FileHashCache,
    pub dir_cache: DirectoryCache,
    /// Print each command on stdout before running it.
    pub print_commands: bool,
    /// Maximum number of update processes run in parallel; 0 picks a
    /// default from the CPU count.
    pub concurrency: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessFailureKind {
    UnexpectedStdout,
    AbnormalExit,
    NonZeroStatus,
}

impl std::fmt::Display for ProcessFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let description = match self {
            ProcessFailureKind::UnexpectedStdout => "process has unexpected output on stdout",
            ProcessFailureKind::AbnormalExit => "process terminated unexpectedly",
            ProcessFailureKind::NonZeroStatus => "process terminated with a non-zero exit code",
        };
        write!(f, "{}", description)
    }
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(
        "the output file `{local_target_path}' was detected to depend on the generated file \
         `{local_dependency_path}'; it must be specified explicitly in the \
         \"order_only_dependencies\" section of the rule"
    )]
    UndeclaredRuleDependency { local_target_path: String, local_dependency_path: String },
    #[error("failed to update `{local_target_path}': {kind}")]
    ProcessFailed { local_target_path: String, kind: ProcessFailureKind },
    #[error("failed to read the depfile: {0}")]
    Depfile(#[from] depfile::Error),
    #[error(transparent)]
    DirCreate(#[from] DirCreateError),
    #[error(transparent)]
    Log(#[from] update_log::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn hash_command_line_template(template: &CommandLineTemplate) -> u64 {
    let hash_variable = |variable: &CommandLineTemplateVariable| -> u64 {
        match variable {
            CommandLineTemplateVariable::InputFiles => 0,
            CommandLineTemplateVariable::OutputFiles => 1,
            CommandLineTemplateVariable::DependencyFile => 2,
        }
    };
    let parts_hash = hash_seq(template.parts.iter().map(|part| {
        HashStream::new(0)
            .push(hash_seq(part.literal_args.iter().map(|arg| hash_str(arg))))
            .push(hash_seq(part.variable_args.iter().map(hash_variable)))
            .digest()
    }));
    let environment_hash = hash_seq(
        template
            .environment
            .iter()
            .map(|(key, value)| HashStream::new(0).push(hash_str(key)).push(hash_str(value)).digest()),
    );
    HashStream::new(0)
        .push(hash_str(&template.binary_path))
        .push(parts_hash)
        .push(environment_hash)
        .digest()
}

fn hash_files<'a, I: IntoIterator<Item = &'a String>>(
    hash_cache: &mut FileHashCache,
    root_path: &str,
    local_paths: I,
) -> io::Result<u64> {
    let mut stream = HashStream::new(0);
    for local_path in local_paths {
        stream.push(hash_str(local_path));
        stream.push(hash_cache.hash(&format!("{}/{}", root_path, local_path))?);
    }
    Ok(stream.digest())
}

/// The imprint of a target: a digest of the command line template, the
/// content of the direct inputs, of the order-only dependencies, and of the
/// previously discovered depfile dependencies. Identical imprints mean
/// identical build inputs.
pub fn get_target_imprint(
    hash_cache: &mut FileHashCache,
    root_path: &str,
    local_src_paths: &[String],
    dep_paths: &[String],
    dependency_local_paths: &[String],
    template: &CommandLineTemplate,
) -> io::Result<u64> {
    let mut stream = HashStream::new(0);
    stream.push(hash_command_line_template(template));
    stream.push(hash_files(hash_cache, root_path, local_src_paths)?);
    stream.push(hash_files(hash_cache, root_path, dep_paths)?);
    stream.push(hash_files(hash_cache, root_path, dependency_local_paths)?);
    Ok(stream.digest())
}

/// Whether `local_target_path` can be skipped: it has a log record, its
/// content still matches the recorded hash, and the freshly computed imprint
/// matches the recorded one. A target file modified or deleted by hand, or
/// any missing input, makes the target stale rather than failing the run.
pub fn is_file_up_to_date(
    log_cache: &update_log::Cache,
    hash_cache: &mut FileHashCache,
    root_path: &str,
    local_target_path: &str,
    local_src_paths: &[String],
    dep_paths: &[String],
    template: &CommandLineTemplate,
) -> Result<bool, UpdateError> {
    let record = match log_cache.find(local_target_path) {
        None => return Ok(false),
        Some(record) => record.clone(),
    };
    match hash_cache.hash(&format!("{}/{}", root_path, local_target_path)) {
        Ok(new_hash) if new_hash == record.hash => {}
        Ok(_) => {
            warn!(
                "`{}' was modified manually since it was generated; updating it again",
                local_target_path
            );
            return Ok(false);
        }
        Err(ref error) if error.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(error) => return Err(error.into()),
    }
    match get_target_imprint(
        hash_cache,
        root_path,
        local_src_paths,
        dep_paths,
        &record.dependency_local_paths,
        template,
    ) {
        Ok(new_imprint) => Ok(new_imprint == record.imprint),
        Err(ref error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error.into()),
    }
}

type DepfileReaderHandle = thread::JoinHandle<Result<Option<depfile::DepfileData>, depfile::Error>>;

/// A file update handed over to the worker pool, with the pieces the
/// executor needs at finalization: the temp FIFO directory, the depfile
/// reader task, and the dummy write side that keeps the FIFO alive until
/// the subprocess has exited.
pub struct ScheduledFileUpdate {
    pub command_line: CommandLine,
    read_depfile_thread: DepfileReaderHandle,
    depfile_dir: tempfile::TempDir,
    depfile_dummy_writer: std::fs::File,
}

/// Prepare a single-file update: temp FIFO, reified command line, output
/// directory, hash invalidation. The returned job is ready for dispatch.
pub fn schedule_file_update(
    cx: &mut UpdateContext,
    template: &CommandLineTemplate,
    local_src_paths: &[String],
    local_target_path: &str,
    working_path: &str,
) -> Result<ScheduledFileUpdate, UpdateError> {
    let depfile_dir = tempfile::Builder::new().prefix("upd.").tempdir()?;
    let depfile_path = depfile_dir.path().join("dep");
    crate::io::mkfifo(&depfile_path)?;
    let depfile_path_str = depfile_path.to_string_lossy().into_owned();

    let command_line = reify_command_line(
        template,
        &CommandLineParameters {
            dependency_file: depfile_path_str.clone(),
            input_files: local_src_paths.to_vec(),
            output_files: vec![local_target_path.to_string()],
        },
        &cx.root_path,
        working_path,
    );
    println!("updating: {}", local_target_path);
    if cx.print_commands {
        println!("$ {}", command_line);
    }
    cx.dir_cache.create(&dirname(local_target_path))?;

    let reader_path = depfile_path_str;
    let read_depfile_thread = thread::Builder::new()
        .name(format!("upd-depfile-{}", local_target_path.replace('/', "_")))
        .spawn(move || depfile::read(&reader_path))?;
    cx.hash_cache.invalidate(&format!("{}/{}", cx.root_path, local_target_path));

    // Opening the write side guarantees the reader thread unblocks even if
    // the subprocess never opens the depfile; it is closed only once the
    // subprocess has exited, in `finalize_scheduled_update`.
    let depfile_dummy_writer = OpenOptions::new().write(true).open(depfile_dir.path().join("dep"))?;

    debug!("scheduled update of `{}'", local_target_path);
    Ok(ScheduledFileUpdate { command_line, read_depfile_thread, depfile_dir, depfile_dummy_writer })
}

/// After a successful subprocess: collect the depfile, validate the
/// discovered dependencies, recompute the imprint and content hash, and
/// append the record to the log.
pub fn finalize_scheduled_update(
    cx: &mut UpdateContext,
    sfu: ScheduledFileUpdate,
    template: &CommandLineTemplate,
    local_src_paths: &[String],
    dep_paths: &[String],
    local_target_path: &str,
    updm: &UpdateMap,
    order_only_dependency_file_paths: &std::collections::BTreeSet<String>,
    working_path: &str,
) -> Result<(), UpdateError> {
    let ScheduledFileUpdate { read_depfile_thread, depfile_dir, depfile_dummy_writer, .. } = sfu;
    drop(depfile_dummy_writer);
    let depfile_data = read_depfile_thread
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "depfile reader thread panicked"))??;
    depfile_dir.close()?;

    let mut dependency_local_paths: Vec<String> = Vec::new();
    if let Some(depfile_data) = depfile_data {
        let local_src_path_set: HashSet<&String> = local_src_paths.iter().collect();
        for dep_path in depfile_data.dependency_paths {
            let dep_path = get_relative_path(&cx.root_path, &dep_path, working_path);
            if local_src_path_set.contains(&dep_path) {
                continue;
            }
            if updm.output_files_by_path.contains_key(&dep_path)
                && !order_only_dependency_file_paths.contains(&dep_path)
            {
                return Err(UpdateError::UndeclaredRuleDependency {
                    local_target_path: local_target_path.to_string(),
                    local_dependency_path: dep_path,
                });
            }
            dependency_local_paths.push(dep_path);
        }
    }

    let new_imprint = get_target_imprint(
        &mut cx.hash_cache,
        &cx.root_path,
        local_src_paths,
        dep_paths,
        &dependency_local_paths,
        template,
    )?;
    let new_hash = cx.hash_cache.hash(&format!("{}/{}", cx.root_path, local_target_path))?;
    cx.log_cache.record(
        local_target_path,
        update_log::FileRecord { imprint: new_imprint, hash: new_hash, dependency_local_paths },
    )?;
    debug!("recorded update of `{}'", local_target_path);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command_line::{CommandLineTemplatePart, Environment};
    use std::fs;

    fn template_with_env(environment: Environment) -> CommandLineTemplate {
        CommandLineTemplate {
            binary_path: "cc".to_string(),
            parts: vec![CommandLineTemplatePart {
                literal_args: vec!["-c".to_string()],
                variable_args: vec![CommandLineTemplateVariable::InputFiles],
            }],
            environment,
        }
    }

    #[test]
    fn template_hash_is_stable_and_sensitive() {
        let template = template_with_env(Environment::new());
        assert_eq!(hash_command_line_template(&template), hash_command_line_template(&template));

        let mut other = template.clone();
        other.binary_path = "c++".to_string();
        assert_ne!(hash_command_line_template(&template), hash_command_line_template(&other));

        let mut with_env = template.clone();
        with_env.environment.insert("LANG".to_string(), "C".to_string());
        assert_ne!(hash_command_line_template(&template), hash_command_line_template(&with_env));
    }

    #[test]
    fn imprint_changes_with_input_content() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().to_string_lossy().into_owned();
        fs::write(temp.path().join("a.c"), "int x;").unwrap();
        let template = template_with_env(Environment::new());
        let sources = vec!["a.c".to_string()];

        let mut hash_cache = FileHashCache::new();
        let before =
            get_target_imprint(&mut hash_cache, &root, &sources, &[], &[], &template).unwrap();

        fs::write(temp.path().join("a.c"), "int y;").unwrap();
        let mut fresh_cache = FileHashCache::new();
        let after =
            get_target_imprint(&mut fresh_cache, &root, &sources, &[], &[], &template).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn up_to_date_checks_record_content_and_imprint() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().to_string_lossy().into_owned();
        fs::write(temp.path().join("a.c"), "int x;").unwrap();
        fs::write(temp.path().join("a.o"), "OBJ").unwrap();
        let log_path = temp.path().join("log").to_string_lossy().into_owned();
        let template = template_with_env(Environment::new());
        let sources = vec!["a.c".to_string()];

        let mut log_cache = update_log::Cache::from_log_file(&log_path).unwrap();
        let mut hash_cache = FileHashCache::new();

        // Nothing recorded yet.
        assert!(!is_file_up_to_date(
            &log_cache, &mut hash_cache, &root, "a.o", &sources, &[], &template
        )
        .unwrap());

        let imprint =
            get_target_imprint(&mut hash_cache, &root, &sources, &[], &[], &template).unwrap();
        let content_hash = hash_cache.hash(&format!("{}/a.o", root)).unwrap();
        log_cache
            .record(
                "a.o",
                update_log::FileRecord {
                    imprint,
                    hash: content_hash,
                    dependency_local_paths: vec![],
                },
            )
            .unwrap();
        assert!(is_file_up_to_date(
            &log_cache, &mut hash_cache, &root, "a.o", &sources, &[], &template
        )
        .unwrap());

        // Manual modification of the output: stale, not fatal.
        fs::write(temp.path().join("a.o"), "TAMPERED").unwrap();
        let mut fresh_cache = FileHashCache::new();
        assert!(!is_file_up_to_date(
            &log_cache, &mut fresh_cache, &root, "a.o", &sources, &[], &template
        )
        .unwrap());

        // Removed output: stale as well.
        fs::remove_file(temp.path().join("a.o")).unwrap();
        let mut fresh_cache = FileHashCache::new();
        assert!(!is_file_up_to_date(
            &log_cache, &mut fresh_cache, &root, "a.o", &sources, &[], &template
        )
        .unwrap());
    }

    #[test]
    fn up_to_date_is_false_when_inputs_changed() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().to_string_lossy().into_owned();
        fs::write(temp.path().join("a.c"), "int x;").unwrap();
        fs::write(temp.path().join("a.o"), "OBJ").unwrap();
        let log_path = temp.path().join("log").to_string_lossy().into_owned();
        let template = template_with_env(Environment::new());
        let sources = vec!["a.c".to_string()];

        let mut log_cache = update_log::Cache::from_log_file(&log_path).unwrap();
        let mut hash_cache = FileHashCache::new();
        let imprint =
            get_target_imprint(&mut hash_cache, &root, &sources, &[], &[], &template).unwrap();
        let content_hash = hash_cache.hash(&format!("{}/a.o", root)).unwrap();
        log_cache
            .record(
                "a.o",
                update_log::FileRecord {
                    imprint,
                    hash: content_hash,
                    dependency_local_paths: vec![],
                },
            )
            .unwrap();

        fs::write(temp.path().join("a.c"), "int y;").unwrap();
        let mut fresh_cache = FileHashCache::new();
        assert!(!is_file_up_to_date(
            &log_cache, &mut fresh_cache, &root, "a.o", &sources, &[], &template
        )
        .unwrap());
    }
}
