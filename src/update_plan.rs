//! The update plan and its executor.
//!
//! At any point during a run, the plan describes the work left to do: which
//! output files are pending, which of them are ready right now (all their
//! generated inputs are done), and which files each pending output unblocks.
//! The executor drains the ready queue into the worker pool, reconciles
//! finished jobs, and erases completed targets, which in turn promotes
//! their descendants to ready.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use log::{debug, trace};

use crate::command_line::CommandLineTemplate;
use crate::update::{
    finalize_scheduled_update, is_file_up_to_date, schedule_file_update, ProcessFailureKind,
    ScheduledFileUpdate, UpdateContext, UpdateError,
};
use crate::update_map::{OutputFilesByPath, UpdateMap};
use crate::worker::WorkerPool;

/// The work left to do, as a dependency-counting queue over the subgraph of
/// requested targets.
#[derive(Debug, Default)]
pub struct UpdatePlan {
    /// Output files ready to be updated immediately: their inputs either are
    /// source files, or have already been updated.
    pub queued_output_file_paths: VecDeque<String>,
    /// All the files that remain to update.
    pub pending_output_file_paths: HashSet<String>,
    /// For each pending output, how many of its generated inputs still need
    /// updating before it can go.
    pub pending_input_counts_by_path: HashMap<String, usize>,
    /// For each input, the outputs it may unblock once updated.
    pub descendants_by_path: HashMap<String, Vec<String>>,
}

impl UpdatePlan {
    /// Remove a file from the plan, typically because it finished updating
    /// or was found up-to-date. Descendants whose pending-input count drops
    /// to zero are enqueued, each exactly once.
    pub fn erase(&mut self, local_target_path: &str) {
        self.pending_output_file_paths.remove(local_target_path);
        let descendants = match self.descendants_by_path.get(local_target_path) {
            None => return,
            Some(descendants) => descendants.clone(),
        };
        for descendant_path in descendants {
            let input_count = self
                .pending_input_counts_by_path
                .get_mut(&descendant_path)
                .expect("update plan is corrupted");
            assert!(*input_count > 0, "update plan is corrupted");
            *input_count -= 1;
            if *input_count == 0 {
                self.queued_output_file_paths.push_back(descendant_path);
            }
        }
    }
}

fn build_update_plan_for_path(
    plan: &mut UpdatePlan,
    output_files_by_path: &OutputFilesByPath,
    local_target_path: &str,
    local_input_path: &str,
) -> bool {
    if !output_files_by_path.contains_key(local_input_path) {
        return false;
    }
    plan.descendants_by_path
        .entry(local_input_path.to_string())
        .or_insert_with(Vec::new)
        .push(local_target_path.to_string());
    build_update_plan(plan, output_files_by_path, local_input_path);
    true
}

/// Add `local_target_path` and, transitively, all the generated files it
/// needs, to the plan. Safe to call for several targets; shared
/// dependencies are planned once.
pub fn build_update_plan(
    plan: &mut UpdatePlan,
    output_files_by_path: &OutputFilesByPath,
    local_target_path: &str,
) {
    if plan.pending_output_file_paths.contains(local_target_path) {
        return;
    }
    plan.pending_output_file_paths.insert(local_target_path.to_string());
    let descriptor = &output_files_by_path[local_target_path];
    let mut input_count = 0;
    for local_input_path in &descriptor.local_input_file_paths {
        if build_update_plan_for_path(plan, output_files_by_path, local_target_path, local_input_path)
        {
            input_count += 1;
        }
    }
    for local_dependency_path in &descriptor.order_only_dependency_file_paths {
        if build_update_plan_for_path(
            plan,
            output_files_by_path,
            local_target_path,
            local_dependency_path,
        ) {
            input_count += 1;
        }
    }
    if input_count == 0 {
        plan.queued_output_file_paths.push_back(local_target_path.to_string());
    } else {
        plan.pending_input_counts_by_path.insert(local_target_path.to_string(), input_count);
    }
}

/// Per-dispatched-job bookkeeping the executor holds on to until the worker
/// publishes the result.
struct InFlightUpdate {
    local_target_path: String,
    sfu: ScheduledFileUpdate,
    local_src_paths: Vec<String>,
    dep_paths: Vec<String>,
    order_only_dependency_file_paths: BTreeSet<String>,
    command_line_ix: usize,
}

/// Run the whole plan on the given worker pool. Ready targets that are
/// up-to-date are erased without running anything; the others are
/// dispatched as workers free up. On a fatal error (failing process,
/// undeclared dependency, I/O trouble) no new jobs are dispatched,
/// in-flight jobs are drained, and the first error is returned; files
/// updated successfully stay recorded in the log either way.
pub fn execute_update_plan(
    cx: &mut UpdateContext,
    updm: &UpdateMap,
    plan: &mut UpdatePlan,
    command_line_templates: &[CommandLineTemplate],
    working_path: &str,
    mut pool: WorkerPool,
) -> Result<(), UpdateError> {
    let mut in_flight: HashMap<usize, InFlightUpdate> = HashMap::new();
    let mut first_error: Option<UpdateError> = None;

    while !plan.pending_output_file_paths.is_empty() {
        if first_error.is_none() {
            if let Err(error) =
                dispatch_ready_targets(cx, updm, plan, command_line_templates, working_path, &mut pool, &mut in_flight)
            {
                first_error = Some(error);
            }
        }
        if in_flight.is_empty() {
            // Either dispatch stopped on an error, or everything left was
            // erased as up-to-date and the outer condition re-checks.
            if first_error.is_some() || plan.queued_output_file_paths.is_empty() {
                break;
            }
            continue;
        }

        let finished = pool.wait_finished();
        if finished.is_empty() {
            break;
        }
        for worker_ix in finished {
            let result = pool.take_result(worker_ix);
            let update = match in_flight.remove(&worker_ix) {
                Some(update) => update,
                None => continue,
            };
            match reconcile_finished_update(cx, updm, command_line_templates, working_path, update, result) {
                Ok(local_target_path) => plan.erase(&local_target_path),
                Err(error) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }
    }

    pool.shutdown();
    match first_error {
        None => Ok(()),
        Some(error) => Err(error),
    }
}

fn dispatch_ready_targets(
    cx: &mut UpdateContext,
    updm: &UpdateMap,
    plan: &mut UpdatePlan,
    command_line_templates: &[CommandLineTemplate],
    working_path: &str,
    pool: &mut WorkerPool,
    in_flight: &mut HashMap<usize, InFlightUpdate>,
) -> Result<(), UpdateError> {
    while let Some(local_target_path) = plan.queued_output_file_paths.front().cloned() {
        let descriptor = updm
            .output_files_by_path
            .get(&local_target_path)
            .expect("plan refers to a path missing from the update map");
        let template = &command_line_templates[descriptor.command_line_ix];
        let dep_paths: Vec<String> =
            descriptor.order_only_dependency_file_paths.iter().cloned().collect();
        if is_file_up_to_date(
            &cx.log_cache,
            &mut cx.hash_cache,
            &cx.root_path,
            &local_target_path,
            &descriptor.local_input_file_paths,
            &dep_paths,
            template,
        )? {
            trace!("`{}' is up-to-date", local_target_path);
            plan.queued_output_file_paths.pop_front();
            plan.erase(&local_target_path);
            continue;
        }
        let worker_ix = match pool.find_idle_worker() {
            Some(worker_ix) => worker_ix,
            None => break,
        };
        plan.queued_output_file_paths.pop_front();
        let sfu = schedule_file_update(
            cx,
            template,
            &descriptor.local_input_file_paths,
            &local_target_path,
            working_path,
        )?;
        pool.dispatch(worker_ix, sfu.command_line.clone());
        in_flight.insert(
            worker_ix,
            InFlightUpdate {
                local_target_path,
                sfu,
                local_src_paths: descriptor.local_input_file_paths.clone(),
                dep_paths,
                order_only_dependency_file_paths: descriptor
                    .order_only_dependency_file_paths
                    .clone(),
                command_line_ix: descriptor.command_line_ix,
            },
        );
    }
    Ok(())
}

/// Interpret one finished worker result: forward the subprocess's stderr,
/// classify failures, and on success run finalization (depfile collection,
/// imprint, log record). Returns the target path to erase from the plan.
fn reconcile_finished_update(
    cx: &mut UpdateContext,
    updm: &UpdateMap,
    command_line_templates: &[CommandLineTemplate],
    working_path: &str,
    update: InFlightUpdate,
    result: std::io::Result<crate::worker::CommandLineResult>,
) -> Result<String, UpdateError> {
    let result = result?;
    eprint!("{}", result.stderr);

    let mut failure: Option<ProcessFailureKind> = None;
    if !result.stdout.is_empty() {
        eprintln!("upd: error: process has unexpected output on stdout");
        eprintln!(
            "Update commands are not allowed to produce output except diagnostics on stderr."
        );
        eprintln!("========= STDOUT =========");
        eprint!("{}", result.stdout);
        eprintln!("========= END =========");
        failure = Some(ProcessFailureKind::UnexpectedStdout);
    }
    if result.status.code().is_none() {
        eprintln!("upd: error: process terminated unexpectedly");
        failure = Some(ProcessFailureKind::AbnormalExit);
    } else if result.status.code() != Some(0) {
        eprintln!("upd: error: process terminated with non-zero exit code");
        failure = Some(ProcessFailureKind::NonZeroStatus);
    }
    if let Some(kind) = failure {
        return Err(UpdateError::ProcessFailed {
            local_target_path: update.local_target_path,
            kind,
        });
    }

    finalize_scheduled_update(
        cx,
        update.sfu,
        &command_line_templates[update.command_line_ix],
        &update.local_src_paths,
        &update.dep_paths,
        &update.local_target_path,
        updm,
        &update.order_only_dependency_file_paths,
        working_path,
    )?;
    debug!("updated `{}'", update.local_target_path);
    Ok(update.local_target_path)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::update_map::OutputFile;

    fn descriptor(inputs: &[&str]) -> OutputFile {
        OutputFile {
            command_line_ix: 0,
            local_input_file_paths: inputs.iter().map(|s| s.to_string()).collect(),
            order_only_dependency_file_paths: BTreeSet::new(),
        }
    }

    fn map_of(entries: &[(&str, OutputFile)]) -> OutputFilesByPath {
        entries.iter().map(|(path, file)| (path.to_string(), file.clone())).collect()
    }

    #[test]
    fn roots_are_queued_immediately() {
        let map = map_of(&[("a.o", descriptor(&["a.c"]))]);
        let mut plan = UpdatePlan::default();
        build_update_plan(&mut plan, &map, "a.o");
        assert_eq!(plan.queued_output_file_paths, vec!["a.o"]);
        assert!(plan.pending_input_counts_by_path.is_empty());
    }

    #[test]
    fn chains_block_until_inputs_are_erased() {
        let map = map_of(&[
            ("a.o", descriptor(&["a.c"])),
            ("prog", descriptor(&["a.o"])),
        ]);
        let mut plan = UpdatePlan::default();
        build_update_plan(&mut plan, &map, "prog");
        assert_eq!(plan.queued_output_file_paths, vec!["a.o"]);
        assert_eq!(plan.pending_input_counts_by_path["prog"], 1);
        assert_eq!(plan.pending_output_file_paths.len(), 2);

        plan.queued_output_file_paths.pop_front();
        plan.erase("a.o");
        assert_eq!(plan.queued_output_file_paths, vec!["prog"]);
        assert_eq!(plan.pending_output_file_paths.len(), 1);

        plan.queued_output_file_paths.pop_front();
        plan.erase("prog");
        assert!(plan.pending_output_file_paths.is_empty());
    }

    #[test]
    fn diamond_dependencies_enqueue_exactly_once() {
        let map = map_of(&[
            ("a.o", descriptor(&["a.c"])),
            ("b.o", descriptor(&["b.c"])),
            ("prog", descriptor(&["a.o", "b.o"])),
        ]);
        let mut plan = UpdatePlan::default();
        build_update_plan(&mut plan, &map, "prog");
        assert_eq!(plan.pending_input_counts_by_path["prog"], 2);

        plan.erase("a.o");
        assert!(!plan.queued_output_file_paths.contains(&"prog".to_string()));
        plan.erase("b.o");
        assert_eq!(
            plan.queued_output_file_paths.iter().filter(|p| *p == "prog").count(),
            1
        );
    }

    #[test]
    fn planning_twice_is_idempotent() {
        let map = map_of(&[
            ("a.o", descriptor(&["a.c"])),
            ("prog", descriptor(&["a.o"])),
        ]);
        let mut plan = UpdatePlan::default();
        build_update_plan(&mut plan, &map, "prog");
        build_update_plan(&mut plan, &map, "a.o");
        build_update_plan(&mut plan, &map, "prog");
        assert_eq!(plan.pending_output_file_paths.len(), 2);
        assert_eq!(plan.queued_output_file_paths.len(), 1);
    }

    mod executor {
        use super::super::*;
        use crate::command_line::{
            CommandLineTemplate, CommandLineTemplatePart, CommandLineTemplateVariable,
            Environment,
        };
        use crate::dir_cache::DirectoryCache;
        use crate::hash_cache::FileHashCache;
        use crate::update_log;
        use crate::update_map::{OutputFile, UpdateMap};
        use crate::worker::{
            CommandLineResult, CommandLineRunner, MockCommandLineRunner, WorkerPool,
        };
        use std::collections::BTreeSet;
        use std::fs;
        use std::os::unix::process::ExitStatusExt;
        use std::process::ExitStatus;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        fn copy_template() -> CommandLineTemplate {
            CommandLineTemplate {
                binary_path: "copy".to_string(),
                parts: vec![CommandLineTemplatePart {
                    literal_args: vec![],
                    variable_args: vec![
                        CommandLineTemplateVariable::InputFiles,
                        CommandLineTemplateVariable::OutputFiles,
                    ],
                }],
                environment: Environment::new(),
            }
        }

        /// An in-process pool whose "subprocesses" copy their first argument
        /// to their second, both resolved against the project root.
        fn copying_pool(root: &str, run_count: &Arc<AtomicUsize>) -> WorkerPool {
            let root = root.to_string();
            let run_count = Arc::clone(run_count);
            WorkerPool::with_runner_factory(
                1,
                Arc::new(move || {
                    let root = root.clone();
                    let run_count = Arc::clone(&run_count);
                    Ok(Box::new(MockCommandLineRunner::new(
                        move |job: &crate::command_line::CommandLine| {
                            run_count.fetch_add(1, Ordering::SeqCst);
                            fs::copy(
                                format!("{}/{}", root, job.args[0]),
                                format!("{}/{}", root, job.args[1]),
                            )?;
                            Ok(CommandLineResult {
                                stdout: String::new(),
                                stderr: String::new(),
                                status: ExitStatus::from_raw(0),
                            })
                        },
                    )) as Box<dyn CommandLineRunner>)
                }),
            )
        }

        fn failing_pool(run_count: &Arc<AtomicUsize>) -> WorkerPool {
            let run_count = Arc::clone(run_count);
            WorkerPool::with_runner_factory(
                1,
                Arc::new(move || {
                    let run_count = Arc::clone(&run_count);
                    Ok(Box::new(MockCommandLineRunner::new(
                        move |_: &crate::command_line::CommandLine| {
                            run_count.fetch_add(1, Ordering::SeqCst);
                            Ok(CommandLineResult {
                                stdout: String::new(),
                                stderr: String::new(),
                                status: ExitStatus::from_raw(1 << 8),
                            })
                        },
                    )) as Box<dyn CommandLineRunner>)
                }),
            )
        }

        fn context(root: &str) -> UpdateContext {
            fs::create_dir_all(format!("{}/.upd", root)).unwrap();
            UpdateContext {
                root_path: root.to_string(),
                log_cache: update_log::Cache::from_log_file(&format!("{}/.upd/log", root))
                    .unwrap(),
                hash_cache: FileHashCache::new(),
                dir_cache: DirectoryCache::new(root),
                print_commands: false,
                concurrency: 1,
            }
        }

        fn chained_map() -> UpdateMap {
            let mut updm = UpdateMap::default();
            updm.output_files_by_path.insert(
                "dist/a.o".to_string(),
                OutputFile {
                    command_line_ix: 0,
                    local_input_file_paths: vec!["src/a.c".to_string()],
                    order_only_dependency_file_paths: BTreeSet::new(),
                },
            );
            updm.output_files_by_path.insert(
                "bin/prog".to_string(),
                OutputFile {
                    command_line_ix: 0,
                    local_input_file_paths: vec!["dist/a.o".to_string()],
                    order_only_dependency_file_paths: BTreeSet::new(),
                },
            );
            updm
        }

        #[test]
        fn executes_chains_once_and_skips_on_rerun() {
            let temp = tempfile::tempdir().unwrap();
            let root = temp.path().to_string_lossy().into_owned();
            fs::create_dir_all(temp.path().join("src")).unwrap();
            fs::write(temp.path().join("src/a.c"), "int a;").unwrap();
            let updm = chained_map();
            let templates = vec![copy_template()];
            let run_count = Arc::new(AtomicUsize::new(0));

            let mut cx = context(&root);
            let mut plan = UpdatePlan::default();
            build_update_plan(&mut plan, &updm.output_files_by_path, "bin/prog");
            execute_update_plan(
                &mut cx,
                &updm,
                &mut plan,
                &templates,
                &root,
                copying_pool(&root, &run_count),
            )
            .unwrap();
            assert_eq!(run_count.load(Ordering::SeqCst), 2);
            assert_eq!(fs::read_to_string(temp.path().join("bin/prog")).unwrap(), "int a;");
            drop(cx);

            // Re-running the same plan performs no work at all.
            let mut cx = context(&root);
            let mut plan = UpdatePlan::default();
            build_update_plan(&mut plan, &updm.output_files_by_path, "bin/prog");
            execute_update_plan(
                &mut cx,
                &updm,
                &mut plan,
                &templates,
                &root,
                copying_pool(&root, &run_count),
            )
            .unwrap();
            assert_eq!(run_count.load(Ordering::SeqCst), 2);
        }

        #[test]
        fn failures_stop_further_dispatch() {
            let temp = tempfile::tempdir().unwrap();
            let root = temp.path().to_string_lossy().into_owned();
            fs::create_dir_all(temp.path().join("src")).unwrap();
            fs::write(temp.path().join("src/c.c"), "int c;").unwrap();
            fs::write(temp.path().join("src/d.c"), "int d;").unwrap();
            let mut updm = UpdateMap::default();
            for name in &["c", "d"] {
                updm.output_files_by_path.insert(
                    format!("dist/{}.o", name),
                    OutputFile {
                        command_line_ix: 0,
                        local_input_file_paths: vec![format!("src/{}.c", name)],
                        order_only_dependency_file_paths: BTreeSet::new(),
                    },
                );
            }
            let templates = vec![copy_template()];
            let run_count = Arc::new(AtomicUsize::new(0));

            let mut cx = context(&root);
            let mut plan = UpdatePlan::default();
            build_update_plan(&mut plan, &updm.output_files_by_path, "dist/c.o");
            build_update_plan(&mut plan, &updm.output_files_by_path, "dist/d.o");
            let result = execute_update_plan(
                &mut cx,
                &updm,
                &mut plan,
                &templates,
                &root,
                failing_pool(&run_count),
            );
            match result {
                Err(UpdateError::ProcessFailed { kind, .. }) => {
                    assert_eq!(kind, ProcessFailureKind::NonZeroStatus);
                }
                other => panic!("expected a process failure, got ok={}", other.is_ok()),
            }
            // The second target was never dispatched.
            assert_eq!(run_count.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn erase_strictly_shrinks_the_pending_set() {
        let map = map_of(&[
            ("a.o", descriptor(&["a.c"])),
            ("prog", descriptor(&["a.o"])),
        ]);
        let mut plan = UpdatePlan::default();
        build_update_plan(&mut plan, &map, "prog");
        let mut pending = plan.pending_output_file_paths.len();
        for path in ["a.o", "prog"].iter() {
            plan.erase(path);
            assert!(plan.pending_output_file_paths.len() < pending);
            pending = plan.pending_output_file_paths.len();
        }
    }
}
