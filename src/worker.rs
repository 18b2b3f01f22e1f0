//! The update worker pool.
//!
//! A fixed pool of threads runs update subprocesses. Each worker owns a
//! single pseudo-terminal for its whole lifetime; subprocess stderr goes
//! through the pty slave so that interactive tools keep emitting colors,
//! while stdout is captured through a plain pipe (update commands are not
//! supposed to write anything there).
//!
//! Shared state is a single mutex over the worker slots. The executor waits
//! on one condition variable for results; each worker waits on its own for
//! dispatch. Workers hold no lock at all while their subprocess runs.

use std::fs::OpenOptions;
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{debug, trace};
use nix::pty::PtyMaster;

use crate::command_line::CommandLine;
use crate::io::nix_to_io_error;

/// Captured streams and exit status of one finished command line.
#[derive(Debug)]
pub struct CommandLineResult {
    pub stdout: String,
    pub stderr: String,
    pub status: ExitStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerStatus {
    Idle,
    InProgress,
    Finished,
    Shutdown,
}

struct WorkerSlot {
    status: WorkerStatus,
    job: Option<CommandLine>,
    result: Option<io::Result<CommandLineResult>>,
}

struct PoolShared {
    slots: Mutex<Vec<WorkerSlot>>,
    /// Notified whenever a worker publishes a result.
    finished_cv: Condvar,
}

struct WorkerHandle {
    cv: Arc<Condvar>,
    thread: Option<thread::JoinHandle<()>>,
}

/// Runs reified command lines on behalf of a worker. The real
/// implementation spawns subprocesses wired to the worker's pty; the mock
/// variant runs an in-process closure through the same interface.
pub trait CommandLineRunner: Send {
    fn run(&mut self, target: &CommandLine) -> io::Result<CommandLineResult>;
}

/// Invoked once per worker, on the worker's own thread, so that every
/// runner can own per-worker resources (the real one owns a pty).
pub type RunnerFactory =
    Arc<dyn Fn() -> io::Result<Box<dyn CommandLineRunner>> + Send + Sync>;

/// A pseudo-terminal pair; the master side stays open for the owning
/// worker's lifetime, the slave side is reopened for each subprocess.
struct Pseudoterminal {
    master: PtyMaster,
    pts_name: String,
}

impl Pseudoterminal {
    fn open() -> io::Result<Pseudoterminal> {
        use nix::fcntl::OFlag;
        let master = nix::pty::posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)
            .map_err(nix_to_io_error)?;
        nix::pty::grantpt(&master).map_err(nix_to_io_error)?;
        nix::pty::unlockpt(&master).map_err(nix_to_io_error)?;
        let pts_name = nix::pty::ptsname_r(&master).map_err(nix_to_io_error)?;
        Ok(Pseudoterminal { master, pts_name })
    }
}

/// Read the pty master until the last slave is closed. On Linux that shows
/// up as `EIO`, which is the normal end-of-stream here.
fn read_pty_to_string(fd: RawFd) -> io::Result<String> {
    let mut bytes: Vec<u8> = Vec::new();
    let mut buffer = [0u8; 4096];
    loop {
        match nix::unistd::read(fd, &mut buffer) {
            Ok(0) => break,
            Ok(count) => bytes.extend_from_slice(&buffer[..count]),
            Err(nix::Error::Sys(nix::errno::Errno::EIO)) => break,
            Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
            Err(error) => return Err(nix_to_io_error(error)),
        }
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Run one command line: spawn the subprocess with its stdout piped and its
/// stderr pointed at the worker's pty slave, gather both streams from
/// auxiliary threads, and wait for the exit status. The environment is the
/// parent's, extended with the template's entries, plus `TERM=xterm-color`.
fn run_command_line(target: &CommandLine, pty: &Pseudoterminal) -> io::Result<CommandLineResult> {
    let slave = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(&pty.pts_name)?;

    let mut child = Command::new(&target.binary_path)
        .args(&target.args)
        .env("TERM", "xterm-color")
        .envs(&target.environment)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::from(slave))
        .spawn()?;

    let mut child_stdout = child.stdout.take().expect("child stdout must be piped");
    let stdout_thread = thread::spawn(move || -> io::Result<String> {
        let mut bytes = Vec::new();
        child_stdout.read_to_end(&mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    });
    let master_fd = pty.master.as_raw_fd();
    let stderr_thread = thread::spawn(move || read_pty_to_string(master_fd));

    let status = child.wait()?;
    let stdout = stdout_thread.join().expect("stdout reader thread panicked")?;
    let stderr = stderr_thread.join().expect("stderr reader thread panicked")?;
    Ok(CommandLineResult { stdout, stderr, status })
}

/// The real runner: one pty per instance, one subprocess per job.
pub struct PtyCommandLineRunner {
    pty: Pseudoterminal,
}

impl PtyCommandLineRunner {
    pub fn new() -> io::Result<PtyCommandLineRunner> {
        Ok(PtyCommandLineRunner { pty: Pseudoterminal::open()? })
    }
}

impl CommandLineRunner for PtyCommandLineRunner {
    fn run(&mut self, target: &CommandLine) -> io::Result<CommandLineResult> {
        run_command_line(target, &self.pty)
    }
}

/// In-process runner driven by a closure, structurally identical to the
/// real one from the pool's point of view.
pub struct MockCommandLineRunner<F> {
    run_fn: F,
}

impl<F> MockCommandLineRunner<F>
where
    F: FnMut(&CommandLine) -> io::Result<CommandLineResult> + Send,
{
    pub fn new(run_fn: F) -> MockCommandLineRunner<F> {
        MockCommandLineRunner { run_fn }
    }
}

impl<F> CommandLineRunner for MockCommandLineRunner<F>
where
    F: FnMut(&CommandLine) -> io::Result<CommandLineResult> + Send,
{
    fn run(&mut self, target: &CommandLine) -> io::Result<CommandLineResult> {
        (self.run_fn)(target)
    }
}

fn worker_main(
    shared: Arc<PoolShared>,
    cv: Arc<Condvar>,
    worker_ix: usize,
    runner_factory: RunnerFactory,
) {
    // Per-worker runner, constructed on the worker's own thread. If that
    // fails (e.g. no pty available), every job dispatched to this worker
    // reports the failure.
    let mut runner = runner_factory();
    let mut slots = shared.slots.lock().expect("worker pool mutex poisoned");
    loop {
        match slots[worker_ix].status {
            WorkerStatus::Shutdown => return,
            WorkerStatus::InProgress => {
                let job = slots[worker_ix].job.take().expect("dispatched worker without a job");
                drop(slots);
                trace!("worker #{} running: {}", worker_ix, job);
                let result = match runner.as_mut() {
                    Ok(runner) => runner.run(&job),
                    Err(error) => {
                        Err(io::Error::new(error.kind(), format!("worker setup: {}", error)))
                    }
                };
                slots = shared.slots.lock().expect("worker pool mutex poisoned");
                // Shutdown may have been requested while the job was
                // running; the result is still published, but the worker
                // must not clobber the shutdown request and wait again.
                let shutting_down = slots[worker_ix].status == WorkerStatus::Shutdown;
                slots[worker_ix].result = Some(result);
                if shutting_down {
                    shared.finished_cv.notify_all();
                    return;
                }
                slots[worker_ix].status = WorkerStatus::Finished;
                shared.finished_cv.notify_all();
            }
            _ => {
                slots = cv.wait(slots).expect("worker pool mutex poisoned");
            }
        }
    }
}

/// Fixed-size pool of update workers. Workers are created lazily, up to the
/// configured concurrency, and joined on shutdown.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<WorkerHandle>,
    concurrency: usize,
    runner_factory: RunnerFactory,
}

impl WorkerPool {
    /// A pool running real subprocesses. `concurrency == 0` picks a default
    /// from the number of logical CPUs.
    pub fn new(concurrency: usize) -> WorkerPool {
        WorkerPool::with_runner_factory(
            concurrency,
            Arc::new(|| {
                PtyCommandLineRunner::new()
                    .map(|runner| Box::new(runner) as Box<dyn CommandLineRunner>)
            }),
        )
    }

    pub fn with_runner_factory(concurrency: usize, runner_factory: RunnerFactory) -> WorkerPool {
        let concurrency = if concurrency == 0 { num_cpus::get() } else { concurrency };
        debug!("worker pool concurrency: {}", concurrency);
        WorkerPool {
            shared: Arc::new(PoolShared {
                slots: Mutex::new(Vec::new()),
                finished_cv: Condvar::new(),
            }),
            workers: Vec::new(),
            concurrency,
            runner_factory,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// An idle worker index, constructing a fresh worker only when all
    /// existing ones are busy and the pool is below its concurrency.
    /// `None` when the pool is saturated.
    pub fn find_idle_worker(&mut self) -> Option<usize> {
        let mut slots = self.shared.slots.lock().expect("worker pool mutex poisoned");
        if let Some(worker_ix) =
            slots.iter().position(|slot| slot.status == WorkerStatus::Idle)
        {
            return Some(worker_ix);
        }
        if self.workers.len() >= self.concurrency {
            return None;
        }
        let worker_ix = self.workers.len();
        slots.push(WorkerSlot { status: WorkerStatus::Idle, job: None, result: None });
        drop(slots);
        let cv = Arc::new(Condvar::new());
        let shared = Arc::clone(&self.shared);
        let worker_cv = Arc::clone(&cv);
        let runner_factory = Arc::clone(&self.runner_factory);
        let thread = thread::Builder::new()
            .name(format!("upd-worker-{}", worker_ix))
            .spawn(move || worker_main(shared, worker_cv, worker_ix, runner_factory))
            .expect("failed to spawn update worker");
        self.workers.push(WorkerHandle { cv, thread: Some(thread) });
        Some(worker_ix)
    }

    /// Hand a job to an idle worker previously returned by
    /// [`WorkerPool::find_idle_worker`].
    pub fn dispatch(&self, worker_ix: usize, job: CommandLine) {
        let mut slots = self.shared.slots.lock().expect("worker pool mutex poisoned");
        let slot = &mut slots[worker_ix];
        assert_eq!(slot.status, WorkerStatus::Idle, "dispatch needs an idle worker");
        slot.job = Some(job);
        slot.status = WorkerStatus::InProgress;
        self.workers[worker_ix].cv.notify_one();
    }

    /// Block until at least one worker is finished, and return all finished
    /// worker indices. An empty result means nothing is in progress either.
    pub fn wait_finished(&self) -> Vec<usize> {
        let mut slots = self.shared.slots.lock().expect("worker pool mutex poisoned");
        loop {
            let finished: Vec<usize> = slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.status == WorkerStatus::Finished)
                .map(|(worker_ix, _)| worker_ix)
                .collect();
            if !finished.is_empty() {
                return finished;
            }
            let has_in_progress =
                slots.iter().any(|slot| slot.status == WorkerStatus::InProgress);
            if !has_in_progress {
                return finished;
            }
            slots = self.shared.finished_cv.wait(slots).expect("worker pool mutex poisoned");
        }
    }

    /// Collect the result of a finished worker, making it idle again.
    pub fn take_result(&self, worker_ix: usize) -> io::Result<CommandLineResult> {
        let mut slots = self.shared.slots.lock().expect("worker pool mutex poisoned");
        let slot = &mut slots[worker_ix];
        assert_eq!(slot.status, WorkerStatus::Finished, "no result to take");
        slot.status = WorkerStatus::Idle;
        slot.result.take().expect("finished worker without a result")
    }

    /// Signal every worker to exit and join the threads. Workers that are
    /// mid-job finish it first.
    pub fn shutdown(&mut self) {
        {
            let mut slots = self.shared.slots.lock().expect("worker pool mutex poisoned");
            for slot in slots.iter_mut() {
                slot.status = WorkerStatus::Shutdown;
            }
            for worker in &self.workers {
                worker.cv.notify_one();
            }
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
        self.workers.clear();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
