//! The reload supervisor process loop.
//!
//! # Responsibilities
//! - Keep exactly one worker process alive on the shared listening socket
//! - Restart the worker when a watched file changes
//! - Apply the worker exit-code protocol
//! - Retry failed spawns with backoff
//!
//! # Design Decisions
//! - Workers are stopped with SIGKILL; the socket stays open in the parent,
//!   so pending connections queue in the backlog until the next worker
//! - A worker that crashes is not respawned until a file changes, which
//!   avoids a tight crash loop while the code is broken

use std::ffi::OsString;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::ReloaderConfig;
use crate::net::StdListener;
use crate::observability::metrics;
use crate::reload::signature::WatchSet;
use crate::reload::watcher::FileWatcher;
use crate::reload::{ReloadError, RESTART_EXIT_CODE, RUN_MAIN_ENV, SERVER_FD_ENV};
use crate::resilience::Backoff;

/// How to start a worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Re-run this executable with the same arguments.
    pub fn current_process() -> Result<Self, ReloadError> {
        let program = std::env::current_exe().map_err(ReloadError::CurrentExe)?;
        Ok(Self::new(program).args(std::env::args_os().skip(1)))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    fn spawn(&self, fd: RawFd) -> Result<Child, ReloadError> {
        Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(RUN_MAIN_ENV, "true")
            .env(SERVER_FD_ENV, fd.to_string())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ReloadError::Spawn {
                program: self.program.clone(),
                source,
            })
    }
}

/// What ended a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerExit {
    Clean,
    RestartRequested,
    Failed(Option<i32>),
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => WorkerExit::Clean,
            Some(RESTART_EXIT_CODE) => WorkerExit::RestartRequested,
            code => WorkerExit::Failed(code),
        }
    }
}

impl WorkerExit {
    /// A worker whose status cannot be collected is treated as crashed; it
    /// was dropped (and killed) so the next change starts a fresh one.
    fn from_wait(result: std::io::Result<ExitStatus>) -> Self {
        match result {
            Ok(status) => status.into(),
            Err(e) => {
                tracing::error!(error = %ReloadError::Wait(e), "Lost track of worker");
                WorkerExit::Failed(None)
            }
        }
    }
}

/// Owns the watch state, the shared socket and the current worker.
pub struct Supervisor {
    watcher: FileWatcher,
    interval: Duration,
    listener: StdListener,
    command: WorkerCommand,
    backoff: Backoff,
    restarts: u64,
}

impl Supervisor {
    /// Watch what `config` names plus the running executable.
    pub fn new(
        config: &ReloaderConfig,
        listener: StdListener,
        command: WorkerCommand,
    ) -> Result<Self, ReloadError> {
        Self::with_watch_set(config, WatchSet::from_config(config), listener, command)
    }

    pub fn with_watch_set(
        config: &ReloaderConfig,
        set: WatchSet,
        listener: StdListener,
        command: WorkerCommand,
    ) -> Result<Self, ReloadError> {
        listener.set_inheritable(true).map_err(ReloadError::Socket)?;
        let watcher = FileWatcher::new(config.kind, set)?;
        Ok(Self {
            watcher,
            interval: config.interval(),
            listener,
            command,
            backoff: Backoff::default(),
            restarts: 0,
        })
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run until a worker exits cleanly or shutdown is signalled.
    ///
    /// Returns the number of restarts performed.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<u64, ReloadError> {
        tracing::info!(
            reloader = ?self.watcher.kind(),
            interval_ms = self.interval.as_millis() as u64,
            program = %self.command.program.display(),
            "Restarting with reloader"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut worker: Option<Child> = None;
        let mut spawn_at = Some(Instant::now());

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Reloader shutting down");
                    if let Some(child) = worker.as_mut() {
                        stop_worker(child).await;
                    }
                    return Ok(self.restarts);
                }

                _ = sleep_until(spawn_at) => {
                    spawn_at = None;
                    match self.command.spawn(self.listener.as_raw_fd()) {
                        Ok(child) => {
                            tracing::debug!(pid = ?child.id(), "Worker started");
                            self.backoff.reset();
                            worker = Some(child);
                        }
                        Err(e) => {
                            let delay = self.backoff.next_delay();
                            tracing::error!(
                                error = %e,
                                attempt = self.backoff.attempts(),
                                retry_in_ms = delay.as_millis() as u64,
                                "Worker spawn failed"
                            );
                            metrics::record_worker_restart("failure");
                            spawn_at = Some(Instant::now() + delay);
                        }
                    }
                }

                status = wait_worker(&mut worker) => {
                    worker = None;
                    match WorkerExit::from_wait(status) {
                        WorkerExit::Clean => {
                            tracing::info!("Worker exited cleanly, stopping reloader");
                            return Ok(self.restarts);
                        }
                        WorkerExit::RestartRequested => {
                            tracing::info!("Worker requested a restart");
                            self.record_restart("requested");
                            spawn_at = Some(Instant::now());
                        }
                        WorkerExit::Failed(code) => {
                            tracing::error!(
                                exit_code = ?code,
                                "Worker exited unexpectedly, waiting for a file change"
                            );
                        }
                    }
                }

                _ = ticker.tick() => {
                    if let Some(path) = self.watcher.poll().await {
                        tracing::info!(path = %path.display(), "Detected change, reloading");
                        if let Some(child) = worker.as_mut() {
                            stop_worker(child).await;
                        }
                        worker = None;
                        self.record_restart("change");
                        spawn_at = Some(Instant::now());
                    }
                }
            }
        }
    }

    fn record_restart(&mut self, reason: &'static str) {
        self.restarts += 1;
        metrics::record_worker_restart(reason);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn wait_worker(worker: &mut Option<Child>) -> std::io::Result<ExitStatus> {
    match worker {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

async fn stop_worker(child: &mut Child) {
    let pid = child.id();
    if let Err(e) = child.start_kill() {
        tracing::debug!(pid = ?pid, error = %e, "Worker already gone");
    }
    match child.wait().await {
        Ok(status) => tracing::debug!(pid = ?pid, status = %status, "Worker stopped"),
        Err(e) => tracing::warn!(pid = ?pid, error = %e, "Failed to reap worker"),
    }
}
