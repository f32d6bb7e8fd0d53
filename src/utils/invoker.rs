// src/utils/invoker.rs: budgeted, abortable external tool runs

use std::fs::File;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use log::{debug, warn};
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use crate::config::defs::{PipelineError, INTERNAL_TAG, STDERR_TAIL_LINES};
use crate::utils::counts::{CountRule, ReadCounts};
use crate::utils::streams::{collect_lines, spawn_line_collector, tail};


/// The run's core budget. Permits are cores; every checkout also counts one
/// in-flight invocation so the peak can be audited afterwards.
#[derive(Debug)]
pub struct CoreBudget {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl CoreBudget {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(CoreBudget {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cores not currently checked out.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous checkouts seen since the last reset.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn reset_peak(&self) {
        self.peak.store(self.in_flight(), Ordering::SeqCst);
    }

    /// Cost clamped to `1..=capacity`; a cost above capacity could never be admitted.
    pub fn effective_cost(&self, cost: usize) -> usize {
        cost.clamp(1, self.capacity)
    }

    /// Waits in FIFO order for `cost` cores.
    pub async fn acquire(self: &Arc<Self>, cost: usize) -> Result<BudgetGuard, PipelineError> {
        let cost = self.effective_cost(cost);
        let permit = self
            .semaphore
            .clone()
            .acquire_many_owned(cost as u32)
            .await
            .map_err(|e| PipelineError::Other(anyhow!("core budget closed: {}", e)))?;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Ok(BudgetGuard {
            budget: Arc::clone(self),
            _permit: permit,
        })
    }
}

/// Scoped checkout; dropping it returns the cores, whatever ended the run.
#[derive(Debug)]
pub struct BudgetGuard {
    budget: Arc<CoreBudget>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for BudgetGuard {
    fn drop(&mut self) {
        self.budget.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}


/// Requests a run-wide abort. Cloned receivers are handed to every invoker.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        AbortHandle { tx: Arc::new(tx) }
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        AbortHandle::new()
    }
}

/// Resolves once an abort is requested; never resolves if the handle is gone.
pub async fn abort_requested(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}


/// One external command line.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCommand {
    pub tool: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Redirects stdout into this file instead of capturing it.
    pub stdout_to: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(tool: &str, args: Vec<String>) -> Self {
        ToolCommand {
            tool: tool.to_string(),
            args,
            working_dir: None,
            stdout_to: None,
        }
    }

    pub fn stdout_to(mut self, path: PathBuf) -> Self {
        self.stdout_to = Some(path);
        self
    }

    pub fn working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    fn failure(&self, exit_code: Option<i32>, stderr_tail: impl Into<String>) -> PipelineError {
        PipelineError::ToolFailure {
            tool: self.tool.clone(),
            exit_code,
            stderr_tail: stderr_tail.into(),
        }
    }
}

/// A file the tool must leave behind after a zero exit.
#[derive(Debug, Clone, PartialEq)]
pub struct DeclaredOutput {
    pub path: PathBuf,
    /// A sample can legitimately end with zero surviving reads.
    pub allow_empty: bool,
}

impl DeclaredOutput {
    pub fn non_empty(path: PathBuf) -> Self {
        DeclaredOutput { path, allow_empty: false }
    }

    pub fn may_be_empty(path: PathBuf) -> Self {
        DeclaredOutput { path, allow_empty: true }
    }
}

/// Record of one finished tool run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolRun {
    pub tool: String,
    pub args: Vec<String>,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    #[serde(skip)]
    pub stdout: String,
    pub stderr_tail: String,
    pub counts: ReadCounts,
    /// Set when the counts could not be read; the run itself succeeded.
    pub count_error: Option<String>,
}


#[derive(Debug, Clone)]
pub struct ToolInvoker {
    budget: Arc<CoreBudget>,
    abort: watch::Receiver<bool>,
}

impl ToolInvoker {
    pub fn new(budget: Arc<CoreBudget>, abort: &AbortHandle) -> Self {
        ToolInvoker {
            budget,
            abort: abort.subscribe(),
        }
    }

    pub fn budget(&self) -> &Arc<CoreBudget> {
        &self.budget
    }

    pub fn is_aborted(&self) -> bool {
        *self.abort.borrow()
    }

    async fn checkout(&self, cost: usize) -> Result<BudgetGuard, PipelineError> {
        if self.is_aborted() {
            return Err(PipelineError::AbortRequested);
        }
        tokio::select! {
            guard = self.budget.acquire(cost) => guard,
            _ = abort_requested(self.abort.clone()) => Err(PipelineError::AbortRequested),
        }
    }

    /// Runs one external tool under the core budget.
    ///
    /// # Arguments
    ///
    /// * `command` - Tool, arguments, working directory, optional stdout file.
    /// * `inputs` - Files that must exist before the tool starts.
    /// * `outputs` - Files the tool must produce on a zero exit.
    /// * `cost` - Cores checked out for the run's duration.
    /// * `rule` - How to read reads in/out from the tool's report.
    ///
    /// # Returns
    /// ToolRun, or `ToolFailure` / `AbortRequested`. Unreadable counts are not
    /// an error: they are logged and left unknown.
    pub async fn invoke(
        &self,
        command: &ToolCommand,
        inputs: &[PathBuf],
        outputs: &[DeclaredOutput],
        cost: usize,
        rule: &CountRule,
    ) -> Result<ToolRun, PipelineError> {
        for input in inputs {
            if !input.exists() {
                return Err(command.failure(None, format!("missing input {}", input.display())));
            }
        }

        let _guard = self.checkout(cost).await?;
        let start = Instant::now();
        debug!("Running {} {}", command.tool, command.args.join(" "));

        let mut cmd = Command::new(&command.tool);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        match &command.stdout_to {
            Some(path) => {
                let file = File::create(path)?;
                cmd.stdout(Stdio::from(file));
            }
            None => {
                cmd.stdout(Stdio::piped());
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            command.failure(None, format!("failed to spawn {}: {}. Is it installed?", command.tool, e))
        })?;
        let stdout_task = child.stdout.take().map(spawn_line_collector);
        let stderr_task = child.stderr.take().map(spawn_line_collector);

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = abort_requested(self.abort.clone()) => {
                warn!("Abort requested; killing {}", command.tool);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill {}: {}", command.tool, e);
                }
                return Err(PipelineError::AbortRequested);
            }
        };

        let stdout = collect_lines(stdout_task).await.join("\n");
        let stderr_tail = tail(&collect_lines(stderr_task).await, STDERR_TAIL_LINES);
        let duration = start.elapsed();

        if !status.success() {
            return Err(command.failure(status.code(), stderr_tail));
        }

        for output in outputs {
            let len = match std::fs::metadata(&output.path) {
                Ok(meta) => meta.len(),
                Err(_) => {
                    return Err(command.failure(
                        status.code(),
                        format!("declared output {} is missing", output.path.display()),
                    ));
                }
            };
            if len == 0 && !output.allow_empty {
                return Err(command.failure(
                    status.code(),
                    format!("declared output {} is empty", output.path.display()),
                ));
            }
        }

        let (counts, count_error) = match rule.extract(&stdout) {
            Ok(counts) => (counts, None),
            Err(e) => {
                warn!("{}; read counts recorded as unknown", e);
                (ReadCounts::unknown(), Some(e.to_string()))
            }
        };

        Ok(ToolRun {
            tool: command.tool.clone(),
            args: command.args.clone(),
            exit_code: status.code(),
            duration,
            stdout,
            stderr_tail,
            counts,
            count_error,
        })
    }

    /// Runs in-process work on the blocking pool under the same budget and
    /// abort rules as an external tool.
    ///
    /// Blocking work cannot be cancelled: on abort the cores stay checked out
    /// until the work returns, then `AbortRequested` is reported.
    pub async fn invoke_internal<F>(&self, cost: usize, work: F) -> Result<ToolRun, PipelineError>
    where
        F: FnOnce() -> Result<ReadCounts, PipelineError> + Send + 'static,
    {
        let _guard = self.checkout(cost).await?;
        let start = Instant::now();
        let mut handle = tokio::task::spawn_blocking(work);
        let joined = tokio::select! {
            joined = &mut handle => joined,
            _ = abort_requested(self.abort.clone()) => {
                debug!("abort requested; waiting for in-process work to return");
                let _ = handle.await;
                return Err(PipelineError::AbortRequested);
            }
        };
        let counts = joined.map_err(|e| PipelineError::Other(anyhow!("internal step panicked: {}", e)))??;
        Ok(ToolRun {
            tool: INTERNAL_TAG.to_string(),
            args: Vec::new(),
            exit_code: Some(0),
            duration: start.elapsed(),
            stdout: String::new(),
            stderr_tail: String::new(),
            counts,
            count_error: None,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ToolCommand {
        ToolCommand::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    fn invoker(capacity: usize) -> (ToolInvoker, AbortHandle) {
        let abort = AbortHandle::new();
        (ToolInvoker::new(CoreBudget::new(capacity), &abort), abort)
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_tool_failure() {
        let (invoker, _abort) = invoker(2);
        let err = invoker
            .invoke(&sh("echo broken >&2; exit 3"), &[], &[], 1, &CountRule::Unaccounted)
            .await
            .unwrap_err();
        match err {
            PipelineError::ToolFailure { exit_code, stderr_tail, .. } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(stderr_tail, "broken");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(invoker.budget().available(), 2);
    }

    #[tokio::test]
    async fn test_missing_declared_output_is_tool_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (invoker, _abort) = invoker(1);
        let output = DeclaredOutput::non_empty(dir.path().join("never_written.fasta"));
        let err = invoker
            .invoke(&sh("true"), &[], &[output], 1, &CountRule::Unaccounted)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ToolFailure { exit_code: Some(0), .. }));
    }

    #[tokio::test]
    async fn test_empty_output_respects_allow_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.fasta");
        let (invoker, _abort) = invoker(1);
        let command = sh("true").stdout_to(path.clone());

        let strict = DeclaredOutput::non_empty(path.clone());
        assert!(invoker.invoke(&command, &[], &[strict], 1, &CountRule::Unaccounted).await.is_err());

        let lenient = DeclaredOutput::may_be_empty(path.clone());
        let run = invoker
            .invoke(&command, &[], &[lenient], 1, &CountRule::Records { input: path.clone(), output: path })
            .await
            .unwrap();
        assert_eq!(run.counts, ReadCounts::known(0, 0));
    }

    #[tokio::test]
    async fn test_unreadable_counts_do_not_fail_the_run() {
        let (invoker, _abort) = invoker(1);
        let run = invoker
            .invoke(&sh("echo no report here"), &[], &[], 1, &CountRule::CutadaptMinimal)
            .await
            .unwrap();
        assert_eq!(run.stdout, "no report here");
        assert_eq!(run.counts, ReadCounts::unknown());
        assert!(run.count_error.is_some());
    }

    #[tokio::test]
    async fn test_abort_kills_child_and_releases_cores() {
        let (invoker, abort) = invoker(2);
        let running = invoker.clone();
        let handle = tokio::spawn(async move {
            running.invoke(&sh("sleep 30"), &[], &[], 2, &CountRule::Unaccounted).await
        });
        while invoker.budget().in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        abort.abort();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(PipelineError::AbortRequested)));
        assert_eq!(invoker.budget().available(), 2);
        assert_eq!(invoker.budget().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_abort_holds_cores_until_internal_work_returns() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let (invoker, abort) = invoker(2);
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let running = invoker.clone();
        let handle = tokio::spawn(async move {
            running
                .invoke_internal(2, move || {
                    std::thread::sleep(Duration::from_millis(300));
                    flag.store(true, Ordering::SeqCst);
                    Ok(ReadCounts::known(1, 1))
                })
                .await
        });
        while invoker.budget().in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        abort.abort();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(invoker.budget().available(), 0);

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(PipelineError::AbortRequested)));
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(invoker.budget().available(), 2);
    }

    #[tokio::test]
    async fn test_cost_above_capacity_is_clamped() {
        let (invoker, _abort) = invoker(2);
        let run = invoker
            .invoke(&sh("true"), &[], &[], 16, &CountRule::Unaccounted)
            .await
            .unwrap();
        assert_eq!(run.exit_code, Some(0));
        assert_eq!(invoker.budget().peak(), 1);
    }
}
