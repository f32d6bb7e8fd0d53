// src/orchestrator/runner.rs: fan a stage out over its work units

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::task::JoinSet;

use crate::config::defs::{PipelineError, StageId};
use crate::orchestrator::stage::{
    InvocationResult, Sample, SampleFailure, StageAggregate, StageContext, StageResult, StageState,
    StageTask, UnitReport, WorkUnit,
};
use crate::utils::fastx::record_counter;
use crate::utils::file::commit_compressed;


type UnitOutcome = (WorkUnit, Result<UnitReport, PipelineError>, Duration);

/// Collects unit outcomes on the control task as workers finish.
struct StageCollector {
    stage: StageId,
    results: Vec<InvocationResult>,
    failures: Vec<SampleFailure>,
    survivors: Vec<Sample>,
    aborted: bool,
}

impl StageCollector {
    fn new(stage: StageId) -> Self {
        StageCollector {
            stage,
            results: Vec::new(),
            failures: Vec::new(),
            survivors: Vec::new(),
            aborted: false,
        }
    }

    fn fail_all(&mut self, units: &[WorkUnit], error: &PipelineError) {
        for unit in units {
            self.failures.push(SampleFailure::from_error(&unit.id, error));
        }
    }

    /// Units whose worker was lost without an outcome still count as failed.
    fn fail_lost(&mut self, lost: BTreeMap<String, WorkUnit>) {
        if lost.is_empty() {
            return;
        }
        let err = PipelineError::Other(anyhow!("worker task lost"));
        for unit in lost.into_values() {
            error!("{}: {}: {}", self.stage, unit.id, err);
            self.failures.push(SampleFailure::from_error(&unit.id, &err));
        }
    }

    fn succeed(&mut self, ctx: &StageContext, unit: WorkUnit, report: UnitReport, duration: Duration) {
        ctx.ledger.record(&unit.id, self.stage, report.reads_in, report.reads_out);
        info!(
            "{}: {}: {} reads in, {} reads out ({} ms)",
            self.stage,
            unit.id,
            display_count(report.reads_in),
            display_count(report.reads_out),
            duration.as_millis()
        );
        self.survivors
            .push(unit.carrier().with_output(self.stage, report.outputs.clone(), false));
        self.results.push(InvocationResult {
            sample: unit.id,
            stage: self.stage,
            runs: report.runs,
            duration,
            reads_in: report.reads_in,
            reads_out: report.reads_out,
            outputs: report.outputs,
            partial: false,
        });
    }

    fn fail(
        &mut self,
        task: &dyn StageTask,
        ctx: &StageContext,
        unit: WorkUnit,
        err: PipelineError,
        duration: Duration,
    ) {
        let mut failure = SampleFailure::from_error(&unit.id, &err);
        if failure.aborted {
            self.aborted = true;
            debug!("{}: {}: aborted", self.stage, unit.id);
            self.failures.push(failure);
            return;
        }
        warn!("{}: {}: {}", self.stage, unit.id, err);

        if ctx.config.policy.forward_failed_outputs {
            match forward_partial(task, ctx, &unit) {
                Ok(Some((output, reads_out))) => {
                    warn!("{}: {}: forwarding partial output {}", self.stage, unit.id, output.display());
                    ctx.ledger.record(&unit.id, self.stage, None, Some(reads_out));
                    self.survivors
                        .push(unit.carrier().with_output(self.stage, vec![output.clone()], true));
                    self.results.push(InvocationResult {
                        sample: unit.id.clone(),
                        stage: self.stage,
                        runs: Vec::new(),
                        duration,
                        reads_in: None,
                        reads_out: Some(reads_out),
                        outputs: vec![output],
                        partial: true,
                    });
                    failure.forwarded = true;
                }
                Ok(None) => {}
                Err(e) => warn!("{}: {}: partial output not forwarded: {}", self.stage, unit.id, e),
            }
        }
        self.failures.push(failure);
    }
}

fn display_count(count: Option<u64>) -> String {
    count.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string())
}

/// Commits whatever the failed unit staged, if anything usable is there.
fn forward_partial(
    task: &dyn StageTask,
    ctx: &StageContext,
    unit: &WorkUnit,
) -> Result<Option<(PathBuf, u64)>, PipelineError> {
    let spec = task.spec();
    let name = spec.output_name(&unit.id);
    let staged = ctx.layout.staged_path(spec.id, &name);
    match std::fs::metadata(&staged) {
        Ok(meta) if meta.len() > 0 => {}
        _ => return Ok(None),
    }
    let dest = ctx.layout.data_path(spec.id, &name);
    commit_compressed(&staged, &dest, ctx.compression_level())?;
    let reads_out = record_counter(&dest)?;
    Ok(Some((dest, reads_out)))
}


/// Runs one stage over the surviving samples.
///
/// Every unit is spawned at once and queues on the core budget, so a freed
/// slot goes straight to the next waiting unit. Unit errors are contained in
/// the returned `StageResult`; nothing here aborts the run.
///
/// # Arguments
///
/// * `task` - The stage implementation.
/// * `samples` - Samples that survived the previous stage.
/// * `ctx` - Shared run context.
///
/// # Returns
/// StageResult with per-unit results, failures, aggregate counts and survivors.
pub async fn run_stage(task: Arc<dyn StageTask>, samples: Vec<Sample>, ctx: Arc<StageContext>) -> StageResult {
    let start = Instant::now();
    let spec = task.spec().clone();
    let stage = spec.id;
    let mut collector = StageCollector::new(stage);
    let mut stage_error: Option<String> = None;
    let mut stage_outputs = Vec::new();

    info!("{}: starting with {} samples", stage, samples.len());
    ctx.invoker.budget().reset_peak();

    let units = task.group(&samples, &ctx);
    let prepared = match ctx.layout.prepare_stage(stage) {
        Ok(()) => task.prepare(&ctx, &samples).await,
        Err(e) => Err(PipelineError::from(e)),
    };

    if let Err(e) = prepared {
        error!("{}: stage setup failed: {}", stage, e);
        collector.aborted = matches!(e, PipelineError::AbortRequested);
        collector.fail_all(&units, &e);
        stage_error = Some(e.to_string());
    } else {
        let mut workers: JoinSet<UnitOutcome> = JoinSet::new();
        let mut pending: BTreeMap<String, WorkUnit> = BTreeMap::new();
        for unit in units {
            if ctx.invoker.is_aborted() {
                collector.fail(task.as_ref(), &ctx, unit, PipelineError::AbortRequested, Duration::ZERO);
                continue;
            }
            pending.insert(unit.id.clone(), unit.clone());
            let task = Arc::clone(&task);
            let ctx = Arc::clone(&ctx);
            workers.spawn(async move {
                let started = Instant::now();
                let outcome = AssertUnwindSafe(task.process(ctx, unit.clone()))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(PipelineError::Other(anyhow!("worker panicked"))));
                (unit, outcome, started.elapsed())
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((unit, outcome, duration)) => {
                    pending.remove(&unit.id);
                    match outcome {
                        Ok(report) => collector.succeed(&ctx, unit, report, duration),
                        Err(e) => collector.fail(task.as_ref(), &ctx, unit, e, duration),
                    }
                }
                Err(e) => error!("{}: worker task lost: {}", stage, e),
            }
        }
        collector.fail_lost(pending);

        if !collector.aborted {
            match task.finalize(&ctx, &collector.results).await {
                Ok(outputs) => stage_outputs = outputs,
                Err(e) => {
                    error!("{}: finalizing failed: {}", stage, e);
                    collector.aborted = matches!(e, PipelineError::AbortRequested);
                    stage_error = Some(e.to_string());
                }
            }
        }
    }

    let StageCollector {
        results,
        failures,
        mut survivors,
        aborted,
        ..
    } = collector;
    survivors.sort_by(|a, b| a.id.cmp(&b.id));

    let aggregate = StageAggregate {
        samples: results.len(),
        reads_in: results.iter().filter_map(|r| r.reads_in).sum(),
        reads_out: results.iter().filter_map(|r| r.reads_out).sum(),
        failed: failures.len(),
    };

    let clean = failures.is_empty() && stage_error.is_none();
    if clean {
        if let Err(e) = ctx.layout.remove_temp(stage) {
            warn!("{}: could not remove temp directory: {}", stage, e);
        }
    } else {
        warn!(
            "{}: {} of {} units failed; staged files kept in {}",
            stage,
            failures.len(),
            results.len() + failures.len(),
            ctx.layout.temp_dir(stage).display()
        );
    }

    let duration = start.elapsed();
    info!(
        "{}: finished in {} ms, {} reads in, {} reads out, peak {} concurrent invocations",
        stage,
        duration.as_millis(),
        aggregate.reads_in,
        aggregate.reads_out,
        ctx.invoker.budget().peak()
    );

    StageResult {
        stage,
        status: if clean { StageState::CompletedOk } else { StageState::CompletedWithFailures },
        results,
        failures,
        aggregate,
        duration,
        survivors,
        stage_outputs,
        stage_error,
        aborted,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_lost_units_are_recorded_as_failures() {
        let mut collector = StageCollector::new(StageId::Dereplication);
        let mut lost = BTreeMap::new();
        for id in ["S02", "S01"] {
            lost.insert(
                id.to_string(),
                WorkUnit::single(&Sample::new(id, vec![PathBuf::from(format!("{}.fasta.gz", id))])),
            );
        }
        collector.fail_lost(lost);
        collector.fail_lost(BTreeMap::new());

        let samples: Vec<&str> = collector.failures.iter().map(|f| f.sample.as_str()).collect();
        assert_eq!(samples, vec!["S01", "S02"]);
        assert!(collector.failures.iter().all(|f| !f.aborted && !f.forwarded));
        assert!(collector.failures[0].error.contains("worker task lost"));
        assert!(collector.survivors.is_empty());
    }
}
