// src/orchestrator/sequencer.rs: stage graph and run state machine

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Local};
use log::{error, info, warn};
use serde::Serialize;

use crate::config::defs::{PipelineError, StageId};
use crate::orchestrator::ledger::StageSummary;
use crate::orchestrator::report::ReportSink;
use crate::orchestrator::runner::run_stage;
use crate::orchestrator::stage::{Sample, StageContext, StageResult, StageSpec, StageState, StageTask};


/// Directed acyclic graph of stage specs.
#[derive(Debug, Clone)]
pub struct StageGraph {
    specs: BTreeMap<StageId, StageSpec>,
}

impl StageGraph {
    /// Builds the graph, rejecting unknown predecessors and cycles.
    pub fn new(specs: Vec<StageSpec>) -> Result<Self, PipelineError> {
        let specs: BTreeMap<StageId, StageSpec> = specs.into_iter().map(|s| (s.id, s)).collect();
        for spec in specs.values() {
            for pred in &spec.predecessors {
                if !specs.contains_key(pred) {
                    return Err(PipelineError::MissingInput(format!(
                        "stage {} depends on unknown stage {}",
                        spec.id, pred
                    )));
                }
            }
        }
        let graph = StageGraph { specs };
        graph.topological_order()?;
        Ok(graph)
    }

    pub fn spec(&self, id: StageId) -> Option<&StageSpec> {
        self.specs.get(&id)
    }

    pub fn contains(&self, id: StageId) -> bool {
        self.specs.contains_key(&id)
    }

    /// Kahn's algorithm; ties resolve by pipeline ordinal.
    pub fn topological_order(&self) -> Result<Vec<StageId>, PipelineError> {
        let mut indegree: BTreeMap<StageId, usize> =
            self.specs.values().map(|s| (s.id, s.predecessors.len())).collect();
        let mut ready: VecDeque<StageId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.specs.len());

        while let Some(id) = ready.pop_front() {
            order.push(id);
            let mut released = Vec::new();
            for spec in self.specs.values().filter(|s| s.predecessors.contains(&id)) {
                if let Some(d) = indegree.get_mut(&spec.id) {
                    *d -= 1;
                    if *d == 0 {
                        released.push(spec.id);
                    }
                }
            }
            released.sort();
            ready.extend(released);
        }

        if order.len() != self.specs.len() {
            let stuck: Vec<String> = indegree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            return Err(PipelineError::Other(anyhow::anyhow!(
                "stage graph has a cycle through {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }

    /// Closest predecessor accepted by `enabled`, walking back through skipped stages.
    pub fn nearest_predecessor<F>(&self, id: StageId, enabled: F) -> Option<StageId>
    where
        F: Fn(StageId) -> bool,
    {
        let mut queue: VecDeque<StageId> = self.spec(id)?.predecessors.iter().copied().collect();
        while let Some(pred) = queue.pop_front() {
            if enabled(pred) {
                return Some(pred);
            }
            if let Some(spec) = self.spec(pred) {
                queue.extend(spec.predecessors.iter().copied());
            }
        }
        None
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    CompletedOk,
    CompletedWithFailures,
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: StageId,
    pub state: StageState,
    pub duration_ms: u128,
    pub samples_in: usize,
    pub samples_out: usize,
    pub failed_samples: Vec<String>,
    pub summary: StageSummary,
    pub stage_error: Option<String>,
}

/// The run as a whole, handed to the report writer at the end.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
    pub stages: Vec<StageRecord>,
    pub status: RunStatus,
    pub tool_versions: BTreeMap<String, String>,
}


/// Drives stages through `Pending -> Running -> Completed*` or `Pending -> Skipped`.
pub struct Sequencer {
    graph: StageGraph,
    tasks: BTreeMap<StageId, Arc<dyn StageTask>>,
    states: BTreeMap<StageId, StageState>,
    plan: Vec<StageId>,
}

impl Sequencer {
    /// Every planned stage must be in the graph and have a task.
    pub fn new(
        graph: StageGraph,
        tasks: Vec<Arc<dyn StageTask>>,
        planned: &[StageId],
    ) -> Result<Self, PipelineError> {
        let tasks: BTreeMap<StageId, Arc<dyn StageTask>> =
            tasks.into_iter().map(|t| (t.spec().id, t)).collect();
        let plan: Vec<StageId> = graph
            .topological_order()?
            .into_iter()
            .filter(|id| planned.contains(id))
            .collect();
        for id in planned {
            if !graph.contains(*id) || !tasks.contains_key(id) {
                return Err(PipelineError::MissingInput(format!("no stage registered for {}", id)));
            }
        }
        let states = plan.iter().map(|id| (*id, StageState::Pending)).collect();
        Ok(Sequencer {
            graph,
            tasks,
            states,
            plan,
        })
    }

    pub fn plan(&self) -> &[StageId] {
        &self.plan
    }

    pub fn state(&self, id: StageId) -> Option<StageState> {
        self.states.get(&id).copied()
    }

    pub fn transition(&mut self, id: StageId, to: StageState) -> Result<(), PipelineError> {
        let from = self
            .state(id)
            .ok_or_else(|| PipelineError::MissingInput(format!("stage {} is not planned", id)))?;
        let allowed = matches!(
            (from, to),
            (StageState::Pending, StageState::Running)
                | (StageState::Pending, StageState::Skipped)
                | (StageState::Running, StageState::CompletedOk)
                | (StageState::Running, StageState::CompletedWithFailures)
        );
        if !allowed {
            return Err(PipelineError::InvalidTransition {
                stage: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        if to == StageState::Running && !self.predecessors_done(id) {
            return Err(PipelineError::InvalidTransition {
                stage: id.to_string(),
                from: from.to_string(),
                to: format!("{} (predecessors unfinished)", to),
            });
        }
        self.states.insert(id, to);
        Ok(())
    }

    /// Unplanned predecessors are outside this run and count as done.
    fn predecessors_done(&self, id: StageId) -> bool {
        self.graph
            .spec(id)
            .map(|spec| {
                spec.predecessors
                    .iter()
                    .all(|p| self.state(*p).map(|s| s.is_terminal()).unwrap_or(true))
            })
            .unwrap_or(false)
    }

    /// First planned stage goes to Running immediately.
    pub fn start(&mut self) -> Result<Option<StageId>, PipelineError> {
        match self.plan.first().copied() {
            Some(first) => {
                self.transition(first, StageState::Running)?;
                Ok(Some(first))
            }
            None => Ok(None),
        }
    }

    /// Terminal status over the stages that actually ran.
    pub fn status(&self, aborted: bool) -> RunStatus {
        if aborted {
            return RunStatus::Aborted;
        }
        let all_ok = self
            .states
            .values()
            .all(|s| matches!(s, StageState::CompletedOk | StageState::Skipped));
        if all_ok {
            RunStatus::CompletedOk
        } else {
            RunStatus::CompletedWithFailures
        }
    }

    /// Runs the planned stages in order over `samples`.
    ///
    /// # Arguments
    ///
    /// * `samples` - Input samples of the first planned stage.
    /// * `ctx` - Shared run context.
    /// * `sink` - Report writer, fed at every stage boundary and at the end.
    ///
    /// # Returns
    /// PipelineRun. Only broken sequencing (an invalid transition) is an error.
    pub async fn run(
        &mut self,
        samples: Vec<Sample>,
        ctx: Arc<StageContext>,
        sink: &dyn ReportSink,
    ) -> Result<PipelineRun, PipelineError> {
        let started_at = Local::now();
        let mut records = Vec::new();
        let mut samples = samples;
        let mut aborted = false;
        let mut halted = false;

        let plan = self.plan.clone();
        let first_enabled = plan.first().map(|id| ctx.config.is_enabled(*id)).unwrap_or(false);
        let mut started = if first_enabled { self.start()? } else { None };

        for id in plan {
            if ctx.invoker.is_aborted() {
                warn!("Abort requested; {} and later stages will not start", id);
                aborted = true;
                break;
            }

            let enabled = ctx.config.is_enabled(id);
            if halted || !enabled {
                self.transition(id, StageState::Skipped)?;
                info!("{}: skipped{}", id, if halted { " after earlier failures" } else { "" });
                records.push(skipped_record(id, samples.len()));
                continue;
            }

            if started != Some(id) {
                self.transition(id, StageState::Running)?;
            }
            started = None;

            let task = match self.tasks.get(&id) {
                Some(task) => Arc::clone(task),
                None => return Err(PipelineError::MissingInput(format!("no stage registered for {}", id))),
            };
            let stage_start = Instant::now();
            let samples_in = samples.len();
            let result = run_stage(task, samples, Arc::clone(&ctx)).await;
            self.transition(id, result.status)?;

            if let Err(e) = sink.stage_completed(&result, &ctx.ledger) {
                error!("{}: could not write stage report: {}", id, e);
            }

            records.push(stage_record(&result, &ctx, samples_in, stage_start));
            samples = result.survivors;

            if result.aborted {
                aborted = true;
                break;
            }
            if result.status == StageState::CompletedWithFailures {
                if ctx.config.policy.halt_on_failure {
                    warn!("{}: failures detected; halting remaining stages", id);
                    halted = true;
                } else {
                    warn!("{}: continuing with {} surviving samples", id, samples.len());
                }
            }
            if samples.is_empty() && !halted {
                warn!("{}: no samples left for later stages", id);
            }
        }

        let run = PipelineRun {
            started_at,
            finished_at: Some(Local::now()),
            stages: records,
            status: self.status(aborted),
            tool_versions: ctx.tool_versions.clone(),
        };
        if let Err(e) = sink.run_completed(&run, &ctx.ledger) {
            error!("Could not write project report: {}", e);
        }
        Ok(run)
    }
}

fn skipped_record(stage: StageId, samples: usize) -> StageRecord {
    StageRecord {
        stage,
        state: StageState::Skipped,
        duration_ms: 0,
        samples_in: samples,
        samples_out: samples,
        failed_samples: Vec::new(),
        summary: StageSummary::default(),
        stage_error: None,
    }
}

fn stage_record(result: &StageResult, ctx: &StageContext, samples_in: usize, start: Instant) -> StageRecord {
    StageRecord {
        stage: result.stage,
        state: result.status,
        duration_ms: start.elapsed().as_millis(),
        samples_in,
        samples_out: result.survivors.len(),
        failed_samples: result.failures.iter().map(|f| f.sample.clone()).collect(),
        summary: ctx.ledger.summary(result.stage),
        stage_error: result.stage_error.clone(),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::orchestrator::stage::{UnitReport, WorkUnit};

    fn spec(id: StageId, predecessors: Vec<StageId>) -> StageSpec {
        StageSpec {
            id,
            predecessors,
            tool: "sh",
            cost: 1,
            output_suffix: ".fasta.gz",
        }
    }

    fn chain() -> StageGraph {
        StageGraph::new(vec![
            spec(StageId::Dereplication, vec![StageId::QualityFiltering]),
            spec(StageId::PeMerging, vec![]),
            spec(StageId::QualityFiltering, vec![StageId::PrimerTrimming]),
            spec(StageId::PrimerTrimming, vec![StageId::PeMerging]),
        ])
        .unwrap()
    }

    #[test]
    fn test_topological_order() {
        assert_eq!(
            chain().topological_order().unwrap(),
            vec![
                StageId::PeMerging,
                StageId::PrimerTrimming,
                StageId::QualityFiltering,
                StageId::Dereplication
            ]
        );
    }

    #[test]
    fn test_cycle_is_rejected() {
        let result = StageGraph::new(vec![
            spec(StageId::PeMerging, vec![StageId::PrimerTrimming]),
            spec(StageId::PrimerTrimming, vec![StageId::PeMerging]),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_predecessor_is_rejected() {
        assert!(StageGraph::new(vec![spec(StageId::Denoising, vec![StageId::Dereplication])]).is_err());
    }

    #[test]
    fn test_nearest_predecessor_walks_past_disabled() {
        let graph = StageGraph::new(vec![
            spec(StageId::Denoising, vec![]),
            spec(StageId::Clustering, vec![StageId::Denoising]),
            spec(StageId::ReplicateMerging, vec![StageId::Clustering]),
        ])
        .unwrap();
        let found = graph.nearest_predecessor(StageId::ReplicateMerging, |s| s != StageId::Clustering);
        assert_eq!(found, Some(StageId::Denoising));
        assert_eq!(graph.nearest_predecessor(StageId::Denoising, |_| true), None);
    }

    struct Noop(StageSpec);

    #[async_trait]
    impl StageTask for Noop {
        fn spec(&self) -> &StageSpec {
            &self.0
        }

        async fn process(&self, _ctx: Arc<StageContext>, _unit: WorkUnit) -> Result<UnitReport, PipelineError> {
            Ok(UnitReport::default())
        }
    }

    fn sequencer(planned: &[StageId]) -> Sequencer {
        let graph = chain();
        let tasks: Vec<Arc<dyn StageTask>> = graph
            .topological_order()
            .unwrap()
            .into_iter()
            .map(|id| Arc::new(Noop(graph.spec(id).unwrap().clone())) as Arc<dyn StageTask>)
            .collect();
        Sequencer::new(graph, tasks, planned).unwrap()
    }

    #[test]
    fn test_state_machine_transitions() {
        let mut seq = sequencer(&[
            StageId::Dereplication,
            StageId::PeMerging,
            StageId::PrimerTrimming,
            StageId::QualityFiltering,
        ]);
        assert_eq!(seq.plan()[0], StageId::PeMerging);
        assert_eq!(seq.start().unwrap(), Some(StageId::PeMerging));
        assert_eq!(seq.state(StageId::PeMerging), Some(StageState::Running));
        assert_eq!(seq.state(StageId::PrimerTrimming), Some(StageState::Pending));

        let early = seq.transition(StageId::PrimerTrimming, StageState::Running);
        assert!(matches!(early, Err(PipelineError::InvalidTransition { .. })));

        seq.transition(StageId::PeMerging, StageState::CompletedOk).unwrap();
        assert!(seq.transition(StageId::PeMerging, StageState::Running).is_err());

        seq.transition(StageId::PrimerTrimming, StageState::Skipped).unwrap();
        seq.transition(StageId::QualityFiltering, StageState::Running).unwrap();
        seq.transition(StageId::QualityFiltering, StageState::CompletedWithFailures).unwrap();
        assert!(seq.transition(StageId::Dereplication, StageState::CompletedOk).is_err());
        seq.transition(StageId::Dereplication, StageState::Running).unwrap();
        seq.transition(StageId::Dereplication, StageState::CompletedOk).unwrap();

        assert_eq!(seq.status(false), RunStatus::CompletedWithFailures);
        assert_eq!(seq.status(true), RunStatus::Aborted);
    }

    #[test]
    fn test_single_stage_plan_ignores_unplanned_predecessors() {
        let mut seq = sequencer(&[StageId::QualityFiltering]);
        assert_eq!(seq.plan(), &[StageId::QualityFiltering]);
        assert_eq!(seq.start().unwrap(), Some(StageId::QualityFiltering));
        seq.transition(StageId::QualityFiltering, StageState::CompletedOk).unwrap();
        assert_eq!(seq.status(false), RunStatus::CompletedOk);
    }
}
