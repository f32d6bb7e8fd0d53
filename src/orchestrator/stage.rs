// src/orchestrator/stage.rs: stage definitions and per-stage results

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::defs::{PipelineError, StageId};
use crate::config::resolve::Configuration;
use crate::orchestrator::layout::ProjectLayout;
use crate::orchestrator::ledger::Ledger;
use crate::utils::invoker::{ToolInvoker, ToolRun};


/// Static description of a stage: its place in the graph, what it runs, and
/// how its outputs are named so later stages can find them again.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSpec {
    pub id: StageId,
    pub predecessors: Vec<StageId>,
    pub tool: &'static str,
    /// Cores checked out per invocation.
    pub cost: usize,
    /// Appended to the sample id to form the output file name.
    pub output_suffix: &'static str,
}

impl StageSpec {
    pub fn name(&self) -> &'static str {
        self.id.dir_name()
    }

    pub fn ordinal(&self) -> usize {
        self.id.ordinal()
    }

    pub fn output_name(&self, sample: &str) -> String {
        format!("{}{}", sample, self.output_suffix)
    }

    /// Inverse of `output_name`.
    pub fn sample_from_output(&self, path: &Path) -> Option<String> {
        path.file_name()?
            .to_str()?
            .strip_suffix(self.output_suffix)
            .filter(|id| !id.is_empty())
            .map(|id| id.to_string())
    }
}


#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageOutput {
    pub stage: StageId,
    pub files: Vec<PathBuf>,
    /// Forwarded from a failed invocation.
    pub partial: bool,
}

/// One sample and the outputs it has accumulated so far.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub id: String,
    pub origin: Vec<PathBuf>,
    pub outputs: Vec<StageOutput>,
}

impl Sample {
    pub fn new(id: &str, origin: Vec<PathBuf>) -> Self {
        Sample {
            id: id.to_string(),
            origin,
            outputs: Vec::new(),
        }
    }

    /// Files the next stage should read.
    pub fn current(&self) -> &[PathBuf] {
        self.outputs
            .last()
            .map(|o| o.files.as_slice())
            .unwrap_or(self.origin.as_slice())
    }

    pub fn is_partial(&self) -> bool {
        self.outputs.iter().any(|o| o.partial)
    }

    pub fn with_output(&self, stage: StageId, files: Vec<PathBuf>, partial: bool) -> Sample {
        let mut next = self.clone();
        next.outputs.push(StageOutput { stage, files, partial });
        next
    }

    /// New identity for several samples folded into one (replicate merging).
    pub fn merged(id: &str, members: &[Sample]) -> Sample {
        Sample {
            id: id.to_string(),
            origin: members.iter().flat_map(|m| m.origin.iter().cloned()).collect(),
            outputs: Vec::new(),
        }
    }
}


/// What one invocation of a stage works on: usually a single sample,
/// several for stages that fold samples together.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkUnit {
    pub id: String,
    pub members: Vec<Sample>,
}

impl WorkUnit {
    pub fn single(sample: &Sample) -> Self {
        WorkUnit {
            id: sample.id.clone(),
            members: vec![sample.clone()],
        }
    }

    pub fn inputs(&self) -> Vec<PathBuf> {
        self.members.iter().flat_map(|m| m.current().iter().cloned()).collect()
    }

    /// The sample that carries this unit's output into the next stage.
    pub fn carrier(&self) -> Sample {
        match self.members.as_slice() {
            [only] if only.id == self.id => only.clone(),
            members => Sample::merged(&self.id, members),
        }
    }
}


/// Everything a stage needs while it runs. Shared read-only by all workers.
pub struct StageContext {
    pub config: Arc<Configuration>,
    pub layout: ProjectLayout,
    pub invoker: ToolInvoker,
    pub ledger: Arc<Ledger>,
    pub tool_versions: BTreeMap<String, String>,
}

impl StageContext {
    pub fn compression_level(&self) -> u32 {
        self.config.compression_level
    }

    pub fn tool_version(&self, tool: &str) -> String {
        self.tool_versions
            .get(tool)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string())
    }
}


/// Result of a unit's successful processing.
#[derive(Debug, Clone, Default)]
pub struct UnitReport {
    pub runs: Vec<ToolRun>,
    pub reads_in: Option<u64>,
    pub reads_out: Option<u64>,
    pub outputs: Vec<PathBuf>,
}


/// A concrete stage. The runner owns scheduling, staging, and accounting;
/// implementations only turn one work unit into committed outputs.
#[async_trait]
pub trait StageTask: Send + Sync {
    fn spec(&self) -> &StageSpec;

    /// Splits the surviving samples into work units; one unit per sample by default.
    fn group(&self, samples: &[Sample], _ctx: &StageContext) -> Vec<WorkUnit> {
        samples.iter().map(WorkUnit::single).collect()
    }

    /// Stage-wide setup before any unit starts.
    async fn prepare(&self, _ctx: &StageContext, _samples: &[Sample]) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn process(&self, ctx: Arc<StageContext>, unit: WorkUnit) -> Result<UnitReport, PipelineError>;

    /// Stage-wide outputs built once every unit has finished.
    async fn finalize(
        &self,
        _ctx: &StageContext,
        _results: &[InvocationResult],
    ) -> Result<Vec<PathBuf>, PipelineError> {
        Ok(Vec::new())
    }
}


/// Per (sample, stage) outcome. Built once when the unit finishes.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationResult {
    pub sample: String,
    pub stage: StageId,
    pub runs: Vec<ToolRun>,
    pub duration: Duration,
    pub reads_in: Option<u64>,
    pub reads_out: Option<u64>,
    pub outputs: Vec<PathBuf>,
    pub partial: bool,
}

impl InvocationResult {
    pub fn exit_code(&self) -> Option<i32> {
        self.runs.last().and_then(|r| r.exit_code)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleFailure {
    pub sample: String,
    pub error: String,
    pub exit_code: Option<i32>,
    pub aborted: bool,
    /// Staged output was committed and the sample kept in the run anyway.
    pub forwarded: bool,
}

impl SampleFailure {
    pub fn from_error(sample: &str, error: &PipelineError) -> Self {
        let exit_code = match error {
            PipelineError::ToolFailure { exit_code, .. } => *exit_code,
            _ => None,
        };
        SampleFailure {
            sample: sample.to_string(),
            error: error.to_string(),
            exit_code,
            aborted: matches!(error, PipelineError::AbortRequested),
            forwarded: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageAggregate {
    pub samples: usize,
    pub reads_in: u64,
    pub reads_out: u64,
    pub failed: usize,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StageState {
    Pending,
    Running,
    CompletedOk,
    CompletedWithFailures,
    Skipped,
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageState::CompletedOk | StageState::CompletedWithFailures | StageState::Skipped
        )
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageState::Pending => "pending",
            StageState::Running => "running",
            StageState::CompletedOk => "completed",
            StageState::CompletedWithFailures => "completed with failures",
            StageState::Skipped => "skipped",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage: StageId,
    pub status: StageState,
    pub results: Vec<InvocationResult>,
    pub failures: Vec<SampleFailure>,
    pub aggregate: StageAggregate,
    pub duration: Duration,
    /// Samples handed to the next stage, sorted by id.
    #[serde(skip)]
    pub survivors: Vec<Sample>,
    pub stage_outputs: Vec<PathBuf>,
    pub stage_error: Option<String>,
    pub aborted: bool,
}
