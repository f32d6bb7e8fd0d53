pub mod layout;
pub mod ledger;
pub mod report;
pub mod runner;
pub mod sequencer;
pub mod stage;

pub use layout::ProjectLayout;
pub use ledger::{Ledger, LedgerEntry, StageSummary};
pub use report::{NullReport, ProjectReport, ReportSink};
pub use runner::run_stage;
pub use sequencer::{PipelineRun, RunStatus, Sequencer, StageGraph};
pub use stage::{
    InvocationResult, Sample, SampleFailure, StageContext, StageResult, StageSpec, StageState,
    StageTask, UnitReport, WorkUnit,
};
