// src/pipelines/quality_filtering.rs: expected-error and length filtering to FASTA

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::defs::{PipelineError, StageId, VsearchSubcommand, VSEARCH_QMAX, VSEARCH_TAG};
use crate::config::resolve::QualityFilteringOptions;
use crate::orchestrator::stage::{StageContext, StageSpec, StageTask, UnitReport, WorkUnit};
use crate::pipelines::external::{empty_input_shortcut, finish_unit, UnitPaths};
use crate::utils::command::vsearch::{arg_generator, VsearchConfig};
use crate::utils::counts::CountRule;
use crate::utils::invoker::{DeclaredOutput, ToolCommand};


pub fn spec() -> StageSpec {
    StageSpec {
        id: StageId::QualityFiltering,
        predecessors: vec![StageId::PrimerTrimming],
        tool: VSEARCH_TAG,
        cost: 1,
        output_suffix: "_filtered.fasta.gz",
    }
}

pub struct QualityFiltering {
    spec: StageSpec,
}

impl QualityFiltering {
    pub fn new() -> Self {
        QualityFiltering { spec: spec() }
    }
}

pub fn filter_args(options: &QualityFilteringOptions, input: PathBuf, log: &PathBuf) -> Vec<String> {
    let config = VsearchConfig::new(VsearchSubcommand::FastqFilter, input)
        .field("--fastaout", "-")
        .flag("--quiet")
        .field("--fasta_width", 0)
        .field("--log", log.display())
        .field("--fastq_maxee", options.max_ee)
        .field("--fastq_minlen", options.min_length)
        .field("--fastq_maxlen", options.max_length)
        .field("--fastq_qmax", VSEARCH_QMAX);
    arg_generator(&config)
}

#[async_trait]
impl StageTask for QualityFiltering {
    fn spec(&self) -> &StageSpec {
        &self.spec
    }

    async fn process(&self, ctx: Arc<StageContext>, unit: WorkUnit) -> Result<UnitReport, PipelineError> {
        let inputs = unit.inputs();
        let input = match inputs.as_slice() {
            [input] => input.clone(),
            _ => {
                return Err(PipelineError::MissingInput(format!(
                    "{} needs exactly one trimmed read file, found {}",
                    unit.id,
                    inputs.len()
                )));
            }
        };
        if let Some(report) = empty_input_shortcut(&ctx, &self.spec, &unit).await? {
            return Ok(report);
        }
        let options = ctx.config.quality_filtering().ok_or_else(|| {
            PipelineError::config(StageId::QualityFiltering.section(), "*", "options not resolved")
        })?;

        let paths = UnitPaths::new(&ctx, &self.spec, &unit.id);
        let command = ToolCommand::new(VSEARCH_TAG, filter_args(options, input.clone(), &paths.log))
            .stdout_to(paths.staged.clone());

        let run = ctx
            .invoker
            .invoke(
                &command,
                &[input],
                &[DeclaredOutput::may_be_empty(paths.staged.clone())],
                self.spec.cost,
                &CountRule::FastqFilter { log: paths.log.clone() },
            )
            .await?;
        finish_unit(&ctx, paths, vec![run]).await
    }
}
