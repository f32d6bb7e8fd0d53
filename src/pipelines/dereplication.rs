// src/pipelines/dereplication.rs: collapse identical reads with size annotations

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::defs::{PipelineError, StageId, VsearchSubcommand, VSEARCH_TAG};
use crate::orchestrator::stage::{StageContext, StageSpec, StageTask, UnitReport, WorkUnit};
use crate::pipelines::external::{empty_input_shortcut, finish_unit, UnitPaths};
use crate::utils::command::vsearch::{arg_generator, VsearchConfig};
use crate::utils::counts::CountRule;
use crate::utils::invoker::{DeclaredOutput, ToolCommand};


pub fn spec() -> StageSpec {
    StageSpec {
        id: StageId::Dereplication,
        predecessors: vec![StageId::QualityFiltering],
        tool: VSEARCH_TAG,
        cost: 1,
        output_suffix: "_dereplicated.fasta.gz",
    }
}

pub struct Dereplication {
    spec: StageSpec,
}

impl Dereplication {
    pub fn new() -> Self {
        Dereplication { spec: spec() }
    }
}

pub fn uniques_args(minuniquesize: u64, input: PathBuf, log: &PathBuf) -> Vec<String> {
    let config = VsearchConfig::new(VsearchSubcommand::Uniques, input)
        .field("--minuniquesize", minuniquesize)
        .field("--fastaout", "-")
        .flag("--quiet")
        .field("--fasta_width", 0)
        .field("--log", log.display())
        .flag("--sizeout")
        .field("--relabel", "seq:");
    arg_generator(&config)
}

#[async_trait]
impl StageTask for Dereplication {
    fn spec(&self) -> &StageSpec {
        &self.spec
    }

    async fn process(&self, ctx: Arc<StageContext>, unit: WorkUnit) -> Result<UnitReport, PipelineError> {
        let inputs = unit.inputs();
        let input = match inputs.as_slice() {
            [input] => input.clone(),
            _ => {
                return Err(PipelineError::MissingInput(format!(
                    "{} needs exactly one filtered FASTA, found {}",
                    unit.id,
                    inputs.len()
                )));
            }
        };
        if let Some(report) = empty_input_shortcut(&ctx, &self.spec, &unit).await? {
            return Ok(report);
        }
        let options = ctx.config.dereplication().ok_or_else(|| {
            PipelineError::config(StageId::Dereplication.section(), "*", "options not resolved")
        })?;

        let paths = UnitPaths::new(&ctx, &self.spec, &unit.id);
        let command = ToolCommand::new(
            VSEARCH_TAG,
            uniques_args(options.minimum_sequence_abundance, input.clone(), &paths.log),
        )
        .stdout_to(paths.staged.clone());

        let run = ctx
            .invoker
            .invoke(
                &command,
                &[input],
                &[DeclaredOutput::may_be_empty(paths.staged.clone())],
                self.spec.cost,
                &CountRule::Uniques { log: paths.log.clone() },
            )
            .await?;
        finish_unit(&ctx, paths, vec![run]).await
    }
}
