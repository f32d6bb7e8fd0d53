// src/pipelines/primer_trimming.rs: cut the linked primer pair off merged reads

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::defs::{PipelineError, StageId, CUTADAPT_TAG};
use crate::orchestrator::stage::{StageContext, StageSpec, StageTask, UnitReport, WorkUnit};
use crate::pipelines::external::{empty_input_shortcut, finish_unit, UnitPaths};
use crate::utils::command::cutadapt::{arg_generator, linked_adapter, CutadaptConfig};
use crate::utils::counts::CountRule;
use crate::utils::invoker::{DeclaredOutput, ToolCommand};


pub fn spec() -> StageSpec {
    StageSpec {
        id: StageId::PrimerTrimming,
        predecessors: vec![StageId::PeMerging],
        tool: CUTADAPT_TAG,
        cost: 1,
        output_suffix: "_trimmed.fastq.gz",
    }
}

/// Reads without both primers are discarded.
pub struct PrimerTrimming {
    spec: StageSpec,
}

impl PrimerTrimming {
    pub fn new() -> Self {
        PrimerTrimming { spec: spec() }
    }
}

#[async_trait]
impl StageTask for PrimerTrimming {
    fn spec(&self) -> &StageSpec {
        &self.spec
    }

    async fn process(&self, ctx: Arc<StageContext>, unit: WorkUnit) -> Result<UnitReport, PipelineError> {
        let inputs = unit.inputs();
        let input = match inputs.as_slice() {
            [input] => input.clone(),
            _ => {
                return Err(PipelineError::MissingInput(format!(
                    "{} needs exactly one merged read file, found {}",
                    unit.id,
                    inputs.len()
                )));
            }
        };
        if let Some(report) = empty_input_shortcut(&ctx, &self.spec, &unit).await? {
            return Ok(report);
        }
        let options = ctx.config.primer_trimming().ok_or_else(|| {
            PipelineError::config(StageId::PrimerTrimming.section(), "*", "options not resolved")
        })?;

        let paths = UnitPaths::new(&ctx, &self.spec, &unit.id);
        let config = CutadaptConfig {
            adapter: linked_adapter(options),
            input: input.clone(),
            output: paths.staged.clone(),
            cores: self.spec.cost,
        };
        let command = ToolCommand::new(CUTADAPT_TAG, arg_generator(&config));

        let run = ctx
            .invoker
            .invoke(
                &command,
                &[input],
                &[DeclaredOutput::may_be_empty(paths.staged.clone())],
                self.spec.cost,
                &CountRule::CutadaptMinimal,
            )
            .await?;
        finish_unit(&ctx, paths, vec![run]).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_spec_naming() {
        let spec = spec();
        assert_eq!(spec.output_name("S1"), "S1_trimmed.fastq.gz");
        assert_eq!(
            spec.sample_from_output(Path::new("/p/04_primer_trimming/data/S1_trimmed.fastq.gz")),
            Some("S1".to_string())
        );
        assert_eq!(spec.predecessors, vec![StageId::PeMerging]);
    }
}
