// src/pipelines/pe_merging.rs: paired-end read merging

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::defs::{PipelineError, StageId, VsearchSubcommand, VSEARCH_TAG};
use crate::config::resolve::PeMergingOptions;
use crate::orchestrator::stage::{StageContext, StageSpec, StageTask, UnitReport, WorkUnit};
use crate::pipelines::external::{empty_input_shortcut, finish_unit, UnitPaths};
use crate::utils::command::vsearch::{arg_generator, VsearchConfig};
use crate::utils::counts::CountRule;
use crate::utils::invoker::{DeclaredOutput, ToolCommand};


pub fn spec() -> StageSpec {
    StageSpec {
        id: StageId::PeMerging,
        predecessors: Vec::new(),
        tool: VSEARCH_TAG,
        cost: 1,
        output_suffix: "_PE.fastq.gz",
    }
}

/// Merges each sample's forward and reverse reads into one FASTQ.
pub struct PeMerging {
    spec: StageSpec,
}

impl PeMerging {
    pub fn new() -> Self {
        PeMerging { spec: spec() }
    }
}

pub fn merge_args(
    options: &PeMergingOptions,
    forward: PathBuf,
    reverse: &PathBuf,
    log: &PathBuf,
    threads: usize,
) -> Vec<String> {
    let config = VsearchConfig::new(VsearchSubcommand::MergePairs, forward)
        .field("--reverse", reverse.display())
        .field("--fastqout", "-")
        .flag("--quiet")
        .field("--fastq_maxdiffpct", options.maxdiffpct)
        .field("--fastq_maxdiffs", options.maxdiffs)
        .field("--fastq_minovlen", options.minovlen)
        .flag("--fastq_allowmergestagger")
        .field("--threads", threads)
        .field("--log", log.display());
    arg_generator(&config)
}

#[async_trait]
impl StageTask for PeMerging {
    fn spec(&self) -> &StageSpec {
        &self.spec
    }

    async fn process(&self, ctx: Arc<StageContext>, unit: WorkUnit) -> Result<UnitReport, PipelineError> {
        let inputs = unit.inputs();
        let (forward, reverse) = match inputs.as_slice() {
            [forward, reverse] => (forward.clone(), reverse.clone()),
            _ => {
                return Err(PipelineError::MissingInput(format!(
                    "{} needs one forward and one reverse read file, found {}",
                    unit.id,
                    inputs.len()
                )));
            }
        };
        if let Some(report) = empty_input_shortcut(&ctx, &self.spec, &unit).await? {
            return Ok(report);
        }
        let options = ctx
            .config
            .pe_merging()
            .ok_or_else(|| PipelineError::config(StageId::PeMerging.section(), "*", "options not resolved"))?;

        let paths = UnitPaths::new(&ctx, &self.spec, &unit.id);
        let command = ToolCommand::new(
            VSEARCH_TAG,
            merge_args(options, forward.clone(), &reverse, &paths.log, self.spec.cost),
        )
        .stdout_to(paths.staged.clone());

        let run = ctx
            .invoker
            .invoke(
                &command,
                &[forward, reverse],
                &[DeclaredOutput::may_be_empty(paths.staged.clone())],
                self.spec.cost,
                &CountRule::MergePairs { log: paths.log.clone() },
            )
            .await?;
        finish_unit(&ctx, paths, vec![run]).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_args() {
        let options = PeMergingOptions {
            maxdiffpct: 25,
            maxdiffs: 199,
            minovlen: 5,
        };
        let args = merge_args(
            &options,
            PathBuf::from("S1_R1.fastq.gz"),
            &PathBuf::from("S1_R2.fastq.gz"),
            &PathBuf::from("S1_vsearch.log"),
            1,
        );
        assert_eq!(&args[..4], &["--fastq_mergepairs", "S1_R1.fastq.gz", "--reverse", "S1_R2.fastq.gz"]);
        let maxdiffs = args.iter().position(|a| a == "--fastq_maxdiffs").unwrap();
        assert_eq!(args[maxdiffs + 1], "199");
        assert!(args.contains(&"--fastq_allowmergestagger".to_string()));
        assert_eq!(args.last().unwrap(), "S1_vsearch.log");
    }
}
