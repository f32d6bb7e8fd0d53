// src/pipelines/clustering.rs: per-sample OTU clustering by identity threshold

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::defs::{PipelineError, StageId, VsearchSubcommand, VSEARCH_TAG};
use crate::orchestrator::stage::{StageContext, StageSpec, StageTask, UnitReport, WorkUnit};
use crate::pipelines::external::{
    blocking, commit_output, empty_input_shortcut, rewrite_by_hash, UnitPaths,
};
use crate::utils::command::vsearch::{arg_generator, VsearchConfig};
use crate::utils::counts::CountRule;
use crate::utils::invoker::{DeclaredOutput, ToolCommand};


pub fn spec() -> StageSpec {
    StageSpec {
        id: StageId::Clustering,
        predecessors: vec![StageId::Denoising],
        tool: VSEARCH_TAG,
        cost: 1,
        output_suffix: "_OTUs.fasta.gz",
    }
}

pub struct Clustering {
    spec: StageSpec,
}

impl Clustering {
    pub fn new() -> Self {
        Clustering { spec: spec() }
    }
}

/// `pct_id` is a percentage; vsearch wants a fraction.
pub fn cluster_args(pct_id: f64, input: PathBuf, log: &PathBuf, threads: usize) -> Vec<String> {
    let config = VsearchConfig::new(VsearchSubcommand::ClusterSize, input)
        .field("--id", pct_id / 100.0)
        .flag("--sizein")
        .flag("--sizeout")
        .field("--centroids", "-")
        .field("--fasta_width", 0)
        .flag("--quiet")
        .field("--log", log.display())
        .field("--threads", threads);
    arg_generator(&config)
}

#[async_trait]
impl StageTask for Clustering {
    fn spec(&self) -> &StageSpec {
        &self.spec
    }

    async fn process(&self, ctx: Arc<StageContext>, unit: WorkUnit) -> Result<UnitReport, PipelineError> {
        let inputs = unit.inputs();
        let input = match inputs.as_slice() {
            [input] => input.clone(),
            _ => {
                return Err(PipelineError::MissingInput(format!(
                    "{} needs exactly one ESV FASTA, found {}",
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
            .clustering()
            .ok_or_else(|| PipelineError::config(StageId::Clustering.section(), "*", "options not resolved"))?;

        let paths = UnitPaths::new(&ctx, &self.spec, &unit.id);
        let centroids = ctx.layout.scratch_path(self.spec.id, &unit.id, "centroids.fasta");
        let command = ToolCommand::new(
            VSEARCH_TAG,
            cluster_args(options.pct_id, input.clone(), &paths.log, self.spec.cost),
        )
        .stdout_to(centroids.clone());

        let run = ctx
            .invoker
            .invoke(
                &command,
                &[input],
                &[DeclaredOutput::may_be_empty(centroids.clone())],
                self.spec.cost,
                &CountRule::Clusters { log: paths.log.clone() },
            )
            .await?;

        let staged = paths.staged.clone();
        let otus = blocking(move || rewrite_by_hash(&centroids, &staged)).await?;
        commit_output(&ctx, &paths).await?;
        let _ = std::fs::remove_file(&paths.log);

        Ok(UnitReport {
            reads_in: run.counts.reads_in,
            reads_out: Some(otus),
            runs: vec![run],
            outputs: vec![paths.dest],
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_args_use_fraction() {
        let args = cluster_args(97.0, PathBuf::from("S1_ESVs.fasta.gz"), &PathBuf::from("S1.log"), 1);
        assert_eq!(&args[..4], &["--cluster_size", "S1_ESVs.fasta.gz", "--id", "0.97"]);
    }
}
