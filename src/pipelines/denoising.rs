// src/pipelines/denoising.rs: UNOISE3 denoising and de novo chimera removal into ESVs

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::defs::{PipelineError, StageId, VsearchSubcommand, VSEARCH_TAG};
use crate::config::resolve::DenoisingOptions;
use crate::orchestrator::stage::{StageContext, StageSpec, StageTask, UnitReport, WorkUnit};
use crate::pipelines::external::{
    blocking, commit_output, empty_input_shortcut, rewrite_by_hash, UnitPaths,
};
use crate::utils::command::vsearch::{arg_generator, VsearchConfig};
use crate::utils::counts::CountRule;
use crate::utils::invoker::{DeclaredOutput, ToolCommand};


pub fn spec() -> StageSpec {
    StageSpec {
        id: StageId::Denoising,
        predecessors: vec![StageId::Dereplication],
        tool: VSEARCH_TAG,
        cost: 1,
        output_suffix: "_ESVs.fasta.gz",
    }
}

pub struct Denoising {
    spec: StageSpec,
}

impl Denoising {
    pub fn new() -> Self {
        Denoising { spec: spec() }
    }
}

pub fn unoise_args(options: &DenoisingOptions, input: PathBuf, log: &PathBuf, threads: usize) -> Vec<String> {
    let config = VsearchConfig::new(VsearchSubcommand::ClusterUnoise, input)
        .field("--unoise_alpha", options.alpha)
        .field("--minsize", options.minsize)
        .flag("--sizein")
        .flag("--sizeout")
        .field("--centroids", "-")
        .field("--fasta_width", 0)
        .flag("--quiet")
        .field("--log", log.display())
        .field("--threads", threads);
    arg_generator(&config)
}

pub fn uchime_args(centroids: PathBuf) -> Vec<String> {
    let config = VsearchConfig::new(VsearchSubcommand::UchimeDenovo, centroids)
        .flag("--sizein")
        .flag("--sizeout")
        .field("--nonchimeras", "-")
        .field("--fasta_width", 0)
        .flag("--quiet");
    arg_generator(&config)
}

#[async_trait]
impl StageTask for Denoising {
    fn spec(&self) -> &StageSpec {
        &self.spec
    }

    /// Two vsearch runs per sample; the chimera-free centroids are then
    /// relabelled by sequence hash so identical ESVs match across samples.
    async fn process(&self, ctx: Arc<StageContext>, unit: WorkUnit) -> Result<UnitReport, PipelineError> {
        let inputs = unit.inputs();
        let input = match inputs.as_slice() {
            [input] => input.clone(),
            _ => {
                return Err(PipelineError::MissingInput(format!(
                    "{} needs exactly one dereplicated FASTA, found {}",
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
            .denoising()
            .ok_or_else(|| PipelineError::config(StageId::Denoising.section(), "*", "options not resolved"))?;

        let paths = UnitPaths::new(&ctx, &self.spec, &unit.id);
        let centroids = ctx.layout.scratch_path(self.spec.id, &unit.id, "centroids.fasta");
        let nonchimeras = ctx.layout.scratch_path(self.spec.id, &unit.id, "nonchimeras.fasta");

        let unoise = ToolCommand::new(
            VSEARCH_TAG,
            unoise_args(options, input.clone(), &paths.log, self.spec.cost),
        )
        .stdout_to(centroids.clone());
        let denoised = ctx
            .invoker
            .invoke(
                &unoise,
                &[input],
                &[DeclaredOutput::may_be_empty(centroids.clone())],
                self.spec.cost,
                &CountRule::Unoise { log: paths.log.clone() },
            )
            .await?;

        let uchime = ToolCommand::new(VSEARCH_TAG, uchime_args(centroids.clone()))
            .stdout_to(nonchimeras.clone());
        let chimera_free = ctx
            .invoker
            .invoke(
                &uchime,
                &[centroids.clone()],
                &[DeclaredOutput::may_be_empty(nonchimeras.clone())],
                self.spec.cost,
                &CountRule::SizeAnnotations {
                    input: centroids.clone(),
                    output: nonchimeras.clone(),
                },
            )
            .await?;

        let staged = paths.staged.clone();
        let esvs = blocking(move || rewrite_by_hash(&nonchimeras, &staged)).await?;
        commit_output(&ctx, &paths).await?;
        let _ = std::fs::remove_file(&centroids);
        let _ = std::fs::remove_file(&paths.log);

        Ok(UnitReport {
            reads_in: denoised.counts.reads_in,
            reads_out: Some(esvs),
            runs: vec![denoised, chimera_free],
            outputs: vec![paths.dest],
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unoise_args() {
        let options = DenoisingOptions { alpha: 2.0, minsize: 8 };
        let args = unoise_args(&options, PathBuf::from("S1_dereplicated.fasta.gz"), &PathBuf::from("S1.log"), 1);
        assert_eq!(&args[..6], &["--cluster_unoise", "S1_dereplicated.fasta.gz", "--unoise_alpha", "2", "--minsize", "8"]);
        let pos = args.iter().position(|a| a == "--centroids").unwrap();
        assert_eq!(args[pos + 1], "-");
    }

    #[test]
    fn test_uchime_args_write_to_stdout() {
        let args = uchime_args(PathBuf::from("c.fasta"));
        assert_eq!(&args[..2], &["--uchime_denovo", "c.fasta"]);
        let pos = args.iter().position(|a| a == "--nonchimeras").unwrap();
        assert_eq!(args[pos + 1], "-");
    }
}
