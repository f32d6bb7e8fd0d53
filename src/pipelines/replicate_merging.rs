// src/pipelines/replicate_merging.rs: fold PCR replicates into one sample

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fxhash::FxHashMap as HashMap;
use log::debug;

use crate::config::defs::{PipelineError, StageId, INTERNAL_TAG};
use crate::orchestrator::stage::{Sample, StageContext, StageSpec, StageTask, UnitReport, WorkUnit};
use crate::pipelines::external::{commit_output, write_by_hash, UnitPaths};
use crate::utils::counts::ReadCounts;
use crate::utils::fastx::{collapse_by_hash, read_sized_fasta, SizedSequence};


pub fn spec() -> StageSpec {
    StageSpec {
        id: StageId::ReplicateMerging,
        predecessors: vec![StageId::Clustering],
        tool: INTERNAL_TAG,
        cost: 1,
        output_suffix: "_merged.fasta.gz",
    }
}

pub struct ReplicateMerging {
    spec: StageSpec,
}

impl ReplicateMerging {
    pub fn new() -> Self {
        ReplicateMerging { spec: spec() }
    }
}

/// `Lake1_A_r2` -> `Lake1_A` for delimiter `_`. Ids without the delimiter are their own group.
pub fn replicate_group<'a>(sample: &'a str, delimiter: &str) -> &'a str {
    match sample.rfind(delimiter) {
        Some(pos) if pos > 0 && !delimiter.is_empty() => &sample[..pos],
        _ => sample,
    }
}

/// Keeps sequences seen in at least `min_presence` replicates, summing their sizes.
pub fn merge_replicates(replicates: Vec<Vec<SizedSequence>>, min_presence: u64) -> Vec<SizedSequence> {
    let mut presence: HashMap<String, u64> = HashMap::default();
    let mut pooled: Vec<SizedSequence> = Vec::new();
    for replicate in replicates {
        for (hash, sequence) in collapse_by_hash(replicate) {
            *presence.entry(hash).or_insert(0) += 1;
            pooled.push(sequence);
        }
    }
    pooled
        .into_iter()
        .filter(|s| presence.get(&s.hash).copied().unwrap_or(0) >= min_presence)
        .collect()
}

#[async_trait]
impl StageTask for ReplicateMerging {
    fn spec(&self) -> &StageSpec {
        &self.spec
    }

    fn group(&self, samples: &[Sample], ctx: &StageContext) -> Vec<WorkUnit> {
        let delimiter = ctx
            .config
            .replicate_merging()
            .map(|o| o.replicate_delimiter.clone())
            .unwrap_or_default();
        let mut groups: BTreeMap<String, Vec<Sample>> = BTreeMap::new();
        for sample in samples {
            groups
                .entry(replicate_group(&sample.id, &delimiter).to_string())
                .or_default()
                .push(sample.clone());
        }
        groups
            .into_iter()
            .map(|(id, members)| {
                debug!("{}: {} <- {} replicates", StageId::ReplicateMerging, id, members.len());
                WorkUnit { id, members }
            })
            .collect()
    }

    async fn process(&self, ctx: Arc<StageContext>, unit: WorkUnit) -> Result<UnitReport, PipelineError> {
        let options = ctx.config.replicate_merging().ok_or_else(|| {
            PipelineError::config(StageId::ReplicateMerging.section(), "*", "options not resolved")
        })?;
        let min_presence = options.minimum_replicate_presence;
        let inputs: Vec<PathBuf> = unit.inputs();
        for input in &inputs {
            if !input.exists() {
                return Err(PipelineError::MissingInput(input.display().to_string()));
            }
        }

        let paths = UnitPaths::new(&ctx, &self.spec, &unit.id);
        let staged = paths.staged.clone();
        let run = ctx
            .invoker
            .invoke_internal(self.spec.cost, move || {
                let mut replicates = Vec::with_capacity(inputs.len());
                for input in &inputs {
                    replicates.push(read_sized_fasta(input)?);
                }
                let reads_in = replicates.iter().map(|r| r.len() as u64).sum();
                let merged = merge_replicates(replicates, min_presence);
                let reads_out = write_by_hash(merged, &staged)?;
                Ok(ReadCounts::known(reads_in, reads_out))
            })
            .await?;
        commit_output(&ctx, &paths).await?;

        Ok(UnitReport {
            reads_in: run.counts.reads_in,
            reads_out: run.counts.reads_out,
            runs: vec![run],
            outputs: vec![paths.dest],
        })
    }
}
