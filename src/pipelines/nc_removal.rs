// src/pipelines/nc_removal.rs: subtract negative-control reads from every sample

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use fxhash::FxHashMap as HashMap;
use log::info;

use crate::config::defs::{PipelineError, StageId, INTERNAL_TAG};
use crate::orchestrator::stage::{Sample, StageContext, StageSpec, StageTask, UnitReport, WorkUnit};
use crate::pipelines::external::{blocking, commit_output, write_by_hash, UnitPaths};
use crate::utils::counts::ReadCounts;
use crate::utils::fastx::{read_sized_fasta, SizedSequence};


pub fn spec() -> StageSpec {
    StageSpec {
        id: StageId::NcRemoval,
        predecessors: vec![StageId::ReplicateMerging],
        tool: INTERNAL_TAG,
        cost: 1,
        output_suffix: "_nc_removed.fasta.gz",
    }
}

/// Highest size of each sequence hash over all negative controls.
pub type ControlReads = HashMap<String, u64>;

/// Negative controls are read once in `prepare` and are not forwarded.
pub struct NcRemoval {
    spec: StageSpec,
    controls: Mutex<Arc<ControlReads>>,
}

impl NcRemoval {
    pub fn new() -> Self {
        NcRemoval {
            spec: spec(),
            controls: Mutex::new(Arc::new(ControlReads::default())),
        }
    }

    fn controls(&self) -> Result<Arc<ControlReads>, PipelineError> {
        self.controls
            .lock()
            .map(|c| Arc::clone(&c))
            .map_err(|_| PipelineError::Other(anyhow!("negative control table poisoned")))
    }
}

fn control_prefix(ctx: &StageContext) -> String {
    ctx.config
        .nc_removal()
        .map(|o| o.negative_control_prefix.clone())
        .unwrap_or_default()
}

pub fn is_negative_control(sample: &str, prefix: &str) -> bool {
    !prefix.is_empty() && sample.starts_with(prefix)
}

pub fn max_control_reads(controls: Vec<Vec<SizedSequence>>) -> ControlReads {
    let mut reads = ControlReads::default();
    for control in controls {
        for sequence in control {
            let entry = reads.entry(sequence.hash).or_insert(0);
            *entry = (*entry).max(sequence.size);
        }
    }
    reads
}

/// Sequences whose size drops to zero or below are removed.
pub fn subtract_controls(sequences: Vec<SizedSequence>, controls: &ControlReads) -> Vec<SizedSequence> {
    sequences
        .into_iter()
        .filter_map(|mut sequence| {
            let control = controls.get(&sequence.hash).copied().unwrap_or(0);
            if sequence.size > control {
                sequence.size -= control;
                Some(sequence)
            } else {
                None
            }
        })
        .collect()
}

#[async_trait]
impl StageTask for NcRemoval {
    fn spec(&self) -> &StageSpec {
        &self.spec
    }

    fn group(&self, samples: &[Sample], ctx: &StageContext) -> Vec<WorkUnit> {
        let prefix = control_prefix(ctx);
        samples
            .iter()
            .filter(|s| !is_negative_control(&s.id, &prefix))
            .map(WorkUnit::single)
            .collect()
    }

    async fn prepare(&self, ctx: &StageContext, samples: &[Sample]) -> Result<(), PipelineError> {
        let prefix = control_prefix(ctx);
        let files: Vec<PathBuf> = samples
            .iter()
            .filter(|s| is_negative_control(&s.id, &prefix))
            .flat_map(|s| s.current().iter().cloned())
            .collect();
        let count = files.len();
        let reads = blocking(move || {
            let mut controls = Vec::with_capacity(files.len());
            for file in &files {
                controls.push(read_sized_fasta(file)?);
            }
            Ok(max_control_reads(controls))
        })
        .await?;
        info!(
            "{}: {} negative control files hold {} distinct sequences",
            self.spec.id,
            count,
            reads.len()
        );

        let mut guard = self
            .controls
            .lock()
            .map_err(|_| PipelineError::Other(anyhow!("negative control table poisoned")))?;
        *guard = Arc::new(reads);
        Ok(())
    }

    async fn process(&self, ctx: Arc<StageContext>, unit: WorkUnit) -> Result<UnitReport, PipelineError> {
        let inputs = unit.inputs();
        let input = match inputs.as_slice() {
            [input] if input.exists() => input.clone(),
            [input] => return Err(PipelineError::MissingInput(input.display().to_string())),
            _ => {
                return Err(PipelineError::MissingInput(format!(
                    "{} needs exactly one FASTA, found {}",
                    unit.id,
                    inputs.len()
                )));
            }
        };
        let controls = self.controls()?;
        let paths = UnitPaths::new(&ctx, &self.spec, &unit.id);
        let staged = paths.staged.clone();
        let run = ctx
            .invoker
            .invoke_internal(self.spec.cost, move || {
                let sequences = read_sized_fasta(&input)?;
                let reads_in = sequences.len() as u64;
                let kept = subtract_controls(sequences, &controls);
                let reads_out = write_by_hash(kept, &staged)?;
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


#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::fastx::sequence_hash;

    fn sized(seq: &str, size: u64) -> SizedSequence {
        SizedSequence {
            hash: sequence_hash(seq),
            size,
            seq: seq.to_string(),
        }
    }

    #[test]
    fn test_max_control_reads() {
        let reads = max_control_reads(vec![
            vec![sized("AAAA", 3), sized("CCCC", 1)],
            vec![sized("AAAA", 5)],
        ]);
        assert_eq!(reads.get(&sequence_hash("AAAA")), Some(&5));
        assert_eq!(reads.get(&sequence_hash("CCCC")), Some(&1));
    }

    #[test]
    fn test_subtract_controls() {
        let controls = max_control_reads(vec![vec![sized("AAAA", 5), sized("CCCC", 10)]]);
        let kept = subtract_controls(
            vec![sized("AAAA", 12), sized("CCCC", 10), sized("GGGG", 2)],
            &controls,
        );
        assert_eq!(kept, vec![sized("AAAA", 7), sized("GGGG", 2)]);
    }

    #[test]
    fn test_is_negative_control() {
        assert!(is_negative_control("NC_1", "NC_"));
        assert!(!is_negative_control("Lake_NC_1", "NC_"));
        assert!(!is_negative_control("NC_1", ""));
    }
}
