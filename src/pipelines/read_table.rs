// src/pipelines/read_table.rs: sequence x sample read table across the project

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use fxhash::FxHashMap as HashMap;
use log::info;
use ndarray::{Array2, Axis};

use crate::config::defs::{PipelineError, StageId, INTERNAL_TAG};
use crate::orchestrator::stage::{
    InvocationResult, Sample, StageContext, StageSpec, StageTask, UnitReport, WorkUnit,
};
use crate::pipelines::external::blocking;
use crate::utils::counts::ReadCounts;
use crate::utils::fastx::{collapse_by_hash, read_sized_fasta, write_fasta_record, SizedSequence};
use crate::utils::file::commit_file;


pub fn spec() -> StageSpec {
    StageSpec {
        id: StageId::ReadTable,
        predecessors: vec![StageId::NcRemoval],
        tool: INTERNAL_TAG,
        cost: 1,
        output_suffix: "_read_table.tsv",
    }
}

type SampleReads = BTreeMap<String, Vec<SizedSequence>>;

/// Collects every sample's sequences during the stage and writes one table in `finalize`.
pub struct ReadTable {
    spec: StageSpec,
    collected: Arc<Mutex<SampleReads>>,
}

impl ReadTable {
    pub fn new() -> Self {
        ReadTable {
            spec: spec(),
            collected: Arc::new(Mutex::new(SampleReads::new())),
        }
    }
}

fn poisoned<T>(_: T) -> PipelineError {
    PipelineError::Other(anyhow!("read table state poisoned"))
}


/// Reads per sequence (rows) and sample (columns), rows ordered by total
/// abundance, then hash.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceTable {
    pub samples: Vec<String>,
    pub hashes: Vec<String>,
    pub sequences: Vec<String>,
    pub counts: Array2<u64>,
}

impl SequenceTable {
    pub fn build(reads: &SampleReads) -> Self {
        let samples: Vec<String> = reads.keys().cloned().collect();
        let mut rows: HashMap<String, usize> = HashMap::default();
        let mut hashes = Vec::new();
        let mut sequences = Vec::new();
        for sequence in reads.values().flatten() {
            if !rows.contains_key(&sequence.hash) {
                rows.insert(sequence.hash.clone(), hashes.len());
                hashes.push(sequence.hash.clone());
                sequences.push(sequence.seq.clone());
            }
        }

        let mut counts = Array2::<u64>::zeros((hashes.len(), samples.len()));
        for (column, sequences_in_sample) in reads.values().enumerate() {
            for sequence in sequences_in_sample {
                if let Some(&row) = rows.get(&sequence.hash) {
                    counts[[row, column]] += sequence.size;
                }
            }
        }

        let totals = counts.sum_axis(Axis(1));
        let mut order: Vec<usize> = (0..hashes.len()).collect();
        order.sort_by(|&a, &b| totals[b].cmp(&totals[a]).then_with(|| hashes[a].cmp(&hashes[b])));

        SequenceTable {
            samples,
            hashes: order.iter().map(|&i| hashes[i].clone()).collect(),
            sequences: order.iter().map(|&i| sequences[i].clone()).collect(),
            counts: counts.select(Axis(0), &order),
        }
    }

    pub fn totals(&self) -> Vec<u64> {
        self.counts.sum_axis(Axis(1)).to_vec()
    }

    pub fn row_id(prefix: &str, row: usize) -> String {
        format!("{}_{}", prefix, row + 1)
    }

    pub fn write_tsv(&self, path: &Path, prefix: &str) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        write!(writer, "ID\thash\tseq")?;
        for sample in &self.samples {
            write!(writer, "\t{}", sample)?;
        }
        writeln!(writer)?;
        for (row, counts) in self.counts.outer_iter().enumerate() {
            write!(writer, "{}\t{}\t{}", Self::row_id(prefix, row), self.hashes[row], self.sequences[row])?;
            for count in counts.iter() {
                write!(writer, "\t{}", count)?;
            }
            writeln!(writer)?;
        }
        writer.flush()
    }

    pub fn write_fasta(&self, path: &Path, prefix: &str) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        for (row, seq) in self.sequences.iter().enumerate() {
            write_fasta_record(&mut writer, &Self::row_id(prefix, row), None, seq.as_bytes())?;
        }
        writer.flush()
    }
}


#[async_trait]
impl StageTask for ReadTable {
    fn spec(&self) -> &StageSpec {
        &self.spec
    }

    async fn prepare(&self, _ctx: &StageContext, _samples: &[Sample]) -> Result<(), PipelineError> {
        self.collected.lock().map_err(poisoned)?.clear();
        Ok(())
    }

    async fn process(&self, ctx: Arc<StageContext>, unit: WorkUnit) -> Result<UnitReport, PipelineError> {
        let inputs = unit.inputs();
        for input in &inputs {
            if !input.exists() {
                return Err(PipelineError::MissingInput(input.display().to_string()));
            }
        }
        let collected = Arc::clone(&self.collected);
        let files = inputs.clone();
        let sample = unit.id.clone();
        let run = ctx
            .invoker
            .invoke_internal(self.spec.cost, move || {
                let mut sequences = Vec::new();
                for file in &files {
                    sequences.extend(read_sized_fasta(file)?);
                }
                let records = sequences.len() as u64;
                let sequences: Vec<SizedSequence> = collapse_by_hash(sequences).into_values().collect();
                collected.lock().map_err(poisoned)?.insert(sample, sequences);
                Ok(ReadCounts::known(records, records))
            })
            .await?;

        Ok(UnitReport {
            reads_in: run.counts.reads_in,
            reads_out: run.counts.reads_out,
            runs: vec![run],
            outputs: inputs,
        })
    }

    async fn finalize(
        &self,
        ctx: &StageContext,
        results: &[InvocationResult],
    ) -> Result<Vec<PathBuf>, PipelineError> {
        let prefix = ctx
            .config
            .read_table()
            .map(|o| o.id_prefix.clone())
            .ok_or_else(|| PipelineError::config(StageId::ReadTable.section(), "*", "options not resolved"))?;

        let reads: SampleReads = {
            let collected = self.collected.lock().map_err(poisoned)?;
            results
                .iter()
                .filter_map(|r| collected.get(&r.sample).map(|s| (r.sample.clone(), s.clone())))
                .collect()
        };

        let project = ctx.layout.name();
        let tsv_name = self.spec.output_name(&project);
        let fasta_name = format!("{}_{}s.fasta", project, prefix);
        let staged_tsv = ctx.layout.staged_path(self.spec.id, &tsv_name);
        let staged_fasta = ctx.layout.staged_path(self.spec.id, &fasta_name);
        let tsv = ctx.layout.data_path(self.spec.id, &tsv_name);
        let fasta = ctx.layout.data_path(self.spec.id, &fasta_name);

        let outputs = vec![tsv.clone(), fasta.clone()];
        let rows = blocking(move || {
            let table = SequenceTable::build(&reads);
            table.write_tsv(&staged_tsv, &prefix)?;
            table.write_fasta(&staged_fasta, &prefix)?;
            commit_file(&staged_tsv, &tsv)?;
            commit_file(&staged_fasta, &fasta)?;
            Ok(table.hashes.len())
        })
        .await?;

        info!("{}: read table holds {} sequences over {} samples", self.spec.id, rows, results.len());
        Ok(outputs)
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

    fn reads() -> SampleReads {
        let mut reads = SampleReads::new();
        reads.insert("S1".to_string(), vec![sized("AAAA", 2), sized("CCCC", 30)]);
        reads.insert("S2".to_string(), vec![sized("AAAA", 5), sized("GGGG", 1)]);
        reads
    }

    #[test]
    fn test_build_orders_by_total() {
        let table = SequenceTable::build(&reads());
        assert_eq!(table.samples, vec!["S1", "S2"]);
        assert_eq!(table.sequences, vec!["CCCC", "AAAA", "GGGG"]);
        assert_eq!(table.totals(), vec![30, 7, 1]);
        assert_eq!(table.counts[[1, 0]], 2);
        assert_eq!(table.counts[[1, 1]], 5);
        assert_eq!(table.counts[[0, 1]], 0);
    }

    #[test]
    fn test_write_tsv_and_fasta() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = SequenceTable::build(&reads());
        let tsv = dir.path().join("t.tsv");
        let fasta = dir.path().join("t.fasta");
        table.write_tsv(&tsv, "ESV")?;
        table.write_fasta(&fasta, "ESV")?;

        let text = std::fs::read_to_string(&tsv)?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ID\thash\tseq\tS1\tS2");
        assert!(lines[1].starts_with("ESV_1\t"));
        assert!(lines[1].ends_with("\tCCCC\t30\t0"));
        assert_eq!(std::fs::read_to_string(&fasta)?.lines().next(), Some(">ESV_1"));
        Ok(())
    }

    #[test]
    fn test_empty_table() {
        let table = SequenceTable::build(&SampleReads::new());
        assert!(table.hashes.is_empty());
        assert_eq!(table.counts.dim(), (0, 0));
    }
}
