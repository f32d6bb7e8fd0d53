// src/pipelines/external.rs: shared plumbing for stages that shell out

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use log::info;
use tokio::task;

use crate::config::defs::PipelineError;
use crate::orchestrator::stage::{StageContext, StageSpec, UnitReport, WorkUnit};
use crate::utils::fastx::{
    all_empty, collapse_by_hash, read_sized_fasta, sort_by_abundance, write_sized_fasta, SizedSequence,
};
use crate::utils::file::{commit_compressed, commit_file, write_empty_gz};
use crate::utils::invoker::ToolRun;


/// Where one unit's files live during and after the stage.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitPaths {
    /// Committed, compressed output in `<stage>/data`.
    pub dest: PathBuf,
    /// Uncompressed output in `<stage>/temp`, renamed into place on success.
    pub staged: PathBuf,
    pub log: PathBuf,
}

impl UnitPaths {
    pub fn new(ctx: &StageContext, spec: &StageSpec, unit: &str) -> Self {
        let name = spec.output_name(unit);
        UnitPaths {
            dest: ctx.layout.data_path(spec.id, &name),
            staged: ctx.layout.staged_path(spec.id, &name),
            log: ctx.layout.scratch_path(spec.id, unit, &format!("{}.log", spec.tool)),
        }
    }
}


pub(crate) async fn blocking<T, F>(work: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
{
    task::spawn_blocking(work)
        .await
        .map_err(|e| PipelineError::Other(anyhow!("blocking task failed: {}", e)))?
        .map_err(PipelineError::from)
}

/// Units whose inputs hold no records skip the tool: an empty gzip output is
/// committed and the unit reports zero reads in and out.
pub async fn empty_input_shortcut(
    ctx: &StageContext,
    spec: &StageSpec,
    unit: &WorkUnit,
) -> Result<Option<UnitReport>, PipelineError> {
    let inputs = unit.inputs();
    for input in &inputs {
        if !input.exists() {
            return Err(PipelineError::ToolFailure {
                tool: spec.tool.to_string(),
                exit_code: None,
                stderr_tail: format!("missing input {}", input.display()),
            });
        }
    }
    if !blocking(move || all_empty(&inputs)).await? {
        return Ok(None);
    }

    let paths = UnitPaths::new(ctx, spec, &unit.id);
    let level = ctx.compression_level();
    let mut staged_gz = paths.staged.clone().into_os_string();
    staged_gz.push(".empty.gz");
    let staged_gz = PathBuf::from(staged_gz);
    let dest = paths.dest.clone();
    blocking(move || {
        write_empty_gz(&staged_gz, level)?;
        commit_file(&staged_gz, &dest)
    })
    .await?;

    info!("{}: {}: input holds no reads; wrote empty output", spec.id, unit.id);
    Ok(Some(UnitReport {
        runs: Vec::new(),
        reads_in: Some(0),
        reads_out: Some(0),
        outputs: vec![paths.dest],
    }))
}

/// Compresses the staged output at the configured level and renames it into `data`.
pub async fn commit_output(ctx: &StageContext, paths: &UnitPaths) -> Result<(), PipelineError> {
    let staged = paths.staged.clone();
    let dest = paths.dest.clone();
    let level = ctx.compression_level();
    blocking(move || commit_compressed(&staged, &dest, level)).await
}

/// Writes sequences as `>hash;size=N`, identical sequences folded together
/// and ordered by abundance. Returns the number of records written.
pub fn write_by_hash(sequences: Vec<SizedSequence>, staged: &Path) -> io::Result<u64> {
    let mut sequences: Vec<SizedSequence> = collapse_by_hash(sequences).into_values().collect();
    sort_by_abundance(&mut sequences);
    let mut writer = BufWriter::new(File::create(staged)?);
    write_sized_fasta(&mut writer, &sequences)?;
    writer.flush()?;
    Ok(sequences.len() as u64)
}

/// Relabels a tool's sized FASTA by sequence hash into `staged`, then drops `source`.
pub fn rewrite_by_hash(source: &Path, staged: &Path) -> io::Result<u64> {
    let written = write_by_hash(read_sized_fasta(source)?, staged)?;
    std::fs::remove_file(source)?;
    Ok(written)
}

/// Reads in from the first run, reads out from the last.
pub fn combine_counts(runs: &[ToolRun]) -> (Option<u64>, Option<u64>) {
    let reads_in = runs.first().and_then(|r| r.counts.reads_in);
    let reads_out = runs.last().and_then(|r| r.counts.reads_out);
    (reads_in, reads_out)
}

/// Finishes a single-output unit: commit, then report the runs' counts.
pub async fn finish_unit(
    ctx: &StageContext,
    paths: UnitPaths,
    runs: Vec<ToolRun>,
) -> Result<UnitReport, PipelineError> {
    commit_output(ctx, &paths).await?;
    let _ = std::fs::remove_file(&paths.log);
    let (reads_in, reads_out) = combine_counts(&runs);
    Ok(UnitReport {
        runs,
        reads_in,
        reads_out,
        outputs: vec![paths.dest],
    })
}
