// src/utils/counts.rs: read-count extraction from tool logs and reports

use std::fs;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::config::defs::{PipelineError, CUTADAPT_TAG, VSEARCH_TAG};
use crate::utils::fastx::{read_sized_fasta, record_counter, total_size};

lazy_static! {
    static ref MERGE_PAIRS_IN: Regex = Regex::new(r"(\d+)\s+Pairs").unwrap();
    static ref MERGE_PAIRS_OUT: Regex = Regex::new(r"(\d+)\s+Merged").unwrap();
    static ref FILTER_KEPT: Regex = Regex::new(r"(\d+) sequences kept").unwrap();
    static ref FILTER_DISCARDED: Regex = Regex::new(r"(\d+) sequences discarded").unwrap();
    static ref UNIQUES_IN: Regex = Regex::new(r"(\d+) seqs").unwrap();
    static ref UNIQUES_OUT: Regex = Regex::new(r"(\d+) unique sequences").unwrap();
    static ref CLUSTER_IN: Regex = Regex::new(r"(\d+) seqs, min").unwrap();
    static ref CLUSTER_OUT: Regex = Regex::new(r"Clusters: (\d+)").unwrap();
    static ref UNOISE_DISCARDED: Regex = Regex::new(r"(\d+) sequences discarded\.").unwrap();
}


/// Reads entering and leaving one tool run. `None` is an unknown count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ReadCounts {
    pub reads_in: Option<u64>,
    pub reads_out: Option<u64>,
}

impl ReadCounts {
    pub fn known(reads_in: u64, reads_out: u64) -> Self {
        ReadCounts {
            reads_in: Some(reads_in),
            reads_out: Some(reads_out),
        }
    }

    pub fn unknown() -> Self {
        ReadCounts::default()
    }
}


/// Where a stage's tool reports how many reads it saw and kept.
#[derive(Debug, Clone, PartialEq)]
pub enum CountRule {
    /// vsearch `--fastq_mergepairs` log: `N  Pairs`, `M  Merged`.
    MergePairs { log: PathBuf },
    /// vsearch `--fastq_filter` log: kept plus discarded in, kept out.
    FastqFilter { log: PathBuf },
    /// vsearch `--fastx_uniques` log: `N seqs`, `M unique sequences`.
    Uniques { log: PathBuf },
    /// vsearch `--cluster_size` log: `N seqs, min`, `Clusters: M`.
    Clusters { log: PathBuf },
    /// vsearch `--cluster_unoise` log. `--minsize` drops sequences before the
    /// `N seqs, min` line, so reads in adds `K sequences discarded.` when present.
    Unoise { log: PathBuf },
    /// cutadapt `--report=minimal` table on stdout.
    CutadaptMinimal,
    /// Record counts of an input and an output file.
    Records { input: PathBuf, output: PathBuf },
    /// Sums of `;size=N` annotations of an input and an output FASTA.
    SizeAnnotations { input: PathBuf, output: PathBuf },
    Unaccounted,
}

impl CountRule {
    fn tool(&self) -> &'static str {
        match self {
            CountRule::CutadaptMinimal => CUTADAPT_TAG,
            _ => VSEARCH_TAG,
        }
    }

    /// Applies the rule once the tool has exited successfully.
    ///
    /// # Arguments
    ///
    /// * `stdout` - Captured stdout of the run (empty when redirected to a file).
    ///
    /// # Returns
    /// ReadCounts, or `ReportParseError` when the report is unreadable.
    pub fn extract(&self, stdout: &str) -> Result<ReadCounts, PipelineError> {
        match self {
            CountRule::MergePairs { log } => {
                let text = self.read_log(log)?;
                Ok(ReadCounts::known(
                    self.capture(&MERGE_PAIRS_IN, &text)?,
                    self.capture(&MERGE_PAIRS_OUT, &text)?,
                ))
            }
            CountRule::FastqFilter { log } => {
                let text = self.read_log(log)?;
                let kept = self.capture(&FILTER_KEPT, &text)?;
                let discarded = self.capture(&FILTER_DISCARDED, &text)?;
                Ok(ReadCounts::known(kept + discarded, kept))
            }
            CountRule::Uniques { log } => {
                let text = self.read_log(log)?;
                Ok(ReadCounts::known(
                    self.capture(&UNIQUES_IN, &text)?,
                    self.capture(&UNIQUES_OUT, &text)?,
                ))
            }
            CountRule::Clusters { log } => {
                let text = self.read_log(log)?;
                Ok(ReadCounts::known(
                    self.capture(&CLUSTER_IN, &text)?,
                    self.capture(&CLUSTER_OUT, &text)?,
                ))
            }
            CountRule::Unoise { log } => {
                let text = self.read_log(log)?;
                let kept = self.capture(&CLUSTER_IN, &text)?;
                let discarded = if UNOISE_DISCARDED.is_match(&text) {
                    self.capture(&UNOISE_DISCARDED, &text)?
                } else {
                    0
                };
                Ok(ReadCounts::known(
                    kept + discarded,
                    self.capture(&CLUSTER_OUT, &text)?,
                ))
            }
            CountRule::CutadaptMinimal => parse_cutadapt_minimal(stdout),
            CountRule::Records { input, output } => Ok(ReadCounts::known(
                self.records(input)?,
                self.records(output)?,
            )),
            CountRule::SizeAnnotations { input, output } => Ok(ReadCounts::known(
                self.abundance(input)?,
                self.abundance(output)?,
            )),
            CountRule::Unaccounted => Ok(ReadCounts::unknown()),
        }
    }

    fn records(&self, path: &Path) -> Result<u64, PipelineError> {
        record_counter(path).map_err(|e| self.parse_error(format!("{}: {}", path.display(), e)))
    }

    fn abundance(&self, path: &Path) -> Result<u64, PipelineError> {
        read_sized_fasta(path)
            .map(|sequences| total_size(&sequences))
            .map_err(|e| self.parse_error(format!("{}: {}", path.display(), e)))
    }

    fn read_log(&self, log: &Path) -> Result<String, PipelineError> {
        fs::read_to_string(log)
            .map_err(|e| self.parse_error(format!("cannot read log {}: {}", log.display(), e)))
    }

    fn capture(&self, pattern: &Regex, text: &str) -> Result<u64, PipelineError> {
        pattern
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .ok_or_else(|| self.parse_error(format!("no match for '{}'", pattern.as_str())))
    }

    fn parse_error(&self, reason: String) -> PipelineError {
        PipelineError::ReportParseError {
            tool: self.tool().to_string(),
            reason,
        }
    }
}


/// Reads `in_reads` and `out_reads` from cutadapt's minimal report, a header
/// line followed by one tab-separated value line.
fn parse_cutadapt_minimal(stdout: &str) -> Result<ReadCounts, PipelineError> {
    let parse_error = |reason: &str| PipelineError::ReportParseError {
        tool: CUTADAPT_TAG.to_string(),
        reason: reason.to_string(),
    };

    let mut lines = stdout.lines().filter(|l| !l.trim().is_empty());
    let header: Vec<&str> = lines
        .by_ref()
        .find(|l| l.contains("in_reads"))
        .ok_or_else(|| parse_error("no report header"))?
        .split('\t')
        .collect();
    let values: Vec<&str> = lines
        .next()
        .ok_or_else(|| parse_error("no report values"))?
        .split('\t')
        .collect();

    let column = |name: &str| -> Result<u64, PipelineError> {
        let index = header
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| parse_error(&format!("missing column {}", name)))?;
        values
            .get(index)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| parse_error(&format!("unreadable value for {}", name)))
    };

    Ok(ReadCounts::known(column("in_reads")?, column("out_reads")?))
}


#[cfg(test)]
mod tests {
    use super::*;

    fn write_log(dir: &Path, text: &str) -> PathBuf {
        let log = dir.join("run.log");
        fs::write(&log, text).unwrap();
        log
    }

    #[test]
    fn test_merge_pairs_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = write_log(
            dir.path(),
            "Merging reads 100%\n     10000  Pairs\n      9500  Merged (95.0%)\n       500  Not merged (5.0%)\n",
        );
        let counts = CountRule::MergePairs { log }.extract("").unwrap();
        assert_eq!(counts, ReadCounts::known(10000, 9500));
    }

    #[test]
    fn test_fastq_filter_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = write_log(
            dir.path(),
            "812 sequences kept (of which 0 truncated), 188 sequences discarded.\n",
        );
        let counts = CountRule::FastqFilter { log }.extract("").unwrap();
        assert_eq!(counts, ReadCounts::known(1000, 812));
    }

    #[test]
    fn test_uniques_and_cluster_logs() {
        let dir = tempfile::tempdir().unwrap();
        let log = write_log(
            dir.path(),
            "181240 nt in 812 seqs, min 200, max 220, avg 223\n97 unique sequences, avg cluster 8.4\n",
        );
        let counts = CountRule::Uniques { log: log.clone() }.extract("").unwrap();
        assert_eq!(counts, ReadCounts::known(812, 97));

        fs::write(&log, "21700 nt in 97 seqs, min 220, max 224, avg 224\nClusters: 12 Size min 8, max 400\n").unwrap();
        let counts = CountRule::Clusters { log }.extract("").unwrap();
        assert_eq!(counts, ReadCounts::known(97, 12));
    }

    #[test]
    fn test_unoise_log_adds_minsize_discards() {
        let dir = tempfile::tempdir().unwrap();
        let log = write_log(
            dir.path(),
            "672 nt in 3 seqs, min 224, max 224, avg 224\n97 sequences discarded.\nClusters: 2 Size min 9, max 40\n",
        );
        let counts = CountRule::Unoise { log: log.clone() }.extract("").unwrap();
        assert_eq!(counts, ReadCounts::known(100, 2));

        fs::write(&log, "672 nt in 3 seqs, min 224, max 224, avg 224\nClusters: 2 Size min 9, max 40\n").unwrap();
        let counts = CountRule::Unoise { log }.extract("").unwrap();
        assert_eq!(counts, ReadCounts::known(3, 2));
    }

    #[test]
    fn test_cutadapt_minimal_report() {
        let stdout = "status\tin_reads\tin_bp\ttoo_short\ttoo_long\ttoo_many_n\tout_reads\tw/adapters\tqualtrim_bp\tout_bp\n\
                      OK\t9500\t2850000\t0\t0\t0\t9100\t9100\t0\t2002000\n";
        let counts = CountRule::CutadaptMinimal.extract(stdout).unwrap();
        assert_eq!(counts, ReadCounts::known(9500, 9100));
    }

    #[test]
    fn test_record_and_size_rules() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.fasta");
        let output = dir.path().join("out.fasta");
        fs::write(&input, ">a;size=40\nACGT\n>b;size=2\nTTGA\n>c\nGGGG\n").unwrap();
        fs::write(&output, ">a;size=40\nACGT\n").unwrap();

        let records = CountRule::Records { input: input.clone(), output: output.clone() };
        assert_eq!(records.extract("").unwrap(), ReadCounts::known(3, 1));
        let sizes = CountRule::SizeAnnotations { input, output };
        assert_eq!(sizes.extract("").unwrap(), ReadCounts::known(43, 40));
    }

    #[test]
    fn test_unreadable_log_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = write_log(dir.path(), "vsearch crashed politely\n");
        let err = CountRule::MergePairs { log }.extract("").unwrap_err();
        assert!(matches!(err, PipelineError::ReportParseError { .. }));
        assert!(!err.is_fatal());

        let missing = CountRule::Uniques { log: dir.path().join("absent.log") };
        assert!(matches!(missing.extract(""), Err(PipelineError::ReportParseError { .. })));
        assert!(CountRule::CutadaptMinimal.extract("").is_err());
    }
}
