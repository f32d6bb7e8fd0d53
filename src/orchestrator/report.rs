// src/orchestrator/report.rs: stage logfiles and the project report

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use log::debug;
use serde::Serialize;

use crate::orchestrator::layout::ProjectLayout;
use crate::orchestrator::ledger::{Ledger, LedgerEntry};
use crate::orchestrator::sequencer::PipelineRun;
use crate::orchestrator::stage::{SampleFailure, StageResult};


/// Consumer of stage and run results.
pub trait ReportSink: Send + Sync {
    fn stage_completed(&self, result: &StageResult, ledger: &Ledger) -> Result<()>;

    fn run_completed(&self, run: &PipelineRun, ledger: &Ledger) -> Result<()>;
}

/// Discards everything; for callers that only want the returned `PipelineRun`.
pub struct NullReport;

impl ReportSink for NullReport {
    fn stage_completed(&self, _result: &StageResult, _ledger: &Ledger) -> Result<()> {
        Ok(())
    }

    fn run_completed(&self, _run: &PipelineRun, _ledger: &Ledger) -> Result<()> {
        Ok(())
    }
}


#[derive(Serialize)]
struct ProjectReportDocument<'a> {
    run: &'a PipelineRun,
    ledger: Vec<LedgerEntry>,
    anomalies: Vec<LedgerEntry>,
}

/// Writes the report files into the project tree:
/// `<stage>/Logfile_<stage>.tsv`, `read_count_ledger.tsv`, `Project_report.json`.
pub struct ProjectReport {
    layout: ProjectLayout,
    tool_versions: BTreeMap<String, String>,
}

impl ProjectReport {
    pub fn new(layout: ProjectLayout, tool_versions: BTreeMap<String, String>) -> Self {
        ProjectReport { layout, tool_versions }
    }

    fn program_version(&self, tool: &str) -> String {
        match self.tool_versions.get(tool) {
            Some(version) => format!("{} {}", tool, version),
            None => tool.to_string(),
        }
    }

    fn write_stage_log(&self, result: &StageResult, ledger: &Ledger) -> Result<()> {
        let path = self.layout.stage_log(result.stage);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(
            File::create(&path).with_context(|| format!("creating {}", path.display()))?,
        );
        writeln!(writer, "sample\tfinished at\tprogram version\treads in\treads out\tanomaly\tstatus")?;

        let latest = ledger.latest(result.stage);
        let mut rows: Vec<(String, String)> = Vec::new();
        for invocation in &result.results {
            let entry = latest.iter().find(|e| e.sample == invocation.sample);
            let finished = entry
                .map(|e| e.recorded_at.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();
            let version = invocation
                .runs
                .first()
                .map(|r| self.program_version(&r.tool))
                .unwrap_or_default();
            let status = if invocation.partial { "partial" } else { "ok" };
            rows.push((
                invocation.sample.clone(),
                format!(
                    "{}\t{}\t{}\t{}\t{}\t{}\t{}",
                    invocation.sample,
                    finished,
                    version,
                    count_cell(invocation.reads_in),
                    count_cell(invocation.reads_out),
                    entry.map(|e| e.anomaly).unwrap_or(false),
                    status
                ),
            ));
        }
        for failure in result.failures.iter().filter(|f| !f.forwarded) {
            rows.push((failure.sample.clone(), failure_row(failure)));
        }
        rows.sort();
        for (_, row) in rows {
            writeln!(writer, "{}", row)?;
        }
        writer.flush()?;
        debug!("Wrote {}", path.display());
        Ok(())
    }

    fn write_ledger(&self, ledger: &Ledger) -> Result<()> {
        write_ledger_table(&self.layout.ledger_table(), &ledger.entries())
    }
}

fn count_cell(count: Option<u64>) -> String {
    count.map(|c| c.to_string()).unwrap_or_else(|| "NA".to_string())
}

fn failure_row(failure: &SampleFailure) -> String {
    let status = if failure.aborted { "aborted" } else { "failed" };
    format!(
        "{}\t\t\tNA\tNA\tfalse\t{}: {}",
        failure.sample,
        status,
        failure.error.replace(['\t', '\n'], " ")
    )
}

pub fn write_ledger_table(path: &Path, entries: &[LedgerEntry]) -> Result<()> {
    let mut writer = BufWriter::new(
        File::create(path).with_context(|| format!("creating {}", path.display()))?,
    );
    writeln!(writer, "seq\tsample\tstage\treads_in\treads_out\trecorded_at\tanomaly")?;
    for entry in entries {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            entry.seq,
            entry.sample,
            entry.stage,
            count_cell(entry.reads_in),
            count_cell(entry.reads_out),
            entry.recorded_at.to_rfc3339(),
            entry.anomaly
        )?;
    }
    writer.flush()?;
    Ok(())
}

impl ReportSink for ProjectReport {
    fn stage_completed(&self, result: &StageResult, ledger: &Ledger) -> Result<()> {
        self.write_stage_log(result, ledger)?;
        self.write_ledger(ledger)
    }

    fn run_completed(&self, run: &PipelineRun, ledger: &Ledger) -> Result<()> {
        self.write_ledger(ledger)?;
        let document = ProjectReportDocument {
            run,
            ledger: ledger.entries(),
            anomalies: ledger.anomalies(),
        };
        let path = self.layout.project_report();
        let writer = BufWriter::new(
            File::create(&path).with_context(|| format!("creating {}", path.display()))?,
        );
        serde_json::to_writer_pretty(writer, &document)?;
        debug!("Wrote {}", path.display());
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;
    use chrono::Local;
    use crate::config::defs::StageId;
    use crate::orchestrator::sequencer::RunStatus;
    use crate::orchestrator::stage::{InvocationResult, StageAggregate, StageState};

    fn stage_result(ledger: &Ledger) -> StageResult {
        ledger.record("S2", StageId::QualityFiltering, Some(400), Some(0));
        let invocation = InvocationResult {
            sample: "S2".to_string(),
            stage: StageId::QualityFiltering,
            runs: Vec::new(),
            duration: Duration::from_millis(5),
            reads_in: Some(400),
            reads_out: Some(0),
            outputs: vec![PathBuf::from("S2_filtered.fasta.gz")],
            partial: false,
        };
        StageResult {
            stage: StageId::QualityFiltering,
            status: StageState::CompletedWithFailures,
            results: vec![invocation],
            failures: vec![SampleFailure {
                sample: "S1".to_string(),
                error: "vsearch failed (exit code Some(1)):\tboom".to_string(),
                exit_code: Some(1),
                aborted: false,
                forwarded: false,
            }],
            aggregate: StageAggregate {
                samples: 1,
                reads_in: 400,
                reads_out: 0,
                failed: 1,
            },
            duration: Duration::from_millis(9),
            survivors: Vec::new(),
            stage_outputs: Vec::new(),
            stage_error: None,
            aborted: false,
        }
    }

    #[test]
    fn test_stage_log_lists_results_and_failures() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::new(dir.path());
        let report = ProjectReport::new(layout.clone(), BTreeMap::new());
        let ledger = Ledger::new();
        report.stage_completed(&stage_result(&ledger), &ledger).unwrap();

        let log = fs::read_to_string(layout.stage_log(StageId::QualityFiltering)).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("S1\t"));
        assert!(lines[1].contains("failed: vsearch failed"));
        assert!(lines[2].starts_with("S2\t"));
        assert!(lines[2].contains("\t400\t0\ttrue\tok"));

        let table = fs::read_to_string(layout.ledger_table()).unwrap();
        assert_eq!(table.lines().count(), 2);
    }

    #[test]
    fn test_project_report_is_json() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::new(dir.path());
        let report = ProjectReport::new(layout.clone(), BTreeMap::new());
        let ledger = Ledger::new();
        ledger.record("S1", StageId::PeMerging, Some(10), Some(0));
        let run = PipelineRun {
            started_at: Local::now(),
            finished_at: Some(Local::now()),
            stages: Vec::new(),
            status: RunStatus::CompletedOk,
            tool_versions: BTreeMap::new(),
        };
        report.run_completed(&run, &ledger).unwrap();

        let text = fs::read_to_string(layout.project_report()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["run"]["status"], "CompletedOk");
        assert_eq!(value["anomalies"].as_array().unwrap().len(), 1);
        assert_eq!(value["ledger"][0]["stage"], "pe_merging");
    }
}
