// src/orchestrator/ledger.rs: append-only read-count ledger

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Local};
use log::warn;
use serde::Serialize;

use crate::config::defs::StageId;


/// One (sample, stage) completion. Never modified after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub seq: u64,
    pub sample: String,
    pub stage: StageId,
    pub reads_in: Option<u64>,
    pub reads_out: Option<u64>,
    pub recorded_at: DateTime<Local>,
    /// Reads went in and none came out.
    pub anomaly: bool,
}

/// Per-stage totals over the latest entry of each sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageSummary {
    pub samples: usize,
    pub reads_in: u64,
    pub reads_out: u64,
    /// Samples whose reads in or out could not be read.
    pub unknown_counts: usize,
    pub anomalies: Vec<String>,
}

impl StageSummary {
    /// Fraction of reads lost in the stage, when reads went in.
    pub fn attrition(&self) -> Option<f64> {
        if self.reads_in == 0 {
            return None;
        }
        Some(1.0 - self.reads_out as f64 / self.reads_in as f64)
    }
}


#[derive(Debug, Default)]
pub struct Ledger {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl Ledger {
    pub fn new() -> Self {
        Ledger::default()
    }

    /// Appends one entry; concurrent appends serialize on the lock.
    pub fn record(
        &self,
        sample: &str,
        stage: StageId,
        reads_in: Option<u64>,
        reads_out: Option<u64>,
    ) -> LedgerEntry {
        let anomaly = matches!((reads_in, reads_out), (Some(i), Some(0)) if i > 0);
        if anomaly {
            warn!("{}: {}: {} reads in, none survived", stage, sample, reads_in.unwrap_or(0));
        }
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let entry = LedgerEntry {
            seq: entries.len() as u64,
            sample: sample.to_string(),
            stage,
            reads_in,
            reads_out,
            recorded_at: Local::now(),
            anomaly,
        };
        entries.push(entry.clone());
        entry
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries for one stage, latest per sample, sorted by sample.
    pub fn latest(&self, stage: StageId) -> Vec<LedgerEntry> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let mut latest: BTreeMap<&str, &LedgerEntry> = BTreeMap::new();
        for entry in entries.iter().filter(|e| e.stage == stage) {
            latest.insert(entry.sample.as_str(), entry);
        }
        latest.into_values().cloned().collect()
    }

    /// Aggregate over the latest entry of each sample; re-runs supersede but
    /// do not erase earlier entries.
    pub fn summary(&self, stage: StageId) -> StageSummary {
        let mut summary = StageSummary::default();
        for entry in self.latest(stage) {
            summary.samples += 1;
            summary.reads_in += entry.reads_in.unwrap_or(0);
            summary.reads_out += entry.reads_out.unwrap_or(0);
            if entry.reads_in.is_none() || entry.reads_out.is_none() {
                summary.unknown_counts += 1;
            }
            if entry.anomaly {
                summary.anomalies.push(entry.sample.clone());
            }
        }
        summary
    }

    /// Every entry of a sample in the order it was recorded.
    pub fn history(&self, sample: &str) -> Vec<LedgerEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| e.sample == sample)
            .cloned()
            .collect()
    }

    pub fn anomalies(&self) -> Vec<LedgerEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| e.anomaly)
            .cloned()
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_anomaly_flag() {
        let ledger = Ledger::new();
        assert!(ledger.record("S1", StageId::QualityFiltering, Some(500), Some(0)).anomaly);
        assert!(!ledger.record("S2", StageId::QualityFiltering, Some(0), Some(0)).anomaly);
        assert!(!ledger.record("S3", StageId::QualityFiltering, None, Some(0)).anomaly);
        let summary = ledger.summary(StageId::QualityFiltering);
        assert_eq!(summary.anomalies, vec!["S1".to_string()]);
        assert_eq!(summary.unknown_counts, 1);
    }

    #[test]
    fn test_rerun_appends_and_summary_uses_latest() {
        let ledger = Ledger::new();
        ledger.record("S1", StageId::PeMerging, Some(100), Some(90));
        ledger.record("S2", StageId::PeMerging, Some(50), Some(40));
        ledger.record("S1", StageId::PeMerging, Some(100), Some(95));
        ledger.record("S1", StageId::PrimerTrimming, Some(95), Some(80));

        let history = ledger.history("S1");
        assert_eq!(history.len(), 3);
        assert!(history.windows(2).all(|w| w[0].seq < w[1].seq));
        assert_eq!(history[0].reads_out, Some(90));

        let summary = ledger.summary(StageId::PeMerging);
        assert_eq!(summary.samples, 2);
        assert_eq!(summary.reads_in, 150);
        assert_eq!(summary.reads_out, 135);
        assert!((summary.attrition().unwrap() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_concurrent_appends_are_not_lost() {
        let ledger = Arc::new(Ledger::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        ledger.record(&format!("S{}_{}", t, i), StageId::Dereplication, Some(2), Some(1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let entries = ledger.entries();
        assert_eq!(entries.len(), 800);
        let mut seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        seqs.dedup();
        assert_eq!(seqs.len(), 800);
        assert_eq!(ledger.summary(StageId::Dereplication).reads_out, 800);
    }
}
