use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use clap::ValueEnum;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use log::LevelFilter;
use std::collections::HashMap;
use thiserror::Error;

use crate::config::resolve::Configuration;

// External software
pub const GZIP_EXT: &str = "gz";
pub const VSEARCH_TAG: &str = "vsearch";
pub const CUTADAPT_TAG: &str = "cutadapt";
pub const INTERNAL_TAG: &str = "metabar";


lazy_static! {
    /// Oldest releases known to understand every flag we pass.
    pub static ref TOOL_VERSIONS: HashMap<&'static str, (u32, u32)> = {
        let mut m = HashMap::new();
        m.insert(VSEARCH_TAG, (2, 21));
        m.insert(CUTADAPT_TAG, (3, 5));
        m
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VsearchSubcommand {
    MergePairs,
    FastqFilter,
    Uniques,
    ClusterUnoise,
    UchimeDenovo,
    ClusterSize,
}

impl VsearchSubcommand {
    pub fn flag(&self) -> &'static str {
        match self {
            VsearchSubcommand::MergePairs => "--fastq_mergepairs",
            VsearchSubcommand::FastqFilter => "--fastq_filter",
            VsearchSubcommand::Uniques => "--fastx_uniques",
            VsearchSubcommand::ClusterUnoise => "--cluster_unoise",
            VsearchSubcommand::UchimeDenovo => "--uchime_denovo",
            VsearchSubcommand::ClusterSize => "--cluster_size",
        }
    }
}

/// Every stage of the fixed metabarcoding graph, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    PeMerging,
    PrimerTrimming,
    QualityFiltering,
    Dereplication,
    Denoising,
    Clustering,
    ReplicateMerging,
    NcRemoval,
    ReadTable,
}

impl StageId {
    pub const ALL: [StageId; 9] = [
        StageId::PeMerging,
        StageId::PrimerTrimming,
        StageId::QualityFiltering,
        StageId::Dereplication,
        StageId::Denoising,
        StageId::Clustering,
        StageId::ReplicateMerging,
        StageId::NcRemoval,
        StageId::ReadTable,
    ];

    /// Numbered project directory holding the stage's `data` folder.
    pub fn dir_name(&self) -> &'static str {
        match self {
            StageId::PeMerging => "03_PE_merging",
            StageId::PrimerTrimming => "04_primer_trimming",
            StageId::QualityFiltering => "05_quality_filtering",
            StageId::Dereplication => "06_dereplication",
            StageId::Denoising => "07_denoising",
            StageId::Clustering => "08_clustering",
            StageId::ReplicateMerging => "09_replicate_merging",
            StageId::NcRemoval => "10_nc_removal",
            StageId::ReadTable => "11_read_table",
        }
    }

    /// Section name in the settings file.
    pub fn section(&self) -> &'static str {
        match self {
            StageId::PeMerging => "pe_merging",
            StageId::PrimerTrimming => "primer_trimming",
            StageId::QualityFiltering => "quality_filtering",
            StageId::Dereplication => "dereplication",
            StageId::Denoising => "denoising",
            StageId::Clustering => "clustering",
            StageId::ReplicateMerging => "replicate_merging",
            StageId::NcRemoval => "nc_removal",
            StageId::ReadTable => "read_table",
        }
    }

    pub fn ordinal(&self) -> usize {
        StageId::ALL.iter().position(|s| s == self).unwrap_or(0)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

pub const DEMULTIPLEXED_DIR: &str = "02_demultiplexing";

// Static Filenames
pub const SETTINGS_FILE: &str = "Settings.json";
pub const PROJECT_REPORT_JSON: &str = "Project_report.json";
pub const LEDGER_TSV: &str = "read_count_ledger.tsv";
pub const DATA_DIR: &str = "data";
pub const TEMP_DIR: &str = "temp";

// Static Parameters
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;
pub const RESERVED_CORES: usize = 2;
pub const STDERR_TAIL_LINES: usize = 20;
pub const VSEARCH_QMAX: u32 = 64;
pub const SIZE_ANNOTATION: &str = ";size=";

pub const FASTA_TAG : &str = "fasta";
pub const FASTQ_TAG : &str = "fastq";
pub const FASTA_EXTS: &[&'static str] = &["fasta", "fa", "fna", "faa", "ffn", "frn"];
pub const FASTQ_EXTS: &[&'static str] = &["fastq", "fq"];


#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid setting '{section}.{key}': {reason}")]
    ConfigError {
        section: String,
        key: String,
        reason: String,
    },

    #[error("Requested {requested} cores but only {available} are available")]
    ResourceExhaustion { requested: u64, available: usize },

    #[error("{tool} failed (exit code {exit_code:?}): {stderr_tail}")]
    ToolFailure {
        tool: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("Unreadable read counts from {tool}: {reason}")]
    ReportParseError { tool: String, reason: String },

    #[error("Abort requested")]
    AbortRequested,

    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Invalid transition for stage {stage}: {from} -> {to}")]
    InvalidTransition {
        stage: String,
        from: String,
        to: String,
    },

    #[error("IO error: {0}")]
    IOError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn config(section: &str, key: &str, reason: impl Into<String>) -> Self {
        PipelineError::ConfigError {
            section: section.to_string(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Only these classes stop a run before any stage starts.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::ConfigError { .. } | PipelineError::ResourceExhaustion { .. }
        )
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}


/// Run-wide settings assembled in `main`.
pub struct RunConfig {
    pub cwd: PathBuf,
    pub project: PathBuf,
    pub configuration: Arc<Configuration>,
    pub machine_cores: usize,
    pub log_level: LevelFilter,
}
