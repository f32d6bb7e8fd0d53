// src/config/resolve.rs: validated, immutable run configuration

use std::collections::BTreeMap;

use log::{debug, warn};
use serde::Serialize;

use crate::config::defs::{PipelineError, StageId, DEFAULT_COMPRESSION_LEVEL, RESERVED_CORES};
use crate::config::settings::{RawSettings, Section, GENERAL_SECTION, PIPELINE_SECTION};
use crate::utils::fastx::is_iupac_sequence;


#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeMergingOptions {
    pub maxdiffpct: u64,
    pub maxdiffs: u64,
    pub minovlen: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrimerTrimmingOptions {
    pub p5_primer: String,
    pub p7_primer: String,
    pub anchoring: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityFilteringOptions {
    pub max_ee: f64,
    pub min_length: u64,
    pub max_length: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DereplicationOptions {
    pub minimum_sequence_abundance: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DenoisingOptions {
    pub alpha: f64,
    pub minsize: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusteringOptions {
    pub perform: bool,
    pub pct_id: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicateMergingOptions {
    pub perform: bool,
    pub replicate_delimiter: String,
    pub minimum_replicate_presence: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NcRemovalOptions {
    pub perform: bool,
    pub negative_control_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadTableOptions {
    pub id_prefix: String,
}

/// Per-stage options, checked once at resolve time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageOptions {
    PeMerging(PeMergingOptions),
    PrimerTrimming(PrimerTrimmingOptions),
    QualityFiltering(QualityFilteringOptions),
    Dereplication(DereplicationOptions),
    Denoising(DenoisingOptions),
    Clustering(ClusteringOptions),
    ReplicateMerging(ReplicateMergingOptions),
    NcRemoval(NcRemovalOptions),
    ReadTable(ReadTableOptions),
}

impl StageOptions {
    /// Optional stages carry a `perform` switch; everything else always runs.
    pub fn enabled(&self) -> bool {
        match self {
            StageOptions::Clustering(o) => o.perform,
            StageOptions::ReplicateMerging(o) => o.perform,
            StageOptions::NcRemoval(o) => o.perform,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelinePolicy {
    /// Stop scheduling further stages once a stage ends with failures.
    pub halt_on_failure: bool,
    /// Commit a failed sample's staged output (if any) and keep it in the run.
    pub forward_failed_outputs: bool,
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        PipelinePolicy {
            halt_on_failure: false,
            forward_failed_outputs: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Configuration {
    pub core_budget: usize,
    pub compression_level: u32,
    pub policy: PipelinePolicy,
    stages: BTreeMap<StageId, StageOptions>,
}

impl Configuration {
    pub fn stage(&self, id: StageId) -> Option<&StageOptions> {
        self.stages.get(&id)
    }

    pub fn is_enabled(&self, id: StageId) -> bool {
        self.stages.get(&id).map(|o| o.enabled()).unwrap_or(false)
    }

    pub fn pe_merging(&self) -> Option<&PeMergingOptions> {
        match self.stages.get(&StageId::PeMerging) {
            Some(StageOptions::PeMerging(o)) => Some(o),
            _ => None,
        }
    }

    pub fn primer_trimming(&self) -> Option<&PrimerTrimmingOptions> {
        match self.stages.get(&StageId::PrimerTrimming) {
            Some(StageOptions::PrimerTrimming(o)) => Some(o),
            _ => None,
        }
    }

    pub fn quality_filtering(&self) -> Option<&QualityFilteringOptions> {
        match self.stages.get(&StageId::QualityFiltering) {
            Some(StageOptions::QualityFiltering(o)) => Some(o),
            _ => None,
        }
    }

    pub fn dereplication(&self) -> Option<&DereplicationOptions> {
        match self.stages.get(&StageId::Dereplication) {
            Some(StageOptions::Dereplication(o)) => Some(o),
            _ => None,
        }
    }

    pub fn denoising(&self) -> Option<&DenoisingOptions> {
        match self.stages.get(&StageId::Denoising) {
            Some(StageOptions::Denoising(o)) => Some(o),
            _ => None,
        }
    }

    pub fn clustering(&self) -> Option<&ClusteringOptions> {
        match self.stages.get(&StageId::Clustering) {
            Some(StageOptions::Clustering(o)) => Some(o),
            _ => None,
        }
    }

    pub fn replicate_merging(&self) -> Option<&ReplicateMergingOptions> {
        match self.stages.get(&StageId::ReplicateMerging) {
            Some(StageOptions::ReplicateMerging(o)) => Some(o),
            _ => None,
        }
    }

    pub fn nc_removal(&self) -> Option<&NcRemovalOptions> {
        match self.stages.get(&StageId::NcRemoval) {
            Some(StageOptions::NcRemoval(o)) => Some(o),
            _ => None,
        }
    }

    pub fn read_table(&self) -> Option<&ReadTableOptions> {
        match self.stages.get(&StageId::ReadTable) {
            Some(StageOptions::ReadTable(o)) => Some(o),
            _ => None,
        }
    }
}


/// Validates raw settings into the run's immutable `Configuration`.
///
/// # Arguments
///
/// * `raw` - Mapping-of-mappings from the settings source.
/// * `machine_cores` - Detected machine parallelism.
/// * `stages` - Stages that will run; only their required values are enforced.
///
/// # Returns
/// Configuration, or `ConfigError` / `ResourceExhaustion` naming the offending value.
pub fn resolve(
    raw: &RawSettings,
    machine_cores: usize,
    stages: &[StageId],
) -> Result<Configuration, PipelineError> {
    let known: Vec<&str> = StageId::ALL
        .iter()
        .map(|s| s.section())
        .chain([GENERAL_SECTION, PIPELINE_SECTION])
        .collect();
    for section in raw.keys() {
        if !known.contains(&section.as_str()) {
            warn!("Ignoring unknown settings section '{}'", section);
        }
    }

    let general = Section::new(raw, GENERAL_SECTION);
    let core_budget = resolve_core_budget(&general, machine_cores)?;
    let compression_level = match general.integer("compression_level")? {
        None => DEFAULT_COMPRESSION_LEVEL,
        Some(level) if (1..=9).contains(&level) => level as u32,
        Some(level) => {
            return Err(general.invalid(
                "compression_level",
                format!("must be between 1 and 9, got {}", level),
            ));
        }
    };

    let pipeline = Section::new(raw, PIPELINE_SECTION);
    let defaults = PipelinePolicy::default();
    let policy = PipelinePolicy {
        halt_on_failure: pipeline.boolean("halt_on_failure")?.unwrap_or(defaults.halt_on_failure),
        forward_failed_outputs: pipeline
            .boolean("forward_failed_outputs")?
            .unwrap_or(defaults.forward_failed_outputs),
    };

    let mut options = BTreeMap::new();
    for &stage in StageId::ALL.iter() {
        let section = Section::new(raw, stage.section());
        let will_run = stages.contains(&stage);
        let resolved = resolve_stage(stage, &section, raw, will_run)?;
        options.insert(stage, resolved);
    }

    debug!("Resolved core budget {} of {} cores, compression level {}",
           core_budget, machine_cores, compression_level);

    Ok(Configuration {
        core_budget,
        compression_level,
        policy,
        stages: options,
    })
}

fn resolve_core_budget(general: &Section, machine_cores: usize) -> Result<usize, PipelineError> {
    let machine_cores = machine_cores.max(1);
    match general.integer("cores_to_use")? {
        None => Ok(machine_cores.saturating_sub(RESERVED_CORES).max(1)),
        Some(cores) if cores < 1 => Err(general.invalid(
            "cores_to_use",
            format!("must be a positive integer, got {}", cores),
        )),
        Some(cores) if cores as u64 > machine_cores as u64 => Err(PipelineError::ResourceExhaustion {
            requested: cores as u64,
            available: machine_cores,
        }),
        Some(cores) => Ok(cores as usize),
    }
}

/// Placeholder values are used for required fields of stages that will not
/// run, so the options record is still well formed.
fn resolve_stage(
    stage: StageId,
    section: &Section,
    raw: &RawSettings,
    will_run: bool,
) -> Result<StageOptions, PipelineError> {
    let options = match stage {
        StageId::PeMerging => StageOptions::PeMerging(PeMergingOptions {
            maxdiffpct: section.non_negative_integer("maxdiffpct", 25)?,
            maxdiffs: section.non_negative_integer("maxdiffs", 199)?,
            minovlen: section.positive_integer("minovlen", 5)?,
        }),
        StageId::PrimerTrimming => {
            let (p5_primer, p7_primer) = if will_run {
                (section.required_string("p5_primer")?, section.required_string("p7_primer")?)
            } else {
                (
                    section.string("p5_primer")?.unwrap_or_default(),
                    section.string("p7_primer")?.unwrap_or_default(),
                )
            };
            for (key, primer) in [("p5_primer", &p5_primer), ("p7_primer", &p7_primer)] {
                if !primer.is_empty() && !is_iupac_sequence(primer) {
                    return Err(section.invalid(key, format!("'{}' is not a nucleotide sequence", primer)));
                }
            }
            StageOptions::PrimerTrimming(PrimerTrimmingOptions {
                p5_primer: p5_primer.to_ascii_uppercase(),
                p7_primer: p7_primer.to_ascii_uppercase(),
                anchoring: section.boolean("anchoring")?.unwrap_or(false),
            })
        }
        StageId::QualityFiltering => {
            let (min_length, max_length) = if will_run {
                (section.required_integer("min_length")?, section.required_integer("max_length")?)
            } else {
                (
                    section.non_negative_integer("min_length", 0)?,
                    section.non_negative_integer("max_length", 0)?,
                )
            };
            if will_run && min_length > max_length {
                return Err(section.invalid(
                    "min_length",
                    format!("{} exceeds max_length {}", min_length, max_length),
                ));
            }
            let max_ee = section.float("max_ee")?.unwrap_or(1.0);
            if max_ee < 0.0 {
                return Err(section.invalid("max_ee", format!("must not be negative, got {}", max_ee)));
            }
            StageOptions::QualityFiltering(QualityFilteringOptions {
                max_ee,
                min_length,
                max_length,
            })
        }
        StageId::Dereplication => StageOptions::Dereplication(DereplicationOptions {
            minimum_sequence_abundance: section.positive_integer("minimum_sequence_abundance", 1)?,
        }),
        StageId::Denoising => {
            let alpha = section.float("alpha")?.unwrap_or(2.0);
            if alpha <= 0.0 {
                return Err(section.invalid("alpha", format!("must be positive, got {}", alpha)));
            }
            StageOptions::Denoising(DenoisingOptions {
                alpha,
                minsize: section.positive_integer("minsize", 8)?,
            })
        }
        StageId::Clustering => {
            let pct_id = section.float("pct_id")?.unwrap_or(97.0);
            if !(pct_id > 0.0 && pct_id <= 100.0) {
                return Err(section.invalid("pct_id", format!("must be in (0, 100], got {}", pct_id)));
            }
            StageOptions::Clustering(ClusteringOptions {
                perform: section.boolean("perform")?.unwrap_or(false),
                pct_id,
            })
        }
        StageId::ReplicateMerging => StageOptions::ReplicateMerging(ReplicateMergingOptions {
            perform: section.boolean("perform")?.unwrap_or(false),
            replicate_delimiter: section.string("replicate_delimiter")?.unwrap_or_else(|| "_".to_string()),
            minimum_replicate_presence: section.positive_integer("minimum_replicate_presence", 2)?,
        }),
        StageId::NcRemoval => StageOptions::NcRemoval(NcRemovalOptions {
            perform: section.boolean("perform")?.unwrap_or(false),
            negative_control_prefix: section
                .string("negative_control_prefix")?
                .unwrap_or_else(|| "NC_".to_string()),
        }),
        StageId::ReadTable => {
            let clustered = Section::new(raw, StageId::Clustering.section())
                .boolean("perform")?
                .unwrap_or(false);
            let default_prefix = if clustered { "OTU" } else { "ESV" };
            StageOptions::ReadTable(ReadTableOptions {
                id_prefix: section.string("id_prefix")?.unwrap_or_else(|| default_prefix.to_string()),
            })
        }
    };
    Ok(options)
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawSettings {
        serde_json::from_value(value).unwrap()
    }

    fn complete() -> RawSettings {
        raw(json!({
            "general": {"cores_to_use": 4, "compression_level": 6},
            "primer_trimming": {"p5_primer": "GTCGGTAAAACTCGTGCCAGC", "p7_primer": "CATAGTGGGGTATCTAATCCCAGTTTG"},
            "quality_filtering": {"max_ee": 1, "min_length": 200, "max_length": 220}
        }))
    }

    #[test]
    fn test_resolve_defaults() {
        let config = resolve(&complete(), 8, &StageId::ALL).unwrap();
        assert_eq!(config.core_budget, 4);
        assert_eq!(config.compression_level, 6);
        assert_eq!(config.pe_merging().unwrap().maxdiffs, 199);
        assert_eq!(config.denoising().unwrap().minsize, 8);
        assert!(!config.is_enabled(StageId::Clustering));
        assert!(config.is_enabled(StageId::Denoising));
        assert_eq!(config.read_table().unwrap().id_prefix, "ESV");
    }

    #[test]
    fn test_unset_core_budget_reserves_two_cores() {
        let settings = raw(json!({}));
        let config = resolve(&settings, 8, &[StageId::PeMerging]).unwrap();
        assert_eq!(config.core_budget, 6);
        let config = resolve(&settings, 2, &[StageId::PeMerging]).unwrap();
        assert_eq!(config.core_budget, 1);
    }

    #[test]
    fn test_rejects_non_positive_core_budget() {
        for cores in [0, -3] {
            let settings = raw(json!({"general": {"cores_to_use": cores}}));
            let err = resolve(&settings, 8, &[StageId::PeMerging]).unwrap_err();
            assert!(matches!(err, PipelineError::ConfigError { .. }), "{}", err);
            assert!(err.is_fatal());
        }
    }

    #[test]
    fn test_rejects_core_budget_above_machine() {
        let settings = raw(json!({"general": {"cores_to_use": 64}}));
        let err = resolve(&settings, 8, &[StageId::PeMerging]).unwrap_err();
        assert!(matches!(err, PipelineError::ResourceExhaustion { requested: 64, available: 8 }));
    }

    #[test]
    fn test_rejects_compression_level_out_of_range() {
        for level in [0, 10, -1] {
            let settings = raw(json!({"general": {"compression_level": level}}));
            let err = resolve(&settings, 8, &[StageId::PeMerging]).unwrap_err();
            assert!(err.to_string().contains("compression_level"), "{}", err);
        }
    }

    #[test]
    fn test_missing_primers_only_fail_when_trimming_runs() {
        let settings = raw(json!({}));
        assert!(resolve(&settings, 8, &[StageId::PeMerging]).is_ok());
        let err = resolve(&settings, 8, &[StageId::PrimerTrimming]).unwrap_err();
        assert!(err.to_string().contains("primer_trimming.p5_primer"), "{}", err);
    }

    #[test]
    fn test_missing_fragment_length_fails() {
        let settings = raw(json!({"quality_filtering": {"min_length": 200}}));
        let err = resolve(&settings, 8, &[StageId::QualityFiltering]).unwrap_err();
        assert!(err.to_string().contains("quality_filtering.max_length"), "{}", err);
    }

    #[test]
    fn test_rejects_invalid_primer() {
        let mut settings = complete();
        settings
            .get_mut("primer_trimming")
            .unwrap()
            .insert("p5_primer".to_string(), json!("GTC-XYZ"));
        let err = resolve(&settings, 8, &StageId::ALL).unwrap_err();
        assert!(err.to_string().contains("p5_primer"));
    }

    #[test]
    fn test_clustering_switches_table_prefix() {
        let mut settings = complete();
        settings.insert(
            "clustering".to_string(),
            serde_json::from_value(json!({"perform": true, "pct_id": 97})).unwrap(),
        );
        let config = resolve(&settings, 8, &StageId::ALL).unwrap();
        assert!(config.is_enabled(StageId::Clustering));
        assert_eq!(config.read_table().unwrap().id_prefix, "OTU");
    }
}
