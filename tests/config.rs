use std::fs;

use anyhow::Result;

use metabar_pipelines::config::defs::{PipelineError, StageId};
use metabar_pipelines::config::resolve::resolve;
use metabar_pipelines::config::settings::load_settings;


#[test]
fn test_settings_file_round() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("Settings.json");
    fs::write(
        &path,
        r#"{
            "general": {"cores_to_use": 3, "compression_level": 9},
            "pipeline": {"halt_on_failure": true},
            "primer_trimming": {"p5_primer": "gtcggtaaaactcgtgccagc", "p7_primer": "CATAGTGGGGTATCTAATCCCAGTTTG", "anchoring": true},
            "quality_filtering": {"max_ee": 0.5, "min_length": 300, "max_length": 320},
            "clustering": {"perform": true}
        }"#,
    )?;
    let raw = load_settings(&path)?;
    let config = resolve(&raw, 16, &StageId::ALL)?;

    assert_eq!(config.core_budget, 3);
    assert_eq!(config.compression_level, 9);
    assert!(config.policy.halt_on_failure);
    assert!(!config.policy.forward_failed_outputs);
    assert_eq!(config.primer_trimming().unwrap().p5_primer, "GTCGGTAAAACTCGTGCCAGC");
    assert_eq!(config.quality_filtering().unwrap().max_ee, 0.5);
    assert!(config.is_enabled(StageId::Clustering));
    assert!(!config.is_enabled(StageId::NcRemoval));
    assert_eq!(config.read_table().unwrap().id_prefix, "OTU");
    Ok(())
}

#[test]
fn test_missing_settings_file_uses_defaults() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let raw = load_settings(&dir.path().join("Settings.json"))?;
    assert!(raw.is_empty());
    let config = resolve(&raw, 8, &[StageId::Dereplication])?;
    assert_eq!(config.core_budget, 6);
    assert_eq!(config.dereplication().unwrap().minimum_sequence_abundance, 1);
    Ok(())
}

#[test]
fn test_fatal_settings_errors() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("Settings.json");

    fs::write(&path, "{ not json")?;
    let err = load_settings(&path).unwrap_err();
    assert!(matches!(err, PipelineError::ConfigError { .. }));
    assert!(err.is_fatal());

    fs::write(&path, r#"{"general": {"cores_to_use": 64}}"#)?;
    let err = resolve(&load_settings(&path)?, 8, &[]).unwrap_err();
    assert!(matches!(err, PipelineError::ResourceExhaustion { requested: 64, available: 8 }));
    assert!(err.is_fatal());

    fs::write(&path, r#"{"quality_filtering": {"min_length": 250}}"#)?;
    let err = resolve(&load_settings(&path)?, 8, &[StageId::QualityFiltering]).unwrap_err();
    assert!(matches!(err, PipelineError::ConfigError { ref key, .. } if key == "max_length"));
    Ok(())
}
