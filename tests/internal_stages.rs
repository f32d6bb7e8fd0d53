use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use metabar_pipelines::config::defs::StageId;
use metabar_pipelines::config::resolve::resolve;
use metabar_pipelines::config::settings::RawSettings;
use metabar_pipelines::orchestrator::{
    Ledger, ProjectLayout, ProjectReport, RunStatus, Sample, Sequencer, StageContext, StageState,
};
use metabar_pipelines::pipelines::metabarcoding::{default_graph, default_tasks};
use metabar_pipelines::utils::fastx::{read_sized_fasta, sequence_hash};
use metabar_pipelines::utils::invoker::{AbortHandle, CoreBudget, ToolInvoker};


fn sample(dir: &Path, id: &str, records: &[(&str, u64)]) -> Result<Sample> {
    let path = dir.join(format!("{}_OTUs.fasta", id));
    let mut text = String::new();
    for (i, (seq, size)) in records.iter().enumerate() {
        text.push_str(&format!(">seq{};size={}\n{}\n", i, size, seq));
    }
    fs::write(&path, text)?;
    Ok(Sample::new(id, vec![path]))
}

#[tokio::test]
async fn test_merge_remove_controls_and_tabulate() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path().join("lake_survey");
    let inputs = root.join("inputs");
    fs::create_dir_all(&inputs)?;

    let samples = vec![
        sample(&inputs, "A_1", &[("AAAA", 10), ("CCCC", 3)])?,
        sample(&inputs, "A_2", &[("AAAA", 5), ("GGGG", 4)])?,
        sample(&inputs, "B_1", &[("CCCC", 7), ("TTTT", 2)])?,
        sample(&inputs, "B_2", &[("CCCC", 1), ("TTTT", 2)])?,
        sample(&inputs, "NC_1", &[("AAAA", 4)])?,
        sample(&inputs, "NC_2", &[("AAAA", 6), ("TTTT", 1)])?,
    ];

    let raw: RawSettings = serde_json::from_value(json!({
        "general": {"cores_to_use": 2},
        "replicate_merging": {"perform": true, "replicate_delimiter": "_", "minimum_replicate_presence": 2},
        "nc_removal": {"perform": true, "negative_control_prefix": "NC"}
    }))?;
    let plan = [StageId::ReplicateMerging, StageId::NcRemoval, StageId::ReadTable];
    let config = resolve(&raw, 4, &plan)?;

    let layout = ProjectLayout::new(&root);
    let ctx = Arc::new(StageContext {
        config: Arc::new(config),
        layout: layout.clone(),
        invoker: ToolInvoker::new(CoreBudget::new(2), &AbortHandle::new()),
        ledger: Arc::new(Ledger::new()),
        tool_versions: BTreeMap::new(),
    });
    let mut sequencer = Sequencer::new(default_graph()?, default_tasks(), &plan)?;
    let sink = ProjectReport::new(layout.clone(), BTreeMap::new());

    let run = sequencer.run(samples, Arc::clone(&ctx), &sink).await?;
    assert_eq!(run.status, RunStatus::CompletedOk);
    for id in plan {
        assert_eq!(sequencer.state(id), Some(StageState::CompletedOk));
    }

    // Replicates folded: A keeps AAAA only, B keeps both of its sequences.
    let merged = read_sized_fasta(&layout.data_path(StageId::ReplicateMerging, "A_merged.fasta.gz"))?;
    assert_eq!(merged.len(), 1);
    assert_eq!((merged[0].seq.as_str(), merged[0].size), ("AAAA", 15));
    assert_eq!(ctx.ledger.summary(StageId::ReplicateMerging).samples, 3);

    // Controls are subtracted and not carried on.
    let cleaned = read_sized_fasta(&layout.data_path(StageId::NcRemoval, "A_nc_removed.fasta.gz"))?;
    assert_eq!(cleaned[0].size, 5);
    assert_eq!(cleaned[0].hash, sequence_hash("AAAA"));
    assert!(!layout.data_path(StageId::NcRemoval, "NC_nc_removed.fasta.gz").exists());
    assert_eq!(ctx.ledger.summary(StageId::NcRemoval).samples, 2);

    let table = fs::read_to_string(layout.data_path(StageId::ReadTable, "lake_survey_read_table.tsv"))?;
    let rows: Vec<Vec<&str>> = table.lines().map(|l| l.split('\t').collect()).collect();
    assert_eq!(rows[0], vec!["ID", "hash", "seq", "A", "B"]);
    assert_eq!(rows[1][0], "ESV_1");
    assert_eq!(&rows[1][2..], &["CCCC", "0", "8"]);
    assert_eq!(&rows[2][2..], &["AAAA", "5", "0"]);
    assert_eq!(&rows[3][2..], &["TTTT", "0", "4"]);
    assert!(layout.data_path(StageId::ReadTable, "lake_survey_ESVs.fasta").exists());

    assert!(layout.stage_log(StageId::NcRemoval).exists());
    assert!(layout.project_report().exists());
    assert!(layout.ledger_table().exists());
    Ok(())
}
