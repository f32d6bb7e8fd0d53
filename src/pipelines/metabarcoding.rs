// src/pipelines/metabarcoding.rs: the fixed metabarcoding stage chain

use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::defs::{PipelineError, RunConfig, StageId, INTERNAL_TAG};
use crate::config::resolve::Configuration;
use crate::orchestrator::layout::ProjectLayout;
use crate::orchestrator::ledger::Ledger;
use crate::orchestrator::report::ProjectReport;
use crate::orchestrator::sequencer::{PipelineRun, Sequencer, StageGraph};
use crate::orchestrator::stage::{Sample, StageContext, StageSpec, StageTask};
use crate::pipelines::{
    clustering, denoising, dereplication, nc_removal, pe_merging, primer_trimming, quality_filtering,
    read_table, replicate_merging,
};
use crate::utils::command::check_versions;
use crate::utils::fastx::find_file_pairs;
use crate::utils::file::list_files_with_suffix;
use crate::utils::invoker::{AbortHandle, CoreBudget, ToolInvoker};


pub fn default_specs() -> Vec<StageSpec> {
    vec![
        pe_merging::spec(),
        primer_trimming::spec(),
        quality_filtering::spec(),
        dereplication::spec(),
        denoising::spec(),
        clustering::spec(),
        replicate_merging::spec(),
        nc_removal::spec(),
        read_table::spec(),
    ]
}

pub fn default_graph() -> Result<StageGraph, PipelineError> {
    StageGraph::new(default_specs())
}

pub fn default_tasks() -> Vec<Arc<dyn StageTask>> {
    vec![
        Arc::new(pe_merging::PeMerging::new()),
        Arc::new(primer_trimming::PrimerTrimming::new()),
        Arc::new(quality_filtering::QualityFiltering::new()),
        Arc::new(dereplication::Dereplication::new()),
        Arc::new(denoising::Denoising::new()),
        Arc::new(clustering::Clustering::new()),
        Arc::new(replicate_merging::ReplicateMerging::new()),
        Arc::new(nc_removal::NcRemoval::new()),
        Arc::new(read_table::ReadTable::new()),
    ]
}


/// Finds the input samples of `stage` on disk.
///
/// The first stage reads paired files from `02_demultiplexing/data`; any
/// other stage reads the committed outputs of its nearest enabled predecessor.
///
/// # Arguments
///
/// * `layout` - Project paths.
/// * `graph` - Stage graph.
/// * `config` - Resolved configuration, used to skip disabled predecessors.
/// * `stage` - Stage whose inputs are wanted.
///
/// # Returns
/// Samples sorted by id, or `MissingInput` if the input folder is absent.
pub fn discover_samples(
    layout: &ProjectLayout,
    graph: &StageGraph,
    config: &Configuration,
    stage: StageId,
) -> Result<Vec<Sample>, PipelineError> {
    let predecessor = graph.nearest_predecessor(stage, |id| config.is_enabled(id));
    let source = match predecessor {
        Some(pred) => layout.data_dir(pred),
        None => layout.demultiplexed_data(),
    };
    if !source.is_dir() {
        return Err(PipelineError::MissingInput(format!(
            "input folder {} for {} does not exist",
            source.display(),
            stage
        )));
    }

    let mut samples = Vec::new();
    match predecessor.and_then(|pred| graph.spec(pred)) {
        Some(pred_spec) => {
            for file in list_files_with_suffix(&source, pred_spec.output_suffix)? {
                match pred_spec.sample_from_output(&file) {
                    Some(id) => samples.push(Sample::new(&id, vec![file])),
                    None => debug!("Ignoring {}", file.display()),
                }
            }
        }
        None => {
            let files = list_files_with_suffix(&source, ".fastq.gz")?;
            let (pairs, singles) = find_file_pairs(&files);
            for single in singles {
                warn!("No read pair found for {}; ignoring it", single.display());
            }
            samples.extend(
                pairs
                    .into_iter()
                    .map(|pair| Sample::new(&pair.sample, vec![pair.forward, pair.reverse])),
            );
        }
    }
    samples.sort_by(|a, b| a.id.cmp(&b.id));
    info!("Found {} samples in {}", samples.len(), source.display());
    Ok(samples)
}


/// External tools the planned, enabled stages will call.
pub fn required_tools(graph: &StageGraph, config: &Configuration, plan: &[StageId]) -> Vec<&'static str> {
    let mut tools: Vec<&'static str> = plan
        .iter()
        .filter(|id| config.is_enabled(**id))
        .filter_map(|id| graph.spec(*id))
        .map(|spec| spec.tool)
        .filter(|tool| *tool != INTERNAL_TAG)
        .collect();
    tools.sort();
    tools.dedup();
    tools
}


/// Runs the planned stages over the project.
///
/// # Arguments
///
/// * `config` - RunConfig struct from main.
/// * `plan` - Stages to run; the rest of the graph is treated as already done.
/// * `abort` - Abort switch shared with the signal handler.
///
/// # Returns
/// PipelineRun describing every planned stage.
pub async fn run(
    config: Arc<RunConfig>,
    plan: &[StageId],
    abort: AbortHandle,
) -> Result<PipelineRun, PipelineError> {
    let layout = ProjectLayout::new(config.project.clone());
    let configuration = Arc::clone(&config.configuration);
    let graph = default_graph()?;

    let tool_versions = check_versions(&required_tools(&graph, &configuration, plan)).await;

    let mut sequencer = Sequencer::new(graph.clone(), default_tasks(), plan)?;
    let samples = match sequencer.plan().iter().find(|id| configuration.is_enabled(**id)) {
        Some(first) => discover_samples(&layout, &graph, &configuration, *first)?,
        None => Vec::new(),
    };
    if samples.is_empty() {
        warn!("No input samples found in {}", layout.root().display());
    }

    let budget = CoreBudget::new(configuration.core_budget);
    info!(
        "Core budget {} of {} machine cores",
        budget.capacity(),
        config.machine_cores
    );
    let ctx = Arc::new(StageContext {
        config: configuration,
        layout: layout.clone(),
        invoker: ToolInvoker::new(budget, &abort),
        ledger: Arc::new(Ledger::new()),
        tool_versions: tool_versions.clone(),
    });

    let sink = ProjectReport::new(layout, tool_versions);
    sequencer.run(samples, ctx, &sink).await
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use crate::config::resolve::resolve;
    use crate::config::settings::RawSettings;
    use serde_json::json;

    fn configuration(raw: serde_json::Value) -> Configuration {
        let raw: RawSettings = serde_json::from_value(raw).unwrap();
        resolve(&raw, 8, &[]).unwrap()
    }

    #[test]
    fn test_default_graph_is_a_chain() {
        let graph = default_graph().unwrap();
        assert_eq!(graph.topological_order().unwrap(), StageId::ALL.to_vec());
        let tasks = default_tasks();
        assert_eq!(tasks.len(), StageId::ALL.len());
        for (task, id) in tasks.iter().zip(StageId::ALL.iter()) {
            assert_eq!(task.spec().id, *id);
            assert_eq!(Some(task.spec()), graph.spec(*id));
        }
    }

    #[test]
    fn test_discover_demultiplexed_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::new(dir.path());
        let data = layout.demultiplexed_data();
        fs::create_dir_all(&data).unwrap();
        for name in ["B_R1.fastq.gz", "B_R2.fastq.gz", "A_R1.fastq.gz", "A_R2.fastq.gz", "C_R1.fastq.gz"] {
            fs::write(data.join(name), b"").unwrap();
        }
        let config = configuration(json!({}));
        let samples =
            discover_samples(&layout, &default_graph().unwrap(), &config, StageId::PeMerging).unwrap();
        let ids: Vec<&str> = samples.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert_eq!(samples[0].current().len(), 2);
    }

    #[test]
    fn test_discover_skips_disabled_predecessor() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::new(dir.path());
        let esvs = layout.data_dir(StageId::Denoising);
        fs::create_dir_all(&esvs).unwrap();
        fs::write(esvs.join("S1_ESVs.fasta.gz"), b"").unwrap();
        fs::write(esvs.join("notes.txt"), b"").unwrap();

        let config = configuration(json!({"clustering": {"perform": false}}));
        let samples = discover_samples(
            &layout,
            &default_graph().unwrap(),
            &config,
            StageId::ReplicateMerging,
        )
        .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].id, "S1");
    }

    #[test]
    fn test_missing_input_folder() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::new(dir.path());
        let config = configuration(json!({}));
        let err = discover_samples(&layout, &default_graph().unwrap(), &config, StageId::Dereplication)
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingInput(_)));
    }

    #[test]
    fn test_required_tools() {
        let graph = default_graph().unwrap();
        let config = configuration(json!({}));
        assert_eq!(required_tools(&graph, &config, &StageId::ALL), vec!["cutadapt", "vsearch"]);
        assert!(required_tools(&graph, &config, &[StageId::ReadTable]).is_empty());
    }
}
