use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::defs::StageId;


#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run every stage in order, skipping disabled ones.
    RunAll,
    /// Run a single stage on the outputs of its nearest enabled predecessor.
    RunStage {
        #[arg(value_enum)]
        stage: StageId,
    },
}

#[derive(Parser, Debug, Clone)]
#[command(name = "metabar", version, about = "DNA metabarcoding pipeline over a numbered project folder")]
pub struct Arguments {

    #[command(subcommand)]
    pub command: Command,

    #[arg(short = 'v', long = "verbose", action, global = true)]
    pub verbose: bool,

    #[arg(short = 'p', long = "project", global = true, help = "Project folder. Defaults to the current working directory.")]
    pub project: Option<PathBuf>,

    #[arg(short = 's', long = "settings", global = true, help = "Settings file. Defaults to <project>/Settings.json.")]
    pub settings: Option<PathBuf>,

    #[arg(long, global = true, help = "Cores to use; overrides general.cores_to_use")]
    pub cores: Option<usize>,
}

impl Arguments {
    /// Stages this invocation plans to run, in pipeline order.
    pub fn plan(&self) -> Vec<StageId> {
        match &self.command {
            Command::RunAll => StageId::ALL.to_vec(),
            Command::RunStage { stage } => vec![*stage],
        }
    }
}
