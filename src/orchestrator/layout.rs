// src/orchestrator/layout.rs: numbered project directories

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::defs::{
    StageId, DATA_DIR, DEMULTIPLEXED_DIR, GZIP_EXT, LEDGER_TSV, PROJECT_REPORT_JSON, SETTINGS_FILE,
    TEMP_DIR,
};
use crate::utils::file::file_path_manipulator;


/// Paths inside a project. Scaffolding the project is not our job; stage
/// folders are created on demand, input folders must already exist.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ProjectLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Project name, used to label project-wide outputs.
    pub fn name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string())
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }

    pub fn demultiplexed_data(&self) -> PathBuf {
        self.root.join(DEMULTIPLEXED_DIR).join(DATA_DIR)
    }

    pub fn stage_dir(&self, stage: StageId) -> PathBuf {
        self.root.join(stage.dir_name())
    }

    pub fn data_dir(&self, stage: StageId) -> PathBuf {
        self.stage_dir(stage).join(DATA_DIR)
    }

    pub fn temp_dir(&self, stage: StageId) -> PathBuf {
        self.stage_dir(stage).join(TEMP_DIR)
    }

    /// Final, committed location of a stage output.
    pub fn data_path(&self, stage: StageId, file_name: &str) -> PathBuf {
        self.data_dir(stage).join(file_name)
    }

    /// Uncompressed staging file for `file_name`: `temp/<name without .gz>`.
    pub fn staged_path(&self, stage: StageId, file_name: &str) -> PathBuf {
        let gz_suffix = format!(".{}", GZIP_EXT);
        let raw = file_name.strip_suffix(gz_suffix.as_str()).unwrap_or(file_name);
        self.temp_dir(stage).join(raw)
    }

    /// Scratch file for one unit, e.g. `temp/<unit>_<tag>`.
    pub fn scratch_path(&self, stage: StageId, unit: &str, tag: &str) -> PathBuf {
        file_path_manipulator(unit, &self.temp_dir(stage), Some(tag), "_")
    }

    pub fn stage_log(&self, stage: StageId) -> PathBuf {
        self.stage_dir(stage).join(format!("Logfile_{}.tsv", stage.dir_name()))
    }

    pub fn project_report(&self) -> PathBuf {
        self.root.join(PROJECT_REPORT_JSON)
    }

    pub fn ledger_table(&self) -> PathBuf {
        self.root.join(LEDGER_TSV)
    }

    /// Creates `data/` and a fresh `temp/`; staged files left by an earlier
    /// failed run are discarded.
    pub fn prepare_stage(&self, stage: StageId) -> io::Result<()> {
        fs::create_dir_all(self.data_dir(stage))?;
        self.remove_temp(stage)?;
        fs::create_dir_all(self.temp_dir(stage))
    }

    pub fn remove_temp(&self, stage: StageId) -> io::Result<()> {
        let temp = self.temp_dir(stage);
        if temp.exists() {
            fs::remove_dir_all(temp)?;
        }
        Ok(())
    }
}
