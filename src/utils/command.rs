/// Functions and structs for working with creating command-line arguments

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use log::{info, warn};
use crate::config::defs::{CUTADAPT_TAG, TOOL_VERSIONS, VSEARCH_TAG};


pub mod vsearch {
    use std::path::PathBuf;
    use std::process::Stdio;
    use anyhow::{anyhow, Result};
    use lazy_static::lazy_static;
    use regex::Regex;
    use tokio::process::Command;
    use crate::config::defs::{VsearchSubcommand, VSEARCH_TAG};
    use crate::utils::streams::{read_child_output_to_vec, ChildStream};

    lazy_static! {
        static ref VERSION: Regex = Regex::new(r"vsearch v?([\d\.]+)").unwrap();
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct VsearchConfig {
        pub subcommand: VsearchSubcommand,
        pub input: PathBuf,
        /// Flag and optional value, emitted in order.
        pub subcommand_fields: Vec<(String, Option<String>)>,
    }

    impl VsearchConfig {
        pub fn new(subcommand: VsearchSubcommand, input: PathBuf) -> Self {
            VsearchConfig {
                subcommand,
                input,
                subcommand_fields: Vec::new(),
            }
        }

        pub fn field(mut self, flag: &str, value: impl ToString) -> Self {
            self.subcommand_fields.push((flag.to_string(), Some(value.to_string())));
            self
        }

        pub fn flag(mut self, flag: &str) -> Self {
            self.subcommand_fields.push((flag.to_string(), None));
            self
        }
    }

    /// vsearch prints its banner on stderr.
    pub async fn vsearch_presence_check() -> Result<String> {
        let mut child = Command::new(VSEARCH_TAG)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn {}: {}. Is vsearch installed?", VSEARCH_TAG, e))?;

        let lines = read_child_output_to_vec(&mut child, ChildStream::Stderr).await?;
        child.wait().await?;
        let first_line = lines
            .first()
            .ok_or_else(|| anyhow!("No output from vsearch --version"))?;
        let version = VERSION
            .captures(first_line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim_end_matches('.').to_string())
            .ok_or_else(|| anyhow!("Invalid vsearch --version output: {}", first_line))?;
        Ok(version)
    }

    pub fn arg_generator(config: &VsearchConfig) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push(config.subcommand.flag().to_string());
        args_vec.push(config.input.to_string_lossy().to_string());
        for (flag, value) in &config.subcommand_fields {
            args_vec.push(flag.clone());
            if let Some(value) = value {
                args_vec.push(value.clone());
            }
        }
        args_vec
    }
}

pub mod cutadapt {
    use std::path::PathBuf;
    use std::process::Stdio;
    use anyhow::{anyhow, Result};
    use tokio::process::Command;
    use crate::config::defs::CUTADAPT_TAG;
    use crate::config::resolve::PrimerTrimmingOptions;
    use crate::utils::fastx::reverse_complement;
    use crate::utils::streams::{read_child_output_to_vec, ChildStream};

    #[derive(Debug, Clone, PartialEq)]
    pub struct CutadaptConfig {
        pub adapter: String,
        pub input: PathBuf,
        pub output: PathBuf,
        pub cores: usize,
    }

    /// Linked adapter `P5...revcomp(P7)`, anchored to the read start on request.
    pub fn linked_adapter(options: &PrimerTrimmingOptions) -> String {
        let adapter = format!("{}...{}", options.p5_primer, reverse_complement(&options.p7_primer));
        if options.anchoring {
            format!("^{}", adapter)
        } else {
            adapter
        }
    }

    pub async fn cutadapt_presence_check() -> Result<String> {
        let mut child = Command::new(CUTADAPT_TAG)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn {}: {}. Is cutadapt installed?", CUTADAPT_TAG, e))?;

        let lines = read_child_output_to_vec(&mut child, ChildStream::Stdout).await?;
        child.wait().await?;
        let version = lines
            .first()
            .map(|l| l.trim().to_string())
            .ok_or_else(|| anyhow!("No output from cutadapt --version"))?;
        if version.is_empty() {
            return Err(anyhow!("Empty version number in cutadapt --version output"));
        }
        Ok(version)
    }

    pub fn arg_generator(config: &CutadaptConfig) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("-a".to_string());
        args_vec.push(config.adapter.clone());
        args_vec.push("-o".to_string());
        args_vec.push(config.output.to_string_lossy().to_string());
        args_vec.push(config.input.to_string_lossy().to_string());
        args_vec.push("--discard-untrimmed".to_string());
        args_vec.push(format!("--cores={}", config.cores.max(1)));
        args_vec.push("--report=minimal".to_string());
        args_vec
    }
}


pub async fn check_version(tool: &str) -> Result<String> {
    let version = match tool {
        VSEARCH_TAG => vsearch::vsearch_presence_check().await,
        CUTADAPT_TAG => cutadapt::cutadapt_presence_check().await,
        _ => return Err(anyhow!("Unknown tool: {}", tool)),
    };
    Ok(version?)
}

/// Leading `(major, minor)` of a version string.
fn version_number(version: &str) -> Option<(u32, u32)> {
    let leading_digits = |part: &str| -> String {
        part.trim().chars().take_while(|c| c.is_ascii_digit()).collect()
    };
    let mut parts = version.split('.');
    let major = leading_digits(parts.next()?).parse::<u32>().ok()?;
    let minor = match parts.next().map(leading_digits) {
        Some(minor) if !minor.is_empty() => minor.parse::<u32>().ok()?,
        _ => 0,
    };
    Some((major, minor))
}

/// Detects the versions of the given tools. A missing or outdated tool is
/// only warned about here; its invocations fail per sample later.
///
/// # Arguments
///
/// * `tools` - Tool tags to probe.
///
/// # Returns
/// Tool tag -> version, or "unavailable".
pub async fn check_versions(tools: &[&str]) -> BTreeMap<String, String> {
    let mut versions = BTreeMap::new();
    for &tool in tools {
        match check_version(tool).await {
            Ok(version) => {
                if let (Some(found), Some(&minimum)) = (version_number(&version), TOOL_VERSIONS.get(tool)) {
                    if found < minimum {
                        warn!("{} {} is older than the tested minimum {}.{}", tool, version, minimum.0, minimum.1);
                    }
                }
                info!("Found {} {}", tool, version);
                versions.insert(tool.to_string(), version);
            }
            Err(e) => {
                warn!("{}", e);
                versions.insert(tool.to_string(), "unavailable".to_string());
            }
        }
    }
    versions
}
