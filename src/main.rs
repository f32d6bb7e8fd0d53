use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use env_logger::Builder;
use log::{self, debug, error, info, warn, LevelFilter};
use serde_json::Value;

use metabar_pipelines::cli::parse;
use metabar_pipelines::config::defs::RunConfig;
use metabar_pipelines::config::resolve::resolve;
use metabar_pipelines::config::settings::{load_settings, GENERAL_SECTION};
use metabar_pipelines::orchestrator::layout::ProjectLayout;
use metabar_pipelines::orchestrator::sequencer::RunStatus;
use metabar_pipelines::pipelines::metabarcoding;
use metabar_pipelines::utils::invoker::AbortHandle;
use metabar_pipelines::utils::system::{detect_cores_and_load, detect_ram};


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n Metabar\n-------------\n");

    let dir = env::current_dir()?;
    let project = match &args.project {
        Some(path) if path.is_absolute() => path.clone(),
        Some(path) => dir.join(path),
        None => dir.clone(),
    };
    info!("The project directory is {:?}\n", project);

    let (machine_cores, cpu_load) = detect_cores_and_load().await?;
    debug!("Detected {} logical cores; CPU load {}%", machine_cores, cpu_load);

    match detect_ram() {
        Ok((total_ram, available_ram)) => {
            debug!("Available RAM: {} bytes (~{} GiB)", available_ram, available_ram / 1_073_741_824);
            debug!("Total RAM: {} bytes (~{} GiB)", total_ram, total_ram / 1_073_741_824);
        }
        Err(e) => warn!("{}", e),
    }

    let layout = ProjectLayout::new(project.clone());
    let settings_path: PathBuf = args.settings.clone().unwrap_or_else(|| layout.settings_file());
    let plan = args.plan();

    let configuration = load_settings(&settings_path).and_then(|mut raw| {
        if let Some(cores) = args.cores {
            raw.entry(GENERAL_SECTION.to_string())
                .or_default()
                .insert("cores_to_use".to_string(), Value::from(cores as u64));
        }
        resolve(&raw, machine_cores, &plan)
    });
    let configuration = match configuration {
        Ok(configuration) => Arc::new(configuration),
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    let run_config = Arc::new(RunConfig {
        cwd: dir,
        project,
        configuration,
        machine_cores,
        log_level,
    });

    let abort = AbortHandle::new();
    let signal_abort = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping running tools");
            signal_abort.abort();
        }
    });

    match metabarcoding::run(run_config, &plan, abort).await {
        Ok(run) => {
            info!(
                "Run finished with status {:?} in {} milliseconds.",
                run.status,
                run_start.elapsed().as_millis()
            );
            match run.status {
                RunStatus::CompletedOk => Ok(()),
                RunStatus::CompletedWithFailures => std::process::exit(1),
                RunStatus::Aborted => std::process::exit(130),
            }
        }
        Err(e) => {
            error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
            std::process::exit(1);
        }
    }
}
