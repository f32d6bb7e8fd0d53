// src/utils/system.rs: System functions

use std::time::Duration;

use anyhow::{anyhow, Result};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tokio::time::sleep;


/// Determines the machine parallelism available to the core budget.
///
/// # Returns
///
/// Result<(usize, f32)> logical cores, current cpu usage
pub async fn detect_cores_and_load() -> Result<(usize, f32)> {
    let refresh_kind = RefreshKind::nothing().with_cpu(Default::default());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_cpu_all();
    sleep(Duration::from_millis(100)).await;
    system.refresh_cpu_specifics(CpuRefreshKind::nothing().with_cpu_usage());
    let cpu_load = system.global_cpu_usage();
    let cores = num_cpus::get().max(1);
    Ok((cores, cpu_load))
}


/// Finds the amount of total and available RAM, keyed to OS
///
/// # Returns
///
/// Result<(u64, u64)> total ram, available ram
pub fn detect_ram() -> Result<(u64, u64)> {
    let (total_ram, available_ram) = if cfg!(target_os = "macos") {
        let refresh_kind = RefreshKind::nothing().with_memory(Default::default());
        let mut system = System::new_with_specifics(refresh_kind);
        system.refresh_memory_specifics(MemoryRefreshKind::everything());
        let total = system.total_memory();
        let used = system.used_memory();
        (total, total.saturating_sub(used))
    } else {
        let mut system = System::new_all();
        system.refresh_memory();
        (system.total_memory(), system.available_memory())
    };

    if total_ram == 0 || available_ram == 0 {
        return Err(anyhow!("Failed to detect valid RAM values"));
    }

    Ok((total_ram, available_ram))
}
