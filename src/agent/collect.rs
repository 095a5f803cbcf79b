//! Collectors for the agent's local metric set.
//!
//! Two independent tasks call into this module: one refreshes process-level
//! readings plus a synthetic random gauge, the other host-level memory and
//! per-core utilization. Both write into the same guarded map; name
//! collisions are overwrites by design since every reading is a gauge.

use sysinfo::{CpuExt, ProcessExt, System, SystemExt};

use super::MetricSet;

/// Refresh process-level readings: memory footprint, CPU share, uptime and
/// the `RandomValue` canary gauge.
pub fn update_process_metrics(metrics: &MetricSet, sys: &mut System) {
    if let Ok(pid) = sysinfo::get_current_pid() {
        sys.refresh_process(pid);
        if let Some(process) = sys.process(pid) {
            let mut set = metrics.lock().unwrap();
            set.insert(
                "ProcessResidentMemory".to_string(),
                process.memory() as f64,
            );
            set.insert(
                "ProcessVirtualMemory".to_string(),
                process.virtual_memory() as f64,
            );
            set.insert("ProcessCpu".to_string(), f64::from(process.cpu_usage()));
            set.insert("ProcessUptime".to_string(), process.run_time() as f64);
        }
    }

    let mut set = metrics.lock().unwrap();
    set.insert("RandomValue".to_string(), rand::random::<f64>());
}

/// Refresh host-level readings: total/free memory and one utilization gauge
/// per core.
pub fn update_host_metrics(metrics: &MetricSet, sys: &mut System) {
    sys.refresh_memory();
    sys.refresh_cpu();

    let mut set = metrics.lock().unwrap();
    set.insert("TotalMemory".to_string(), sys.total_memory() as f64);
    set.insert("FreeMemory".to_string(), sys.free_memory() as f64);
    for (i, cpu) in sys.cpus().iter().enumerate() {
        set.insert(
            format!("CPUutilization{}", i),
            f64::from(cpu.cpu_usage()),
        );
    }
}
