use anyhow::{Context, Result};
use log::info;
use std::fmt::Write as _;
use std::path::Path;

use sysinfo::System;

const UNKNOWN: &str = "<unknown>";

/// Description of the host a pipeline runs on, one `key: value` per line
#[rustfmt::skip]
pub fn system_report() -> Result<String> {
    let mut sys = System::new_all();
    sys.refresh_all();
    let mut report = String::new();

    writeln!(report, "{:<25}{}", "Host name:", System::host_name().unwrap_or_else(|| UNKNOWN.to_owned()))?;
    writeln!(report, "{:<25}{}", "System name:", System::name().unwrap_or_else(|| UNKNOWN.to_owned()))?;
    writeln!(report, "{:<25}{}", "System kernel version:", System::kernel_version().unwrap_or_else(|| UNKNOWN.to_owned()))?;
    writeln!(report, "{:<25}{}", "System OS version:", System::long_os_version().unwrap_or_else(|| UNKNOWN.to_owned()))?;
    writeln!(report, "{:<25}{}", "CPU Arch:", System::cpu_arch())?;

    match sys.cpus().first() {
        Some(cpu) => writeln!(report, "{:<25}{} ({} logical) @ {:.2} GHz",
            "CPU:", cpu.brand(), sys.cpus().len(), cpu.frequency() as f64 / 1000.0)?,
        None => writeln!(report, "{:<25}{}", "CPU:", UNKNOWN)?,
    }

    writeln!(report, "{:<25}{} bytes", "Total memory:", sys.total_memory())?;
    writeln!(report, "{:<25}{} bytes", "Available memory:", sys.available_memory())?;
    writeln!(report, "{:<25}{} bytes", "Total swap:", sys.total_swap())?;
    writeln!(report, "{:<25}{}", "Uptime (seconds):", System::uptime())?;
    Ok(report)
}

/// Write [`system_report`] to `file`
pub fn dump_sys_info(file: &Path) -> Result<()> {
    info!("Writing system info to {file:?}");
    let report = system_report()?;
    std::fs::write(file, report)
        .with_context(|| format!("Failed to write system info to {}", file.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_dump_sys_info() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("system_info");
        dump_sys_info(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("CPU Arch:"));
        assert!(contents.contains("Total memory:"));
        assert_eq!(contents.lines().count(), 10);
    }
}
