//! Termination of browser processes left behind by crashed runs.

use std::path::Path;
use sysinfo::System;
use tracing::info;

/// A process is ours when its executable name matches one of `names` and,
/// if a profile marker is given, its command line carries it. Matching on
/// the profile keeps a user's own browser windows alive.
pub fn is_orphan(process_name: &str, cmd_line: &str, names: &[String], marker: Option<&str>) -> bool {
    let process_name = process_name.to_lowercase();
    let process_name = process_name.trim_end_matches(".exe");
    if !names.iter().any(|n| n.eq_ignore_ascii_case(process_name)) {
        return false;
    }
    match marker {
        Some(m) => cmd_line.contains(m),
        None => true,
    }
}

/// Kill matching browser processes; returns how many were signalled.
pub fn kill_orphaned_browsers(names: &[String], user_data_dir: Option<&Path>) -> usize {
    let marker = user_data_dir
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| format!("--user-data-dir={}", p.display()));

    let mut sys = System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::All, true);

    let mut killed = 0usize;
    for (_pid, proc_) in sys.processes() {
        let cmd_line = proc_
            .cmd()
            .iter()
            .map(|s| s.to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let name = proc_.name().to_string_lossy();
        if is_orphan(&name, &cmd_line, names, marker.as_deref()) && proc_.kill() {
            killed += 1;
        }
    }

    if killed > 0 {
        info!("Killed {} orphaned browser process(es)", killed);
    }
    killed
}
