//! Platform process enumeration.
//!
//! A scan never fails: processes that disappear mid-scan or cannot be
//! inspected (permissions, races) are silently skipped.

use std::path::PathBuf;

/// One running process observed during a scan.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Short process name (image name on Windows, `comm` on Linux).
    pub name: String,
    /// Executable path, when the platform exposes it.
    pub exe: Option<PathBuf>,
}

/// Enumerate currently running processes.
#[must_use]
pub fn running_processes() -> Vec<ProcessInfo> {
    platform_scan()
}

#[cfg(target_os = "linux")]
fn platform_scan() -> Vec<ProcessInfo> {
    use std::fs;

    let mut processes = Vec::new();
    let Ok(entries) = fs::read_dir("/proc") else {
        return processes;
    };
    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        let Ok(name) = fs::read_to_string(entry.path().join("comm")) else {
            continue;
        };
        let exe = fs::read_link(entry.path().join("exe")).ok();
        processes.push(ProcessInfo { pid, name: name.trim().to_string(), exe });
    }
    processes
}

#[cfg(target_os = "macos")]
fn platform_scan() -> Vec<ProcessInfo> {
    use std::path::Path;
    use std::process::Command;

    let mut processes = Vec::new();
    let Ok(output) = Command::new("ps").args(["-axo", "pid=,comm="]).output() else {
        return processes;
    };
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let mut fields = line.trim().splitn(2, ' ');
        let Some(pid) = fields.next().and_then(|raw| raw.trim().parse::<u32>().ok()) else {
            continue;
        };
        let Some(command) = fields.next().map(str::trim) else {
            continue;
        };
        let exe = command.starts_with('/').then(|| PathBuf::from(command));
        let name = Path::new(command)
            .file_name()
            .map_or_else(|| command.to_string(), |name| name.to_string_lossy().into_owned());
        processes.push(ProcessInfo { pid, name, exe });
    }
    processes
}

#[cfg(windows)]
fn platform_scan() -> Vec<ProcessInfo> {
    use std::process::Command;

    let mut processes = Vec::new();
    let Ok(output) = Command::new("tasklist").args(["/FO", "CSV", "/NH"]).output() else {
        return processes;
    };
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let fields: Vec<&str> =
            line.trim().trim_matches('"').split("\",\"").collect();
        if fields.len() < 2 {
            continue;
        }
        let Ok(pid) = fields[1].parse::<u32>() else {
            continue;
        };
        processes.push(ProcessInfo { pid, name: fields[0].to_string(), exe: None });
    }
    processes
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn platform_scan() -> Vec<ProcessInfo> {
    Vec::new()
}

/// Whether a previously observed pid still refers to a live process.
#[cfg(unix)]
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None) {
        Ok(()) => true,
        // The process exists but belongs to someone else.
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(windows)]
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    use std::process::Command;

    let filter = format!("PID eq {pid}");
    let Ok(output) = Command::new("tasklist").args(["/FI", &filter, "/NH"]).output() else {
        return false;
    };
    String::from_utf8_lossy(&output.stdout).contains(&pid.to_string())
}

#[cfg(not(any(unix, windows)))]
#[must_use]
pub fn pid_alive(_pid: u32) -> bool {
    false
}
