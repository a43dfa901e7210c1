//! Resource diagnostics for the supervisor and its workers.
//!
//! Gathers file-descriptor accounting, the child-process tree, system-wide
//! PTY and fd counters, and supervisor-internal counters into one report,
//! then classifies warning conditions. Every probe is individually
//! time-boxed; a slow worker or a stalled OS query degrades to zeros
//! instead of blocking the aggregate.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

use super::fdstat::{self, PtyFdCounts};
use super::session::SpawnError;
use super::supervisor::ShellSupervisor;

/// Budget for the blocking OS probes (process table, memory).
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Fd usage fractions above which warnings fire.
const FD_WARN_FRACTION: f64 = 0.75;
const FD_CRITICAL_FRACTION: f64 = 0.90;
/// Soft limits below this are too tight for a multi-session host.
const FD_SOFT_LIMIT_FLOOR: u64 = 256;
/// Child trees larger than this are flagged as excessive.
const CHILD_TREE_CEILING: usize = 64;

/// Per-worker PTY descriptor counts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerFdReport {
    pub session_id: String,
    #[serde(flatten)]
    pub counts: PtyFdCounts,
}

/// File-descriptor accounting for the host and all workers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FdReport {
    pub soft_limit: u64,
    pub hard_limit: u64,
    pub open_fds: usize,
    pub host_pty: PtyFdCounts,
    pub workers: Vec<WorkerFdReport>,
    /// Host + worker masters.
    pub total_masters: usize,
    /// Host + worker slaves.
    pub total_slaves: usize,
}

/// One process in the host's child tree.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessNode {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub name: String,
    /// Single-letter state: R/S/I/T/Z/D, `?` when unknown.
    pub state: String,
    pub rss_bytes: u64,
    pub vsz_bytes: u64,
}

/// The host's direct and transitive children.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessTreeReport {
    pub direct_children: usize,
    pub total_descendants: usize,
    pub zombies: usize,
    pub processes: Vec<ProcessNode>,
}

/// System-wide counters and host memory figures.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemReport {
    pub system_open_files: Option<u64>,
    pub system_file_limit: Option<u64>,
    pub pty_devices_used: Option<u64>,
    pub pty_device_limit: Option<u64>,
    pub load_average: (f64, f64, f64),
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub host_rss_bytes: u64,
}

/// The aggregated diagnostics view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsReport {
    pub fds: FdReport,
    pub process_tree: ProcessTreeReport,
    pub system: SystemReport,
    pub pty_instances_created_total: u64,
    pub terminate_signals_total: u64,
    pub active_sessions: usize,
    pub spawn_errors: Vec<SpawnError>,
    pub warnings: Vec<String>,
}

/// Collects the full report for a supervisor.
pub async fn collect(supervisor: &ShellSupervisor) -> DiagnosticsReport {
    let (soft_limit, hard_limit) = fdstat::fd_limits();
    let open_fds = fdstat::open_fd_count();
    let host_pty = fdstat::count_pty_fds();

    let workers: Vec<WorkerFdReport> = supervisor
        .worker_pty_fd_counts()
        .await
        .into_iter()
        .map(|(session_id, counts)| WorkerFdReport { session_id, counts })
        .collect();
    let total_masters = host_pty.masters + workers.iter().map(|w| w.counts.masters).sum::<usize>();
    let total_slaves = host_pty.slaves + workers.iter().map(|w| w.counts.slaves).sum::<usize>();

    let (process_tree, mut system) = probe_os().await;
    if let Some((used, max)) = fdstat::system_file_usage() {
        system.system_open_files = Some(used);
        system.system_file_limit = Some(max);
    }
    if let Some((used, max)) = fdstat::pty_device_usage() {
        system.pty_devices_used = Some(used);
        system.pty_device_limit = Some(max);
    }

    let active_sessions = supervisor.active_count();
    let warnings = classify_warnings(&WarningInputs {
        open_fds: open_fds as u64,
        soft_limit,
        total_master_fds: total_masters,
        active_sessions,
        process_count: process_tree.total_descendants,
        process_limit: process_limit(),
        zombies: process_tree.zombies,
    });

    DiagnosticsReport {
        fds: FdReport {
            soft_limit,
            hard_limit,
            open_fds,
            host_pty,
            workers,
            total_masters,
            total_slaves,
        },
        process_tree,
        system,
        pty_instances_created_total: supervisor.pty_instances_created_total(),
        terminate_signals_total: supervisor.terminate_signals_total(),
        active_sessions,
        spawn_errors: supervisor.spawn_errors(),
        warnings,
    }
}

/// Blocking process-table and memory probes, time-boxed off the runtime.
async fn probe_os() -> (ProcessTreeReport, SystemReport) {
    let probe = tokio::task::spawn_blocking(|| {
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        sys.refresh_memory();
        let tree = build_process_tree(&sys, std::process::id());

        let load = System::load_average();
        let host_rss = sys
            .process(Pid::from_u32(std::process::id()))
            .map(|p| p.memory())
            .unwrap_or(0);
        let system = SystemReport {
            system_open_files: None,
            system_file_limit: None,
            pty_devices_used: None,
            pty_device_limit: None,
            load_average: (load.one, load.five, load.fifteen),
            total_memory_bytes: sys.total_memory(),
            available_memory_bytes: sys.available_memory(),
            host_rss_bytes: host_rss,
        };
        (tree, system)
    });
    match tokio::time::timeout(PROBE_TIMEOUT, probe).await {
        Ok(Ok(result)) => result,
        _ => {
            log::warn!("OS diagnostics probe timed out after {PROBE_TIMEOUT:?}");
            (ProcessTreeReport::default(), SystemReport::default())
        }
    }
}

/// DFS over the process table from `root_pid`, excluding the root itself.
fn build_process_tree(sys: &System, root_pid: u32) -> ProcessTreeReport {
    let mut children_map: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            children_map.entry(parent).or_default().push(*pid);
        }
    }

    let root = Pid::from_u32(root_pid);
    let direct_children = children_map.get(&root).map(|c| c.len()).unwrap_or(0);

    let mut processes = Vec::new();
    let mut zombies = 0;
    let mut stack: Vec<Pid> = children_map.get(&root).cloned().unwrap_or_default();
    while let Some(pid) = stack.pop() {
        if let Some(process) = sys.process(pid) {
            let state = state_letter(process.status());
            if state == "Z" {
                zombies += 1;
            }
            processes.push(ProcessNode {
                pid: pid.as_u32(),
                parent_pid: process.parent().map(|p| p.as_u32()),
                name: process.name().to_string_lossy().to_string(),
                state: state.to_string(),
                rss_bytes: process.memory(),
                vsz_bytes: process.virtual_memory(),
            });
            if let Some(children) = children_map.get(&pid) {
                stack.extend(children.iter().copied());
            }
        }
    }

    ProcessTreeReport {
        direct_children,
        total_descendants: processes.len(),
        zombies,
        processes,
    }
}

fn state_letter(status: ProcessStatus) -> &'static str {
    match status {
        ProcessStatus::Run => "R",
        ProcessStatus::Sleep => "S",
        ProcessStatus::Idle => "I",
        ProcessStatus::Stop => "T",
        ProcessStatus::Zombie => "Z",
        ProcessStatus::UninterruptibleDiskSleep => "D",
        _ => "?",
    }
}

fn process_limit() -> Option<u64> {
    #[cfg(unix)]
    {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        let rc = unsafe { libc::getrlimit(libc::RLIMIT_NPROC, &mut limit) };
        if rc == 0 && limit.rlim_cur != libc::RLIM_INFINITY {
            return Some(limit.rlim_cur as u64);
        }
    }
    None
}

pub(crate) struct WarningInputs {
    pub open_fds: u64,
    pub soft_limit: u64,
    pub total_master_fds: usize,
    pub active_sessions: usize,
    pub process_count: usize,
    pub process_limit: Option<u64>,
    pub zombies: usize,
}

/// Turns raw counters into the textual warnings the UI surfaces.
pub(crate) fn classify_warnings(inputs: &WarningInputs) -> Vec<String> {
    let mut warnings = Vec::new();

    if inputs.soft_limit > 0 {
        let usage = inputs.open_fds as f64 / inputs.soft_limit as f64;
        if usage > FD_CRITICAL_FRACTION {
            warnings.push(format!(
                "critical: file descriptor usage at {:.0}% of the soft limit ({}/{})",
                usage * 100.0,
                inputs.open_fds,
                inputs.soft_limit
            ));
        } else if usage > FD_WARN_FRACTION {
            warnings.push(format!(
                "file descriptor usage at {:.0}% of the soft limit ({}/{})",
                usage * 100.0,
                inputs.open_fds,
                inputs.soft_limit
            ));
        }
    }

    if inputs.soft_limit > 0 && inputs.soft_limit < FD_SOFT_LIMIT_FLOOR {
        warnings.push(format!(
            "file descriptor soft limit is only {}; raise it above {FD_SOFT_LIMIT_FLOOR} for multi-session use",
            inputs.soft_limit
        ));
    }

    if let Some(limit) = inputs.process_limit {
        if limit > 0 && inputs.process_count as f64 > limit as f64 * 0.9 {
            warnings.push(format!(
                "child process count {} is above 90% of the process limit {limit}",
                inputs.process_count
            ));
        }
    }

    if inputs.zombies > 0 {
        warnings.push(format!(
            "{} zombie process(es) in the child tree",
            inputs.zombies
        ));
    }

    if inputs.process_count > CHILD_TREE_CEILING {
        warnings.push(format!(
            "child process tree has {} processes; sessions may be leaking children",
            inputs.process_count
        ));
    }

    if inputs.total_master_fds > inputs.active_sessions * 3 {
        warnings.push(format!(
            "potential PTY leak: {} master fds open for {} active session(s)",
            inputs.total_master_fds, inputs.active_sessions
        ));
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_inputs() -> WarningInputs {
        WarningInputs {
            open_fds: 40,
            soft_limit: 1024,
            total_master_fds: 2,
            active_sessions: 2,
            process_count: 4,
            process_limit: Some(10_000),
            zombies: 0,
        }
    }

    #[test]
    fn healthy_system_has_no_warnings() {
        assert!(classify_warnings(&quiet_inputs()).is_empty());
    }

    #[test]
    fn fd_pressure_tiers() {
        let mut inputs = quiet_inputs();
        inputs.open_fds = 800; // 78%
        let warnings = classify_warnings(&inputs);
        assert_eq!(warnings.len(), 1);
        assert!(!warnings[0].starts_with("critical"));

        inputs.open_fds = 950; // 93%
        let warnings = classify_warnings(&inputs);
        assert!(warnings[0].starts_with("critical"));
    }

    #[test]
    fn low_soft_limit_flagged() {
        let mut inputs = quiet_inputs();
        inputs.soft_limit = 128;
        inputs.open_fds = 10;
        let warnings = classify_warnings(&inputs);
        assert!(warnings.iter().any(|w| w.contains("soft limit is only 128")));
    }

    #[test]
    fn zombies_and_oversized_tree_flagged() {
        let mut inputs = quiet_inputs();
        inputs.zombies = 2;
        inputs.process_count = CHILD_TREE_CEILING + 1;
        let warnings = classify_warnings(&inputs);
        assert!(warnings.iter().any(|w| w.contains("zombie")));
        assert!(warnings.iter().any(|w| w.contains("may be leaking children")));
    }

    #[test]
    fn pty_leak_heuristic() {
        let mut inputs = quiet_inputs();
        inputs.active_sessions = 1;
        inputs.total_master_fds = 4;
        let warnings = classify_warnings(&inputs);
        assert!(warnings.iter().any(|w| w.contains("potential PTY leak")));

        inputs.total_master_fds = 3;
        assert!(classify_warnings(&inputs).is_empty());
    }

    #[test]
    fn state_letters_cover_the_interesting_states() {
        assert_eq!(state_letter(ProcessStatus::Zombie), "Z");
        assert_eq!(state_letter(ProcessStatus::Run), "R");
        assert_eq!(state_letter(ProcessStatus::UninterruptibleDiskSleep), "D");
    }
}
