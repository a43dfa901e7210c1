//! File-descriptor accounting for the current process, plus the system-wide
//! fd and PTY device counters the diagnostics report includes.
//!
//! A process can only enumerate its own descriptors portably, which is why
//! workers self-report their counts over IPC instead of the supervisor
//! peeking at them.

use serde::Serialize;

/// PTY-related descriptor counts for one process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PtyFdCounts {
    /// Descriptors whose path resolves to the PTY multiplexer (`/dev/ptmx`).
    pub masters: usize,
    /// Descriptors on PTY slave devices (`/dev/pts/N`, `/dev/ttys*`).
    pub slaves: usize,
    /// masters + slaves.
    pub total: usize,
}

/// Soft and hard `RLIMIT_NOFILE` for this process.
pub fn fd_limits() -> (u64, u64) {
    #[cfg(unix)]
    {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
        if rc == 0 {
            return (limit.rlim_cur as u64, limit.rlim_max as u64);
        }
    }
    (0, 0)
}

/// Number of open descriptors in this process.
pub fn open_fd_count() -> usize {
    open_fds().len()
}

/// Classifies this process's descriptors into PTY masters and slaves.
pub fn count_pty_fds() -> PtyFdCounts {
    let mut counts = PtyFdCounts::default();
    for fd in open_fds() {
        match fd_path(fd) {
            Some(path) if is_pty_master_path(&path) => counts.masters += 1,
            Some(path) if is_pty_slave_path(&path) => counts.slaves += 1,
            _ => {}
        }
    }
    counts.total = counts.masters + counts.slaves;
    counts
}

fn is_pty_master_path(path: &str) -> bool {
    path == "/dev/ptmx" || path.starts_with("/dev/ptmx")
}

fn is_pty_slave_path(path: &str) -> bool {
    path.starts_with("/dev/pts/") || path.starts_with("/dev/ttys") || path.starts_with("/dev/ttyp")
}

#[cfg(target_os = "linux")]
fn open_fds() -> Vec<i32> {
    match std::fs::read_dir("/proc/self/fd") {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_string_lossy().parse::<i32>().ok())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[cfg(target_os = "macos")]
fn open_fds() -> Vec<i32> {
    match std::fs::read_dir("/dev/fd") {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_string_lossy().parse::<i32>().ok())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn open_fds() -> Vec<i32> {
    Vec::new()
}

#[cfg(target_os = "linux")]
fn fd_path(fd: i32) -> Option<String> {
    std::fs::read_link(format!("/proc/self/fd/{fd}"))
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}

#[cfg(target_os = "macos")]
fn fd_path(fd: i32) -> Option<String> {
    // F_GETPATH resolves the descriptor's path; /dev/fd entries are not
    // symlinks on macOS.
    let mut buf = [0u8; libc::PATH_MAX as usize];
    let rc = unsafe { libc::fcntl(fd, libc::F_GETPATH, buf.as_mut_ptr()) };
    if rc < 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Some(String::from_utf8_lossy(&buf[..end]).into_owned())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn fd_path(_fd: i32) -> Option<String> {
    None
}

/// System-wide open-file count and limit, when the platform exposes them.
pub fn system_file_usage() -> Option<(u64, u64)> {
    #[cfg(target_os = "linux")]
    {
        // /proc/sys/fs/file-nr: "<allocated> <free> <max>"
        let text = std::fs::read_to_string("/proc/sys/fs/file-nr").ok()?;
        let mut fields = text.split_whitespace();
        let used: u64 = fields.next()?.parse().ok()?;
        let _free = fields.next()?;
        let max: u64 = fields.next()?.parse().ok()?;
        return Some((used, max));
    }
    #[cfg(target_os = "macos")]
    {
        let used = sysctl_u64("kern.num_files")?;
        let max = sysctl_u64("kern.maxfiles")?;
        return Some((used, max));
    }
    #[allow(unreachable_code)]
    None
}

/// Count of allocated kernel PTY devices and the kernel limit.
pub fn pty_device_usage() -> Option<(u64, u64)> {
    #[cfg(target_os = "linux")]
    {
        let read_u64 = |path: &str| -> Option<u64> {
            std::fs::read_to_string(path).ok()?.trim().parse().ok()
        };
        let used = read_u64("/proc/sys/kernel/pty/nr")?;
        let max = read_u64("/proc/sys/kernel/pty/max")?;
        return Some((used, max));
    }
    #[cfg(target_os = "macos")]
    {
        let max = sysctl_u64("kern.tty.ptmx_max")?;
        let used = std::fs::read_dir("/dev")
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_name().to_string_lossy().starts_with("ttys"))
                    .count() as u64
            })
            .unwrap_or(0);
        return Some((used, max));
    }
    #[allow(unreachable_code)]
    None
}

#[cfg(target_os = "macos")]
fn sysctl_u64(name: &str) -> Option<u64> {
    use std::ffi::CString;
    let cname = CString::new(name).ok()?;
    let mut value: i64 = 0;
    let mut len = std::mem::size_of::<i64>();
    let rc = unsafe {
        libc::sysctlbyname(
            cname.as_ptr(),
            &mut value as *mut i64 as *mut libc::c_void,
            &mut len,
            std::ptr::null_mut(),
            0,
        )
    };
    if rc == 0 && value >= 0 {
        Some(value as u64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_are_sane() {
        let (soft, hard) = fd_limits();
        assert!(soft > 0);
        assert!(hard >= soft);
    }

    #[test]
    fn counts_at_least_stdio() {
        // stdin/stdout/stderr are open while tests run.
        assert!(open_fd_count() >= 3);
    }

    #[test]
    fn pty_classification_by_path() {
        assert!(is_pty_master_path("/dev/ptmx"));
        assert!(is_pty_slave_path("/dev/pts/3"));
        assert!(is_pty_slave_path("/dev/ttys001"));
        assert!(!is_pty_slave_path("/dev/null"));
        assert!(!is_pty_master_path("/dev/tty"));
    }

    #[test]
    fn counting_self_does_not_panic() {
        let counts = count_pty_fds();
        assert_eq!(counts.total, counts.masters + counts.slaves);
    }
}
