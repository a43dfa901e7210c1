//! Platform shim owning one PTY pair and the shell attached to it.
//!
//! One adapter instance equals one OS PTY. Output is pumped by a dedicated
//! reader thread into a bounded channel (the consumer sees chunks one at a
//! time, in order); the child's exit status is observed by a waiter thread
//! and delivered exactly once through a watch channel.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, watch};

use super::error::ShellError;

/// How long `kill_force` waits for the exit watcher before resolving anyway.
const KILL_SAFETY_WINDOW: Duration = Duration::from_millis(500);

/// Launch parameters for one PTY session.
#[derive(Debug, Clone)]
pub struct PtyLaunch {
    /// Shell executable. `None` falls back to `$SHELL`, then `/bin/sh`.
    pub shell: Option<String>,
    /// Working directory for the shell (the session's worktree).
    pub cwd: String,
    /// Extra environment entries applied over the inherited environment.
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
    /// Set `LANG` from the system default when the environment lacks one.
    pub set_locale: bool,
}

/// A live PTY with its shell child.
pub struct PtyAdapter {
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    child_pid: u32,
    #[cfg(unix)]
    pgid: i32,
    output_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    exit_rx: watch::Receiver<Option<i32>>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    waiter_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PtyAdapter {
    /// Allocates a PTY pair and spawns the shell attached to its slave end.
    ///
    /// The child becomes a session and process-group leader (portable-pty
    /// calls `setsid()` on spawn), so signals to `-pgid` reach the whole
    /// tree. Dimensions are normalized to at least 1x1. Spawn failures
    /// preserve the OS error string verbatim; the adapter never retries.
    pub fn open(launch: &PtyLaunch) -> Result<Self, ShellError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: launch.rows.max(1),
                cols: launch.cols.max(1),
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| spawn_error(format!("Failed to open PTY: {e}")))?;

        let shell = launch.shell.clone().unwrap_or_else(default_shell);
        let mut cmd = CommandBuilder::new(&shell);
        for arg in shell_args(&shell) {
            cmd.arg(arg);
        }
        cmd.cwd(&launch.cwd);
        prepare_env(&mut cmd, &launch.env, launch.set_locale);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| spawn_error(format!("Failed to spawn shell: {e}")))?;

        let child_pid = child
            .process_id()
            .ok_or_else(|| spawn_error("Could not obtain child PID".to_string()))?;

        #[cfg(unix)]
        let pgid = pair
            .master
            .process_group_leader()
            .unwrap_or(child_pid as i32);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| spawn_error(format!("Failed to take PTY writer: {e}")))?;

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| spawn_error(format!("Failed to clone PTY reader: {e}")))?;

        // Dedicated OS thread for blocking PTY reads. EOF (shell exited and
        // the slave side closed) or a fatal error ends the loop.
        let (tx, rx) = mpsc::channel::<Vec<u8>>(256);
        let reader_handle = std::thread::Builder::new()
            .name(format!("pty-reader-{child_pid}"))
            .spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.blocking_send(buf[..n].to_vec()).is_err() {
                                log::warn!("PTY reader {child_pid}: consumer gone, dropping {n} bytes");
                                break;
                            }
                        }
                        Err(e) => {
                            #[cfg(unix)]
                            {
                                let raw = e.raw_os_error().unwrap_or(0);
                                if raw == libc::EAGAIN || raw == libc::EINTR {
                                    continue;
                                }
                            }
                            log::debug!("PTY reader {child_pid} error: {e}");
                            break;
                        }
                    }
                }
                log::debug!("PTY reader {child_pid} exited");
            })
            .map_err(|e| spawn_error(format!("Failed to spawn reader thread: {e}")))?;

        // Waiter thread: observes the child's exit status exactly once.
        let (exit_tx, exit_rx) = watch::channel(None::<i32>);
        let mut waited_child = child;
        let waiter_handle = std::thread::Builder::new()
            .name(format!("pty-wait-{child_pid}"))
            .spawn(move || {
                let code = match waited_child.wait() {
                    Ok(status) => status.exit_code() as i32,
                    Err(e) => {
                        log::debug!("PTY child {child_pid} wait error: {e}");
                        -1
                    }
                };
                let _ = exit_tx.send(Some(code));
            })
            .map_err(|e| spawn_error(format!("Failed to spawn wait thread: {e}")))?;

        // The master keeps the PTY alive; the slave handle is no longer
        // needed in this process.
        drop(pair.slave);

        #[cfg(unix)]
        log::info!("Opened PTY (pid={child_pid}, pgid={pgid}, shell={shell})");
        #[cfg(not(unix))]
        log::info!("Opened PTY (pid={child_pid}, shell={shell})");

        Ok(Self {
            writer: Mutex::new(Some(writer)),
            master: Mutex::new(Some(pair.master)),
            child_pid,
            #[cfg(unix)]
            pgid,
            output_rx: Mutex::new(Some(rx)),
            exit_rx,
            reader_handle: Mutex::new(Some(reader_handle)),
            waiter_handle: Mutex::new(Some(waiter_handle)),
        })
    }

    /// PID of the shell child.
    pub fn child_pid(&self) -> u32 {
        self.child_pid
    }

    /// Takes the output channel. Yields raw chunks in read order; can only
    /// be taken once.
    pub fn take_output(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.output_rx.lock().ok()?.take()
    }

    /// A receiver that resolves to the child's exit code once it exits.
    pub fn exit_watch(&self) -> watch::Receiver<Option<i32>> {
        self.exit_rx.clone()
    }

    /// Exit code, if the child has already exited.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    /// Writes raw bytes to the PTY master and flushes immediately. Partial
    /// lines are valid; nothing is buffered. Empty writes are no-ops.
    pub fn write(&self, data: &[u8]) -> Result<(), ShellError> {
        if data.is_empty() {
            return Ok(());
        }
        let mut guard = self
            .writer
            .lock()
            .map_err(|e| ShellError::write_failed(format!("Writer lock poisoned: {e}")))?;
        let writer = guard
            .as_mut()
            .ok_or_else(|| ShellError::write_failed("PTY already closed"))?;
        writer
            .write_all(data)
            .map_err(|e| ShellError::write_failed(format!("Write failed: {e}")))?;
        writer
            .flush()
            .map_err(|e| ShellError::write_failed(format!("Flush failed: {e}")))?;
        Ok(())
    }

    /// Resizes the controlling terminal, propagating SIGWINCH to the child.
    /// Dimensions are normalized to at least 1x1.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), ShellError> {
        let guard = self
            .master
            .lock()
            .map_err(|e| ShellError::resize_failed(format!("Master lock poisoned: {e}")))?;
        let master = guard
            .as_ref()
            .ok_or_else(|| ShellError::resize_failed("PTY already closed"))?;
        master
            .resize(PtySize {
                rows: rows.max(1),
                cols: cols.max(1),
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ShellError::resize_failed(format!("Resize failed: {e}")))?;
        Ok(())
    }

    /// Sends SIGKILL to the shell's process group and waits for the exit
    /// watcher to confirm. Falls back to signaling the child PID if the
    /// group signal fails. Resolves with the exit code, or `None` when the
    /// 500 ms safety window elapses first.
    pub async fn kill_force(&self) -> Option<i32> {
        if let Some(code) = self.exit_code() {
            return Some(code);
        }
        self.signal_kill();

        let mut exit_rx = self.exit_rx.clone();
        let waited = tokio::time::timeout(KILL_SAFETY_WINDOW, async {
            loop {
                if let Some(code) = *exit_rx.borrow() {
                    return code;
                }
                if exit_rx.changed().await.is_err() {
                    return -1;
                }
            }
        })
        .await;

        match waited {
            Ok(code) => Some(code),
            Err(_) => {
                log::warn!(
                    "PTY child {} did not report exit within {:?} of SIGKILL",
                    self.child_pid,
                    KILL_SAFETY_WINDOW
                );
                None
            }
        }
    }

    #[cfg(unix)]
    fn signal_kill(&self) {
        // Negative pgid reaches the whole group.
        let rc = unsafe { libc::kill(-self.pgid, libc::SIGKILL) };
        if rc != 0 {
            log::warn!(
                "SIGKILL of process group {} failed: {}; falling back to pid {}",
                self.pgid,
                std::io::Error::last_os_error(),
                self.child_pid
            );
            let rc = unsafe { libc::kill(self.child_pid as i32, libc::SIGKILL) };
            if rc != 0 {
                log::warn!(
                    "SIGKILL of pid {} failed: {}",
                    self.child_pid,
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_kill(&self) {
        use std::process::Command;
        let result = Command::new("taskkill")
            .args(["/PID", &self.child_pid.to_string(), "/T", "/F"])
            .output();
        if let Err(e) = result {
            log::warn!("taskkill of pid {} failed: {e}", self.child_pid);
        }
    }

    /// Closes the master side and joins the I/O threads. Called after the
    /// child is known (or forced) to be dead.
    pub fn dispose(&self) {
        if let Ok(mut guard) = self.output_rx.lock() {
            guard.take();
        }
        // Dropping writer and master closes the PTY fds, which EOFs the
        // reader thread if it is still blocked in read().
        if let Ok(mut writer) = self.writer.lock() {
            writer.take();
        }
        if let Ok(mut master) = self.master.lock() {
            master.take();
        }
        if let Ok(mut handle) = self.reader_handle.lock() {
            if let Some(h) = handle.take() {
                let _ = h.join();
            }
        }
        if let Ok(mut handle) = self.waiter_handle.lock() {
            if let Some(h) = handle.take() {
                let _ = h.join();
            }
        }
    }
}

impl Drop for PtyAdapter {
    fn drop(&mut self) {
        if self.exit_code().is_none() {
            self.signal_kill();
        }
    }
}

fn spawn_error(message: String) -> ShellError {
    let os_code = super::error::errno_from_message(&message);
    ShellError::spawn_failed(message, os_code)
}

fn default_shell() -> String {
    #[cfg(unix)]
    {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
    #[cfg(not(unix))]
    {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    }
}

/// Extra arguments for the shell. bash/zsh-family shells get `-l` so the
/// session has a login environment; anything else is launched bare.
pub fn shell_args(shell: &str) -> Vec<&'static str> {
    let name = shell.rsplit('/').next().unwrap_or(shell);
    if name == "bash" || name == "zsh" || name.starts_with("bash-") || name.starts_with("zsh-") {
        vec!["-l"]
    } else {
        Vec::new()
    }
}

/// Prepares the child environment: inherit, drop variables that would make
/// embedded-runtime CLIs misbehave, apply caller overrides, then fill in
/// `LANG` when requested and absent.
fn prepare_env(cmd: &mut CommandBuilder, overrides: &HashMap<String, String>, set_locale: bool) {
    // A leaked ELECTRON_RUN_AS_NODE makes every Node-based CLI spawned from
    // this shell run as a bare script interpreter instead of its own app.
    cmd.env_remove("ELECTRON_RUN_AS_NODE");

    for (key, value) in overrides {
        cmd.env(key, value);
    }

    if set_locale && needs_lang(overrides) {
        cmd.env("LANG", default_lang());
    }
}

fn needs_lang(overrides: &HashMap<String, String>) -> bool {
    match overrides.get("LANG") {
        Some(value) => value.is_empty(),
        None => std::env::var("LANG").map(|v| v.is_empty()).unwrap_or(true),
    }
}

/// System default locale in `LANG` form.
///
/// On macOS this is derived from the user locale preference; everywhere
/// else (and on any failure) it falls back to `en_US.UTF-8`.
pub fn default_lang() -> String {
    #[cfg(target_os = "macos")]
    {
        if let Ok(output) = std::process::Command::new("defaults")
            .args(["read", "-g", "AppleLocale"])
            .output()
        {
            if output.status.success() {
                let locale = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !locale.is_empty() {
                    // AppleLocale may carry qualifiers like "en_US@currency=USD".
                    let base = locale.split('@').next().unwrap_or(&locale);
                    return format!("{base}.UTF-8");
                }
            }
        }
    }
    "en_US.UTF-8".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_flag_only_for_bash_zsh_family() {
        assert_eq!(shell_args("/bin/bash"), vec!["-l"]);
        assert_eq!(shell_args("/usr/bin/zsh"), vec!["-l"]);
        assert_eq!(shell_args("zsh"), vec!["-l"]);
        assert!(shell_args("/bin/sh").is_empty());
        assert!(shell_args("/usr/bin/fish").is_empty());
        assert!(shell_args("/opt/homebrew/bin/nu").is_empty());
    }

    #[test]
    fn default_lang_is_utf8() {
        assert!(default_lang().ends_with(".UTF-8"));
    }

    #[test]
    fn lang_override_suppresses_locale_fill() {
        let mut overrides = HashMap::new();
        overrides.insert("LANG".to_string(), "de_DE.UTF-8".to_string());
        assert!(!needs_lang(&overrides));
    }

    #[test]
    fn empty_lang_override_still_fills() {
        let mut overrides = HashMap::new();
        overrides.insert("LANG".to_string(), String::new());
        // An explicitly empty LANG counts as unset.
        assert!(needs_lang(&overrides));
    }
}
