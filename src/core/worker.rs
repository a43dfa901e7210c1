//! Session worker: the process that isolates one PTY.
//!
//! The supervisor spawns one worker per session and talks to it over
//! stdin/stdout frames ([`crate::core::ipc`]). Everything the PTY allocates
//! lives in this process, so killing the worker deterministically frees the
//! descriptors and the shell's process group. The loop here must never
//! outlive its PTY: on `Terminate`, on a lost IPC link, or after the shell
//! exits, the worker cleans up and exits the process.

use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::io::{AsyncWrite, BufReader, Stdin};
use tokio::sync::{mpsc, watch};

use super::fdstat;
use super::ipc::{self, WorkerCommand, WorkerEvent};
use super::pty_adapter::{PtyAdapter, PtyLaunch};

/// Grace period for draining buffered PTY output once the shell has exited.
const EXIT_DRAIN_WINDOW: Duration = Duration::from_millis(100);

/// Runs the worker until termination. Returns the process exit code: 0 for
/// every deliberate shutdown path, 1 only when the worker could not even
/// announce itself.
pub async fn run() -> i32 {
    let stdin = BufReader::new(tokio::io::stdin());
    // Frame reads are pushed through a channel so the main loop can select
    // on them without cancelling a half-read frame.
    let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>(64);
    tokio::spawn(read_commands(stdin, command_tx));
    run_loop(command_rx, tokio::io::stdout()).await
}

/// Pumps decoded frames from stdin into the command channel. Dropping the
/// sender is how the loop learns the IPC link is gone.
async fn read_commands(mut stdin: BufReader<Stdin>, tx: mpsc::Sender<WorkerCommand>) {
    loop {
        match ipc::read_frame::<_, WorkerCommand>(&mut stdin).await {
            Ok(Some(command)) => {
                if tx.send(command).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("IPC decode failure: {e}");
                break;
            }
        }
    }
}

async fn run_loop<W>(mut commands: mpsc::Receiver<WorkerCommand>, mut stdout: W) -> i32
where
    W: AsyncWrite + Unpin,
{
    if send(&mut stdout, &WorkerEvent::Ready).await.is_err() {
        log::error!("Worker could not reach the supervisor; exiting");
        return 1;
    }

    let mut adapter: Option<PtyAdapter> = None;
    let mut output_rx: Option<mpsc::Receiver<Vec<u8>>> = None;
    let mut exit_rx: Option<watch::Receiver<Option<i32>>> = None;

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    log::info!("IPC link closed; shutting down");
                    break;
                };
                match command {
                    WorkerCommand::Start { worktree, cols, rows, set_locale } => {
                        if adapter.is_some() {
                            let _ = send(&mut stdout, &WorkerEvent::Error {
                                message: "Session already started".to_string(),
                            }).await;
                            continue;
                        }
                        let launch = PtyLaunch {
                            shell: None,
                            cwd: worktree,
                            env: Default::default(),
                            cols,
                            rows,
                            set_locale,
                        };
                        match PtyAdapter::open(&launch) {
                            Ok(opened) => {
                                output_rx = opened.take_output();
                                exit_rx = Some(opened.exit_watch());
                                let shell_pid = opened.child_pid();
                                adapter = Some(opened);
                                if send(&mut stdout, &WorkerEvent::Started { shell_pid }).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                log::error!("PTY spawn failed: {}", e.message);
                                let _ = send(&mut stdout, &WorkerEvent::Error {
                                    message: e.message,
                                }).await;
                                return 0;
                            }
                        }
                    }
                    WorkerCommand::Write { data } => {
                        if let Some(pty) = adapter.as_ref() {
                            if let Err(e) = pty.write(&data) {
                                log::debug!("PTY write failed: {e}");
                            }
                        }
                    }
                    WorkerCommand::Resize { cols, rows } => {
                        if let Some(pty) = adapter.as_ref() {
                            if let Err(e) = pty.resize(cols, rows) {
                                log::warn!("PTY resize failed: {e}");
                            }
                        }
                    }
                    WorkerCommand::Terminate => {
                        log::info!("Terminate received");
                        break;
                    }
                    WorkerCommand::Diagnostics => {
                        let counts = fdstat::count_pty_fds();
                        if send(&mut stdout, &WorkerEvent::Diagnostics {
                            master_fds: counts.masters,
                            slave_fds: counts.slaves,
                            total_pty_fds: counts.total,
                        }).await.is_err() {
                            break;
                        }
                    }
                    WorkerCommand::GetForegroundProcess => {
                        let (pid, command) = adapter
                            .as_ref()
                            .map(|pty| foreground_process(pty.child_pid()))
                            .unwrap_or((None, None));
                        if send(&mut stdout, &WorkerEvent::ForegroundProcess { pid, command }).await.is_err() {
                            break;
                        }
                    }
                }
            }
            chunk = recv_output(&mut output_rx) => {
                match chunk {
                    Some(data) => {
                        if send(&mut stdout, &WorkerEvent::Output { data }).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Reader hit EOF; the exit watcher reports the code.
                        output_rx = None;
                    }
                }
            }
            code = wait_exit(&mut exit_rx) => {
                drain_output(&mut stdout, &mut output_rx).await;
                let _ = send(&mut stdout, &WorkerEvent::Exit { code }).await;
                // Release the channel before dispose() joins the reader
                // thread, or a sender blocked on a full channel never exits.
                drop(output_rx.take());
                if let Some(pty) = adapter.take() {
                    pty.dispose();
                }
                log::info!("Shell exited with code {code}");
                return 0;
            }
        }
    }

    // Terminate or lost link: force-kill the PTY group and free everything.
    // The output receiver goes first so a reader blocked on a full channel
    // can exit before dispose() joins it.
    drop(output_rx.take());
    if let Some(pty) = adapter.take() {
        pty.kill_force().await;
        pty.dispose();
    }
    0
}

async fn send<W: AsyncWrite + Unpin>(
    stdout: &mut W,
    event: &WorkerEvent,
) -> Result<(), ipc::CodecError> {
    ipc::write_frame(stdout, event).await
}

/// Receives the next output chunk, or parks forever when no PTY is attached
/// (the select loop is then driven by commands alone).
async fn recv_output(rx: &mut Option<mpsc::Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Resolves once the shell's exit status is known; parks when not started.
async fn wait_exit(rx: &mut Option<watch::Receiver<Option<i32>>>) -> i32 {
    match rx {
        Some(rx) => loop {
            if let Some(code) = *rx.borrow() {
                return code;
            }
            if rx.changed().await.is_err() {
                return -1;
            }
        },
        None => std::future::pending().await,
    }
}

/// Forwards whatever output the reader produced before the exit status was
/// observed, so subscribers see the shell's last words ahead of the exit
/// notification.
async fn drain_output<W: AsyncWrite + Unpin>(
    stdout: &mut W,
    output_rx: &mut Option<mpsc::Receiver<Vec<u8>>>,
) {
    let Some(rx) = output_rx else { return };
    loop {
        match tokio::time::timeout(EXIT_DRAIN_WINDOW, rx.recv()).await {
            Ok(Some(data)) => {
                if send(stdout, &WorkerEvent::Output { data }).await.is_err() {
                    break;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
}

/// The shell's current foreground job: its most recently started immediate
/// child, reported as `(pid, command name)`. `(None, None)` when idle.
pub fn foreground_process(shell_pid: u32) -> (Option<u32>, Option<String>) {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let shell = Pid::from_u32(shell_pid);
    let mut newest: Option<(u64, u32, String)> = None;
    for (pid, process) in sys.processes() {
        if process.parent() == Some(shell) {
            let started = process.start_time();
            let name = process.name().to_string_lossy().to_string();
            if newest.as_ref().map(|(t, _, _)| started >= *t).unwrap_or(true) {
                newest = Some((started, pid.as_u32(), name));
            }
        }
    }
    match newest {
        Some((_, pid, name)) => (Some(pid), Some(name)),
        None => (None, None),
    }
}
