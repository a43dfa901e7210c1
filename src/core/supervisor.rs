//! The session supervisor: authoritative registry and router for all PTY
//! sessions.
//!
//! Each session lives in its own worker process (`canopy-worker`); the
//! supervisor holds only handles. It routes writes and resizes down, fans
//! output out to subscribers with ring-buffered replay, terminates sessions
//! exactly once no matter how many callers race, and keeps the counters the
//! diagnostics report draws from.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinSet;

use super::error::{errno_from_message, ShellError};
use super::fdstat::PtyFdCounts;
use super::ipc::{self, WorkerCommand, WorkerEvent};
use super::output_ring::{OutputRing, DEFAULT_RING_CAPACITY};
use super::session::{
    derive_session_id, random_session_id, SessionInfo, SessionState, SpawnError, SupervisorStats,
};

/// Callback receiving raw output bytes for one session. Invoked in order,
/// one call at a time; must not call back into the supervisor synchronously.
pub type OutputSink = Arc<dyn Fn(&[u8]) + Send + Sync>;
/// Callback receiving a session's exit code, fired at most once.
pub type ExitSink = Arc<dyn Fn(i32) + Send + Sync>;
/// Callback receiving the live `worktree_path -> session count` map after
/// every registry mutation.
pub type SessionsChangedSink = Arc<dyn Fn(&HashMap<String, usize>) + Send + Sync>;

/// Environment toggle for test harnesses: skip graceful worker shutdown in
/// `terminate` paths and SIGKILL worker processes directly.
pub const FORCED_EXIT_ENV: &str = "CANOPY_FORCED_EXIT";

/// Tunables for the supervisor. `Default` matches production behavior.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Worker binary. `None` resolves to `$CANOPY_WORKER_EXE`, then a
    /// `canopy-worker` sibling of the current executable.
    pub worker_exe: Option<PathBuf>,
    /// Byte cap of each session's replay ring.
    pub ring_capacity: usize,
    /// Delay before a new subscriber's replay runs, giving the client
    /// emulator time to finish attaching. Tunable; the right value depends
    /// on the emulator.
    pub replay_delay: Duration,
    /// Max wait for a spawned worker's `Ready`.
    pub ready_timeout: Duration,
    /// Max wait for the `Started` ack after issuing `Start`.
    pub start_timeout: Duration,
    /// Max wait for worker exit after ordering termination before the
    /// session is declared gone anyway.
    pub kill_timeout: Duration,
    /// Per-worker budget for diagnostics and foreground-process queries.
    pub diagnostics_timeout: Duration,
    /// How many spawn failures the diagnostics ring retains.
    pub spawn_error_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_exe: None,
            ring_capacity: DEFAULT_RING_CAPACITY,
            replay_delay: Duration::from_millis(50),
            ready_timeout: Duration::from_secs(5),
            start_timeout: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(5),
            diagnostics_timeout: Duration::from_secs(2),
            spawn_error_capacity: 20,
        }
    }
}

impl SupervisorConfig {
    fn resolve_worker_exe(&self) -> PathBuf {
        if let Some(path) = &self.worker_exe {
            return path.clone();
        }
        if let Ok(path) = std::env::var("CANOPY_WORKER_EXE") {
            return PathBuf::from(path);
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("canopy-worker")))
            .unwrap_or_else(|| PathBuf::from("canopy-worker"))
    }
}

/// Parameters for [`ShellSupervisor::start_session`].
#[derive(Debug, Clone)]
pub struct StartSessionRequest {
    pub worktree_path: String,
    pub cols: u16,
    pub rows: u16,
    pub set_locale: bool,
    /// Client-side terminal handle. Sessions carrying one are reusable:
    /// starting again with the same handle attaches to the live session.
    pub terminal_id: Option<String>,
    /// Spawn a fresh session even when one exists for `terminal_id`.
    pub force_new: bool,
}

/// Result of a successful `start_session`.
#[derive(Debug, Clone)]
pub struct StartSessionReply {
    pub session_id: String,
    /// `true` when an existing session was returned instead of spawning.
    pub reused: bool,
}

struct Subscriber {
    token: u64,
    output: OutputSink,
    exit: ExitSink,
    /// Ring snapshot captured at subscribe time, delivered by the replay
    /// timer. Empty when replay was skipped.
    replay: Vec<u8>,
    /// Live chunks that arrived before the replay ran; flushed after it.
    pending: Vec<Vec<u8>>,
    replay_done: bool,
}

struct OutputState {
    ring: OutputRing,
    subscribers: HashMap<String, Subscriber>,
    /// Exit code once the session is gone; new subscribers are rejected.
    finalized: Option<i32>,
}

struct SessionEntry {
    id: String,
    worktree_path: String,
    terminal_id: Option<String>,
    shell_pid: u32,
    worker_pid: u32,
    created_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    dims: Mutex<(u16, u16)>,
    state: Mutex<SessionState>,
    commands: mpsc::Sender<WorkerCommand>,
    output: Mutex<OutputState>,
    /// Serializes request/reply queries (diagnostics, foreground process).
    query_lock: AsyncMutex<()>,
    pending_reply: Mutex<Option<oneshot::Sender<WorkerEvent>>>,
    gone_tx: watch::Sender<bool>,
    gone_rx: watch::Receiver<bool>,
    kill_requested: AtomicBool,
    finalized: AtomicBool,
    subscriber_tokens: AtomicU64,
}

impl SessionEntry {
    fn output_state(&self) -> MutexGuard<'_, OutputState> {
        // A panicking subscriber callback must not wedge the session.
        self.output.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_snapshot(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance_state(&self, next: SessionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.can_advance_to(next) {
            *state = next;
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
struct TerminalIndex {
    by_terminal: HashMap<String, String>,
    /// Bumped every time a session bound to the terminal dies, so derived
    /// session ids are never reused within the process lifetime.
    generations: HashMap<String, u64>,
}

struct Inner {
    config: SupervisorConfig,
    sessions: DashMap<String, Arc<SessionEntry>>,
    terminal_index: Mutex<TerminalIndex>,
    spawn_errors: Mutex<VecDeque<SpawnError>>,
    sessions_changed: Mutex<Vec<SessionsChangedSink>>,
    pty_instances_created: AtomicU64,
    terminate_signals: AtomicU64,
}

/// Owns and routes all PTY sessions for the host lifetime.
///
/// Wraps an `Arc` so it can be cheaply cloned into background tasks and the
/// request dispatcher without lifetime issues. Constructed once during host
/// startup and passed explicitly wherever it is needed.
#[derive(Clone)]
pub struct ShellSupervisor {
    inner: Arc<Inner>,
}

impl Default for ShellSupervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

impl ShellSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sessions: DashMap::new(),
                terminal_index: Mutex::new(TerminalIndex::default()),
                spawn_errors: Mutex::new(VecDeque::new()),
                sessions_changed: Mutex::new(Vec::new()),
                pty_instances_created: AtomicU64::new(0),
                terminate_signals: AtomicU64::new(0),
            }),
        }
    }

    /// Starts a session for a worktree, or attaches to the live one bound
    /// to `terminal_id`.
    ///
    /// The spawn pipeline: fork the worker, await its `Ready` (timeout kills
    /// the half-initialized worker), issue `Start`, await the `Started` ack.
    /// Failures at any stage are recorded in the spawn-error ring and
    /// surfaced with the OS message verbatim.
    pub async fn start_session(
        &self,
        request: StartSessionRequest,
    ) -> Result<StartSessionReply, ShellError> {
        if let Some(existing) = self.find_reusable(&request) {
            log::info!(
                "Reusing session {existing} for terminal {:?}",
                request.terminal_id
            );
            return Ok(StartSessionReply {
                session_id: existing,
                reused: true,
            });
        }

        let session_id = self.allocate_session_id(&request);
        let entry = match self.spawn_session(&session_id, &request).await {
            Ok(entry) => entry,
            Err(e) => {
                self.record_spawn_error(&request.worktree_path, &e.message, e.os_code.clone());
                return Err(e);
            }
        };

        // Register, unless a concurrent start for the same terminal won the
        // race; the loser's worker dies and the incumbent is returned.
        if let Some(winner) = self.register(entry.clone(), request.force_new) {
            log::info!(
                "Lost start race for terminal {:?}; attaching to {winner}",
                request.terminal_id
            );
            if entry.commands.try_send(WorkerCommand::Terminate).is_err() {
                self.kill_worker(&entry);
            }
            return Ok(StartSessionReply {
                session_id: winner,
                reused: true,
            });
        }

        self.emit_sessions_changed();
        log::info!(
            "Started session {session_id} (worktree={}, shell_pid={}, worker_pid={})",
            entry.worktree_path,
            entry.shell_pid,
            entry.worker_pid
        );
        Ok(StartSessionReply {
            session_id,
            reused: false,
        })
    }

    /// Forwards raw bytes to a session's shell. `SessionNotFound` once the
    /// session is absent or terminating. Empty writes are accepted no-ops.
    pub async fn write(&self, session_id: &str, data: &[u8]) -> Result<(), ShellError> {
        let entry = self.live_entry(session_id)?;
        if data.is_empty() {
            return Ok(());
        }
        entry
            .commands
            .send(WorkerCommand::Write {
                data: data.to_vec(),
            })
            .await
            .map_err(|_| ShellError::ipc(format!("Worker link for {session_id} is closed")))?;
        *entry
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Utc::now();
        Ok(())
    }

    /// Forwards new dimensions to a session's PTY. Idempotent.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), ShellError> {
        let entry = self.live_entry(session_id)?;
        entry
            .commands
            .send(WorkerCommand::Resize { cols, rows })
            .await
            .map_err(|_| ShellError::ipc(format!("Worker link for {session_id} is closed")))?;
        *entry.dims.lock().unwrap_or_else(PoisonError::into_inner) = (cols, rows);
        Ok(())
    }

    /// Registers output and exit sinks for a session.
    ///
    /// Unless `skip_replay`, the ring content as of this call is delivered
    /// to `output` after the configured replay delay, strictly before any
    /// live bytes that arrive after subscription. Re-subscribing with the
    /// same `subscriber_id` replaces the previous registration. The
    /// returned guard unsubscribes on drop; dropping it twice or after an
    /// explicit [`Self::unsubscribe`] is a no-op.
    pub fn subscribe(
        &self,
        session_id: &str,
        subscriber_id: &str,
        output: OutputSink,
        exit: ExitSink,
        skip_replay: bool,
    ) -> Result<SubscriptionGuard, ShellError> {
        let entry = self
            .inner
            .sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ShellError::session_not_found(session_id))?;

        let token = entry.subscriber_tokens.fetch_add(1, Ordering::Relaxed);
        {
            let mut out = entry.output_state();
            if out.finalized.is_some() {
                return Err(ShellError::session_not_found(session_id));
            }
            let replay = if skip_replay {
                Vec::new()
            } else {
                out.ring.snapshot()
            };
            out.subscribers.insert(
                subscriber_id.to_string(),
                Subscriber {
                    token,
                    output,
                    exit,
                    replay,
                    pending: Vec::new(),
                    replay_done: skip_replay,
                },
            );
        }

        if !skip_replay {
            let delay = self.inner.config.replay_delay;
            let entry_for_replay = entry.clone();
            let subscriber_id = subscriber_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                run_replay(&entry_for_replay, &subscriber_id, token);
            });
        }

        Ok(SubscriptionGuard {
            session: Arc::downgrade(&entry),
            subscriber_id: subscriber_id.to_string(),
            token,
            released: AtomicBool::new(false),
        })
    }

    /// Removes a subscriber registration. Unknown ids are no-ops; the ring
    /// keeps buffering regardless of subscriber count.
    pub fn unsubscribe(&self, session_id: &str, subscriber_id: &str) {
        if let Some(entry) = self.inner.sessions.get(session_id) {
            entry.output_state().subscribers.remove(subscriber_id);
        }
    }

    /// Terminates a session. Idempotent and race-safe: an absent session is
    /// already-terminated success, and concurrent calls coalesce onto a
    /// single kill signal with every caller observing success.
    pub async fn terminate(&self, session_id: &str) -> bool {
        let Some(entry) = self
            .inner
            .sessions
            .get(session_id)
            .map(|e| e.value().clone())
        else {
            return true;
        };
        self.terminate_entry(entry).await
    }

    /// Terminates every session whose worktree equals `path` (exact string
    /// equality, no prefix matching). Returns how many were terminated.
    pub async fn terminate_for_worktree(&self, path: &str) -> usize {
        let targets: Vec<Arc<SessionEntry>> = self
            .inner
            .sessions
            .iter()
            .filter(|e| e.value().worktree_path == path)
            .map(|e| e.value().clone())
            .collect();
        self.terminate_many(targets).await
    }

    /// Terminates every session. Used on host shutdown; honors the
    /// forced-exit toggle.
    pub async fn terminate_all(&self) -> usize {
        let targets: Vec<Arc<SessionEntry>> = self
            .inner
            .sessions
            .iter()
            .map(|e| e.value().clone())
            .collect();
        self.terminate_many(targets).await
    }

    /// Point-in-time registry snapshot.
    pub fn stats(&self) -> SupervisorStats {
        let sessions: Vec<SessionInfo> = self
            .inner
            .sessions
            .iter()
            .map(|e| {
                let entry = e.value();
                let (cols, rows) = *entry.dims.lock().unwrap_or_else(PoisonError::into_inner);
                SessionInfo {
                    id: entry.id.clone(),
                    worktree_path: entry.worktree_path.clone(),
                    terminal_id: entry.terminal_id.clone(),
                    created_at: entry.created_at,
                    last_activity: *entry
                        .last_activity
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner),
                    subscribers: entry.output_state().subscribers.len(),
                    shell_pid: entry.shell_pid,
                    cols,
                    rows,
                }
            })
            .collect();
        SupervisorStats {
            active_count: sessions.len(),
            sessions,
        }
    }

    /// The session's buffered output (ring concatenation).
    pub fn buffer_snapshot(&self, session_id: &str) -> Result<Vec<u8>, ShellError> {
        let entry = self
            .inner
            .sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ShellError::session_not_found(session_id))?;
        let snapshot = entry.output_state().ring.snapshot();
        Ok(snapshot)
    }

    /// The shell's current foreground child, queried from the worker with
    /// the per-worker diagnostics budget.
    pub async fn foreground_process(
        &self,
        session_id: &str,
    ) -> Result<(Option<u32>, Option<String>), ShellError> {
        let entry = self.live_entry(session_id)?;
        match self
            .query_worker(&entry, WorkerCommand::GetForegroundProcess)
            .await
        {
            Some(WorkerEvent::ForegroundProcess { pid, command }) => Ok((pid, command)),
            _ => Ok((None, None)),
        }
    }

    /// Recorded spawn failures, oldest first.
    pub fn spawn_errors(&self) -> Vec<SpawnError> {
        self.inner
            .spawn_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Registers a sink for registry mutations. The sink receives the live
    /// `worktree_path -> session count` map.
    pub fn on_sessions_changed(&self, sink: SessionsChangedSink) {
        self.inner
            .sessions_changed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    /// Total PTYs successfully created over the process lifetime. Never
    /// decremented.
    pub fn pty_instances_created_total(&self) -> u64 {
        self.inner.pty_instances_created.load(Ordering::Relaxed)
    }

    /// Total kill signals emitted by terminate paths. Coalesced terminates
    /// count once.
    pub fn terminate_signals_total(&self) -> u64 {
        self.inner.terminate_signals.load(Ordering::Relaxed)
    }

    /// Number of live sessions.
    pub fn active_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// PTY fd counts reported by each worker, zeros for workers that miss
    /// the per-worker budget. Used by the diagnostics collector.
    pub async fn worker_pty_fd_counts(&self) -> Vec<(String, PtyFdCounts)> {
        let entries: Vec<Arc<SessionEntry>> = self
            .inner
            .sessions
            .iter()
            .map(|e| e.value().clone())
            .collect();
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let counts = match self.query_worker(&entry, WorkerCommand::Diagnostics).await {
                Some(WorkerEvent::Diagnostics {
                    master_fds,
                    slave_fds,
                    total_pty_fds,
                }) => PtyFdCounts {
                    masters: master_fds,
                    slaves: slave_fds,
                    total: total_pty_fds,
                },
                _ => PtyFdCounts::default(),
            };
            results.push((entry.id.clone(), counts));
        }
        results
    }

    // ---- internals ----

    fn find_reusable(&self, request: &StartSessionRequest) -> Option<String> {
        if request.force_new {
            return None;
        }
        let terminal_id = request.terminal_id.as_ref()?;
        let index = self
            .inner
            .terminal_index
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let session_id = index.by_terminal.get(terminal_id)?;
        if self.inner.sessions.contains_key(session_id) {
            Some(session_id.clone())
        } else {
            None
        }
    }

    fn allocate_session_id(&self, request: &StartSessionRequest) -> String {
        match (&request.terminal_id, request.force_new) {
            (Some(terminal_id), false) => {
                let index = self
                    .inner
                    .terminal_index
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let generation = index.generations.get(terminal_id).copied().unwrap_or(0);
                derive_session_id(&request.worktree_path, terminal_id, generation)
            }
            _ => random_session_id(),
        }
    }

    async fn spawn_session(
        &self,
        session_id: &str,
        request: &StartSessionRequest,
    ) -> Result<Arc<SessionEntry>, ShellError> {
        let exe = self.inner.config.resolve_worker_exe();
        let mut child = Command::new(&exe)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ShellError::spawn_io(
                    &format!("Failed to spawn session worker {}", exe.display()),
                    &e,
                )
            })?;

        let worker_pid = child.id().unwrap_or(0);
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ShellError::spawn_failed("Worker stdin unavailable", None))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ShellError::spawn_failed("Worker stdout unavailable", None))?;
        let mut reader = BufReader::new(stdout);

        // Phase 1: the worker announces itself.
        match await_event(&mut reader, self.inner.config.ready_timeout).await {
            Ok(WorkerEvent::Ready) => {}
            Ok(other) => {
                let _ = child.start_kill();
                return Err(ShellError::spawn_failed(
                    format!("Worker sent {other:?} before Ready"),
                    None,
                ));
            }
            Err(e) => {
                let _ = child.start_kill();
                return Err(e);
            }
        }

        // Phase 2: order the PTY spawn and await the ack.
        let mut stdin = stdin;
        ipc::write_frame(
            &mut stdin,
            &WorkerCommand::Start {
                worktree: request.worktree_path.clone(),
                cols: request.cols,
                rows: request.rows,
                set_locale: request.set_locale,
            },
        )
        .await
        .map_err(|e| ShellError::ipc(format!("Failed to send Start: {e}")))?;

        let shell_pid = match await_event(&mut reader, self.inner.config.start_timeout).await {
            Ok(WorkerEvent::Started { shell_pid }) => shell_pid,
            Ok(WorkerEvent::Error { message }) => {
                let _ = child.start_kill();
                let os_code = errno_from_message(&message);
                return Err(ShellError::spawn_failed(message, os_code));
            }
            Ok(other) => {
                let _ = child.start_kill();
                return Err(ShellError::spawn_failed(
                    format!("Worker sent {other:?} before Started"),
                    None,
                ));
            }
            Err(e) => {
                let _ = child.start_kill();
                return Err(e);
            }
        };

        // The PTY exists from here on, whatever happens to registration.
        self.inner
            .pty_instances_created
            .fetch_add(1, Ordering::Relaxed);

        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>(64);
        let (gone_tx, gone_rx) = watch::channel(false);
        let now = Utc::now();
        let entry = Arc::new(SessionEntry {
            id: session_id.to_string(),
            worktree_path: request.worktree_path.clone(),
            terminal_id: request.terminal_id.clone(),
            shell_pid,
            worker_pid,
            created_at: now,
            last_activity: Mutex::new(now),
            dims: Mutex::new((request.cols.max(1), request.rows.max(1))),
            state: Mutex::new(SessionState::Running),
            commands: command_tx,
            output: Mutex::new(OutputState {
                ring: OutputRing::new(self.inner.config.ring_capacity),
                subscribers: HashMap::new(),
                finalized: None,
            }),
            query_lock: AsyncMutex::new(()),
            pending_reply: Mutex::new(None),
            gone_tx,
            gone_rx,
            kill_requested: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            subscriber_tokens: AtomicU64::new(1),
        });

        tokio::spawn(command_writer(stdin, command_rx));
        tokio::spawn(event_pump(self.clone(), entry.clone(), reader, child));
        Ok(entry)
    }

    /// Inserts the entry into the registry. Returns the incumbent session
    /// id when a live session for the same terminal already exists, unless
    /// `rebind` (a `force_new` start) steals the terminal binding.
    fn register(&self, entry: Arc<SessionEntry>, rebind: bool) -> Option<String> {
        let mut index = self
            .inner
            .terminal_index
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(terminal_id) = &entry.terminal_id {
            if !rebind {
                if let Some(existing) = index.by_terminal.get(terminal_id) {
                    if self.inner.sessions.contains_key(existing) {
                        return Some(existing.clone());
                    }
                }
            }
            index
                .by_terminal
                .insert(terminal_id.clone(), entry.id.clone());
        }
        self.inner.sessions.insert(entry.id.clone(), entry);
        None
    }

    fn live_entry(&self, session_id: &str) -> Result<Arc<SessionEntry>, ShellError> {
        let entry = self
            .inner
            .sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ShellError::session_not_found(session_id))?;
        if !entry.state_snapshot().is_running() {
            return Err(ShellError::session_not_found(session_id));
        }
        Ok(entry)
    }

    async fn terminate_many(&self, targets: Vec<Arc<SessionEntry>>) -> usize {
        let mut set = JoinSet::new();
        for entry in targets {
            let supervisor = self.clone();
            set.spawn(async move { supervisor.terminate_entry(entry).await });
        }
        let mut terminated = 0;
        while let Some(result) = set.join_next().await {
            if matches!(result, Ok(true)) {
                terminated += 1;
            }
        }
        terminated
    }

    async fn terminate_entry(&self, entry: Arc<SessionEntry>) -> bool {
        entry.advance_state(SessionState::Terminating);

        // One kill per session, no matter how many callers race here.
        if !entry.kill_requested.swap(true, Ordering::SeqCst) {
            self.inner.terminate_signals.fetch_add(1, Ordering::Relaxed);
            if forced_exit_mode() {
                log::info!("Forced-exit mode: SIGKILL worker {}", entry.worker_pid);
                self.kill_worker(&entry);
            } else if entry.commands.send(WorkerCommand::Terminate).await.is_err() {
                // Link already down; the event pump will finalize, but make
                // sure the worker is not lingering.
                self.kill_worker(&entry);
            }
        }

        let mut gone = entry.gone_rx.clone();
        let waited = tokio::time::timeout(self.inner.config.kill_timeout, async {
            loop {
                if *gone.borrow_and_update() {
                    return;
                }
                if gone.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;

        if waited.is_err() && !entry.finalized.load(Ordering::SeqCst) {
            log::warn!(
                "Session {} worker (pid={}) did not exit within {:?}; forcing removal",
                entry.id,
                entry.worker_pid,
                self.inner.config.kill_timeout
            );
            self.kill_worker(&entry);
            self.finalize_session(&entry, -1);
        }
        true
    }

    /// Removes the session from the registry, then fires exit sinks. Safe
    /// to call from every failure path; only the first call acts.
    fn finalize_session(&self, entry: &Arc<SessionEntry>, exit_code: i32) {
        if entry.finalized.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut index = self
                .inner
                .terminal_index
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.inner.sessions.remove(&entry.id);
            if let Some(terminal_id) = &entry.terminal_id {
                if index.by_terminal.get(terminal_id) == Some(&entry.id) {
                    index.by_terminal.remove(terminal_id);
                }
                *index.generations.entry(terminal_id.clone()).or_insert(0) += 1;
            }
        }
        entry.advance_state(SessionState::Gone);

        // Registry removal precedes client-visible exit callbacks: a sink
        // that re-queries the supervisor never sees this session.
        let exit_sinks: Vec<ExitSink> = {
            let mut out = entry.output_state();
            out.finalized = Some(exit_code);
            out.subscribers.drain().map(|(_, s)| s.exit).collect()
        };
        for sink in exit_sinks {
            sink(exit_code);
        }

        let _ = entry.gone_tx.send(true);
        self.emit_sessions_changed();
        log::info!("Session {} gone (exit_code={exit_code})", entry.id);
    }

    fn kill_worker(&self, entry: &Arc<SessionEntry>) {
        kill_pid(entry.worker_pid);
    }

    fn record_spawn_error(&self, worktree_path: &str, message: &str, os_code: Option<String>) {
        log::error!("Spawn failed for {worktree_path}: {message}");
        let mut errors = self
            .inner
            .spawn_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        errors.push_back(SpawnError {
            timestamp: Utc::now(),
            worktree_path: worktree_path.to_string(),
            message: message.to_string(),
            os_code,
        });
        let cap = self.inner.config.spawn_error_capacity.max(1);
        while errors.len() > cap {
            errors.pop_front();
        }
    }

    fn emit_sessions_changed(&self) {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for e in self.inner.sessions.iter() {
            *counts.entry(e.value().worktree_path.clone()).or_insert(0) += 1;
        }
        let sinks: Vec<SessionsChangedSink> = self
            .inner
            .sessions_changed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for sink in sinks {
            sink(&counts);
        }
    }

    async fn query_worker(
        &self,
        entry: &Arc<SessionEntry>,
        command: WorkerCommand,
    ) -> Option<WorkerEvent> {
        let _serialized = entry.query_lock.lock().await;
        let (tx, rx) = oneshot::channel();
        *entry
            .pending_reply
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        if entry.commands.send(command).await.is_err() {
            return None;
        }
        match tokio::time::timeout(self.inner.config.diagnostics_timeout, rx).await {
            Ok(Ok(event)) => Some(event),
            _ => {
                // Budget blown or link lost; clear the slot so a stale reply
                // cannot satisfy the next query.
                entry
                    .pending_reply
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                None
            }
        }
    }
}

/// Delivers one chunk to a session: ring first, then fan-out. Subscribers
/// whose replay is still pending queue the chunk behind it.
fn deliver_output(entry: &Arc<SessionEntry>, data: Vec<u8>) {
    let mut out = entry.output_state();
    if out.finalized.is_some() {
        return;
    }
    for subscriber in out.subscribers.values_mut() {
        if subscriber.replay_done {
            (subscriber.output)(&data);
        } else {
            subscriber.pending.push(data.clone());
        }
    }
    out.ring.push(data);
}

/// Runs a subscriber's deferred replay: snapshot first, then every live
/// chunk queued while the replay was pending.
fn run_replay(entry: &Arc<SessionEntry>, subscriber_id: &str, token: u64) {
    let mut out = entry.output_state();
    let Some(subscriber) = out.subscribers.get_mut(subscriber_id) else {
        return;
    };
    if subscriber.token != token || subscriber.replay_done {
        return;
    }
    let replay = std::mem::take(&mut subscriber.replay);
    let pending = std::mem::take(&mut subscriber.pending);
    subscriber.replay_done = true;
    let sink = subscriber.output.clone();
    if !replay.is_empty() {
        sink(&replay);
    }
    for chunk in pending {
        sink(&chunk);
    }
}

/// Owns the worker's stdin: serializes commands onto the wire. Closing the
/// channel drops stdin, which EOFs the worker and makes it clean up.
async fn command_writer(mut stdin: ChildStdin, mut rx: mpsc::Receiver<WorkerCommand>) {
    while let Some(command) = rx.recv().await {
        if let Err(e) = ipc::write_frame(&mut stdin, &command).await {
            log::debug!("Worker command write failed: {e}");
            break;
        }
    }
}

/// Owns the worker's stdout and the child handle: forwards output into the
/// session, remembers the shell's exit code, answers queries, and
/// finalizes the session when the worker goes away.
async fn event_pump(
    supervisor: ShellSupervisor,
    entry: Arc<SessionEntry>,
    mut reader: BufReader<tokio::process::ChildStdout>,
    mut child: Child,
) {
    let mut shell_exit: Option<i32> = None;
    loop {
        match ipc::read_frame::<_, WorkerEvent>(&mut reader).await {
            Ok(Some(WorkerEvent::Output { data })) => deliver_output(&entry, data),
            Ok(Some(WorkerEvent::Exit { code })) => shell_exit = Some(code),
            Ok(Some(event @ WorkerEvent::Diagnostics { .. }))
            | Ok(Some(event @ WorkerEvent::ForegroundProcess { .. })) => {
                if let Some(tx) = entry
                    .pending_reply
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                {
                    let _ = tx.send(event);
                }
            }
            Ok(Some(WorkerEvent::Error { message })) => {
                log::warn!("Session {} worker error: {message}", entry.id);
            }
            Ok(Some(WorkerEvent::Ready)) | Ok(Some(WorkerEvent::Started { .. })) => {}
            Ok(None) => break,
            Err(e) => {
                log::warn!("Session {} IPC failure: {e}", entry.id);
                break;
            }
        }
    }

    // Reap the worker; its exit status stands in for the shell's when the
    // link died before an Exit event arrived.
    let worker_status = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
    let exit_code = match (shell_exit, worker_status) {
        (Some(code), _) => code,
        (None, Ok(Ok(status))) => status.code().unwrap_or(-1),
        _ => {
            let _ = child.start_kill();
            -1
        }
    };
    supervisor.finalize_session(&entry, exit_code);
}

async fn await_event(
    reader: &mut BufReader<tokio::process::ChildStdout>,
    budget: Duration,
) -> Result<WorkerEvent, ShellError> {
    match tokio::time::timeout(budget, ipc::read_frame::<_, WorkerEvent>(reader)).await {
        Ok(Ok(Some(event))) => Ok(event),
        Ok(Ok(None)) => Err(ShellError::spawn_failed(
            "Worker exited before completing startup",
            None,
        )),
        Ok(Err(e)) => Err(ShellError::spawn_failed(
            format!("Worker IPC failure during startup: {e}"),
            None,
        )),
        Err(_) => Err(ShellError::spawn_failed(
            format!("Timed out after {budget:?} waiting for the session worker"),
            None,
        )),
    }
}

fn forced_exit_mode() -> bool {
    std::env::var(FORCED_EXIT_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    if pid == 0 {
        return;
    }
    let rc = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            log::warn!("SIGKILL of worker {pid} failed: {err}");
        }
    }
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) {
    if pid == 0 {
        return;
    }
    use std::process::Command;
    if let Err(e) = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .output()
    {
        log::warn!("taskkill of worker {pid} failed: {e}");
    }
}

/// Handle tied to one subscription. Dropping it unsubscribes; release is
/// idempotent and token-checked so a stale guard can never remove a newer
/// subscriber registered under the same id.
#[derive(Debug)]
pub struct SubscriptionGuard {
    session: Weak<SessionEntry>,
    subscriber_id: String,
    token: u64,
    released: AtomicBool,
}

impl SubscriptionGuard {
    /// Explicitly removes the registration. Calling twice is a no-op.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(entry) = self.session.upgrade() {
            let mut out = entry.output_state();
            if out
                .subscribers
                .get(&self.subscriber_id)
                .map(|s| s.token == self.token)
                .unwrap_or(false)
            {
                out.subscribers.remove(&self.subscriber_id);
            }
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor_with_bad_worker() -> ShellSupervisor {
        ShellSupervisor::new(SupervisorConfig {
            worker_exe: Some(PathBuf::from("/nonexistent/canopy-worker")),
            ..SupervisorConfig::default()
        })
    }

    fn start_request(worktree: &str) -> StartSessionRequest {
        StartSessionRequest {
            worktree_path: worktree.to_string(),
            cols: 80,
            rows: 24,
            set_locale: false,
            terminal_id: None,
            force_new: false,
        }
    }

    #[tokio::test]
    async fn terminate_of_unknown_session_is_success() {
        let supervisor = supervisor_with_bad_worker();
        assert!(supervisor.terminate("no-such-session").await);
        assert_eq!(supervisor.terminate_signals_total(), 0);
    }

    #[tokio::test]
    async fn write_and_resize_unknown_session_not_found() {
        let supervisor = supervisor_with_bad_worker();
        let err = supervisor.write("missing", b"x").await.unwrap_err();
        assert_eq!(err.code, crate::core::error::ErrorCode::SessionNotFound);
        let err = supervisor.resize("missing", 80, 24).await.unwrap_err();
        assert_eq!(err.code, crate::core::error::ErrorCode::SessionNotFound);
    }

    #[tokio::test]
    async fn subscribe_unknown_session_not_found() {
        let supervisor = supervisor_with_bad_worker();
        let err = supervisor
            .subscribe(
                "missing",
                "sub",
                Arc::new(|_: &[u8]| {}),
                Arc::new(|_: i32| {}),
                false,
            )
            .unwrap_err();
        assert_eq!(err.code, crate::core::error::ErrorCode::SessionNotFound);
    }

    #[tokio::test]
    async fn failed_spawn_is_recorded_and_surfaced() {
        let supervisor = supervisor_with_bad_worker();
        let err = supervisor
            .start_session(start_request("/tmp/w"))
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::core::error::ErrorCode::SpawnFailed);
        assert_eq!(err.os_code.as_deref(), Some("ENOENT"));

        let errors = supervisor.spawn_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].worktree_path, "/tmp/w");
        assert_eq!(errors[0].os_code.as_deref(), Some("ENOENT"));
        assert_eq!(supervisor.pty_instances_created_total(), 0);
        assert_eq!(supervisor.active_count(), 0);
    }

    #[tokio::test]
    async fn spawn_error_ring_is_bounded_and_chronological() {
        let supervisor = ShellSupervisor::new(SupervisorConfig {
            worker_exe: Some(PathBuf::from("/nonexistent/canopy-worker")),
            spawn_error_capacity: 3,
            ..SupervisorConfig::default()
        });
        for i in 0..5 {
            let _ = supervisor
                .start_session(start_request(&format!("/tmp/w{i}")))
                .await;
        }
        let errors = supervisor.spawn_errors();
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0].worktree_path, "/tmp/w2");
        assert_eq!(errors[2].worktree_path, "/tmp/w4");
        assert!(errors.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn stats_empty_registry() {
        let supervisor = supervisor_with_bad_worker();
        let stats = supervisor.stats();
        assert_eq!(stats.active_count, 0);
        assert!(stats.sessions.is_empty());
    }

    #[test]
    fn worker_exe_resolution_prefers_config() {
        let config = SupervisorConfig {
            worker_exe: Some(PathBuf::from("/custom/worker")),
            ..SupervisorConfig::default()
        };
        assert_eq!(config.resolve_worker_exe(), PathBuf::from("/custom/worker"));
    }
}
