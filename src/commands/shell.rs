//! External request/response surface of the supervisor.
//!
//! The host transport (whatever local IPC it uses) deserializes client
//! frames into [`ShellRequest`], calls [`dispatch`], and ships the
//! [`ShellResponse`] back. Validation lives here, at the edge; the
//! supervisor itself only sees well-formed operations. Push traffic going
//! the other way is typed as [`ShellEvent`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::core::diagnostics::{self, DiagnosticsReport};
use crate::core::session::{SessionInfo, SpawnError};
use crate::core::supervisor::{
    ExitSink, OutputSink, ShellSupervisor, StartSessionRequest, SubscriptionGuard,
};

/// Largest terminal dimension a client may request.
const MAX_DIMENSION: u16 = 500;
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Client requests, tagged by method name.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method")]
pub enum ShellRequest {
    #[serde(rename = "shell:start")]
    Start {
        worktree_path: String,
        cols: Option<u16>,
        rows: Option<u16>,
        force_new: Option<bool>,
        terminal_id: Option<String>,
        set_locale: Option<bool>,
    },
    #[serde(rename = "shell:write")]
    Write { process_id: String, data: String },
    #[serde(rename = "shell:resize")]
    Resize {
        process_id: String,
        cols: u16,
        rows: u16,
    },
    #[serde(rename = "shell:terminate")]
    Terminate { process_id: String },
    #[serde(rename = "shell:terminate-for-worktree")]
    TerminateForWorktree { worktree_path: String },
    #[serde(rename = "shell:get-stats")]
    GetStats,
    #[serde(rename = "shell:get-foreground-process")]
    GetForegroundProcess { process_id: String },
    #[serde(rename = "shell:get-buffer")]
    GetBuffer { process_id: String },
    #[serde(rename = "shell:get-spawn-errors")]
    GetSpawnErrors,
    #[serde(rename = "shell:get-diagnostics")]
    GetDiagnostics,
}

/// Responses, one shape per method.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ShellResponse {
    Start(StartResponse),
    Ack(AckResponse),
    Count(CountResponse),
    Stats(StatsResponse),
    Foreground(ForegroundResponse),
    Buffer(BufferResponse),
    SpawnErrors(Vec<SpawnError>),
    Diagnostics(Box<DiagnosticsReport>),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_new: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CountResponse {
    pub success: bool,
    pub count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub active_process_count: usize,
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForegroundResponse {
    pub success: bool,
    pub pid: Option<u32>,
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Events pushed from the supervisor to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum ShellEvent {
    #[serde(rename = "output")]
    Output { process_id: String, data: String },
    #[serde(rename = "exit")]
    Exit { process_id: String, code: i32 },
    #[serde(rename = "sessions-changed")]
    SessionsChanged { counts: HashMap<String, usize> },
}

/// Routes one request to the supervisor.
pub async fn dispatch(supervisor: &ShellSupervisor, request: ShellRequest) -> ShellResponse {
    match request {
        ShellRequest::Start {
            worktree_path,
            cols,
            rows,
            force_new,
            terminal_id,
            set_locale,
        } => {
            // Reject bad worktrees before any worker is forked; this is a
            // client mistake, not a spawn failure, so the spawn-error ring
            // stays untouched.
            let path = std::path::Path::new(&worktree_path);
            if !path.is_dir() {
                return ShellResponse::Start(StartResponse {
                    success: false,
                    process_id: None,
                    is_new: None,
                    error: Some(format!("worktree '{worktree_path}' is not a directory")),
                });
            }
            let result = supervisor
                .start_session(StartSessionRequest {
                    worktree_path,
                    cols: cols.unwrap_or(DEFAULT_COLS),
                    rows: rows.unwrap_or(DEFAULT_ROWS),
                    set_locale: set_locale.unwrap_or(true),
                    terminal_id,
                    force_new: force_new.unwrap_or(false),
                })
                .await;
            match result {
                Ok(reply) => ShellResponse::Start(StartResponse {
                    success: true,
                    process_id: Some(reply.session_id),
                    is_new: Some(!reply.reused),
                    error: None,
                }),
                Err(e) => ShellResponse::Start(StartResponse {
                    success: false,
                    process_id: None,
                    is_new: None,
                    error: Some(e.message),
                }),
            }
        }
        ShellRequest::Write { process_id, data } => {
            ack(supervisor.write(&process_id, data.as_bytes()).await)
        }
        ShellRequest::Resize {
            process_id,
            cols,
            rows,
        } => {
            if cols == 0 || rows == 0 || cols > MAX_DIMENSION || rows > MAX_DIMENSION {
                return ack(Err(crate::core::ShellError::invalid_request(format!(
                    "Invalid dimensions {cols}x{rows}"
                ))));
            }
            ack(supervisor.resize(&process_id, cols, rows).await)
        }
        ShellRequest::Terminate { process_id } => {
            let success = supervisor.terminate(&process_id).await;
            ShellResponse::Ack(AckResponse {
                success,
                error: None,
            })
        }
        ShellRequest::TerminateForWorktree { worktree_path } => {
            let count = supervisor.terminate_for_worktree(&worktree_path).await;
            ShellResponse::Count(CountResponse {
                success: true,
                count,
            })
        }
        ShellRequest::GetStats => {
            let stats = supervisor.stats();
            ShellResponse::Stats(StatsResponse {
                active_process_count: stats.active_count,
                sessions: stats.sessions,
            })
        }
        ShellRequest::GetForegroundProcess { process_id } => {
            match supervisor.foreground_process(&process_id).await {
                Ok((pid, command)) => ShellResponse::Foreground(ForegroundResponse {
                    success: true,
                    pid,
                    command,
                    error: None,
                }),
                Err(e) => ShellResponse::Foreground(ForegroundResponse {
                    success: false,
                    pid: None,
                    command: None,
                    error: Some(e.message),
                }),
            }
        }
        ShellRequest::GetBuffer { process_id } => match supervisor.buffer_snapshot(&process_id) {
            Ok(bytes) => ShellResponse::Buffer(BufferResponse {
                success: true,
                buffer: Some(String::from_utf8_lossy(&bytes).into_owned()),
                error: None,
            }),
            Err(e) => ShellResponse::Buffer(BufferResponse {
                success: false,
                buffer: None,
                error: Some(e.message),
            }),
        },
        ShellRequest::GetSpawnErrors => ShellResponse::SpawnErrors(supervisor.spawn_errors()),
        ShellRequest::GetDiagnostics => {
            ShellResponse::Diagnostics(Box::new(diagnostics::collect(supervisor).await))
        }
    }
}

fn ack(result: Result<(), crate::core::ShellError>) -> ShellResponse {
    match result {
        Ok(()) => ShellResponse::Ack(AckResponse {
            success: true,
            error: None,
        }),
        Err(e) => ShellResponse::Ack(AckResponse {
            success: false,
            error: Some(e.message),
        }),
    }
}

/// Builds output/exit sinks that turn a session's byte stream into
/// [`ShellEvent`]s on a channel, decoding UTF-8 across chunk boundaries.
///
/// Keep the returned [`SubscriptionGuard`] alive for as long as the client
/// is attached; dropping it unsubscribes.
pub fn subscribe_events(
    supervisor: &ShellSupervisor,
    process_id: &str,
    subscriber_id: &str,
    events: tokio::sync::mpsc::UnboundedSender<ShellEvent>,
    skip_replay: bool,
) -> Result<SubscriptionGuard, crate::core::ShellError> {
    let decoder = Arc::new(Mutex::new(Utf8Decoder::new()));
    let output_id = process_id.to_string();
    let output_tx = events.clone();
    let output: OutputSink = Arc::new(move |bytes: &[u8]| {
        let text = match decoder.lock() {
            Ok(mut decoder) => decoder.decode(bytes),
            Err(_) => String::from_utf8_lossy(bytes).into_owned(),
        };
        if !text.is_empty() {
            let _ = output_tx.send(ShellEvent::Output {
                process_id: output_id.clone(),
                data: text,
            });
        }
    });
    let exit_id = process_id.to_string();
    let exit: ExitSink = Arc::new(move |code: i32| {
        let _ = events.send(ShellEvent::Exit {
            process_id: exit_id.clone(),
            code,
        });
    });
    supervisor.subscribe(process_id, subscriber_id, output, exit, skip_replay)
}

/// Forwards registry mutations to a client event channel as
/// `sessions-changed` events carrying the live worktree -> count map.
pub fn forward_registry_events(
    supervisor: &ShellSupervisor,
    events: tokio::sync::mpsc::UnboundedSender<ShellEvent>,
) {
    supervisor.on_sessions_changed(Arc::new(move |counts: &HashMap<String, usize>| {
        let _ = events.send(ShellEvent::SessionsChanged {
            counts: counts.clone(),
        });
    }));
}

/// Stateful UTF-8 decoder that handles split multi-byte sequences.
///
/// PTY output arrives in arbitrary chunks, so a multi-byte code point can
/// straddle a boundary. A lossy conversion would smear U+FFFD over the
/// split character; this buffers the incomplete tail and prepends it to the
/// next chunk instead.
pub struct Utf8Decoder {
    incomplete: Vec<u8>,
}

impl Default for Utf8Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self {
            incomplete: Vec::with_capacity(4),
        }
    }

    /// Decodes bytes, carrying an incomplete trailing sequence over to the
    /// next call. Invalid bytes inside the chunk are skipped.
    pub fn decode(&mut self, input: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.incomplete);
        data.extend_from_slice(input);

        let mut out = String::with_capacity(data.len());
        let mut rest = data.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&rest[..valid]).unwrap_or(""));
                    match e.error_len() {
                        // Incomplete sequence at the end: keep it for later.
                        None => {
                            self.incomplete = rest[valid..].to_vec();
                            break;
                        }
                        Some(bad) => {
                            rest = &rest[valid + bad..];
                        }
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::core::supervisor::SupervisorConfig;

    fn test_supervisor() -> ShellSupervisor {
        ShellSupervisor::new(SupervisorConfig {
            worker_exe: Some(PathBuf::from("/nonexistent/canopy-worker")),
            ..SupervisorConfig::default()
        })
    }

    #[test]
    fn requests_parse_by_method_name() {
        let request: ShellRequest = serde_json::from_str(
            r#"{"method":"shell:start","worktree_path":"/tmp","cols":120,"rows":40}"#,
        )
        .unwrap();
        assert!(matches!(
            request,
            ShellRequest::Start { cols: Some(120), .. }
        ));

        let request: ShellRequest =
            serde_json::from_str(r#"{"method":"shell:get-stats"}"#).unwrap();
        assert!(matches!(request, ShellRequest::GetStats));

        let request: ShellRequest = serde_json::from_str(
            r#"{"method":"shell:terminate-for-worktree","worktree_path":"/w/a"}"#,
        )
        .unwrap();
        assert!(matches!(request, ShellRequest::TerminateForWorktree { .. }));
    }

    #[tokio::test]
    async fn write_to_missing_session_fails_cleanly() {
        let supervisor = test_supervisor();
        let response = dispatch(
            &supervisor,
            ShellRequest::Write {
                process_id: "ghost".into(),
                data: "ls\r".into(),
            },
        )
        .await;
        match response {
            ShellResponse::Ack(ack) => {
                assert!(!ack.success);
                assert!(ack.error.unwrap().contains("not found"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn resize_rejects_out_of_range_dimensions() {
        let supervisor = test_supervisor();
        for (cols, rows) in [(0u16, 24u16), (80, 0), (501, 24), (80, 501)] {
            let response = dispatch(
                &supervisor,
                ShellRequest::Resize {
                    process_id: "ghost".into(),
                    cols,
                    rows,
                },
            )
            .await;
            match response {
                ShellResponse::Ack(ack) => {
                    assert!(!ack.success);
                    assert!(ack.error.unwrap().contains("Invalid dimensions"));
                }
                other => panic!("unexpected response: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn terminate_missing_session_succeeds() {
        let supervisor = test_supervisor();
        let response = dispatch(
            &supervisor,
            ShellRequest::Terminate {
                process_id: "ghost".into(),
            },
        )
        .await;
        match response {
            ShellResponse::Ack(ack) => assert!(ack.success),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_rejects_missing_worktree_without_recording() {
        let supervisor = test_supervisor();
        let response = dispatch(
            &supervisor,
            ShellRequest::Start {
                worktree_path: "/definitely/not/a/dir".into(),
                cols: None,
                rows: None,
                force_new: None,
                terminal_id: None,
                set_locale: None,
            },
        )
        .await;
        match response {
            ShellResponse::Start(start) => {
                assert!(!start.success);
                assert!(start.error.unwrap().contains("not a directory"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
        assert!(supervisor.spawn_errors().is_empty());
    }

    #[test]
    fn decoder_joins_split_multibyte_sequences() {
        let mut decoder = Utf8Decoder::new();
        let emoji = "a🎉b".as_bytes();
        let first = decoder.decode(&emoji[..3]); // splits the emoji
        let second = decoder.decode(&emoji[3..]);
        assert_eq!(format!("{first}{second}"), "a🎉b");
    }

    #[test]
    fn decoder_skips_truly_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        let text = decoder.decode(&[b'x', 0xff, b'y']);
        assert_eq!(text, "xy");
    }

    #[test]
    fn responses_serialize_camel_case() {
        let response = ShellResponse::Start(StartResponse {
            success: true,
            process_id: Some("s-1".into()),
            is_new: Some(true),
            error: None,
        });
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""processId":"s-1""#));
        assert!(json.contains(r#""isNew":true"#));

        let response = ShellResponse::Stats(StatsResponse {
            active_process_count: 0,
            sessions: Vec::new(),
        });
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""activeProcessCount":0"#));

        let response = ShellResponse::SpawnErrors(vec![SpawnError {
            timestamp: chrono::Utc::now(),
            worktree_path: "/w".into(),
            message: "forkpty failed".into(),
            os_code: Some("EMFILE".into()),
        }]);
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""worktreePath":"/w""#));
        assert!(json.contains(r#""osCode":"EMFILE""#));
    }

    #[test]
    fn events_serialize_with_tagged_names() {
        let event = ShellEvent::Exit {
            process_id: "s-1".into(),
            code: 0,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"exit""#));
    }
}
