//! Supervisor <-> worker wire protocol.
//!
//! A closed pair of message enums carried as newline-delimited JSON over the
//! worker's stdin/stdout. Every frame is wrapped in an envelope with a
//! protocol version; frames with an unknown version are rejected at decode
//! time. Terminal byte payloads are base64 so frames stay line-safe.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Current wire version. Bump on any incompatible message change.
pub const PROTOCOL_VERSION: u8 = 1;

/// Commands sent down from the supervisor to a session worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Open the PTY and launch the shell in `worktree`.
    Start {
        worktree: String,
        cols: u16,
        rows: u16,
        set_locale: bool,
    },
    /// Raw bytes for the shell's stdin.
    Write {
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    /// New terminal dimensions.
    Resize { cols: u16, rows: u16 },
    /// Kill the PTY process group and exit the worker.
    Terminate,
    /// Report the worker's own PTY file-descriptor counts.
    Diagnostics,
    /// Report the shell's current foreground child, if any.
    GetForegroundProcess,
}

/// Events sent up from a session worker to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// The command loop is installed; the worker accepts commands.
    Ready,
    /// `Start` succeeded; the shell is running.
    Started { shell_pid: u32 },
    /// Raw PTY output.
    Output {
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    /// The shell exited on its own with this status.
    Exit { code: i32 },
    /// A fatal worker-side failure (PTY spawn, I/O). The message preserves
    /// the underlying OS error string verbatim.
    Error { message: String },
    /// Reply to `Diagnostics`.
    Diagnostics {
        master_fds: usize,
        slave_fds: usize,
        total_pty_fds: usize,
    },
    /// Reply to `GetForegroundProcess`. Both fields are `None` when the
    /// shell is idle.
    ForegroundProcess {
        pid: Option<u32>,
        command: Option<String>,
    },
}

/// Codec failures. I/O errors cover a peer that went away mid-stream.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is missing the protocol version field")]
    MissingVersion,
    #[error("frame did not serialize to a JSON object")]
    NotAnObject,
    #[error("unsupported protocol version {0} (expected {PROTOCOL_VERSION})")]
    UnsupportedVersion(u64),
}

/// Encodes a message as a single JSON line (no trailing newline), stamping
/// the protocol version into the frame.
pub fn encode<T: Serialize>(msg: &T) -> Result<String, CodecError> {
    let mut value = serde_json::to_value(msg)?;
    match value {
        serde_json::Value::Object(ref mut map) => {
            map.insert("v".to_string(), PROTOCOL_VERSION.into());
        }
        _ => return Err(CodecError::NotAnObject),
    }
    Ok(serde_json::to_string(&value)?)
}

/// Decodes one JSON line, enforcing the envelope version.
pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, CodecError> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    let version = value
        .get("v")
        .and_then(|v| v.as_u64())
        .ok_or(CodecError::MissingVersion)?;
    if version != u64::from(PROTOCOL_VERSION) {
        return Err(CodecError::UnsupportedVersion(version));
    }
    Ok(serde_json::from_value(value)?)
}

/// Writes one framed message and flushes.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = encode(msg)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next framed message. Returns `None` on a clean EOF. Blank
/// lines are skipped.
pub async fn read_frame<R, T>(reader: &mut BufReader<R>) -> Result<Option<T>, CodecError>
where
    R: tokio::io::AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return decode(trimmed).map(Some);
    }
}

/// base64 (de)serialization for raw byte payloads.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
