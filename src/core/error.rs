use serde::Serialize;
use std::fmt;

/// Discriminant for supervisor errors, serialized to clients for programmatic
/// error handling (e.g., distinguishing "session gone" from "write failed").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    SpawnFailed,
    SessionNotFound,
    WriteFailed,
    ResizeFailed,
    IpcError,
    KillTimeout,
    InvalidRequest,
}

/// Structured supervisor error with a machine-readable code and a
/// human-readable message.
///
/// The message preserves underlying OS error strings verbatim; clients match
/// against substrings such as "posix_spawnp" and "forkpty" to classify
/// resource exhaustion. `os_code` carries the errno name (`EMFILE`, `EAGAIN`,
/// ...) when the failure maps to one. Implements `std::error::Error` so it
/// can be used with `?` in request handlers.
#[derive(Debug, Clone, Serialize)]
pub struct ShellError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_code: Option<String>,
}

impl fmt::Display for ShellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ShellError {}

impl ShellError {
    /// PTY or shell process could not be created. `os_code` is the errno
    /// name when the OS reported one.
    pub fn spawn_failed(msg: impl Into<String>, os_code: Option<String>) -> Self {
        Self {
            code: ErrorCode::SpawnFailed,
            message: msg.into(),
            os_code,
        }
    }

    /// Builds a SpawnFailed from an `io::Error`, keeping the OS string
    /// verbatim and capturing the errno name.
    pub fn spawn_io(context: &str, err: &std::io::Error) -> Self {
        Self::spawn_failed(format!("{context}: {err}"), errno_name(err))
    }

    /// No session exists with the given ID (already terminated or never
    /// created).
    pub fn session_not_found(id: &str) -> Self {
        Self {
            code: ErrorCode::SessionNotFound,
            message: format!("Session {id} not found"),
            os_code: None,
        }
    }

    /// Writing to the PTY stdin failed.
    pub fn write_failed(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::WriteFailed,
            message: msg.into(),
            os_code: None,
        }
    }

    /// PTY resize (SIGWINCH propagation) failed.
    pub fn resize_failed(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::ResizeFailed,
            message: msg.into(),
            os_code: None,
        }
    }

    /// The worker IPC link is broken. Terminal for the session.
    pub fn ipc(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::IpcError,
            message: msg.into(),
            os_code: None,
        }
    }

    /// Worker did not acknowledge exit within the safety window.
    pub fn kill_timeout(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::KillTimeout,
            message: msg.into(),
            os_code: None,
        }
    }

    /// Malformed or out-of-range client request.
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidRequest,
            message: msg.into(),
            os_code: None,
        }
    }
}

/// Extracts the errno name from an OS error string of the form
/// `"... (os error N)"`. Used when a failure message crosses the worker IPC
/// boundary and only the text survives.
pub fn errno_from_message(message: &str) -> Option<String> {
    let idx = message.rfind("os error ")?;
    let digits: String = message[idx + "os error ".len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let raw: i32 = digits.parse().ok()?;
    errno_name(&std::io::Error::from_raw_os_error(raw))
}

/// Maps an `io::Error` to its errno constant name, for the handful of codes
/// that matter when diagnosing PTY exhaustion.
pub fn errno_name(err: &std::io::Error) -> Option<String> {
    let raw = err.raw_os_error()?;
    let name = match raw {
        libc::EMFILE => "EMFILE",
        libc::ENFILE => "ENFILE",
        libc::EAGAIN => "EAGAIN",
        libc::ENOMEM => "ENOMEM",
        libc::EACCES => "EACCES",
        libc::ENOENT => "ENOENT",
        libc::ENXIO => "ENXIO",
        libc::EIO => "EIO",
        _ => return Some(format!("errno {raw}")),
    };
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_io_captures_errno_name() {
        let err = std::io::Error::from_raw_os_error(libc::EMFILE);
        let shell_err = ShellError::spawn_io("forkpty failed", &err);
        assert_eq!(shell_err.code, ErrorCode::SpawnFailed);
        assert!(shell_err.message.starts_with("forkpty failed: "));
        assert_eq!(shell_err.os_code.as_deref(), Some("EMFILE"));
    }

    #[test]
    fn unknown_errno_falls_back_to_number() {
        let err = std::io::Error::from_raw_os_error(9999);
        assert_eq!(errno_name(&err).as_deref(), Some("errno 9999"));
    }

    #[test]
    fn errno_recovered_from_message_text() {
        let io_err = std::io::Error::from_raw_os_error(libc::EAGAIN);
        let message = format!("Failed to spawn shell: forkpty failed: {io_err}");
        assert_eq!(errno_from_message(&message).as_deref(), Some("EAGAIN"));
        assert_eq!(errno_from_message("no errno here"), None);
    }

    #[test]
    fn not_found_is_serializable() {
        let err = ShellError::session_not_found("s-1");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("SessionNotFound"));
        assert!(!json.contains("os_code"));
    }
}
