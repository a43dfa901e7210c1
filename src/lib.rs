//! Canopy: a PTY session supervisor for hosts that run many git worktrees,
//! each attached to its own interactive shell.
//!
//! The supervisor ([`core::ShellSupervisor`]) keeps the authoritative
//! session registry and routes client traffic; every PTY lives in its own
//! `canopy-worker` child process so that killing the worker deterministically
//! frees the PTY and everything it holds. Recent output is ring-buffered per
//! session for replay to late-joining subscribers, and the diagnostics
//! collector reports descriptor and process-tree pressure before the OS
//! starts refusing `forkpty`.
//!
//! The host embeds this crate, constructs one supervisor at startup, and
//! wires [`commands::dispatch`] to its transport:
//!
//! ```no_run
//! use canopy_shell::commands::{dispatch, ShellRequest};
//! use canopy_shell::core::{ShellSupervisor, SupervisorConfig};
//!
//! # async fn host() {
//! let supervisor = ShellSupervisor::new(SupervisorConfig::default());
//! let response = dispatch(
//!     &supervisor,
//!     ShellRequest::Start {
//!         worktree_path: "/repos/app/.worktrees/feature".into(),
//!         cols: Some(120),
//!         rows: Some(40),
//!         force_new: None,
//!         terminal_id: Some("tab-1".into()),
//!         set_locale: None,
//!     },
//! )
//! .await;
//! # let _ = response;
//! # }
//! ```

pub mod commands;
pub mod core;

pub use core::{ShellError, ShellSupervisor, SupervisorConfig};
