pub mod diagnostics;
pub mod error;
pub mod fdstat;
pub mod ipc;
pub mod output_ring;
pub mod pty_adapter;
pub mod session;
pub mod supervisor;
pub mod worker;

pub use diagnostics::DiagnosticsReport;
pub use error::{ErrorCode, ShellError};
pub use fdstat::PtyFdCounts;
pub use output_ring::OutputRing;
pub use pty_adapter::{PtyAdapter, PtyLaunch};
pub use session::{SessionInfo, SessionState, SpawnError, SupervisorStats};
pub use supervisor::{
    ExitSink, OutputSink, SessionsChangedSink, ShellSupervisor, StartSessionReply,
    StartSessionRequest, SubscriptionGuard, SupervisorConfig, FORCED_EXIT_ENV,
};
