pub mod shell;

pub use shell::{
    dispatch, forward_registry_events, subscribe_events, ShellEvent, ShellRequest, ShellResponse,
};
