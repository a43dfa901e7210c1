//! Session worker entry point.
//!
//! Spawned by the supervisor, one process per PTY session. Speaks the
//! framed protocol on stdin/stdout; logs go to stderr so they never mix
//! with protocol frames.

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let code = canopy_shell::core::worker::run().await;
    std::process::exit(code);
}
