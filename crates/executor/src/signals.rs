use std::backtrace::Backtrace;

use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;

const SIGTERM_BANNER: &str = "Received SIGTERM : Dumping stack trace";

fn stack_dump() -> String {
    format!("{SIGTERM_BANNER}\n{}", Backtrace::force_capture())
}

/// Dumps a stack trace to stdout and exits with status 1 on SIGTERM.
///
/// The trace is the stack of the task that received the signal. Tokio tasks
/// are not threads, so the reaper, informer and cleanup loops do not appear
/// in it; a task stuck in one of them shows up only through its last log
/// lines.
pub fn setup_stack_trace_handler() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        if sigterm.recv().await.is_some() {
            println!("{}", stack_dump());
            std::process::exit(1);
        }
    });
    Ok(())
}
