use anyhow::Context;
use signal_hook::consts::{SIGINT, SIGTERM};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Route SIGINT and SIGTERM into a flag the orchestrator polls.
///
/// The process keeps running after a signal so rollback can finish; the
/// caller decides the exit code from the run report.
pub fn interrupt_flag() -> anyhow::Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    for sig in [SIGINT, SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(&flag))
            .with_context(|| format!("failed to install handler for signal {sig}"))?;
    }
    Ok(flag)
}
