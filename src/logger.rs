//! Logging setup. The engine never calls `println!`; every notable event
//! goes through `tracing`, and fatal protocol violations (spec §7's
//! "abort after emitting a fatal log" policy) are logged at `ERROR`
//! immediately before the panic that tears the process down.

use crate::config::LogLevel;

/// Install a global `tracing` subscriber at the configured level. Safe to
/// call more than once; later calls are no-ops, matching how a host
/// application that embeds this engine alongside its own logging won't
/// have this crate fight over the global subscriber.
pub fn install(level: LogLevel) {
    let Some(level) = level.to_tracing() else {
        return;
    };
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_silent_is_a_no_op() {
        install(LogLevel::Silent);
    }
}
