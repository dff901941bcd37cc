//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::EnvFilter;

/// The environment variable consulted for log filtering, in addition to `RUST_LOG`.
pub const LOG_ENV: &str = "BOOT_TO_TALOS_LOG";

/// Initialize tracing with the default configuration.
pub fn initialize_tracing() {
    // Don't include timestamps and such because they're not really useful and
    // too verbose, and plus several log targets such as journald will already
    // include timestamps.
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    // Our own variable wins over the generic one so that an operator can turn
    // up the kexec/efivarfs chatter without drowning in dependency output.
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // Log to stderr by default
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();
}
