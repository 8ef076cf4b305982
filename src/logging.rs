use tracing_subscriber::EnvFilter;

/// Installs a subscriber printing scenario events to stderr.
///
/// What is printed is selected through `RUST_LOG`. Stage transitions and
/// converged serials are logged at info level, each poll round at debug
/// level and the DNS exchanges with the servers at trace level. So
/// `RUST_LOG=info,xfr_interop::watch=debug` follows the polling in detail.
///
/// Calling this more than once leaves the first subscriber in place.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_thread_ids(true)
        .without_time()
        .try_init()
        .ok();
}
