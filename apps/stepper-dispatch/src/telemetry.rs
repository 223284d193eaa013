use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Install the global subscriber. Later calls are no-ops, so binaries and
/// tests may both call it.
pub fn init_tracing(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|err| {
        eprintln!("invalid log filter {filter:?} ({err}); falling back to info");
        EnvFilter::new("info")
    });
    let fmt_layer = fmt::layer().with_target(true);
    if Registry::default()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
    {
        tracing::debug!(build = env!("STEPPER_BUILD_ID"), "tracing initialised");
    }
}
