/// Initialize structured logging. Call once at startup; respects
/// `RUST_LOG`, defaulting to INFO.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .try_init();
}
