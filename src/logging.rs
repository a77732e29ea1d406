// One-time tracing subscriber init, matching the "completed" tracing wiring
// implied by the teacher's manifest (it depends on `tracing` but never
// finishes hooking up a subscriber).

pub fn init(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
