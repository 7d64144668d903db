//! Test helpers shared by the telefab crates.

/// Enable tracing with the RUST_LOG environment variable.
///
/// This is intended to be used in tests, so it defaults to DEBUG level.
pub fn enable_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::DEBUG.into())
                .from_env_lossy(),
        )
        .try_init();
}

/// Poll a condition block until it `break`s or the timeout elapses.
///
/// The block runs immediately, then every `interval` milliseconds. On
/// timeout the macro panics, failing the test.
#[macro_export]
macro_rules! iter_check {
    ($timeout_ms:expr, $interval_ms:expr, $code:block) => {{
        let deadline = std::time::Instant::now()
            + std::time::Duration::from_millis($timeout_ms);
        loop {
            $code
            if std::time::Instant::now() > deadline {
                panic!(
                    "iter_check timed out after {}ms",
                    $timeout_ms
                );
            }
            tokio::time::sleep(std::time::Duration::from_millis(
                $interval_ms,
            ))
            .await;
        }
    }};
}
