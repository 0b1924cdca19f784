use tokio_util::sync::CancellationToken;

/// Resolves on the first SIGINT, SIGTERM or SIGHUP and cancels `shutdown`,
/// which stops every running relay with a `shutdown` trailer.
pub async fn shutdown_signal(shutdown: CancellationToken) {
    let name = wait_for_signal().await;
    tracing::info!("Caught {name}. Shutting down...");
    shutdown.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut sigint), Ok(mut sigterm), Ok(mut sighup)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) else {
        tracing::warn!("Unix signal handlers unavailable, falling back to CTRL+C");
        let _ = tokio::signal::ctrl_c().await;
        return "CTRL+C";
    };

    tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sighup.recv() => "SIGHUP",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "CTRL+C"
}
