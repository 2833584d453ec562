use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

/// Returns a token that is cancelled once the process receives SIGINT or
/// SIGTERM (Ctrl+C only on non-Unix). Pipelines and servers hold child
/// tokens, so cancellation propagates root-to-leaf from here.
pub fn cancel_on_shutdown() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        let signal = wait_for_signal().await;
        eprintln!("{}", format!("🛑 Shutting down on {signal}").red());
        signal_token.cancel();
    });
    token
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    // K8s sends SIGTERM on pod deletion; SIGINT covers interactive runs.
    let mut sigint = signal(SignalKind::interrupt()).expect("install signal handlers");
    let mut sigterm = signal(SignalKind::terminate()).expect("install signal handlers");

    tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    tokio::signal::ctrl_c()
        .await
        .expect("install signal handlers");
    "Ctrl+C"
}
