use tokio::signal;
use tracing::info;

/// 关闭信号类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM
    Term,

    /// SIGINT / Ctrl+C
    Interrupt,
}

/// 等待系统关闭信号
#[cfg(unix)]
pub async fn wait_for_shutdown() -> anyhow::Result<ShutdownSignal> {
    use signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let received = tokio::select! {
        _ = sigterm.recv() => ShutdownSignal::Term,
        _ = sigint.recv() => ShutdownSignal::Interrupt,
    };
    info!(target: "gb28181d", signal = ?received, "Received shutdown signal");
    Ok(received)
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown() -> anyhow::Result<ShutdownSignal> {
    signal::ctrl_c().await?;
    info!(target: "gb28181d", "Received Ctrl+C");
    Ok(ShutdownSignal::Interrupt)
}
