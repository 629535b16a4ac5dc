use meterproxy::error::AppError;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,meterproxy=debug")),
        )
        .json()
        .init();

    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let state = meterproxy::app::load_state().await?;
    let listener = tokio::net::TcpListener::bind(state.runtime.listen.as_str())
        .await
        .map_err(|err| AppError::startup("listen_failed", err.to_string()))?;
    let local_addr = listener
        .local_addr()
        .map_err(|err| AppError::startup("listen_failed", err.to_string()))?;
    tracing::info!(%local_addr, upstream = %state.forwarder.base_url(), "metering proxy ready");

    axum::serve(listener, meterproxy::app::build_app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::startup("serve_failed", err.to_string()))?;
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
