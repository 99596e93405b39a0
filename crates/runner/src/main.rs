//! Demo runner entry point.

use runner::config::Config;
use runner::demo;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, stopping");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, stopping");
        }
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let config = Config::from_env();

    // 1. Initialize tracing
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(config.json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!config.json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Run the demo until it finishes or we are told to stop
    tracing::info!(?config, "starting demo");
    let code = tokio::select! {
        result = demo::run(&config) => match result {
            Ok(report) => {
                tracing::info!(
                    reservation = %report.reservation.outcome,
                    cancellation = %report.cancellation.outcome,
                    notifications = report.notifications.len(),
                    "demo finished"
                );
                if let Some(trail) = report.trail {
                    tracing::info!(log = %trail.log, "audit trail");
                }
                std::process::ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!(error = %e, "demo failed");
                std::process::ExitCode::FAILURE
            }
        },
        () = shutdown_signal() => std::process::ExitCode::FAILURE,
    };

    // 4. Report metrics
    tracing::info!(metrics = %metrics_handle.render(), "metrics snapshot");
    code
}
