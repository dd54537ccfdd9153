use clap::Parser;
use courier_server::cli::Cli;
use courier_server::{app, telemetry};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Cli::parse().into_settings()?;

    telemetry::init_tracing(&settings.telemetry)?;
    if let Some(port) = settings.telemetry.metrics_port {
        telemetry::install_metrics_exporter(port)?;
    }

    app::run(settings, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c; running until killed");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
    })
    .await
}
