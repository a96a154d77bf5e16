use etcd_counter::{
    config::Config,
    context::ServiceContext,
    coordination::CoordinationClient,
    etcd_store::EtcdCoordinationClient,
    http_server::CounterServer,
    logging::{LoggerManager, LoggingConfig},
    shutdown::ShutdownCoordinator,
    Result,
};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    LoggerManager::new(LoggingConfig::from_config(&config.logging)).initialize()?;

    info!(
        "Starting etcd counter v{} (built: {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIMESTAMP")
    );

    let listen_addr = config.server.socket_addr()?;
    let client: Arc<dyn CoordinationClient> =
        Arc::new(EtcdCoordinationClient::connect(&config.coordination).await?);
    let context = ServiceContext::init(&config, client);

    let shutdown_coordinator = Arc::new(ShutdownCoordinator::new(
        Arc::clone(&context),
        config.shutdown.grace_period,
        config.shutdown.close_timeout,
    ));

    // Runs the whole sequence on its own task once SIGINT or SIGTERM arrives
    let listener = Arc::clone(&shutdown_coordinator);
    let shutdown_task = async move { listener.listen_for_shutdown().await };

    let server = CounterServer::new(listen_addr, Arc::clone(&context));
    if let Err(e) = server
        .serve_until_shutdown(shutdown_coordinator, shutdown_task)
        .await
    {
        error!("HTTP server failed: {}", e);
    }

    // No-op if the sequencer already closed the client
    if let Err(e) = context.teardown().await {
        warn!("Error closing coordination client: {}", e);
    }

    info!("etcd counter shutdown complete");
    Ok(())
}
