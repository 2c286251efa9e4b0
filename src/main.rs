use pneumonia_detector_grpc::service::PneumoniaDetectorService;
use pneumonia_detector_grpc::service::pneumonia_detector_service::{
    self, pneumonia_detector_server::PneumoniaDetectorServer,
};
use pneumonia_detector_grpc::{ServiceConfig, shared_runner};
use tokio::signal;
use tonic::transport::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// Headroom for the protobuf framing around the image bytes.
const MESSAGE_OVERHEAD: usize = 64 * 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config = ServiceConfig::from_env()?;
    info!("Starting with {:?}", config);

    // Load before accepting traffic so a bad artifact stops the process.
    let runner_config = config.runner.clone();
    let runner = tokio::task::spawn_blocking(move || shared_runner(&runner_config)).await??;
    info!(
        "Model {} ready on {}",
        runner.model_version(),
        runner.execution_context()
    );

    let detector_service =
        PneumoniaDetectorService::new(runner, config.max_image_bytes, config.fetch_timeout)?;

    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(pneumonia_detector_service::FILE_DESCRIPTOR_SET)
        .build_v1()?;

    info!("PneumoniaDetectorServer listening on {}", config.bind_addr);

    Server::builder()
        .add_service(
            PneumoniaDetectorServer::new(detector_service)
                .max_decoding_message_size(config.max_image_bytes + MESSAGE_OVERHEAD),
        )
        .add_service(reflection_service)
        .serve_with_shutdown(config.bind_addr, shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pneumonia_detector_grpc=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
