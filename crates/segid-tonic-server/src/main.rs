#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use futures::Stream;
use segid_tonic_core::{
    proto::{FILE_DESCRIPTOR_SET, allocator_server::AllocatorServer},
    segid::{Maintenance, SegmentAllocator},
};
use server::config::{CliArgs, ServerConfig};
use server::coordination::AnyCoordinator;
use server::service::handler::AllocatorService;
use server::store::AnyStore;
use server::telemetry::{TelemetryProviders, init_telemetry};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Connected;
use tonic::{codec::CompressionEncoding, transport::Server};
use tonic_health::server::HealthReporter;
use tonic_reflection::server::Builder;
use tonic_web::GrpcWebLayer;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    if config.uds {
        #[cfg(unix)]
        {
            use tokio::net::UnixListener;
            use tokio_stream::wrappers::UnixListenerStream;
            let uds_path = config.server_addr.clone();
            let uds = UnixListener::bind(&uds_path)?;
            let incoming = UnixListenerStream::new(uds);
            log_startup_info(&uds_path, &config);
            let res = run_server_with_incoming(providers, incoming, config).await;
            let _ = std::fs::remove_file(&uds_path);
            res
        }
        #[cfg(not(unix))]
        {
            anyhow::bail!("Unix domain sockets are not supported on this platform");
        }
    } else {
        let tcp_path = config.server_addr.clone();
        let tcp = TcpListener::bind(&tcp_path).await?;
        let incoming = TcpListenerStream::new(tcp);
        log_startup_info(&tcp_path, &config);
        run_server_with_incoming(providers, incoming, config).await
    }
}

async fn run_server_with_incoming<I, IO, IE>(
    providers: TelemetryProviders,
    incoming: I,
    config: ServerConfig,
) -> anyhow::Result<()>
where
    I: Stream<Item = Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<tower::BoxError>,
{
    let store = Arc::new(AnyStore::open(&config).await?);
    let coordinator = Arc::new(AnyCoordinator::for_store(&store).await?);
    #[cfg(feature = "tracing")]
    tracing::info!(coordinator = coordinator.kind(), "Coordination ready");
    let allocator = Arc::new(SegmentAllocator::new(store, config.allocator.clone())?);

    if config.warm_up {
        match allocator.warm_up_from(coordinator.as_ref()).await {
            Ok(_report) => {
                #[cfg(feature = "tracing")]
                tracing::info!(
                    warmed = _report.warmed.len(),
                    failed = _report.failed.len(),
                    "Warm-up finished"
                );
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_e, "Warm-up skipped, tags load on first use");
            }
        }
    }

    let maintenance_token = CancellationToken::new();
    let maintenance = tokio::spawn(
        Maintenance::new(allocator.clone(), coordinator, config.instance_id.clone())
            .with_interval(config.maintenance_interval)
            .run(maintenance_token.clone()),
    );

    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<AllocatorServer<AllocatorService>>()
        .await;

    let service = AllocatorService::new(allocator, config.max_batch_ids);

    let reflection = Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    Server::builder()
        .accept_http1(true)
        .http2_adaptive_window(Some(true))
        .layer(
            ServiceBuilder::new()
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                )
                .layer(GrpcWebLayer::new()),
        )
        .add_service(health_service.clone())
        .add_service(reflection)
        .add_service(build_allocator_service(service.clone()))
        .serve_with_incoming_shutdown(
            incoming,
            shutdown_signal(
                service,
                health_reporter,
                (maintenance_token, maintenance),
                providers,
            ),
        )
        .await?;

    #[cfg(feature = "tracing")]
    tracing::info!("Service shut down successfully");
    Ok(())
}

fn log_startup_info(_addr: &str, _config: &ServerConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting ID service on {} with full config: {:#?}",
            _addr,
            _config
        );
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting ID service on {} as {} with {} refill workers",
            _addr,
            _config.instance_id,
            _config.allocator.refill_workers
        );
    }
}

fn build_allocator_service(service: AllocatorService) -> AllocatorServer<AllocatorService> {
    AllocatorServer::new(service)
        .send_compressed(CompressionEncoding::Zstd)
        .send_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Deflate)
        .accept_compressed(CompressionEncoding::Zstd)
        .accept_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Deflate)
}

async fn shutdown_signal(
    service: AllocatorService,
    health_reporter: HealthReporter,
    (maintenance_token, maintenance): (CancellationToken, JoinHandle<()>),
    providers: TelemetryProviders,
) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::error!("Failed to install SIGTERM handler: {:?}", _e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(_e) = signal::ctrl_c().await {
            #[cfg(feature = "tracing")]
            tracing::error!("Failed to install Ctrl+C handler: {:?}", _e);
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, terminating gracefully...");

    // 1. Publish the status
    health_reporter
        .set_not_serving::<AllocatorServer<AllocatorService>>()
        .await;

    // 2. Stop background maintenance
    maintenance_token.cancel();
    if let Err(_e) = maintenance.await {
        #[cfg(feature = "tracing")]
        tracing::error!("Maintenance task failed: {:?}", _e);
    }

    // 3. Refuse new requests and drain refill workers
    service.shutdown().await;

    // 4. Flush telemetry
    providers.shutdown();
}
