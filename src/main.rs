use clap::Parser;
use std::error::Error;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use voice_engine_server::config_loader::Settings;
use voice_engine_server::dispatcher::Dispatcher;
use voice_engine_server::error::ServerError;
use voice_engine_server::registry::BackendRegistry;
use voice_engine_server::server::Server;
use voice_engine_server::transport::Endpoint;
use voice_engine_server::voice_registry::{SledStore, VoiceRegistrar};

/// Share speech synthesis backends with local clients over one endpoint
#[derive(Parser)]
#[command(name = "voice-engine-server")]
#[command(author = "StarTuz")]
#[command(version)]
struct Args {
    /// Settings file, layered over the default locations
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "voice_engine_server=trace"
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(settings: &Settings, level: Option<&str>) -> Result<(), Box<dyn Error>> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&settings.log_level)),
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &settings.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        // Without a signal handler the server runs until killed
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref()).map_err(ServerError::from)?;
    init_logging(&settings, args.log_level.as_deref())?;

    info!("Starting voice engine server v{}", env!("CARGO_PKG_VERSION"));

    // Probing may hit the network, keep it off the runtime threads
    let configs = settings.backends.clone();
    let registry = tokio::task::spawn_blocking(move || BackendRegistry::initialize(&configs)).await?;
    if registry.is_empty() {
        error!("No speech engines could be initialized; every request will fail");
    } else {
        info!("Available engines: {}", registry.available_names().join(", "));
    }

    let store = SledStore::open(Path::new(&settings.store_path)).map_err(ServerError::from)?;
    let registrar = VoiceRegistrar::new(Arc::new(store), settings.registration_layout());
    let dispatcher = Dispatcher::new(Arc::new(registry), Arc::new(registrar), settings.codec())
        .with_read_timeout(settings.read_timeout());
    let server = Server::new(Arc::new(dispatcher), settings.concurrent_connections);

    let endpoint = Endpoint::from_settings(&settings);
    let acceptor = endpoint.bind().map_err(|source| ServerError::Bind {
        endpoint: endpoint.address().to_string(),
        source,
    })?;
    info!("Voice engine server listening on {}", endpoint.address());

    server.serve_until(acceptor, shutdown_signal()).await;

    info!("Voice engine server stopped after {} connections", server.connections());
    Ok(())
}
