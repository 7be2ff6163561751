mod api;
mod auth;
mod config;
mod error;
mod instances;
mod metadata;
mod orchestrator;
mod ports;
mod pty;
mod run;
mod scaffold;
mod sessions;
mod workspace;

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use api::AppState;
use config::{Config, OrchestratorBackend};
use instances::InstanceManager;
use metadata::MetadataClient;
use orchestrator::Orchestrator;
use orchestrator::cluster::ClusterOrchestrator;
use orchestrator::local::LocalOrchestrator;
use ports::PortPool;
use run::RunCoordinator;
use sessions::SessionRegistry;

#[derive(Parser)]
#[command(name = "workbench-broker", about = "Session broker for the browser sandbox workbench")]
enum Cli {
    /// Start the HTTP/WS server (default when no subcommand is given)
    #[command(alias = "run")]
    Serve,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 { Cli::Serve } else { Cli::parse() };

    match cli {
        Cli::Serve => run_server().await,
    }
}

async fn run_server() -> Result<(), Box<dyn Error>> {
    let config = Config::from_env();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("workbench_broker=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();

    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: true,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    let config = Arc::new(config);

    let orchestrator: Arc<dyn Orchestrator> = match config.orchestrator_backend {
        OrchestratorBackend::Local => {
            Arc::new(LocalOrchestrator::connect(config.docker_network.clone())?)
        }
        OrchestratorBackend::Cluster => {
            Arc::new(ClusterOrchestrator::connect(config.kube_namespace.clone()).await?)
        }
    };
    tracing::info!(backend = orchestrator.kind(), "orchestrator adapter ready");

    let metadata = MetadataClient::new(config.metadata_base_url.clone());
    let port_pool = PortPool::new(config.allowed_novnc_ports.clone());
    let sessions = Arc::new(SessionRegistry::new());

    let instances = Arc::new(InstanceManager::new(
        orchestrator.clone(),
        metadata.clone(),
        port_pool,
        config.vnc_image.clone(),
        config.internal_novnc_port,
        config.container_env_default.clone(),
        config.free_max_containers,
    ));

    let run_coordinator = Arc::new(RunCoordinator::new(
        orchestrator.clone(),
        sessions.clone(),
        config.workspace.clone(),
        config.workspace_purge_on_run,
    ));

    let state = AppState {
        config: config.clone(),
        orchestrator,
        metadata,
        instances,
        sessions,
        run_coordinator,
    };

    let app = api::routes::build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
