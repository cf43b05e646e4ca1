use std::error::Error;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::Request;
use clap::Parser;
use dotenvy::dotenv;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use shellbox::api::{self, AppState};
use shellbox::config::Config;
use shellbox::records::{FileSandboxRepository, SandboxRepository};
use shellbox::sandbox;
use shellbox::supervisor::SandboxSupervisor;

#[derive(Parser)]
#[command(name = "shellbox", about = "Isolated sandboxes with streamed interactive shells")]
enum Cli {
    /// Start the HTTP server (default when no subcommand is given)
    #[command(alias = "run")]
    Serve {
        /// Override the PORT environment variable
        #[arg(long)]
        port: Option<u16>,
    },
    /// Check that the configured isolation backend is reachable
    Check,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    // Default to Serve when no subcommand is given, but still allow --help
    // and --version to work.
    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 {
        Cli::Serve { port: None }
    } else {
        Cli::parse()
    };

    init_tracing();
    let config = Config::from_env();

    match cli {
        Cli::Serve { port } => run_server(config, port).await?,
        Cli::Check => run_check(config).await?,
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("shellbox=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_tree::HierarchicalLayer::new(2)
                .with_targets(true)
                .with_bracketed_fields(false),
        )
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
}

async fn run_check(config: Config) -> Result<()> {
    let backend = config.runtime.kind();
    let adapter = sandbox::build_adapter(config.runtime)
        .with_context(|| format!("failed to initialize {backend} backend"))?;
    adapter
        .health_check()
        .await
        .with_context(|| format!("{backend} backend is not reachable"))?;
    println!("{backend} backend is reachable");
    Ok(())
}

async fn run_server(config: Config, port_override: Option<u16>) -> Result<()> {
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

    let backend = config.runtime.kind();
    let adapter = sandbox::build_adapter(config.runtime.clone())
        .with_context(|| format!("failed to initialize {backend} backend"))?;
    if let Err(e) = adapter.health_check().await {
        tracing::warn!(backend = %backend, error = %e, "backend health check failed; continuing");
    }

    let records: Arc<dyn SandboxRepository> =
        Arc::new(FileSandboxRepository::new(&config.data_dir));
    records
        .load_all()
        .await
        .context("failed to load sandbox records")?;

    let supervisor = Arc::new(SandboxSupervisor::new(adapter, records));

    let app = api::create_app(AppState {
        supervisor: supervisor.clone(),
    })
    .layer(SentryHttpLayer::new().enable_transaction())
    .layer(NewSentryLayer::<Request<Body>>::new_from_top());

    let port = port_override.unwrap_or(config.port);
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(backend = %backend, environment = %config.environment, "server starting");
    println!("Listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    supervisor.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
