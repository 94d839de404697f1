//! RubricForge binary — thin CLI shell over the [`rubricforge_server`] library crate.

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use rubricforge_server::api::*;
use rubricforge_server::cache::Cache;
use rubricforge_server::config::Config;
use rubricforge_server::fetcher::GithubFetcher;
use rubricforge_server::ledger::Ledger;
use rubricforge_server::model_client::AnthropicModelClient;
use rubricforge_server::orchestrator::Orchestrator;
use rubricforge_server::pipeline::{CacheTier, FallbackTier, LlmAssistedTier, RuleBasedTier, SelectionPipeline};
use rubricforge_server::storage::Storage;
use rubricforge_server::warmer::{CacheWarmer, RepoShape};

/// Repository evaluation pipeline — commit-pinned file selection and rubric grading service.
#[derive(Parser)]
#[command(name = "rubricforge", version, about, long_about = None)]
struct Cli {
    /// Path to the courses.toml file defining the rubric catalog
    #[arg(long)]
    courses: Option<PathBuf>,

    /// Path to the SQLite database file
    #[arg(long)]
    database: Option<PathBuf>,

    /// Bind to 0.0.0.0 instead of 127.0.0.1 (localhost)
    #[arg(long)]
    bind_all: bool,

    /// Port to listen on (overrides PORT env var)
    #[arg(long)]
    port: Option<u16>,
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

fn default_shapes() -> Vec<RepoShape> {
    vec![
        RepoShape {
            name: "mlops-standard".to_string(),
            course_id: "mlops".to_string(),
            canonical_files: vec![
                "README.md".to_string(),
                "src/pipeline/orchestrate.py".to_string(),
                "model.py".to_string(),
                "requirements.txt".to_string(),
                "Dockerfile".to_string(),
            ],
            frequency: 1.0,
        },
        RepoShape {
            name: "data-eng-dbt".to_string(),
            course_id: "data-eng".to_string(),
            canonical_files: vec![
                "README.md".to_string(),
                "dbt_project.yml".to_string(),
                "dbt/models/staging/stg_orders.sql".to_string(),
                "dbt/models/marts/fct_orders.sql".to_string(),
            ],
            frequency: 1.0,
        },
        RepoShape {
            name: "llm-rag".to_string(),
            course_id: "llm-rag".to_string(),
            canonical_files: vec![
                "README.md".to_string(),
                "src/pipeline/retrieve.py".to_string(),
                "src/pipeline/generate.py".to_string(),
                "requirements.txt".to_string(),
            ],
            frequency: 1.0,
        },
    ]
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rubricforge=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(courses) = &cli.courses {
        config.courses_path = courses.clone();
    }
    if let Some(database) = &cli.database {
        config.database_path = database.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.bind_all {
        config.bind_addr = "0.0.0.0".to_string();
    }
    let config = Arc::new(config);

    let catalog = match rubricforge_server::load_course_catalog(&config.courses_path) {
        Ok(catalog) => Arc::new(catalog),
        Err(e) => {
            error!(error = %e, path = %config.courses_path.display(), "failed to load course catalog");
            std::process::exit(1);
        }
    };
    info!(courses = catalog.len(), "loaded course catalog");

    let storage = match Storage::open(&config.database_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to open database");
            std::process::exit(1);
        }
    };

    let cache = Arc::new(Cache::new(Arc::clone(&storage), config.cache_similarity_threshold, config.max_cache_entries));
    let ledger = Arc::new(Ledger::new(Arc::clone(&storage)));
    let fetcher = Arc::new(GithubFetcher::new(config.github_api_base.clone(), config.max_file_bytes));
    let model_client = Arc::new(AnthropicModelClient::new(config.model_api_base.clone(), config.model_api_key.clone()));

    let tiers: Vec<Box<dyn rubricforge_server::pipeline::CascadeTier>> = vec![
        Box::new(CacheTier::new(Arc::clone(&cache))),
        Box::new(RuleBasedTier::new(Arc::clone(&cache), config.cache_similarity_threshold)),
        Box::new(LlmAssistedTier::new(Arc::clone(&model_client) as Arc<dyn rubricforge_server::model_client::ModelClient>)),
        Box::new(FallbackTier),
    ];
    let pipeline = Arc::new(SelectionPipeline::new(tiers, config.max_files_per_evaluation));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&storage),
        Arc::clone(&fetcher) as Arc<dyn rubricforge_server::fetcher::Fetcher>,
        Arc::clone(&cache),
        Arc::clone(&pipeline),
        Arc::clone(&model_client) as Arc<dyn rubricforge_server::model_client::ModelClient>,
        Arc::clone(&ledger),
        Arc::clone(&catalog),
        Arc::clone(&config),
    ));

    let warmer = Arc::new(CacheWarmer::new(
        Arc::clone(&cache),
        Arc::clone(&storage),
        Arc::clone(&catalog),
        Arc::clone(&pipeline),
        default_shapes(),
    ));
    let _warmer_handle = warmer.spawn(Duration::from_secs(3600));

    let reset_ledger = Arc::clone(&ledger);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            match reset_ledger.reset_expired().await {
                Ok(rolled) if rolled > 0 => info!(rolled, "rolled expired usage windows forward"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "usage window sweep failed"),
            }
        }
    });

    let ctx = AppContext { orchestrator: Arc::clone(&orchestrator), ledger, cache, start_time: std::time::Instant::now() };

    let app = Router::new()
        .route("/health", get(health))
        .route("/evaluations", post(admit_evaluation))
        .route("/evaluations/{id}", get(get_evaluation))
        .route("/usage", get(get_usage))
        .route("/cache/stats", get(cache_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx);

    let bind_addr = config.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(format!("{bind_addr}:{}", config.port)).await.unwrap_or_else(|e| {
        error!(port = config.port, error = %e, "could not bind to port");
        std::process::exit(1);
    });

    let port = listener.local_addr().unwrap().port();
    info!(port, "rubricforge listening");
    eprintln!("RUBRICFORGE_PORT={port}");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await.unwrap();

    info!("draining in-flight evaluations before exit");
    orchestrator.drain().await;
}
