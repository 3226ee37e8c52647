use axum::{Extension, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use plan_sequence::pipeline::Pipeline;
use plan_sequence::providers::DashScopeClient;
use plan_sequence::runs::RunTracker;
use plan_sequence::store::ProjectStore;
use plan_sequence::{handlers, AppState};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    init_logging().expect("Failed to initialize logging");

    let projects_root =
        std::env::var("PROJECTS_DIR").unwrap_or_else(|_| "projects".to_string());
    if let Err(e) = std::fs::create_dir_all(&projects_root) {
        tracing::warn!("Failed to create projects directory: {}", e);
    } else {
        tracing::info!("Projects directory ready: {}", projects_root);
    }

    let api_key = match std::env::var("DASHSCOPE_API_KEY") {
        Ok(key) if !key.is_empty() => key,
        _ => {
            tracing::error!(
                "DASHSCOPE_API_KEY not found. Set it in the environment or a .env file."
            );
            std::process::exit(1);
        }
    };

    tracing::info!("Initializing DashScope generation client...");
    let client = Arc::new(DashScopeClient::new(api_key));
    let pipeline = Pipeline::new(
        client.clone(),
        client.clone(),
        client.clone(),
        client.clone(),
    );

    let shared_state = Arc::new(AppState {
        store: ProjectStore::new(&projects_root),
        runs: RunTracker::new(),
        pipeline,
    });

    // Build our application: the API routes plus static serving of every
    // project's artifact directory under /media.
    let app = Router::new()
        .merge(handlers::projects::project_routes())
        .nest_service("/media", ServeDir::new(&projects_root))
        .layer(CorsLayer::permissive())
        .layer(Extension(shared_state));

    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .expect("Failed to bind server port");
    tracing::info!("listening on {}", listener.local_addr().unwrap());
    axum::serve(listener, app)
        .await
        .expect("Server error");
}

// Production-grade logging configuration
fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, fmt, Layer};

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug,plan_sequence=trace,reqwest=info,hyper=info,tower=info".to_string()
        } else {
            "info,plan_sequence=info,reqwest=warn,hyper=warn,tower=warn".to_string()
        }
    });

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log_level))?;

    let fmt_layer = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        // JSON logging for production (easier for log aggregation)
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed()
    } else {
        // Human-readable logging for development
        fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("🎬 plan_sequence starting up...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Build mode: {}",
        if cfg!(debug_assertions) { "development" } else { "production" }
    );
    tracing::info!("Log level: {}", log_level);

    Ok(())
}
