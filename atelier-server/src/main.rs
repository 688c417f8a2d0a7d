use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use atelier_core::{
    Config, DevicePreference, GenerationMode, GenerationOutcome, GenerationRequest, ManagerInfo,
    ModelManager, Orchestrator,
};
use axum::{
    extract::{Json, State},
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod launcher;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Atelier image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Launch mode: the HTTP API or the external node editor
    #[arg(long, value_enum, default_value = "api")]
    mode: Mode,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Configuration file
    #[arg(long, default_value = atelier_core::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Api,
    Ui,
}

#[derive(Deserialize)]
struct ApiRequest {
    #[serde(flatten)]
    request: GenerationRequest,
    /// Echo the encoded PNG in the response body.
    #[serde(default)]
    return_image: bool,
}

#[derive(Serialize)]
struct ApiResponse {
    #[serde(flatten)]
    outcome: GenerationOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
}

// Application state containing the orchestrator; the mutex serializes
// generation requests, one at a time per process.
struct AppState {
    orchestrator: Mutex<Orchestrator>,
}

fn run_mode(state: &AppState, mode: GenerationMode, req: ApiRequest) -> ApiResponse {
    let mut orchestrator = state
        .orchestrator
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let outcome = orchestrator.dispatch(mode, req.request);
    let image = if req.return_image && outcome.success {
        outcome
            .image_path
            .as_ref()
            .and_then(|path| std::fs::read(path).ok())
            .map(|bytes| BASE64_STANDARD.encode(bytes))
    } else {
        None
    };
    ApiResponse { outcome, image }
}

async fn generations_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ApiRequest>,
) -> Json<ApiResponse> {
    Json(run_mode(&state, GenerationMode::TextToImage, req))
}

async fn transforms_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ApiRequest>,
) -> Json<ApiResponse> {
    Json(run_mode(&state, GenerationMode::ImageToImage, req))
}

async fn inpaintings_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ApiRequest>,
) -> Json<ApiResponse> {
    Json(run_mode(&state, GenerationMode::Inpaint, req))
}

async fn models_handler(State(state): State<Arc<AppState>>) -> Json<ManagerInfo> {
    let orchestrator = state
        .orchestrator
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    Json(orchestrator.model_info())
}

/// Console logging always; a file layer too when `logging.file` is set.
fn init_logging(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        String::from("debug")
    } else {
        config.get("logging.level", String::from("info")).to_lowercase()
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.parse()?)
        .from_env_lossy();
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    let log_file = config.get("logging.file", String::new());
    if log_file.is_empty() {
        registry.init();
    } else {
        let path = PathBuf::from(log_file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false),
            )
            .init();
    }
    Ok(())
}

async fn serve(args: Args, config: Config) -> Result<()> {
    let preference = if args.cpu {
        DevicePreference::ForceCpu
    } else {
        DevicePreference::default()
    };
    let manager = ModelManager::with_preference(&config, preference)?;
    let orchestrator = Orchestrator::new(manager, &config);

    // Build application state and wrap in Arc.
    let state = Arc::new(AppState {
        orchestrator: Mutex::new(orchestrator),
    });

    // --- Build axum router with shared state ---
    let app = Router::new()
        .route("/v1/images/generations", post(generations_handler))
        .route("/v1/images/transforms", post(transforms_handler))
        .route("/v1/images/inpaintings", post(inpaintings_handler))
        .route("/v1/models", get(models_handler))
        .with_state(state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!("started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config);
    init_logging(&config, args.verbose)?;

    match args.mode {
        Mode::Ui => launcher::launch_editor(&config),
        Mode::Api => serve(args, config).await,
    }
}
