//! phaseloop UI server: starts and steers one session of the project it is
//! pointed at, over JSON endpoints under `/api` and an SSE feed at `/events`.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use axum::Router;
use axum::routing::get;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::info;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "phaseloop-ui")]
#[command(about = "Web UI for starting and steering a phaseloop session")]
struct Args {
    /// Socket address to serve on
    #[arg(long, default_value = "127.0.0.1:3001")]
    listen: SocketAddr,

    /// Project directory (contains .phaseloop/ and the plan file)
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,

    /// Static UI files; defaults to <project_dir>/ui/dist when present
    #[arg(long)]
    ui_dir: Option<PathBuf>,

    /// More logging (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    phaseloop::logging::init(args.verbose.saturating_add(1));

    let project_dir = args
        .project_dir
        .canonicalize()
        .with_context(|| format!("project dir {}", args.project_dir.display()))?;
    let ui_dir = args
        .ui_dir
        .unwrap_or_else(|| project_dir.join("ui").join("dist"));
    info!(project_dir = %project_dir.display(), "starting phaseloop-ui");

    let state = AppState::new(project_dir);
    sse::start_file_watcher(state.clone());

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("bind {}", args.listen))?;
    info!(addr = %args.listen, "listening");
    axum::serve(listener, app(state, &ui_dir)).await?;
    Ok(())
}

/// API, event stream and, when `ui_dir` exists, the static UI as fallback.
fn app(state: AppState, ui_dir: &Path) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let router = Router::new()
        .nest("/api", routes::api_router())
        .route("/events", get(sse::events_handler))
        .layer(cors)
        .with_state(state);

    if !ui_dir.is_dir() {
        info!(ui_dir = %ui_dir.display(), "no UI directory; serving the API only");
        return router;
    }
    info!(ui_dir = %ui_dir.display(), "serving static UI files");
    router.fallback_service(ServeDir::new(ui_dir).append_index_html_on_directories(true))
}
