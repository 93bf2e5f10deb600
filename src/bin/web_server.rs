use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use kaiden::{
    config::Config,
    db,
    oracle::{ScoringOracle, openai::OpenAiOracle},
    server::{AppState, ManagerApiDoc, UserApiDoc, build_router},
    utils::{SystemClock, init_log},
};
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(Debug, Parser)]
struct Args {
    #[arg(short, long, default_value = "kaiden.toml")]
    config: PathBuf,
    /// Overrides the database path of the config file
    #[arg(short, long)]
    database: Option<PathBuf>,
    #[arg(short = 'H', long)]
    host: Option<String>,
    #[arg(short, long)]
    port: Option<u16>,
    /// Directory for daily-rotated log files; stdout when omitted
    #[arg(short, long)]
    log: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = init_log(args.log);
    let mut config = Config::load(&args.config)?;
    if let Some(database) = args.database {
        config.database.path = database;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let database = db::connect(&config.database.path, config.database.max_connections).await?;
    let oracle: Arc<dyn ScoringOracle> = Arc::new(OpenAiOracle::new(&config.oracle)?);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = Arc::new(AppState::new(
        database.clone(),
        config,
        oracle,
        Arc::new(SystemClock),
    ));
    let app = build_router(state).await?.merge(
        SwaggerUi::new("/swagger-ui")
            .url("/api-docs/user/openapi.json", UserApiDoc::openapi())
            .url("/api-docs/manager/openapi.json", ManagerApiDoc::openapi()),
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on http://{addr}");
    info!("Swagger UI available at http://{addr}/swagger-ui/");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    db::shutdown(database).await;
    Ok(())
}
