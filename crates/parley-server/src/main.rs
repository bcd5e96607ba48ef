use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use parley_db::Database;
use parley_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;
    if !config.production {
        info!("Running in development mode");
    }

    let db = Arc::new(Database::open(&config.db_path)?);
    let provider = parley_server::provider_from_config(&config)?;
    let state = parley_server::bootstrap(&config, db, provider).await?;
    let app = parley_server::app(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Parley server listening on {}", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
