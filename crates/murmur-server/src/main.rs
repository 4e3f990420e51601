mod routes;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use murmur_cache::RedisStore;
use murmur_db::Database;
use murmur_sync::{MessageCache, SyncConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur=debug,murmur_sync=debug,murmur_cache=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let db_path = std::env::var("MURMUR_DB_PATH").unwrap_or_else(|_| "murmur.db".into());
    let redis_url = std::env::var("MURMUR_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".into());
    let pool_size: usize = std::env::var("MURMUR_REDIS_POOL_SIZE")
        .unwrap_or_else(|_| "8".into())
        .parse()?;
    let host = std::env::var("MURMUR_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("MURMUR_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    let mut config = SyncConfig::default();
    if let Ok(prefix) = std::env::var("MURMUR_KEY_PREFIX") {
        config.key_prefix = prefix;
    }
    if let Ok(limit) = std::env::var("MURMUR_PAGE_LIMIT") {
        config.page_limit = limit.parse()?;
    }

    let db = Arc::new(Database::open(&PathBuf::from(&db_path))?);
    let store = Arc::new(RedisStore::open(&redis_url, pool_size)?);

    let cache = Arc::new(MessageCache::new(store, db, config));
    let _worker = cache.start_repair_worker()?;

    // Populate the cache before taking traffic
    let bootstrap = cache.clone();
    match tokio::task::spawn_blocking(move || bootstrap.initialize_all()).await? {
        Ok(report) => info!(
            "cache ready: {} channels, {} messages, {} read positions",
            report.channels, report.messages, report.read_positions
        ),
        Err(e) if e.is_fatal() => return Err(e.into()),
        Err(e) => warn!("cache bootstrap failed, serving from database until repaired: {}", e),
    }

    let app = routes::router(cache)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Murmur server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
