use relay_server::config::Config;
use relay_server::state::AppState;
use relay_server::{app, sweeper};

#[tokio::main]
async fn main() {
    let config = Config::from_env().expect("failed to load configuration from environment");

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| if config.debug { "debug".into() } else { "info".into() });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let pool = relay_core::store::open_pool(&config.database_file).expect("failed to open database");
    relay_core::store::ensure_base_url(&pool, &config.base_url()).expect("failed to seed base_url");

    tokio::spawn(sweeper::run(pool.clone(), config.message_retention_minutes));

    let addr = format!("0.0.0.0:{}", config.cloud_port);
    tracing::info!(%addr, "starting WakeLink relay server");

    let state = AppState::new(pool, config);
    let listener = tokio::net::TcpListener::bind(&addr).await.expect("failed to bind listener");
    axum::serve(listener, app(state)).await.expect("server error");
}
