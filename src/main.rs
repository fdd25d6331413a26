use actix_web::{web, App, HttpServer};
use beacon_gateway_rs::api::{self, AppState};
use beacon_gateway_rs::config::Settings;
use beacon_gateway_rs::context::GatewayContext;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    info!("╔═══════════════════════════════════════════════════════════════╗");
    info!("║               BEACON GATEWAY RS                               ║");
    info!("║               Device Trust & Signal Delivery                  ║");
    info!("╚═══════════════════════════════════════════════════════════════╝");

    // Load environment variables
    dotenv::dotenv().ok();

    let settings = match Settings::new() {
        Ok(s) => s,
        Err(e) => {
            error!("❌ Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let ctx = GatewayContext::new_system();
    let state = match AppState::assemble(&settings, ctx) {
        Ok(s) => web::Data::new(s),
        Err(e) => {
            error!("❌ Failed to open trust store: {}", e);
            std::process::exit(1);
        }
    };
    info!("✅ Core components initialized");

    if settings.admin.api_key.is_none() {
        info!("⚠️ No admin API key configured; /admin routes will reject all requests");
    }

    // --- Sweeper Task ---
    // Expired nonce records and retired device keys accumulate until purged
    let sweeper_state = state.clone();
    let sweep_interval = settings.protocol.sweep_interval_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(sweep_interval));
        loop {
            ticker.tick().await;
            match sweeper_state.replay.sweep().await {
                Ok(0) => {}
                Ok(n) => info!("🧹 Swept {} expired nonce records", n),
                Err(e) => error!("Nonce sweep failed: {}", e),
            }
            match sweeper_state.keystore.purge_expired() {
                Ok(0) => {}
                Ok(n) => info!("🧹 Purged {} retired device keys", n),
                Err(e) => error!("Key purge failed: {}", e),
            }
        }
    });

    // --- API Server ---
    let bind_address = format!("{}:{}", settings.server.bind, settings.server.port);
    info!("🚀 Starting Gateway API on {}", bind_address);

    let admin_key = settings.admin.api_key.clone();

    HttpServer::new(move || {
        let cors = actix_cors::Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header();

        App::new()
            .wrap(cors)
            .app_data(state.clone())
            .configure(api::public_config)
            .service(api::admin_scope(admin_key.clone()))
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
