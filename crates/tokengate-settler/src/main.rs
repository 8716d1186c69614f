use actix_cors::Cors;
use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{web, App, HttpServer};
use alloy::primitives::Address;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tokengate::SettleConfig;
use tokengate_settler::bootstrap::{bootstrap_settler, BootstrapConfig};
use tokengate_settler::routes;

fn parse_cors_origins() -> Vec<String> {
    match std::env::var("ALLOWED_ORIGINS") {
        Ok(origins) => origins
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => vec![],
    }
}

fn build_cors(origins: &[String]) -> Cors {
    if origins.is_empty() {
        // Default: allow localhost on any port
        Cors::default()
            .allowed_origin_fn(|origin, _| {
                origin
                    .to_str()
                    .map(|o| o == "http://localhost" || o.starts_with("http://localhost:"))
                    .unwrap_or(false)
            })
            .allow_any_method()
            .allowed_headers(vec!["content-type", "authorization", "x-webhook-signature"])
            .max_age(3600)
    } else {
        let mut cors = Cors::default();
        for origin in origins {
            cors = cors.allowed_origin(origin);
        }
        cors.allow_any_method()
            .allowed_headers(vec!["content-type", "authorization", "x-webhook-signature"])
            .max_age(3600)
    }
}

fn env_address(name: &str, default: Address) -> Address {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::error!("invalid {name}: {raw}");
            std::process::exit(1);
        }),
        Err(_) => default,
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let private_key = std::env::var("SETTLER_PRIVATE_KEY")
        .expect("SETTLER_PRIVATE_KEY environment variable is required");

    let rpc_url =
        std::env::var("RPC_URL").unwrap_or_else(|_| tokengate::config::RPC_URL.to_string());

    let db_path =
        std::env::var("SETTLER_DB_PATH").unwrap_or_else(|_| "./tokengate.db".to_string());

    let webhook_secret: Vec<u8> = match std::env::var("WEBHOOK_SECRET")
        .ok()
        .filter(|s| !s.is_empty())
    {
        Some(s) => {
            let bytes = s.into_bytes();
            if bytes.len() < 32 {
                tracing::warn!(
                    "WEBHOOK_SECRET is only {} bytes (minimum 32 recommended) — \
                     use the signing secret from your processor's webhook configuration",
                    bytes.len()
                );
            }
            bytes
        }
        None => {
            tracing::error!(
                "WEBHOOK_SECRET is required. Set it to the webhook signing secret \
                 issued by your payment processor."
            );
            std::process::exit(1);
        }
    };

    let metrics_token = std::env::var("METRICS_TOKEN")
        .ok()
        .filter(|s| !s.is_empty())
        .map(|s| s.into_bytes());
    if metrics_token.is_none() {
        tracing::warn!("METRICS_TOKEN not set — /metrics requires TOKENGATE_PUBLIC_METRICS=true");
    }

    let initial_supply: Option<u64> = std::env::var("TOKEN_SUPPLY")
        .ok()
        .and_then(|s| s.parse().ok());

    let defaults = SettleConfig::default();
    let settle = SettleConfig {
        network: std::env::var("NETWORK").unwrap_or(defaults.network.clone()),
        asset: env_address("ASSET_ADDRESS", defaults.asset),
        inbox_router: env_address("INBOX_ROUTER", defaults.inbox_router),
        ..defaults
    };

    let state = web::Data::new(bootstrap_settler(BootstrapConfig {
        private_key: &private_key,
        rpc_url: &rpc_url,
        db_path: &db_path,
        webhook_secret,
        metrics_token,
        initial_supply,
        settle,
    }));

    let port: u16 = std::env::var("SETTLER_PORT")
        .or_else(|_| std::env::var("PORT"))
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(4030);

    let rate_limit_rpm: u64 = std::env::var("RATE_LIMIT_RPM")
        .ok()
        .and_then(|r| r.parse().ok())
        .unwrap_or(120);

    let cors_origins = parse_cors_origins();

    tracing::info!("Tokengate settler listening on port {port}");
    tracing::info!("Network: {}", state.dispatcher.config().network);
    tracing::info!("Rate limit: {rate_limit_rpm} req/min per IP");
    tracing::info!("  POST http://localhost:{port}/webhook");
    tracing::info!("  GET  http://localhost:{port}/payments/{{reference}}");

    let governor_conf = GovernorConfigBuilder::default()
        .requests_per_minute(rate_limit_rpm)
        .finish()
        .expect("failed to build rate limiter config");

    HttpServer::new(move || {
        App::new()
            .wrap(build_cors(&cors_origins))
            .wrap(Governor::new(&governor_conf))
            .app_data(state.clone())
            .app_data(web::PayloadConfig::new(65_536))
            .service(routes::health)
            .service(routes::metrics_endpoint)
            .service(routes::webhook)
            .service(routes::payment_status)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
