use std::env;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use whatsapp_leads_rs::{config::Config, BitableClient, Error, LeadBot, Server};

const DEFAULT_LOG_FILTER: &str = "whatsapp_leads_rs=info,whatsapp_leads=info";

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn run() -> Result<(), Error> {
    let config = Config::from_env()?;
    let bot = LeadBot::from_config(&config)?;

    let mut server = Server::builder()
        .endpoint(config.bind_addr)
        .route(&config.webhook_path)
        .verify_token(&config.verify_token)
        .shutdown(shutdown_signal());

    match (&config.leads_api_key, bot.bitable()) {
        (Some(key), Some(bitable)) => {
            server = server.leads_api(key, BitableClient::clone(bitable));
            info!("lead ingestion endpoint enabled");
        }
        (Some(_), None) => warn!("LEADS_API_KEY is set but Lark is not configured"),
        _ => {}
    }

    if config.lark.is_none() {
        warn!("Lark is not configured, completed leads will only be logged");
    }
    if config.flow_engine.is_some() {
        info!("remote flow engine enabled");
    }

    server.build().serve(bot).await
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    if let Err(err) = run().await {
        error!(error = %err, "server stopped");
        std::process::exit(1);
    }
}
