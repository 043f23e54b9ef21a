mod app;
mod auth;
mod bot;
mod guard;
mod realtime;
mod sanitize;
mod store;
mod types;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("support_chat_server=info,tower_http=warn")),
        )
        .init();

    app::run().await;
}
