mod arena;
mod driver_station;
mod led;
mod network;
mod notifier;
mod plc;
mod store;
mod web;

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::arena::Arena;

#[tokio::main]
/// Activates tracing, builds the arena from the event store and runs the
/// control loop alongside the operator HTTP surface on port 8080.
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();

    let data_dir = std::env::args().nth(1).unwrap_or_else(|| "data".to_string());
    let arena = match Arena::new(&data_dir).await {
        Ok(arena) => Arc::new(Mutex::new(arena)),
        Err(err) => {
            tracing::error!(%err, data_dir, "Arena initialization failed.");
            panic!("Arena initialization failed: {}", err);
        }
    };

    tokio::spawn(arena::run(arena.clone()));

    let app = web::router(arena);
    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080")
        .await
        .unwrap();

    axum::serve(listener, app).await.unwrap();
}
