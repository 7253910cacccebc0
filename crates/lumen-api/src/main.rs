use lumen_api::setup::{initialize_app, server};
use lumen_core::Config;

// Use mimalloc as the global allocator for better performance and lower fragmentation,
// especially when running on musl-based systems inside containers.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::from_env()?;

    let app = initialize_app(config.clone()).await?;

    server::start_server(&config, app.router, app.background).await?;

    Ok(())
}
