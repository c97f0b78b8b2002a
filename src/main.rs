mod proxy;
mod redirect;
mod settings;
mod sniffer;
mod utils;

use lazy_static::lazy_static;
use tokio::task::JoinHandle;

use std::sync::Arc;
use tokio::sync::RwLock;

use settings::Settings;

use anyhow::anyhow;
use anyhow::Result;

lazy_static! {
    pub static ref SETTINGS: Arc<RwLock<Settings>> =
        Arc::new(RwLock::const_new(Settings::new().unwrap()));
}

async fn flatten(handle: JoinHandle<Result<()>>) -> Result<()> {
    match handle.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err),
        Err(err) => Err(anyhow!("handling failed with error: {:?}", err)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let redirect_worker = tokio::spawn(redirect::redirect_worker());

    flatten(redirect_worker).await
}
