use anyhow::{bail, Context, Result};
use irdata::credentials::EnvCredentials;
use irdata::{Client, ClientConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

const USAGE: &str = "usage: irfetch <key file> <creds file> <uri> [ttl secs]";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "irdata=info,irfetch=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 3 || args.len() > 4 {
        bail!(USAGE);
    }
    let key_path = PathBuf::from(&args[0]);
    let creds_path = PathBuf::from(&args[1]);
    let uri = &args[2];
    let ttl: u64 = match args.get(3) {
        Some(ttl) => ttl.parse().context("ttl must be a number of seconds")?,
        None => 15 * 60,
    };

    let config = match std::env::var("IRDATA_CONFIG") {
        Ok(path) => {
            let mut config = irdata::config::load_config(&path)
                .map_err(|e| anyhow::anyhow!("failed to load {}: {}", path, e))?;
            config.apply_env();
            config
        }
        Err(_) => ClientConfig::from_env(),
    };

    let mut client = Client::new(config).context("Failed to create client")?;

    if let Ok(dir) = std::env::var("IRDATA_CACHE_DIR") {
        client
            .enable_cache(&dir)
            .with_context(|| format!("Failed to open cache in {}", dir))?;
        info!(dir = %dir, "Cache enabled");
    }
    if let Ok(path) = std::env::var("IRDATA_TOKEN_FILE") {
        client.persist_token(path);
    }

    if creds_path.exists() {
        client
            .authenticate_from_file(&key_path, &creds_path)
            .await
            .context("Authentication failed")?;
    } else {
        // First run: take IRDATA_* credentials from the environment and keep them
        client
            .authenticate_and_save(&key_path, &creds_path, &EnvCredentials)
            .await
            .context("Authentication failed")?;
    }

    let result = if std::env::var("IRDATA_CACHE_DIR").is_ok() {
        client.get_with_cache(uri, Duration::from_secs(ttl)).await
    } else {
        client.get(uri).await
    };

    let data = match result {
        Ok(data) => data,
        Err(irdata::Error::CacheWrite { data, source }) => {
            tracing::warn!(error = %source, "Result not cached");
            data
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to fetch {}", uri)),
    };

    println!("{}", String::from_utf8_lossy(&data));

    client.close().context("Failed to close client")?;
    Ok(())
}
