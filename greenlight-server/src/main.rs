use anyhow::Result;
use greenlight_server::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse configuration from environment variables and CLI arguments
    let config = Config::from_env_and_args()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("greenlight={}", config.log_level).parse()?)
                .add_directive(format!("greenlight_server={}", config.log_level).parse()?),
        )
        .init();

    if let Err(e) = greenlight_server::serve(config).await {
        tracing::error!("server exited with error: {e:#}");
        return Err(e);
    }

    tracing::info!("server stopped cleanly");
    Ok(())
}
