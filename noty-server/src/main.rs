use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (NOTY_LOG_JSON=1), human-readable otherwise.
    let json_logs = std::env::var("NOTY_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("noty_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = noty_server::config::ServerConfig::parse();
    tracing::info!("public surface on {}", config.public_addr);
    tracing::info!("private/admin surface on {}", config.private_addr);
    tracing::info!("cluster mesh on {}", config.cluster_addr);
    if config.smtp_configured() {
        tracing::info!("SMTP mail enabled via {}", config.smtp_server);
    }
    if config.broker_configured() {
        tracing::info!("task-queue broker enabled (advisory)");
    }

    let server = noty_server::server::Server::new(config);
    server.run().await?;
    Ok(())
}
