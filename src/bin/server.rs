use anyhow::Context;
use deskbridge::api::api_router;
use deskbridge::config::{BrokerConfig, ConfigHandle};
use deskbridge::Broker;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Optional config file path as the first argument.
    let config = match std::env::args().nth(1) {
        Some(path) => {
            let path = PathBuf::from(path);
            let handle = ConfigHandle::load_from_file(&path)
                .await
                .with_context(|| format!("loading config from {}", path.display()))?;
            (*handle.snapshot()).clone()
        }
        None => BrokerConfig::default(),
    };

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    println!("\n=== deskbridge - Remote Support Broker ===\n");
    println!("Components:");
    println!(
        "  Audit log:        {}",
        config.remote_access.audit_log_dir.display()
    );
    println!(
        "  Transfer engine:  {} KiB chunks, {} concurrent, temp dir {}",
        config.transfer.chunk_size / 1024,
        config.transfer.max_concurrent,
        config.transfer.temp_dir.display()
    );
    println!(
        "  Sessions:         {} concurrent max, {} min idle timeout",
        config.remote_access.max_concurrent_sessions,
        config.remote_access.idle_timeout_secs / 60
    );
    println!(
        "  Encryption:       {}",
        if config.transfer.encrypt_files {
            "AES-256-GCM at rest"
        } else {
            "disabled"
        }
    );

    let broker = Broker::new(config).context("assembling broker")?;
    let _sweeper = broker.spawn_cleanup_sweeper();

    let app = api_router(broker);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;

    println!("\nListening on http://{bind_addr}");
    println!("  Peer WebSocket:  ws://{bind_addr}/ws?session_id=<id>&role=client|portal");
    println!("  REST API:        http://{bind_addr}/api/v1/transfers");
    println!("  Health check:    http://{bind_addr}/health\n");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
