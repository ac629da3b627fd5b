use duet_relay::config::RelayConfig;
use duet_relay::relay::RelayServer;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = RelayConfig::from_env()?;

    println!("   Duet Relay Server");
    println!("   Binding to {}{}", config.bind_addr, config.path);
    println!("   Press Ctrl+C to stop\n");

    let server = RelayServer::new(config);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
