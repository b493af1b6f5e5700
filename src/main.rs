use deproxy::config::Config;
use deproxy::endpoint::{Manager, Server};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;
    let manager = Manager::start()?;

    let mut servers = Vec::with_capacity(cfg.servers.len());
    for server_cfg in cfg.servers {
        let mut server = Server::new(server_cfg);
        server.start(&manager)?;
        servers.push(server);
    }
    if !cfg.clients.is_empty() {
        tracing::warn!(
            clients = cfg.clients.len(),
            "Clients are driven from test code; ignoring them here"
        );
    }

    manager.block_on(tokio::signal::ctrl_c())?;
    tracing::info!("Shutdown signal received");

    for server in &servers {
        server.stop();
        tracing::info!(
            listen = %server.config().listen,
            requests = server.received_count(),
            connections = server.connections(),
            "Server stopped"
        );
    }

    Ok(())
}
