use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use leader_election::{
    cli::{Cli, Command},
    client,
    coordinator::Coordinator,
    transport::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Coordinator(args) => {
            let coordinator = Coordinator::spawn(args.config())?;
            let listener = TcpListener::bind(args.listen).await?;
            let server = Server::new(listener, coordinator.clone());
            let addr = server.local_addr()?;
            info!("coordinator listening on {}", addr);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
            let _ = coordinator.shutdown();
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
