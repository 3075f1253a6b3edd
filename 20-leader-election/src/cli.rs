use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::config::CoordinatorConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the coordinator, accepting local TCP connections.
    Coordinator(CoordinatorArgs),
    /// Connect to a coordinator as one participating client.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CoordinatorArgs {
    /// Socket address the coordinator should bind to. Use 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5100")]
    pub listen: SocketAddr,

    /// How often each client is asked for a heartbeat.
    #[arg(long, default_value_t = 2_000)]
    pub probe_interval_ms: u64,

    /// How often silent clients are swept.
    #[arg(long, default_value_t = 1_000)]
    pub sweep_interval_ms: u64,

    /// Silence after which a client is evicted.
    #[arg(long, default_value_t = 7_000)]
    pub liveness_timeout_ms: u64,
}

impl CoordinatorArgs {
    pub fn config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            liveness_timeout: Duration::from_millis(self.liveness_timeout_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Identifier to register under.
    #[arg(long)]
    pub id: String,

    /// Address of the coordinator to connect to.
    #[arg(long, default_value = "127.0.0.1:5100")]
    pub server: SocketAddr,

    /// How often to push a heartbeat without being asked.
    #[arg(long, default_value_t = 2_000)]
    pub heartbeat_interval_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinator_defaults_match_config_defaults() {
        let cli = Cli::parse_from(["leader-election", "coordinator"]);
        let Command::Coordinator(args) = cli.command else {
            panic!("expected coordinator subcommand");
        };
        assert_eq!(args.config(), CoordinatorConfig::default());
    }

    #[test]
    fn coordinator_timings_are_tunable() {
        let cli = Cli::parse_from([
            "leader-election",
            "coordinator",
            "--listen",
            "127.0.0.1:0",
            "--probe-interval-ms",
            "100",
            "--liveness-timeout-ms",
            "350",
        ]);
        let Command::Coordinator(args) = cli.command else {
            panic!("expected coordinator subcommand");
        };
        let config = args.config();
        assert_eq!(config.probe_interval, Duration::from_millis(100));
        assert_eq!(config.liveness_timeout, Duration::from_millis(350));
        assert_eq!(config.sweep_interval, Duration::from_millis(1_000));
    }
}
