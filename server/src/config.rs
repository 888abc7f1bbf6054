use crate::tick::TickSettings;
use clap::Parser;
use shared::outbound::validate_capacity;
use shared::{NetError, Result, DEFAULT_MAX_OUTGOING, DEFAULT_PORT};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Command line arguments for the host
#[derive(Parser, Debug)]
#[clap(author, version, about)]
pub struct Args {
    /// IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    pub host: IpAddr,
    /// Port to listen on
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// Capacity of the outbound message queue
    #[clap(long, default_value_t = DEFAULT_MAX_OUTGOING)]
    pub max_outgoing: usize,
    /// Tick period in milliseconds
    #[clap(short, long, default_value = "30")]
    pub tick_ms: u64,
    /// Delay before the first tick in milliseconds
    #[clap(long, default_value = "300")]
    pub initial_delay_ms: u64,
    /// Worker tasks handling inbound messages
    #[clap(long, default_value = "4")]
    pub dispatch_workers: usize,
    /// How long to wait for each service on shutdown, in seconds
    #[clap(long, default_value = "30")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub max_outgoing: usize,
    pub tick: TickSettings,
    pub dispatch_workers: usize,
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            max_outgoing: DEFAULT_MAX_OUTGOING,
            tick: TickSettings::default(),
            dispatch_workers: 4,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        validate_capacity(self.max_outgoing)?;

        if self.tick.period.is_zero() {
            return Err(NetError::InvalidConfig(
                "tick period must be non-zero".to_string(),
            ));
        }

        let port = self.bind_addr.port();
        if port != 0 && port <= 1024 {
            return Err(NetError::InvalidConfig(format!(
                "port {} is reserved, use 0 or a port above 1024",
                port
            )));
        }

        Ok(())
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            bind_addr: SocketAddr::new(args.host, args.port),
            max_outgoing: args.max_outgoing,
            tick: TickSettings {
                period: Duration::from_millis(args.tick_ms),
                initial_delay: Duration::from_millis(args.initial_delay_ms),
            },
            dispatch_workers: args.dispatch_workers,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_addr.port(), 1666);
        assert_eq!(config.tick.period, Duration::from_millis(30));
        assert_eq!(config.tick.initial_delay, Duration::from_millis(300));
    }

    #[test]
    fn test_args_defaults_match_config_defaults() {
        let config = ServerConfig::from(Args::parse_from(["server"]));
        let defaults = ServerConfig::default();
        assert_eq!(config.bind_addr, defaults.bind_addr);
        assert_eq!(config.max_outgoing, defaults.max_outgoing);
        assert_eq!(config.dispatch_workers, defaults.dispatch_workers);
        assert_eq!(config.shutdown_timeout, defaults.shutdown_timeout);
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let mut config = ServerConfig {
            max_outgoing: 1000,
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(NetError::InvalidQueueCapacity(1000))
        ));

        config.max_outgoing = 10;
        config.tick.period = Duration::ZERO;
        assert!(matches!(config.validate(), Err(NetError::InvalidConfig(_))));

        config.tick.period = Duration::from_millis(30);
        config.bind_addr.set_port(80);
        assert!(config.validate().is_err());

        config.bind_addr.set_port(0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_flags() {
        let args = Args::parse_from([
            "server",
            "--host",
            "127.0.0.1",
            "--port",
            "4000",
            "--tick-ms",
            "50",
            "--dispatch-workers",
            "0",
        ]);
        let config = ServerConfig::from(args);
        assert_eq!(config.bind_addr, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(config.tick.period, Duration::from_millis(50));
        assert_eq!(config.dispatch_workers, 0);
    }
}
