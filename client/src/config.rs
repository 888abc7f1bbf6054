use clap::Parser;
use shared::outbound::validate_capacity;
use shared::{NetError, Result, DEFAULT_MAX_OUTGOING, DEFAULT_PORT};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:1666")]
    pub server: SocketAddr,

    /// Name sent when authenticating
    #[arg(short = 'n', long, default_value = "bot")]
    pub name: String,

    /// Secret sent when authenticating
    #[arg(long, default_value = "secret")]
    pub secret: String,

    /// Nickname shown in game, defaults to the name
    #[arg(long)]
    pub nickname: Option<String>,

    /// Update period in milliseconds
    #[arg(short = 't', long, default_value = "30")]
    pub tick_ms: u64,

    /// Capacity of the outbound message queue
    #[arg(long, default_value_t = DEFAULT_MAX_OUTGOING)]
    pub max_outgoing: usize,

    /// Ticks between random input changes
    #[arg(long, default_value = "20")]
    pub change_every: u32,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: SocketAddr,
    pub name: String,
    pub secret: String,
    pub nickname: String,
    pub tick_period: Duration,
    pub max_outgoing: usize,
    pub change_every: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            name: "bot".to_string(),
            secret: "secret".to_string(),
            nickname: "bot".to_string(),
            tick_period: Duration::from_millis(30),
            max_outgoing: DEFAULT_MAX_OUTGOING,
            change_every: 20,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        validate_capacity(self.max_outgoing)?;
        if self.tick_period.is_zero() {
            return Err(NetError::InvalidConfig(
                "tick period must be non-zero".to_string(),
            ));
        }
        if self.change_every == 0 {
            return Err(NetError::InvalidConfig(
                "change-every must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl From<Args> for ClientConfig {
    fn from(args: Args) -> Self {
        let nickname = args.nickname.unwrap_or_else(|| args.name.clone());
        Self {
            server: args.server,
            name: args.name,
            secret: args.secret,
            nickname,
            tick_period: Duration::from_millis(args.tick_ms),
            max_outgoing: args.max_outgoing,
            change_every: args.change_every,
        }
    }
}
