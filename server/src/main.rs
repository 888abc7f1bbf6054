use clap::Parser;
use log::{error, info, warn};
use server::config::{Args, ServerConfig};
use server::game::GameBoard;
use server::tick::{TickLoop, Ticker};
use server::transport::NetworkServer;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

/// Main-method of the host.
/// Starts the transport, then the tick loop, and runs until enter is pressed.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from(Args::parse());
    config.validate()?;

    let transport = Arc::new(NetworkServer::new(config.bind_addr, config.max_outgoing)?);
    if let Err(e) = transport.start().await {
        error!("Transport failed to start: {}", e);
        return Err(e.into());
    }
    transport.await_running().await?;

    let ticker = Ticker::new(
        Arc::clone(&transport),
        GameBoard::new(),
        config.dispatch_workers,
    );
    let tick_loop = TickLoop::start(ticker, config.tick)?;
    tick_loop.await_running().await?;

    tokio::task::spawn_blocking(wait_for_enter).await??;
    info!("Shutting down");

    tick_loop.stop();
    if let Err(e) = tick_loop.await_terminated(config.shutdown_timeout).await {
        warn!("Tick loop did not stop in time: {}", e);
    }

    transport.stop().await?;
    if let Err(e) = transport.await_terminated(config.shutdown_timeout).await {
        warn!("Transport did not stop in time: {}", e);
    }

    Ok(())
}

fn wait_for_enter() -> io::Result<()> {
    print!("Press enter to stop the server >> ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(())
}
