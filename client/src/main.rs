use clap::Parser;
use client::config::{Args, ClientConfig};
use client::session::{ClientSession, ClientState, Credentials};
use client::transport::NetworkClient;
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{EntityKind, InputSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ClientConfig::from(Args::parse());
    config.validate()?;

    info!("Starting client...");
    info!("Connecting to: {}", config.server);

    let transport = Arc::new(NetworkClient::new(config.max_outgoing)?);
    transport.start()?;

    let mut session = ClientSession::new(
        Arc::clone(&transport),
        config.server,
        Credentials::new(config.name.clone(), config.secret.clone()),
        config.nickname.clone(),
    );

    run_bot(&mut session, &config).await;

    transport.stop().await?;
    Ok(())
}

/// Drives the session until Ctrl+C, wandering around with random keys.
async fn run_bot(session: &mut ClientSession<NetworkClient>, config: &ClientConfig) {
    let mut ticker = interval(config.tick_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let report_every = (Duration::from_secs(1).as_millis() / config.tick_period.as_millis()).max(1);
    let mut rng = StdRng::from_entropy();
    let mut ticks: u128 = 0;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut shutdown => {
                info!("Received Ctrl+C, shutting down...");
                return;
            }
        }

        ticks += 1;
        if ticks % config.change_every as u128 == 0 {
            session.set_input(InputSnapshot::new(
                rng.gen_bool(0.3),
                rng.gen_bool(0.3),
                rng.gen_bool(0.3),
                rng.gen_bool(0.3),
            ));
        }

        session.update();

        if ticks % report_every == 0 && session.state() == ClientState::Joined {
            log_summary(session);
        }
    }
}

fn log_summary(session: &ClientSession<NetworkClient>) {
    let Some(entities) = session.latest_snapshot() else {
        return;
    };
    let players = entities.iter().filter(|entity| entity.is_player()).count();
    let pickups = entities.len() - players;

    match session.own_entity().map(|me| (me.x, me.y, &me.kind)) {
        Some((x, y, EntityKind::Player { score, .. })) => info!(
            "{} players, {} pickups, me at ({:.1}, {:.1}) with score {}",
            players, pickups, x, y, score
        ),
        _ => info!("{} players, {} pickups", players, pickups),
    }
}
