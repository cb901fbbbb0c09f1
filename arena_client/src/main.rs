//! Bot client binary.
//!
//! Usage:
//!   cargo run -p arena_client -- [--addr 127.0.0.1:9002] [--name Bot] [--seconds 30]
//!
//! Joins the server, wanders in random directions, jumps now and then, and
//! logs a summary of the world once per second. `--seconds 0` runs until
//! interrupted or disconnected.

use std::env;
use std::time::Duration;

use anyhow::Context;
use arena_client::{client::GameClient, input::Wander};
use arena_shared::{math::Color, net::ServerMsg};
use tracing::{info, warn};

const SEND_INTERVAL: Duration = Duration::from_millis(50);

struct BotArgs {
    addr: String,
    name: String,
    seconds: u64,
}

fn parse_args() -> BotArgs {
    let mut out = BotArgs {
        addr: "127.0.0.1:9002".to_string(),
        name: "Bot".to_string(),
        seconds: 30,
    };
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                out.addr = args[i + 1].clone();
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                out.name = args[i + 1].clone();
                i += 2;
            }
            "--seconds" if i + 1 < args.len() => {
                out.seconds = args[i + 1].parse().unwrap_or(out.seconds);
                i += 2;
            }
            _ => i += 1,
        }
    }
    out
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args();
    info!(server = %args.addr, name = %args.name, seconds = args.seconds, "Starting bot");

    let mut client = GameClient::connect(&args.addr).await.context("connect")?;
    let mut wander = Wander::new(None, Duration::from_secs(2));

    let color = Color::new(
        wander.chance(0.5) as u8 as f32,
        0.5,
        wander.chance(0.5) as u8 as f32,
    );
    let resp = client.join(&args.name, Some(color)).await?;
    if !resp.success {
        anyhow::bail!(
            "join rejected: {}",
            resp.message.as_deref().unwrap_or("no reason given")
        );
    }

    let started = tokio::time::Instant::now();
    let mut last_report = started;
    let mut ticker = tokio::time::interval(SEND_INTERVAL);

    loop {
        if args.seconds > 0 && started.elapsed() >= Duration::from_secs(args.seconds) {
            info!("Run time elapsed");
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {
                let input = wander.next(SEND_INTERVAL);
                client.send_input(input.movement()).await?;
                if wander.chance(0.02) {
                    client.jump().await?;
                }
            }
            msg = client.recv() => match msg {
                Ok(ServerMsg::GameState(_)) => {}
                Ok(other) => warn!(?other, "Unexpected message"),
                Err(e) => {
                    warn!(error = %e, "Disconnected");
                    return Ok(());
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                break;
            }
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            last_report = tokio::time::Instant::now();
            if let (Some(state), Some(id)) = (&client.last_state, client.player_id) {
                let pos = state.player(id).map(|p| p.pos);
                info!(
                    players = state.players.len(),
                    dummies = state.dummies.len(),
                    ?pos,
                    "World"
                );
            }
        }
    }

    client.close().await
}
