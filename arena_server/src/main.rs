//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p arena_server -- [--addr 127.0.0.1:9002] [--tick-hz 60]
//!                                [--io-threads N] [--seed N] [--config server.json]
//!
//! Console commands:
//!   status         - Show server status
//!   spawn [count]  - Spawn dummies
//!   clear          - Delete all dummies
//!   quit           - Shutdown server

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use arena_server::RunningServer;
use arena_shared::config::ServerConfig;
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> anyhow::Result<ServerConfig> {
    let args: Vec<String> = env::args().collect();

    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let path = args.get(i + 1).context("--config needs a path")?;
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("read config {path}"))?;
            ServerConfig::from_json_str(&text).with_context(|| format!("parse config {path}"))?
        }
        None => ServerConfig::default(),
    };

    // Flags override the config file.
    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--addr", Some(v)) => cfg.server_addr = v.clone(),
            ("--tick-hz", Some(v)) => cfg.tick_hz = v.parse().context("--tick-hz")?,
            ("--io-threads", Some(v)) => cfg.io_threads = Some(v.parse().context("--io-threads")?),
            ("--seed", Some(v)) => cfg.seed = Some(v.parse().context("--seed")?),
            ("--config", Some(_)) => {}
            _ => {
                i += 1;
                continue;
            }
        }
        i += 2;
    }
    Ok(cfg)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all().thread_name("arena-io");
    if let Some(n) = cfg.io_threads {
        builder.worker_threads(n.max(1));
    }
    let runtime = builder.build().context("build runtime")?;

    runtime.block_on(run(cfg))
}

async fn run(cfg: ServerConfig) -> anyhow::Result<()> {
    info!(
        addr = %cfg.server_addr,
        tick_hz = cfg.tick_hz,
        max_players = cfg.player_slots(),
        io_threads = ?cfg.io_threads,
        "Starting server"
    );

    // Physics or bind failure ends the process here.
    let running = RunningServer::launch(cfg).await.context("start server")?;
    info!(local = %running.addr, "Server listening");

    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::Builder::new()
        .name("arena-console".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            let mut stdout = std::io::stdout();
            loop {
                print!("] ");
                let _ = stdout.flush();
                let mut line = String::new();
                match stdin.lock().read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let line = line.trim().to_string();
                if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                    break;
                }
            }
        })
        .context("spawn console thread")?;

    println!("Server ready. Type 'status' for info, 'spawn [n]' for dummies, 'quit' to exit.");
    println!();

    let mut console_open = true;
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("listen for ctrl-c")?;
                info!("Interrupt received");
                break;
            }
            line = console_rx.recv(), if console_open => match line {
                Some(line) if line == "quit" || line == "exit" => break,
                Some(line) => {
                    for out in running.server.exec_console(&line) {
                        println!("{out}");
                    }
                }
                None => console_open = false,
            },
        }
    }

    info!("Shutting down");
    running.shutdown();
    Ok(())
}
