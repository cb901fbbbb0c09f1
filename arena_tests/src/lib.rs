//! Shared helpers for the end-to-end tests.

use std::time::Duration;

use arena_client::GameClient;

/// Generous bound for anything that should happen within a few ticks.
pub const WAIT: Duration = Duration::from_secs(3);

/// Installs a test-writer subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Connects and joins, failing if the join is rejected.
pub async fn joined_client(addr: &str, nickname: &str) -> anyhow::Result<GameClient> {
    let mut client = GameClient::connect(addr).await?;
    let resp = client.join(nickname, None).await?;
    anyhow::ensure!(resp.success, "join rejected: {:?}", resp.message);
    Ok(client)
}
