//! Client implementation.
//!
//! A thin protocol client over the framed TCP transport: join, send input and
//! commands, and receive join responses and world snapshots. Used by the bot
//! binary and by the end-to-end tests.

use std::time::Duration;

use anyhow::Context;
use arena_shared::{
    math::{Color, Vec3},
    net::{decode_server, encode_client, ClientMsg, GameState, JoinResponse, ServerMsg},
    transport::{self, FrameReader, FrameWriter, MessageSink},
    world::PlayerId,
};
use tokio::net::{tcp::OwnedReadHalf, tcp::OwnedWriteHalf, TcpStream};
use tracing::{debug, info};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Connected, join not yet accepted.
    Connected,
    /// Join accepted; the server streams snapshots.
    Joined,
    /// Connection closed by either side.
    Disconnected,
}

/// High-level game client.
pub struct GameClient {
    pub state: ClientState,
    pub player_id: Option<PlayerId>,
    pub nickname: Option<String>,
    /// Most recent snapshot received.
    pub last_state: Option<GameState>,

    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
}

impl GameClient {
    /// Opens a connection. The server waits for [`GameClient::join`] next.
    pub async fn connect(addr: &str) -> anyhow::Result<Self> {
        info!(server = %addr, "Connecting to server");
        let stream = TcpStream::connect(addr).await.context("tcp connect")?;
        stream.set_nodelay(true).context("set nodelay")?;
        let (reader, writer) = transport::split(stream);

        Ok(Self {
            state: ClientState::Connected,
            player_id: None,
            nickname: None,
            last_state: None,
            reader,
            writer,
        })
    }

    pub async fn send(&mut self, msg: &ClientMsg) -> anyhow::Result<()> {
        self.writer.send_frame(&encode_client(msg)).await
    }

    /// Sends raw bytes as one frame, bypassing the encoder.
    pub async fn send_raw(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        self.writer.send_frame(payload).await
    }

    /// Receives the next server message.
    pub async fn recv(&mut self) -> anyhow::Result<ServerMsg> {
        let Some(frame) = self.reader.read_frame().await? else {
            self.state = ClientState::Disconnected;
            anyhow::bail!("server closed the connection");
        };
        let msg = decode_server(&frame).context("decode server message")?;
        if let ServerMsg::GameState(state) = &msg {
            self.last_state = Some(state.clone());
        }
        Ok(msg)
    }

    /// Like [`GameClient::recv`], but gives up after `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> anyhow::Result<Option<ServerMsg>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(msg) => msg.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Sends a join request and waits for the response.
    pub async fn join(&mut self, nickname: &str, color: Option<Color>) -> anyhow::Result<JoinResponse> {
        self.send(&ClientMsg::JoinRequest {
            nickname: nickname.to_string(),
            color,
        })
        .await?;

        loop {
            match self.recv().await? {
                ServerMsg::JoinResponse(resp) => {
                    if resp.success {
                        self.state = ClientState::Joined;
                        self.player_id = resp.player_id;
                        self.nickname = resp.nickname.clone();
                        info!(player_id = ?resp.player_id, nickname = %nickname, "Joined game");
                    } else {
                        info!(message = ?resp.message, "Join rejected");
                    }
                    return Ok(resp);
                }
                ServerMsg::GameState(_) => debug!("Snapshot before join response"),
            }
        }
    }

    fn own_id(&self) -> anyhow::Result<i64> {
        self.player_id
            .map(i64::from)
            .context("not joined")
    }

    /// Sends a movement direction for this client's player.
    pub async fn send_input(&mut self, movement: Vec3) -> anyhow::Result<()> {
        let player_id = self.own_id()?;
        self.send(&ClientMsg::PlayerInput {
            player_id,
            movement,
        })
        .await
    }

    pub async fn jump(&mut self) -> anyhow::Result<()> {
        let player_id = self.own_id()?;
        self.send(&ClientMsg::Jump { player_id }).await
    }

    /// Requests `count` dummies, or the server default when `None`.
    pub async fn spawn_dummies(&mut self, count: Option<i64>) -> anyhow::Result<()> {
        self.send(&ClientMsg::SpawnDummies { count }).await
    }

    pub async fn delete_all_dummies(&mut self) -> anyhow::Result<()> {
        self.send(&ClientMsg::DeleteAllDummies).await
    }

    /// Waits for the next snapshot, skipping other messages.
    pub async fn next_game_state(&mut self, timeout: Duration) -> anyhow::Result<GameState> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.recv_timeout(left).await? {
                Some(ServerMsg::GameState(state)) => return Ok(state),
                Some(other) => debug!(?other, "Skipping non-snapshot message"),
                None => anyhow::bail!("no game state within {timeout:?}"),
            }
        }
    }

    /// Waits for a snapshot satisfying `pred`.
    pub async fn wait_for_state(
        &mut self,
        timeout: Duration,
        mut pred: impl FnMut(&GameState) -> bool,
    ) -> anyhow::Result<GameState> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            let state = self
                .next_game_state(left)
                .await
                .context("waiting for matching game state")?;
            if pred(&state) {
                return Ok(state);
            }
        }
    }

    /// Closes the write half; the server sees end-of-stream.
    pub async fn close(mut self) -> anyhow::Result<()> {
        self.state = ClientState::Disconnected;
        self.writer.close().await
    }
}
