//! Server implementation.
//!
//! The coordinator owns the entity registry (behind the world lock) and the
//! session list (behind the sessions lock). Protocol handlers run on I/O tasks;
//! `tick` runs on the scheduler thread. Rules shared by both:
//! - lock order is world, then sessions;
//! - locks are never held across an `.await`;
//! - snapshots are built under the world lock and encoded/broadcast after it
//!   is released.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Context;
use arena_shared::{
    config::ServerConfig,
    math::{Color, Vec3},
    net::{decode_client, encode_server, ClientMsg, GameState, JoinResponse, ServerMsg},
    physics::{PhysicsBackend, PhysicsConfig, SimplePhysics},
    transport::{self, FrameListener, FrameReader, MessageSink, MAX_FRAME_LEN},
    world::{DummyId, EntityRegistry, PlayerId, WorldConfig},
};
use bytes::Bytes;
use tokio::{io::AsyncRead, net::TcpStream, runtime::Handle, sync::watch};
use tracing::{debug, error, info, warn};

use crate::{
    scheduler::Scheduler,
    session::{lock, Session, SessionId, SessionState},
};

/// Authoritative game server.
pub struct GameServer {
    cfg: ServerConfig,
    world: Mutex<EntityRegistry>,
    sessions: Mutex<Vec<Arc<Session>>>,
    runtime: Handle,
    /// Also the total number of connections ever accepted.
    next_session_id: AtomicU64,
    joins_total: AtomicU64,
    tick: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl GameServer {
    /// Creates a server around an existing physics backend. No sockets are
    /// opened; see [`RunningServer::launch`].
    pub fn new(cfg: ServerConfig, physics: Box<dyn PhysicsBackend>, runtime: Handle) -> Arc<Self> {
        let world = EntityRegistry::new(WorldConfig::from(&cfg), physics);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            cfg,
            world: Mutex::new(world),
            sessions: Mutex::new(Vec::new()),
            runtime,
            next_session_id: AtomicU64::new(0),
            joins_total: AtomicU64::new(0),
            tick: AtomicU64::new(0),
            shutdown,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.cfg
    }

    /// Ticks simulated so far.
    pub fn tick_count(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    pub fn connections_total(&self) -> u64 {
        self.next_session_id.load(Ordering::Acquire)
    }

    pub fn joins_total(&self) -> u64 {
        self.joins_total.load(Ordering::Acquire)
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn joined_count(&self) -> usize {
        lock(&self.sessions).iter().filter(|s| s.is_joined()).count()
    }

    pub fn capacity(&self) -> usize {
        lock(&self.world).capacity()
    }

    /// On-demand snapshot of the world.
    pub fn game_state(&self) -> GameState {
        lock(&self.world).snapshot()
    }

    /// Runs `f` with the world locked. Test and console helper.
    pub fn with_world<T>(&self, f: impl FnOnce(&mut EntityRegistry) -> T) -> T {
        f(&mut lock(&self.world))
    }

    // ─── Connections ───

    /// Accept loop. Runs until the task is aborted.
    pub async fn serve(self: Arc<Self>, listener: FrameListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move { server.serve_connection(stream, peer).await });
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let (reader, writer) = transport::split(stream);
        let session = self.register_session(Some(peer), Box::new(writer));
        self.run_session(&session, reader).await;
    }

    /// Adds a session in `Connecting` state and starts its writer.
    pub fn register_session(
        &self,
        peer: Option<SocketAddr>,
        sink: Box<dyn MessageSink>,
    ) -> Arc<Session> {
        let id: SessionId = self.next_session_id.fetch_add(1, Ordering::AcqRel);
        let session = Session::new(id, peer, sink, &self.runtime);
        lock(&self.sessions).push(session.clone());
        info!(session_id = id, ?peer, "Client connected, waiting for join request");
        session
    }

    /// Inbound loop for one session. Re-arms after every frame until the
    /// connection closes or errors, the session is closed from the write
    /// side, or the server shuts down.
    pub async fn run_session<R: AsyncRead + Unpin>(
        &self,
        session: &Arc<Session>,
        mut reader: FrameReader<R>,
    ) {
        session.mark_ready();
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                frame = reader.read_frame() => match frame {
                    Ok(Some(frame)) => self.handle_frame(session, &frame),
                    Ok(None) => break,
                    Err(e) => {
                        debug!(session_id = session.id(), error = %e, "Read failed");
                        break;
                    }
                },
                _ = session.closed() => break,
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        let peer = session.peer();
        match (session.player_id(), session.nickname()) {
            (Some(player_id), Some(nickname)) => {
                info!(session_id = session.id(), ?peer, player_id, nickname = %nickname, "Player disconnected");
            }
            _ => info!(session_id = session.id(), ?peer, "Client disconnected before joining"),
        }
        // The slot is released by the next prune.
        session.close();
    }

    /// Closes every session and stops all read loops.
    pub fn close_all_sessions(&self) {
        let _ = self.shutdown.send(true);
        let sessions: Vec<Arc<Session>> = lock(&self.sessions).clone();
        for s in sessions {
            s.close();
        }
    }

    // ─── Protocol ───

    /// Decodes and dispatches one inbound frame. Malformed frames are dropped.
    pub fn handle_frame(&self, session: &Arc<Session>, frame: &[u8]) {
        match decode_client(frame) {
            Ok(msg) => self.handle_message(session, msg),
            Err(e) => warn!(session_id = session.id(), error = %e, "Message parse error"),
        }
    }

    pub fn handle_message(&self, session: &Arc<Session>, msg: ClientMsg) {
        if let ClientMsg::JoinRequest { nickname, color } = msg {
            self.on_join(session, &nickname, color.unwrap_or_default());
            return;
        }

        let (SessionState::Joined, Some(own_id)) = (session.state(), session.player_id()) else {
            warn!(
                session_id = session.id(),
                kind = msg.kind(),
                "Received request from non-joined client"
            );
            return;
        };

        match msg {
            ClientMsg::PlayerInput {
                player_id,
                movement,
            } => {
                if self.owns(session, own_id, player_id, "input") {
                    self.set_player_input(own_id, movement);
                }
            }
            ClientMsg::Jump { player_id } => {
                if self.owns(session, own_id, player_id, "jump") {
                    self.player_jump(own_id);
                }
            }
            ClientMsg::SpawnDummies { count } => {
                let count = self.spawn_count(count);
                self.spawn_dummies(count);
                info!(player_id = own_id, count, "Dummy spawn requested");
            }
            ClientMsg::DeleteAllDummies => {
                let removed = self.delete_all_dummies();
                info!(player_id = own_id, removed, "Dummy delete requested");
            }
            ClientMsg::JoinRequest { .. } => {}
        }
    }

    fn owns(&self, session: &Session, own_id: PlayerId, claimed: i64, kind: &str) -> bool {
        if claimed == i64::from(own_id) {
            return true;
        }
        warn!(
            session_id = session.id(),
            player_id = own_id,
            claimed,
            kind,
            "PlayerId mismatch"
        );
        false
    }

    fn on_join(&self, session: &Arc<Session>, nickname: &str, color: Color) {
        match session.state() {
            SessionState::AwaitingJoin => {}
            SessionState::Joined => {
                info!(
                    session_id = session.id(),
                    "Player already joined, ignoring duplicate join request"
                );
                return;
            }
            state => {
                warn!(session_id = session.id(), ?state, "Join request in wrong state");
                return;
            }
        }

        let joined = {
            let mut world = lock(&self.world);
            world
                .add_player(nickname, color)
                .map(|id| (id, world.snapshot()))
        };

        match joined {
            Ok((player_id, snapshot)) => {
                // Both are queued before the session is Joined; broadcasts
                // cannot overtake them.
                send_msg(
                    session,
                    &ServerMsg::JoinResponse(JoinResponse::accepted(player_id, nickname)),
                );
                send_msg(session, &ServerMsg::GameState(snapshot));
                if !session.complete_join(player_id, nickname) {
                    lock(&self.world).remove_player(player_id);
                    return;
                }
                self.joins_total.fetch_add(1, Ordering::AcqRel);
                info!(
                    session_id = session.id(),
                    player_id,
                    nickname = %nickname,
                    color = ?color.to_array(),
                    "Player joined"
                );
            }
            Err(e) => {
                info!(session_id = session.id(), "Server full, rejecting join request");
                send_msg(
                    session,
                    &ServerMsg::JoinResponse(JoinResponse::rejected(e.to_string())),
                );
            }
        }
    }

    fn spawn_count(&self, requested: Option<i64>) -> usize {
        let n = requested.unwrap_or(i64::from(self.cfg.default_dummy_count));
        n.clamp(0, i64::from(self.cfg.max_spawn_per_request)) as usize
    }

    // ─── World operations ───

    pub fn set_player_input(&self, player_id: PlayerId, movement: Vec3) {
        lock(&self.world).set_player_input(player_id, movement);
    }

    pub fn player_jump(&self, player_id: PlayerId) -> bool {
        lock(&self.world).request_jump(player_id)
    }

    pub fn remove_player(&self, player_id: PlayerId) -> bool {
        lock(&self.world).remove_player(player_id)
    }

    /// Spawns dummies and broadcasts the result without waiting for a tick.
    pub fn spawn_dummies(&self, count: usize) -> Vec<DummyId> {
        let (ids, state) = {
            let mut world = lock(&self.world);
            let ids = world.spawn_dummies(count);
            (ids, world.snapshot())
        };
        self.broadcast_state(state);
        ids
    }

    /// Deletes every dummy and broadcasts the result without waiting for a tick.
    pub fn delete_all_dummies(&self) -> usize {
        let (removed, state) = {
            let mut world = lock(&self.world);
            let removed = world.delete_all_dummies();
            (removed, world.snapshot())
        };
        self.broadcast_state(state);
        removed
    }

    // ─── Tick ───

    /// One simulation tick: advance, snapshot, broadcast, prune.
    /// Returns the number of the tick just completed.
    pub fn tick(&self, dt_sec: f32) -> u64 {
        let state = {
            let mut world = lock(&self.world);
            world.advance(dt_sec);
            world.snapshot()
        };
        self.broadcast_state(state);
        self.prune_sessions();
        self.tick.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn broadcast_state(&self, state: GameState) {
        if let Some(frame) = encode(&ServerMsg::GameState(state)) {
            self.broadcast(frame);
        }
    }

    /// Queues `frame` on every joined session. Returns how many received it.
    pub fn broadcast(&self, frame: Bytes) -> usize {
        let sessions = lock(&self.sessions);
        sessions
            .iter()
            .filter(|s| s.is_joined())
            .filter(|s| s.send(frame.clone()))
            .count()
    }

    /// Drops closed sessions and frees their player slots.
    pub fn prune_sessions(&self) -> usize {
        let mut dead = Vec::new();
        lock(&self.sessions).retain(|s| {
            if s.is_alive() {
                true
            } else {
                dead.push(s.clone());
                false
            }
        });

        // Sessions lock is released; world lock is taken on its own.
        for s in &dead {
            if let Some(player_id) = s.player_id() {
                if self.remove_player(player_id) {
                    info!(session_id = s.id(), player_id, "Released slot of closed session");
                }
            }
        }
        dead.len()
    }

    // ─── Console ───

    /// Executes a server console command and returns the lines to print.
    pub fn exec_console(&self, line: &str) -> Vec<String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&cmd) = tokens.first() else {
            return Vec::new();
        };

        match cmd {
            "status" => {
                let (players, dummies, capacity) = {
                    let world = lock(&self.world);
                    (world.player_count(), world.dummy_count(), world.capacity())
                };
                vec![
                    format!("Tick: {}", self.tick_count()),
                    format!("Players: {players} / {capacity}"),
                    format!("Dummies: {dummies}"),
                    format!("Sessions: {}", self.session_count()),
                    format!(
                        "Connections: {} total, {} joins",
                        self.connections_total(),
                        self.joins_total()
                    ),
                ]
            }
            "spawn" => {
                let requested = match tokens.get(1).map(|s| s.parse::<i64>()) {
                    None => None,
                    Some(Ok(n)) => Some(n),
                    Some(Err(_)) => return vec!["Usage: spawn [count]".to_string()],
                };
                let ids = self.spawn_dummies(self.spawn_count(requested));
                vec![format!("Spawned {} dummies", ids.len())]
            }
            "clear" => {
                let removed = self.delete_all_dummies();
                vec![format!("Deleted {removed} dummies")]
            }
            "help" => vec!["Commands: status, spawn [count], clear, quit".to_string()],
            other => vec![format!("Unknown command: {other}")],
        }
    }
}

/// Encodes an outbound message. Frames the transport would refuse are logged
/// and dropped.
fn encode(msg: &ServerMsg) -> Option<Bytes> {
    match encode_server(msg) {
        Ok(frame) if frame.len() <= MAX_FRAME_LEN => Some(frame),
        Ok(frame) => {
            error!(
                len = frame.len(),
                limit = MAX_FRAME_LEN,
                "Server message too large, dropped"
            );
            None
        }
        Err(e) => {
            error!(error = %e, "Failed to encode server message");
            None
        }
    }
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    // Returns at once if shutdown was requested before subscribing.
    let _ = rx.wait_for(|stop| *stop).await;
}

fn send_msg(session: &Session, msg: &ServerMsg) {
    if let Some(frame) = encode(msg) {
        session.send(frame);
    }
}

/// A bound, ticking server.
pub struct RunningServer {
    pub server: Arc<GameServer>,
    pub addr: SocketAddr,
    scheduler: Scheduler,
    accept: tokio::task::JoinHandle<()>,
}

impl RunningServer {
    /// Initializes physics, binds the listener, starts the scheduler thread
    /// and the accept loop. Must be called from inside a tokio runtime.
    pub async fn launch(cfg: ServerConfig) -> anyhow::Result<Self> {
        let physics = SimplePhysics::new(PhysicsConfig {
            seed: cfg.seed,
            ..Default::default()
        })
        .context("initialize physics")?;

        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let listener = FrameListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        let server = GameServer::new(cfg.clone(), Box::new(physics), Handle::current());
        let scheduler = Scheduler::start(server.clone(), cfg.tick_hz)?;
        let accept = tokio::spawn(server.clone().serve(listener));

        info!(
            %addr,
            tick_hz = cfg.tick_hz,
            capacity = server.capacity(),
            "Game server started"
        );
        Ok(Self {
            server,
            addr,
            scheduler,
            accept,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Stops the tick thread, the accept loop, and every session.
    pub fn shutdown(mut self) {
        self.scheduler.stop();
        self.accept.abort();
        self.server.close_all_sessions();
        info!(ticks = self.server.tick_count(), "Server stopped");
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

/// Helper for tests: launch on an ephemeral localhost port.
pub async fn bind_ephemeral(tick_hz: u32) -> anyhow::Result<RunningServer> {
    let cfg = ServerConfig {
        server_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).to_string(),
        tick_hz,
        seed: Some(0),
        ..Default::default()
    };
    RunningServer::launch(cfg).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::{eventually, RecordingSink};
    use arena_shared::{
        net::{decode_server, encode_client, MAX_NICKNAME_CHARS},
        transport::FrameWriter,
    };

    fn server(cfg: ServerConfig) -> Arc<GameServer> {
        let physics = SimplePhysics::new(PhysicsConfig {
            seed: Some(5),
            ..Default::default()
        })
        .unwrap();
        GameServer::new(
            ServerConfig {
                seed: Some(5),
                ..cfg
            },
            Box::new(physics),
            Handle::current(),
        )
    }

    fn connect(server: &GameServer) -> (Arc<Session>, RecordingSink) {
        let sink = RecordingSink::default();
        let session = server.register_session(None, Box::new(sink.clone()));
        session.mark_ready();
        (session, sink)
    }

    fn messages(sink: &RecordingSink) -> Vec<ServerMsg> {
        sink.frames()
            .iter()
            .map(|f| decode_server(f).unwrap())
            .collect()
    }

    fn join(server: &GameServer, session: &Arc<Session>, name: &str) {
        server.handle_frame(
            session,
            &encode_client(&ClientMsg::JoinRequest {
                nickname: name.into(),
                color: None,
            }),
        );
    }

    fn last_state(sink: &RecordingSink) -> Option<GameState> {
        messages(sink).into_iter().rev().find_map(|m| match m {
            ServerMsg::GameState(s) => Some(s),
            _ => None,
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn join_replies_then_sends_snapshot() {
        let server = server(ServerConfig::default());
        let (session, sink) = connect(&server);
        join(&server, &session, "Ann");

        assert!(eventually(|| sink.len() == 2).await);
        let msgs = messages(&sink);
        assert_eq!(
            msgs[0],
            ServerMsg::JoinResponse(JoinResponse::accepted(0, "Ann"))
        );
        let ServerMsg::GameState(state) = &msgs[1] else {
            panic!("expected game state, got {:?}", msgs[1]);
        };
        assert_eq!(state.players.len(), 1);
        assert_eq!(state.players[0].nickname, "Ann");
        assert_eq!(session.player_id(), Some(0));
        assert_eq!(server.joined_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_join_is_ignored() {
        let server = server(ServerConfig::default());
        let (session, sink) = connect(&server);
        join(&server, &session, "Ann");
        join(&server, &session, "Ann again");

        assert!(eventually(|| sink.len() == 2).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.len(), 2);
        assert_eq!(server.game_state().players.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_server_rejects_with_reason() {
        let server = server(ServerConfig {
            max_players: 2,
            ..Default::default()
        });
        for name in ["a", "b"] {
            let (s, _) = connect(&server);
            join(&server, &s, name);
        }
        let (late, sink) = connect(&server);
        join(&server, &late, "c");

        assert!(eventually(|| sink.len() == 1).await);
        assert_eq!(
            messages(&sink)[0],
            ServerMsg::JoinResponse(JoinResponse::rejected("Server is full (2/2 players)"))
        );
        assert_eq!(late.state(), SessionState::AwaitingJoin);
        assert_eq!(server.game_state().players.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn requests_before_join_are_dropped() {
        let server = server(ServerConfig::default());
        let (session, sink) = connect(&server);
        server.handle_message(&session, ClientMsg::SpawnDummies { count: Some(3) });
        server.handle_message(
            &session,
            ClientMsg::PlayerInput {
                player_id: 0,
                movement: Vec3::new(1.0, 0.0, 0.0),
            },
        );
        assert_eq!(server.game_state().dummies.len(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spoofed_player_id_is_ignored() {
        let server = server(ServerConfig::default());
        let (a, _) = connect(&server);
        let (b, _) = connect(&server);
        join(&server, &a, "a");
        join(&server, &b, "b");

        // `b` (slot 1) claims to be slot 0.
        server.handle_message(
            &b,
            ClientMsg::PlayerInput {
                player_id: 0,
                movement: Vec3::new(1.0, 0.0, 0.0),
            },
        );
        server.with_world(|w| {
            assert_eq!(w.player(0).unwrap().input, Vec3::ZERO);
            assert_eq!(w.player(1).unwrap().input, Vec3::ZERO);
        });

        server.handle_message(
            &b,
            ClientMsg::PlayerInput {
                player_id: 1,
                movement: Vec3::new(0.0, 0.0, 1.0),
            },
        );
        server.with_world(|w| {
            assert_eq!(w.player(1).unwrap().input, Vec3::new(0.0, 0.0, 1.0));
        });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_frames_keep_the_session() {
        let server = server(ServerConfig::default());
        let (session, _) = connect(&server);
        server.handle_frame(&session, b"{not json");
        server.handle_frame(&session, br#"{"type": 99}"#);
        assert!(session.is_alive());
        join(&server, &session, "still here");
        assert!(session.is_joined());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dummy_requests_broadcast_immediately() {
        let server = server(ServerConfig::default());
        let (a, sink_a) = connect(&server);
        let (b, sink_b) = connect(&server);
        join(&server, &a, "a");
        join(&server, &b, "b");

        server.handle_message(&a, ClientMsg::SpawnDummies { count: Some(5) });
        assert!(eventually(|| last_state(&sink_b).map(|s| s.dummies.len()) == Some(5)).await);

        server.handle_message(&b, ClientMsg::DeleteAllDummies);
        assert!(eventually(|| last_state(&sink_a).map(|s| s.dummies.len()) == Some(0)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawn_count_defaults_and_clamps() {
        let server = server(ServerConfig {
            max_spawn_per_request: 20,
            ..Default::default()
        });
        assert_eq!(server.spawn_count(None), 10);
        assert_eq!(server.spawn_count(Some(-4)), 0);
        assert_eq!(server.spawn_count(Some(7)), 7);
        assert_eq!(server.spawn_count(Some(1_000)), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tick_snapshot_tracks_slot_changes() {
        let server = server(ServerConfig::default());
        let (watcher, sink) = connect(&server);
        join(&server, &watcher, "watcher");
        let (gone, _) = connect(&server);
        join(&server, &gone, "gone");

        server.remove_player(1);
        let (fresh, _) = connect(&server);
        join(&server, &fresh, "fresh");
        server.tick(1.0 / 60.0);

        // `fresh` reused slot 1; `gone` is not in the snapshot under any id.
        assert!(
            eventually(|| {
                last_state(&sink).is_some_and(|s| {
                    s.players.len() == 2
                        && s.players.iter().any(|p| p.nickname == "fresh")
                        && s.players.iter().all(|p| p.nickname != "gone")
                })
            })
            .await
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn prune_frees_slots_of_closed_sessions() {
        let server = server(ServerConfig::default());
        let (a, _) = connect(&server);
        join(&server, &a, "a");
        let (idle, _) = connect(&server);

        a.close();
        idle.close();
        assert_eq!(server.tick(1.0 / 60.0), 1);
        assert_eq!(server.session_count(), 0);
        assert_eq!(server.game_state().players.len(), 0);
        // Second prune is a no-op.
        assert_eq!(server.prune_sessions(), 0);

        let (b, _) = connect(&server);
        join(&server, &b, "b");
        assert_eq!(b.player_id(), Some(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn broadcast_skips_sessions_not_joined() {
        let server = server(ServerConfig::default());
        let (joined, _) = connect(&server);
        join(&server, &joined, "in");
        let (_lobby, lobby_sink) = connect(&server);

        assert_eq!(server.broadcast(Bytes::from_static(b"{}")), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(lobby_sink.len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn console_commands() {
        let server = server(ServerConfig::default());
        assert_eq!(server.exec_console("spawn 3"), vec!["Spawned 3 dummies"]);
        assert_eq!(server.exec_console("spawn x"), vec!["Usage: spawn [count]"]);
        let status = server.exec_console("status");
        assert!(status.contains(&"Dummies: 3".to_string()));
        assert!(status.contains(&"Players: 0 / 50".to_string()));
        assert_eq!(server.exec_console("clear"), vec!["Deleted 3 dummies"]);
        assert!(server.exec_console("").is_empty());
        assert_eq!(server.exec_console("bogus"), vec!["Unknown command: bogus"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn join_snapshot_is_never_older_than_later_ones() {
        let server = server(ServerConfig::default());
        let spawner = {
            let server = server.clone();
            std::thread::spawn(move || {
                for _ in 0..100 {
                    server.spawn_dummies(1);
                }
            })
        };
        let mut sinks = Vec::new();
        for i in 0..20 {
            let (s, sink) = connect(&server);
            join(&server, &s, &format!("p{i}"));
            sinks.push(sink);
        }
        spawner.join().unwrap();

        for sink in &sinks {
            assert!(eventually(|| last_state(sink).map(|s| s.dummies.len()) == Some(100)).await);
            let msgs = messages(sink);
            assert!(matches!(msgs[0], ServerMsg::JoinResponse(_)));
            let counts: Vec<usize> = msgs
                .iter()
                .filter_map(|m| match m {
                    ServerMsg::GameState(s) => Some(s.dummies.len()),
                    _ => None,
                })
                .collect();
            assert!(
                counts.windows(2).all(|w| w[0] <= w[1]),
                "snapshots out of order: {counts:?}"
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn large_spawn_over_a_framed_pipe_keeps_the_session() {
        let server = server(ServerConfig::default());
        let (server_end, client_end) = tokio::io::duplex(64 * 1024);
        let session = server.register_session(None, Box::new(FrameWriter::new(server_end)));
        session.mark_ready();

        let (frames_tx, mut frames_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut reader = FrameReader::new(client_end);
            while let Ok(Some(frame)) = reader.read_frame().await {
                if frames_tx.send(frame).is_err() {
                    break;
                }
            }
        });

        join(&server, &session, "spawner");
        for _ in 0..15 {
            server.handle_message(&session, ClientMsg::SpawnDummies { count: Some(100) });
        }
        server.tick(1.0 / 60.0);
        assert_eq!(server.game_state().dummies.len(), 500);

        // Join response, join snapshot, one broadcast per request, one tick.
        let mut last = None;
        for _ in 0..18 {
            let frame = tokio::time::timeout(Duration::from_secs(3), frames_rx.recv())
                .await
                .expect("frame not delivered")
                .expect("reader stopped early");
            last = Some(decode_server(&frame).unwrap());
        }
        let Some(ServerMsg::GameState(state)) = &last else {
            panic!("expected game state, got {last:?}");
        };
        assert_eq!(state.dummies.len(), 500);
        assert!(session.is_joined());
        assert_eq!(server.prune_sessions(), 0);
        assert_eq!(server.joined_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worst_case_snapshot_fits_in_a_frame() {
        let server = server(ServerConfig::default());
        // Control characters are escaped as `\u00XX`, six bytes each.
        let nickname = "\u{1}".repeat(MAX_NICKNAME_CHARS);
        server.with_world(|w| {
            for _ in 0..w.capacity() {
                w.add_player(&nickname, Color::new(0.123_456_79, 0.987_654_3, 0.333_333_34))
                    .unwrap();
            }
            w.spawn_dummies(usize::MAX);
        });
        for _ in 0..10 {
            server.tick(1.0 / 60.0);
        }

        let state = server.game_state();
        assert_eq!(state.players.len(), 50);
        assert_eq!(state.dummies.len(), 500);
        let frame = encode_server(&ServerMsg::GameState(state)).unwrap();
        assert!(
            frame.len() * 2 < MAX_FRAME_LEN,
            "snapshot of {} bytes leaves too little headroom",
            frame.len()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_snapshot_is_dropped_not_fatal() {
        let server = server(ServerConfig::default());
        let (session, sink) = connect(&server);
        join(&server, &session, "a");
        assert!(eventually(|| sink.len() == 2).await);

        // Bypasses the decoder's nickname cap.
        let huge = server.with_world(|w| {
            w.add_player(&"x".repeat(MAX_FRAME_LEN), Color::WHITE)
                .unwrap()
        });
        server.tick(1.0 / 60.0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.len(), 2);
        assert!(session.is_joined());

        server.remove_player(huge);
        server.tick(1.0 / 60.0);
        assert!(eventually(|| sink.len() == 3).await);
        assert_eq!(last_state(&sink).unwrap().players.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overflowing_input_never_reaches_snapshots() {
        let server = server(ServerConfig::default());
        let (session, sink) = connect(&server);
        join(&server, &session, "a");

        server.handle_frame(&session, br#"{"type":3,"playerId":0,"x":1e39,"y":0,"z":0}"#);
        server.set_player_input(0, Vec3::new(f32::NAN, 0.0, 0.0));
        server.with_world(|w| assert_eq!(w.player(0).unwrap().input, Vec3::ZERO));

        server.handle_message(&session, ClientMsg::SpawnDummies { count: Some(5) });
        for _ in 0..5 {
            server.tick(1.0 / 60.0);
        }
        // `messages` fails on any frame that does not decode.
        assert!(eventually(|| sink.len() == 8).await);
        let state = last_state(&sink).unwrap();
        assert!(state.players[0].pos.iter().all(|c| c.is_finite()));
        assert!(state.dummies.iter().all(|d| d.pos.iter().all(|c| c.is_finite())));
        assert!(session.is_joined());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_failure_ends_the_read_loop() {
        let server = server(ServerConfig::default());
        let sink = RecordingSink {
            fail_at: Some(1),
            ..Default::default()
        };
        let session = server.register_session(None, Box::new(sink.clone()));
        // The client end stays open, so reads alone would never finish.
        let (_client_end, server_end) = tokio::io::duplex(1024);
        let reader = FrameReader::new(server_end);
        let task = {
            let server = server.clone();
            let session = session.clone();
            tokio::spawn(async move { server.run_session(&session, reader).await })
        };
        assert!(eventually(|| session.state() == SessionState::AwaitingJoin).await);

        // The join snapshot is the frame that fails.
        join(&server, &session, "a");
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("read loop outlived the session")
            .unwrap();
        assert!(!session.is_alive());

        assert_eq!(server.prune_sessions(), 1);
        assert_eq!(server.game_state().players.len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sessions_started_after_shutdown_exit_at_once() {
        let server = server(ServerConfig::default());
        server.close_all_sessions();

        let session = server.register_session(None, Box::new(RecordingSink::default()));
        let (_client_end, server_end) = tokio::io::duplex(1024);
        tokio::time::timeout(
            Duration::from_secs(1),
            server.run_session(&session, FrameReader::new(server_end)),
        )
        .await
        .expect("read loop missed the earlier shutdown");
        assert!(!session.is_alive());
    }
}
